//! # Wheelhouse
//!
//! > A browser-facing gateway that terminates HTTPS on one side and
//! > multiplexes long-lived administrative sessions to per-session bridge
//! > processes on the other, built on [Tokio](https://tokio.rs/) and
//! > [hyper](https://hyper.rs/).
//!
//! A logged-in browser holds one WebSocket; the gateway owns the bridge
//! for that session and relays channel-tagged frames between the two. The
//! same bridge serves package resources into plain HTTP responses, and
//! everything else on the port falls through to static files.
//!
//! ## Example
//! ```no_run
//! use wheelhouse::{BridgeConfig, Credentials, Gateway, Session, SessionConfig, TlsConfig};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     // One session per authenticated browser; lookup is up to the caller.
//!     let bridge = BridgeConfig::new();
//!     let session = Session::new(
//!         Credentials::new("admin", "password"),
//!         bridge.launch(None),
//!         SessionConfig::new(),
//!     );
//!
//!     Gateway::new()
//!         .bind("0.0.0.0:9090")
//!         .with_tls(TlsConfig::from_pem("/etc/gateway"))
//!         .with_document_root("/usr/share/gateway/static")
//!         .with_sessions(move |_headers: &hyper::HeaderMap| Some(session.clone()))
//!         .run()
//!         .await
//! }
//! ```

pub mod app;
pub mod bridge;
pub mod error;
pub(crate) mod fs;
pub mod handlers;
pub mod pipe;
pub mod protocol;
pub mod session;
pub mod tls;
pub mod transport;
pub mod ws;

pub use crate::app::Gateway;
pub use crate::bridge::BridgeConfig;
pub use crate::error::Error;
pub use crate::handlers::{HttpBody, SessionSource};
pub use crate::pipe::{Pipe, PipeEvent};
pub use crate::protocol::{ControlMessage, Frame, Problem};
pub use crate::session::{Credentials, PackageEntry, PackageListing, Session, SessionConfig};
pub use crate::tls::TlsConfig;
pub use crate::transport::{
    FrameCodec, MockBridge, MockTransport, PipeTransport, Transport, TransportEvent,
};
pub use crate::ws::ServerWebSocket;
