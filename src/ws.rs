//! WebSocket upgrade handling
//!
//! Validates the upgrade request, answers the RFC 6455 handshake, and hands
//! the upgraded stream to the session layer. The `Origin` of an upgrade
//! must match the server's own host header; anything else is refused before
//! the handshake completes.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};
use std::{error::Error as StdError, fmt, future::Future};

use hyper::{
    body::Incoming,
    header::{
        HeaderMap, HeaderValue, CONNECTION, HOST, ORIGIN, SEC_WEBSOCKET_ACCEPT,
        SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE,
    },
    upgrade::{OnUpgrade, Upgraded},
    Request, Response, StatusCode, Uri,
};
use hyper_util::rt::TokioIo;
use tokio_tungstenite::{tungstenite::protocol::Role, WebSocketStream};

use crate::{
    error::Error,
    handlers::{empty_body, HttpBody},
};

const UPGRADE_VALUE: &str = "upgrade";
const VERSION: &str = "13";
const WEBSOCKET: &str = "websocket";
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A WebSocket attached to a session, server side.
pub type ServerWebSocket = WebSocketStream<TokioIo<Upgraded>>;

/// Represents a validated request to upgrade a connection to a WebSocket
pub(crate) struct WebSocketUpgrade {
    on_upgrade: OnUpgrade,
    sec_websocket_key: HeaderValue,
}

/// What made an upgrade request unacceptable as a handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UpgradeError {
    /// No `Upgrade: websocket` in the request.
    NotAnUpgrade,
    /// The `Connection` header never asks for the upgrade.
    NoConnectionUpgrade,
    /// A websocket protocol version this gateway does not speak.
    UnsupportedVersion,
    /// The challenge key is absent, so there is nothing to accept.
    MissingKey,
    /// The server connection cannot hand over its stream.
    NotUpgradable,
}

impl fmt::Display for UpgradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpgradeError::NotAnUpgrade => "request does not upgrade to a websocket",
            UpgradeError::NoConnectionUpgrade => "connection header does not request an upgrade",
            UpgradeError::UnsupportedVersion => "unsupported websocket protocol version",
            UpgradeError::MissingKey => "websocket challenge key is missing",
            UpgradeError::NotUpgradable => "connection cannot hand over its stream",
        })
    }
}

impl StdError for UpgradeError {}

impl From<UpgradeError> for Error {
    fn from(err: UpgradeError) -> Self {
        Error::client_error(err)
    }
}

impl WebSocketUpgrade {
    /// Validates the handshake headers and takes ownership of the upgrade.
    pub(crate) fn try_from_request(request: &mut Request<Incoming>) -> Result<Self, Error> {
        let headers = request.headers();

        if !header_matches(headers, &UPGRADE, WEBSOCKET) {
            return Err(UpgradeError::NotAnUpgrade.into());
        }
        if !connection_requests_upgrade(headers) {
            return Err(UpgradeError::NoConnectionUpgrade.into());
        }
        if !matches!(headers.get(&SEC_WEBSOCKET_VERSION), Some(version) if version == VERSION) {
            return Err(UpgradeError::UnsupportedVersion.into());
        }

        let sec_websocket_key = headers
            .get(&SEC_WEBSOCKET_KEY)
            .ok_or(UpgradeError::MissingKey)?
            .clone();

        let on_upgrade = request
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or(UpgradeError::NotUpgradable)?;

        Ok(Self { on_upgrade, sec_websocket_key })
    }

    /// Completes the handshake and calls `handler` with the open stream.
    pub(crate) fn respond<F, Fut>(self, handler: F) -> Response<HttpBody>
    where
        F: FnOnce(ServerWebSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let WebSocketUpgrade { on_upgrade, sec_websocket_key } = self;

        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => TokioIo::new(upgraded),
                Err(err) => {
                    tracing::debug!("websocket upgrade failed: {err}");
                    return;
                }
            };

            let stream = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
            handler(stream).await;
        });

        let accept_key = generate_accept_key(sec_websocket_key.as_bytes());
        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(&UPGRADE, WEBSOCKET)
            .header(&CONNECTION, UPGRADE_VALUE)
            .header(&SEC_WEBSOCKET_ACCEPT, accept_key)
            .body(empty_body())
            .expect("static upgrade response")
    }
}

/// Checks that the request `Origin` names this server.
///
/// The comparison is against our own host header, with the scheme the
/// connection actually uses; a missing `Origin` is accepted (not a browser),
/// a mismatched one is not.
pub(crate) fn origin_ok(headers: &HeaderMap, tls: bool) -> bool {
    let Some(origin) = headers.get(ORIGIN) else { return true };
    let Some(origin) = origin.to_str().ok() else { return false };
    let Some(host) = headers.get(HOST).and_then(|host| host.to_str().ok()) else {
        return false;
    };

    let expected_scheme = if tls { "https" } else { "http" };
    match origin.parse::<Uri>() {
        Ok(uri) => {
            uri.scheme_str() == Some(expected_scheme)
                && uri.authority().map(|authority| authority.as_str()) == Some(host)
        }
        Err(_) => false,
    }
}

fn header_matches(headers: &HeaderMap, name: &hyper::header::HeaderName, value: &str) -> bool {
    matches!(headers.get(name), Some(header) if header.as_bytes().eq_ignore_ascii_case(value.as_bytes()))
}

/// `Connection` may carry a token list, e.g. `keep-alive, Upgrade`.
fn connection_requests_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(&CONNECTION)
        .and_then(|header| header.to_str().ok())
        .map(|header| {
            header
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case(UPGRADE_VALUE))
        })
        .unwrap_or(false)
}

#[inline]
fn generate_accept_key(key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(entries: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in entries {
            map.append(
                name.parse::<hyper::header::HeaderName>().unwrap(),
                value.parse::<HeaderValue>().unwrap(),
            );
        }
        map
    }

    #[test]
    fn it_generates_the_documented_accept_key() {
        let key = generate_accept_key(b"dGhlIHNhbXBsZSBub25jZQ==");

        assert_eq!(key, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn it_reports_upgrade_errors_as_client_errors() {
        let err: Error = UpgradeError::MissingKey.into();

        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "websocket challenge key is missing");
    }

    #[test]
    fn it_accepts_matching_origin() {
        let headers = headers(&[("host", "127.0.0.1"), ("origin", "http://127.0.0.1")]);

        assert!(origin_ok(&headers, false));
    }

    #[test]
    fn it_accepts_matching_origin_with_port() {
        let headers = headers(&[
            ("host", "127.0.0.1:9090"),
            ("origin", "http://127.0.0.1:9090"),
        ]);

        assert!(origin_ok(&headers, false));
    }

    #[test]
    fn it_rejects_foreign_origin() {
        let headers = headers(&[
            ("host", "127.0.0.1"),
            ("origin", "http://another-place.com"),
        ]);

        assert!(!origin_ok(&headers, false));
    }

    #[test]
    fn it_rejects_scheme_mismatch() {
        let headers = headers(&[("host", "127.0.0.1"), ("origin", "http://127.0.0.1")]);

        assert!(!origin_ok(&headers, true));
    }

    #[test]
    fn it_accepts_token_lists_in_connection_header() {
        let headers = headers(&[("connection", "keep-alive, Upgrade")]);

        assert!(connection_requests_upgrade(&headers));
    }
}
