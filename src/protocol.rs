//! Wire protocol shared by the browser and the bridge
//!
//! Every message is a *frame*: an ASCII channel identifier, a single `\n`,
//! and an opaque payload. A frame with an empty channel identifier is a
//! *control frame* and carries a JSON object with at least a `command`
//! member. On the bridge transport frames additionally get a 4-byte
//! big-endian length prefix (see [`crate::transport::FrameCodec`]); on the
//! WebSocket the message boundary itself delimits the frame.

use bytes::{BufMut, Bytes, BytesMut};
use memchr::memchr;
use serde_json::{Map, Value};
use std::fmt;

/// The protocol version both sides must agree on during `init`.
pub const PROTOCOL_VERSION: u64 = 0;

/// Reasons a channel or a whole session closes with.
///
/// These travel to the browser as the `reason` member of a `close` control
/// frame; the vocabulary is fixed and understood by the UI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Problem {
    /// Programming or unexpected I/O error.
    InternalError,
    /// Authentication was rejected.
    NotAuthorized,
    /// The destination does not exist.
    NotFound,
    /// The host is reachable but no bridge is installed there.
    NoCockpit,
    /// The secure-shell peer key is not present in known-hosts.
    UnknownHostkey,
    /// The peer exited on a signal or with an abnormal exit code.
    Terminated,
    /// Invalid framing, a missing or invalid `init`, a duplicate channel id.
    ProtocolError,
    /// The WebSocket was attached without an authenticated session.
    NoSession,
    /// The session was forcibly torn down.
    Disconnected,
}

impl Problem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Problem::InternalError => "internal-error",
            Problem::NotAuthorized => "not-authorized",
            Problem::NotFound => "not-found",
            Problem::NoCockpit => "no-cockpit",
            Problem::UnknownHostkey => "unknown-hostkey",
            Problem::Terminated => "terminated",
            Problem::ProtocolError => "protocol-error",
            Problem::NoSession => "no-session",
            Problem::Disconnected => "disconnected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "internal-error" => Some(Problem::InternalError),
            "not-authorized" => Some(Problem::NotAuthorized),
            "not-found" => Some(Problem::NotFound),
            "no-cockpit" => Some(Problem::NoCockpit),
            "unknown-hostkey" => Some(Problem::UnknownHostkey),
            "terminated" => Some(Problem::Terminated),
            "protocol-error" => Some(Problem::ProtocolError),
            "no-session" => Some(Problem::NoSession),
            "disconnected" => Some(Problem::Disconnected),
            _ => None,
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One channel-tagged message, without the transport length prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Channel identifier; `None` designates a control frame.
    pub channel: Option<String>,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Frame {
    pub fn new(channel: Option<&str>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.map(str::to_owned),
            payload: payload.into(),
        }
    }

    pub fn control(payload: impl Into<Bytes>) -> Self {
        Self { channel: None, payload: payload.into() }
    }

    pub fn is_control(&self) -> bool {
        self.channel.is_none()
    }

    /// Splits `channel\npayload` bytes into a frame.
    ///
    /// Returns `None` when the separator is missing or the channel part is
    /// not valid ASCII; callers drop such messages.
    pub fn parse(data: &Bytes) -> Option<Self> {
        let at = memchr(b'\n', data)?;
        let channel = std::str::from_utf8(&data[..at]).ok()?;
        if !channel.is_ascii() {
            return None;
        }
        let channel = if channel.is_empty() { None } else { Some(channel.to_owned()) };
        Some(Self { channel, payload: data.slice(at + 1..) })
    }

    /// Joins the frame back into `channel\npayload` bytes.
    pub fn to_bytes(&self) -> Bytes {
        let channel = self.channel.as_deref().unwrap_or("");
        let mut buf = BytesMut::with_capacity(channel.len() + 1 + self.payload.len());
        buf.put_slice(channel.as_bytes());
        buf.put_u8(b'\n');
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// A control frame payload: a JSON object with a `command` verb.
///
/// Members other than the ones a command consumes are preserved and travel
/// through the session verbatim, so the bridge and the browser can exchange
/// options the gateway does not interpret.
#[derive(Clone, Debug, Default)]
pub struct ControlMessage {
    fields: Map<String, Value>,
}

impl ControlMessage {
    pub fn new(command: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("command".into(), Value::String(command.into()));
        Self { fields }
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(fields)) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn command(&self) -> Option<&str> {
        self.fields.get("command").and_then(Value::as_str)
    }

    pub fn channel(&self) -> Option<&str> {
        self.fields.get("channel").and_then(Value::as_str)
    }

    pub fn str_member(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn int_member(&self, name: &str) -> Option<u64> {
        self.fields.get(name).and_then(Value::as_u64)
    }

    pub fn bool_member(&self, name: &str) -> Option<bool> {
        self.fields.get(name).and_then(Value::as_bool)
    }

    pub fn member(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Serializes into a control frame, ready to send on either transport.
    pub fn to_frame(&self) -> Frame {
        Frame::control(serde_json::to_vec(&Value::Object(self.fields.clone()))
            .unwrap_or_default())
    }
}

/// Shorthand for the `init` message either side opens with.
pub fn init_message() -> ControlMessage {
    ControlMessage::new("init").with("version", PROTOCOL_VERSION)
}

/// Shorthand for a `close` message carrying a reason.
pub fn close_message(channel: Option<&str>, problem: Problem) -> ControlMessage {
    let msg = ControlMessage::new("close").with("reason", problem.as_str());
    match channel {
        Some(channel) => msg.with("channel", channel),
        None => msg,
    }
}
