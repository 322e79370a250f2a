//! Framed message transport to the bridge
//!
//! Shuttles [`Frame`]s over a [`Pipe`] using a 4-byte big-endian length
//! prefix followed by the channel identifier, a `\n`, and the payload; the
//! length covers everything after the prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use memchr::memchr;
use std::{
    io,
    os::unix::process::ExitStatusExt,
    process::ExitStatus,
    task::{Context, Poll},
};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    pipe::{Pipe, PipeEvent},
    protocol::{Frame, Problem},
};

/// Events delivered by a [`Transport`], in order.
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete inbound frame; control frames have no channel.
    Recv(Frame),
    /// The transport has closed; delivered exactly once, last.
    Closed(Option<Problem>),
}

/// The capability a session holds toward its bridge.
///
/// Concrete variants are the pipe-backed [`PipeTransport`] and the
/// in-memory [`MockTransport`] used by tests; the session holds one by
/// reference without knowing which.
pub trait Transport: Send + 'static {
    /// Queues one frame; `channel` is `None` for control frames.
    fn send(&mut self, channel: Option<&str>, payload: Bytes);

    /// Closes the underlying stream; with a problem, immediately.
    fn close(&mut self, problem: Option<Problem>);

    /// Polls for the next event; `None` after `Closed` was delivered.
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<TransportEvent>>;

    /// Transport name, for logging.
    fn name(&self) -> &str;
}

/// Length-prefixed frame codec for the bridge byte stream.
#[derive(Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        loop {
            if src.len() < 4 {
                return Ok(None);
            }
            let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if src.len() < 4 + size {
                src.reserve(4 + size - src.len());
                return Ok(None);
            }

            src.advance(4);
            let message = src.split_to(size).freeze();
            match split_message(&message) {
                Some(frame) => return Ok(Some(frame)),
                None => {
                    tracing::warn!("received invalid frame without a channel separator");
                    continue;
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        let channel = frame.channel.as_deref().unwrap_or("");
        let size = channel.len() + 1 + frame.payload.len();
        dst.reserve(4 + size);
        dst.put_u32(size as u32);
        dst.put_slice(channel.as_bytes());
        dst.put_u8(b'\n');
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

fn split_message(message: &Bytes) -> Option<Frame> {
    let at = memchr(b'\n', message)?;
    let channel = std::str::from_utf8(&message[..at]).ok()?;
    let channel = if channel.is_empty() { None } else { Some(channel.to_owned()) };
    Some(Frame { channel, payload: message.slice(at + 1..) })
}

/// A [`Transport`] over a [`Pipe`], usually the stdio of a bridge process.
pub struct PipeTransport {
    pipe: Pipe,
    codec: FrameCodec,
    buffer: BytesMut,
    closed: bool,
}

impl PipeTransport {
    pub fn new(pipe: Pipe) -> Self {
        Self {
            pipe,
            codec: FrameCodec,
            buffer: BytesMut::new(),
            closed: false,
        }
    }

    /// Pid of the bridge process, when the pipe tracks one.
    pub fn pid(&self) -> Option<u32> {
        self.pipe.pid()
    }

    fn close_problem(&self, problem: Option<Problem>, status: Option<ExitStatus>) -> Option<Problem> {
        if !self.pipe.is_process() {
            return problem;
        }

        match problem {
            // The stream went down without a more precise diagnosis; the
            // exit status of the bridge carries the real reason.
            None | Some(Problem::InternalError) => {
                let Some(status) = status else { return problem };
                if status.signal() == Some(libc::SIGTERM) {
                    Some(Problem::Terminated)
                } else {
                    match status.code() {
                        Some(0) => problem,
                        Some(5) => Some(Problem::NotAuthorized), // wrong password
                        Some(6) => Some(Problem::UnknownHostkey),
                        Some(127) => Some(Problem::NoCockpit), // bridge not installed
                        Some(255) => Some(Problem::Terminated), // ssh failed or got a signal
                        _ => {
                            tracing::warn!("{}: bridge program failed: {status}", self.pipe.name());
                            Some(Problem::InternalError)
                        }
                    }
                }
            }
            Some(Problem::NotFound) => {
                tracing::debug!("{}: failed to execute bridge: not found", self.pipe.name());
                Some(Problem::NoCockpit)
            }
            other => other,
        }
    }
}

impl Transport for PipeTransport {
    fn send(&mut self, channel: Option<&str>, payload: Bytes) {
        let frame = Frame { channel: channel.map(str::to_owned), payload };
        let mut encoded = BytesMut::new();
        self.codec
            .encode(frame, &mut encoded)
            .expect("frame encoding is infallible");
        tracing::trace!("{}: queued {} byte frame", self.pipe.name(), encoded.len());
        self.pipe.write(encoded.freeze());
    }

    fn close(&mut self, problem: Option<Problem>) {
        self.pipe.close(problem);
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<TransportEvent>> {
        loop {
            if self.closed {
                return Poll::Ready(None);
            }

            match self.codec.decode(&mut self.buffer) {
                Ok(Some(frame)) => return Poll::Ready(Some(TransportEvent::Recv(frame))),
                Ok(None) => {}
                Err(_) => unreachable!("frame decoding reports no errors"),
            }

            match std::task::ready!(self.pipe.poll_recv(cx)) {
                Some(PipeEvent::Read(chunk)) => {
                    self.buffer.extend_from_slice(&chunk);
                }
                Some(PipeEvent::Closed { problem, status }) => {
                    let mut problem = problem;
                    if !self.buffer.is_empty() {
                        tracing::warn!(
                            "{}: received truncated {} byte frame",
                            self.pipe.name(),
                            self.buffer.len()
                        );
                        self.buffer.clear();
                        problem = problem.or(Some(Problem::InternalError));
                    }
                    let problem = self.close_problem(problem, status);
                    self.closed = true;
                    tracing::debug!(
                        "{}: closed{}{}",
                        self.pipe.name(),
                        if problem.is_some() { ": " } else { "" },
                        problem.map(|p| p.as_str()).unwrap_or("")
                    );
                    return Poll::Ready(Some(TransportEvent::Closed(problem)));
                }
                None => {
                    self.closed = true;
                    return Poll::Ready(None);
                }
            }
        }
    }

    fn name(&self) -> &str {
        self.pipe.name()
    }
}

/// In-memory transport pair for tests: the session side implements
/// [`Transport`], the [`MockBridge`] side plays the bridge.
pub struct MockTransport {
    name: String,
    sent: mpsc::UnboundedSender<Frame>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    closed: bool,
}

/// The bridge end of a [`MockTransport`] pair.
pub struct MockBridge {
    sent: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockTransport {
    pub fn pair(name: &str) -> (MockTransport, MockBridge) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            MockTransport {
                name: name.to_owned(),
                sent: sent_tx,
                events: event_rx,
                closed: false,
            },
            MockBridge {
                sent: sent_rx,
                events: event_tx,
            },
        )
    }
}

impl Transport for MockTransport {
    fn send(&mut self, channel: Option<&str>, payload: Bytes) {
        if self.closed {
            return;
        }
        let _ = self.sent.send(Frame { channel: channel.map(str::to_owned), payload });
    }

    fn close(&mut self, problem: Option<Problem>) {
        let _ = problem;
        self.closed = true;
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<TransportEvent>> {
        if self.closed {
            return Poll::Ready(None);
        }
        match std::task::ready!(self.events.poll_recv(cx)) {
            Some(event) => {
                if matches!(event, TransportEvent::Closed(_)) {
                    self.closed = true;
                }
                Poll::Ready(Some(event))
            }
            None => Poll::Ready(None),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl MockBridge {
    /// Next frame the session sent toward the bridge.
    pub async fn next_sent(&mut self) -> Option<Frame> {
        self.sent.recv().await
    }

    /// Injects a payload frame as if the bridge produced it.
    pub fn send(&self, channel: Option<&str>, payload: impl Into<Bytes>) {
        let _ = self.events.send(TransportEvent::Recv(Frame {
            channel: channel.map(str::to_owned),
            payload: payload.into(),
        }));
    }

    /// Closes the transport toward the session with `problem`.
    pub fn close(&self, problem: Option<Problem>) {
        let _ = self.events.send(TransportEvent::Closed(problem));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ControlMessage;
    use futures_util::future::poll_fn;

    async fn recv(transport: &mut impl Transport) -> Option<TransportEvent> {
        poll_fn(|cx| transport.poll_recv(cx)).await
    }

    async fn recv_closed(transport: &mut impl Transport) -> Option<Problem> {
        loop {
            match recv(transport).await {
                Some(TransportEvent::Recv(_)) => continue,
                Some(TransportEvent::Closed(problem)) => return problem,
                None => panic!("transport ended without a close event"),
            }
        }
    }

    fn encode(frames: &[Frame]) -> BytesMut {
        let mut codec = FrameCodec;
        let mut wire = BytesMut::new();
        for frame in frames {
            codec.encode(frame.clone(), &mut wire).unwrap();
        }
        wire
    }

    #[test]
    fn it_round_trips_frames_in_order() {
        let frames = [
            Frame::new(Some("4"), Bytes::from_static(b"the message")),
            Frame::control(Bytes::from_static(b"{\"command\":\"init\",\"version\":0}")),
            Frame::new(Some("chan_A-1"), Bytes::from_static(&[0u8, 255, 10, 13])),
            Frame::new(Some("4"), Bytes::new()),
        ];

        let mut wire = encode(&frames);

        let mut codec = FrameCodec;
        let mut decoded = Vec::new();
        while let Some(frame) = codec.decode(&mut wire).unwrap() {
            decoded.push(frame);
        }
        assert_eq!(decoded, frames);
        assert!(wire.is_empty());
    }

    #[test]
    fn it_waits_for_complete_frames() {
        let mut codec = FrameCodec;
        let wire = encode(&[Frame::new(Some("9"), Bytes::from_static(b"split me"))]);

        for cut in 1..wire.len() {
            let mut head = BytesMut::from(&wire[..cut]);
            assert!(codec.decode(&mut head).unwrap().is_none());
        }
    }

    #[test]
    fn it_encodes_the_documented_layout() {
        let mut wire = encode(&[Frame::new(Some("4"), Bytes::from_static(b"abc"))]);

        // length covers channel + newline + payload
        assert_eq!(&wire.split_to(4)[..], &[0, 0, 0, 5]);
        assert_eq!(&wire[..], b"4\nabc");
    }

    #[tokio::test]
    async fn it_frames_an_echo_process() {
        let pipe = Pipe::spawn(&["cat".to_string()], None, None);
        let mut transport = PipeTransport::new(pipe);

        transport.send(Some("4"), Bytes::from_static(b"the message"));

        match recv(&mut transport).await {
            Some(TransportEvent::Recv(frame)) => {
                assert_eq!(frame.channel.as_deref(), Some("4"));
                assert_eq!(&frame.payload[..], b"the message");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        transport.close(None);
        assert_eq!(recv_closed(&mut transport).await, None);
    }

    #[tokio::test]
    async fn it_maps_exit_codes_to_problems() {
        let cases = [
            (5, Problem::NotAuthorized),
            (6, Problem::UnknownHostkey),
            (127, Problem::NoCockpit),
            (255, Problem::Terminated),
            (1, Problem::InternalError),
        ];

        for (code, expected) in cases {
            let argv = vec!["sh".to_string(), "-c".to_string(), format!("exit {code}")];
            let mut transport = PipeTransport::new(Pipe::spawn(&argv, None, None));
            transport.close(None);

            assert_eq!(recv_closed(&mut transport).await, Some(expected), "exit {code}");
        }
    }

    #[tokio::test]
    async fn it_maps_sigterm_to_terminated() {
        let argv = vec!["sleep".to_string(), "60".to_string()];
        let mut transport = PipeTransport::new(Pipe::spawn(&argv, None, None));

        transport.close(Some(Problem::InternalError));

        assert_eq!(recv_closed(&mut transport).await, Some(Problem::Terminated));
    }

    #[tokio::test]
    async fn it_relabels_missing_bridge_as_no_cockpit() {
        let argv = vec!["/nonexistent".to_string()];
        let mut transport = PipeTransport::new(Pipe::spawn(&argv, None, None));

        assert_eq!(recv_closed(&mut transport).await, Some(Problem::NoCockpit));
    }

    #[tokio::test]
    async fn it_reports_truncated_tail_as_internal_error() {
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            // a length prefix promising more bytes than ever arrive
            "printf '\\000\\000\\000\\377'".to_string(),
        ];
        let mut transport = PipeTransport::new(Pipe::spawn(&argv, None, None));
        transport.close(None);

        assert_eq!(recv_closed(&mut transport).await, Some(Problem::InternalError));
    }

    #[tokio::test]
    async fn it_pairs_mock_transports() {
        let (mut transport, mut bridge) = MockTransport::pair("mock");

        transport.send(None, crate::protocol::init_message().to_frame().payload);
        let frame = bridge.next_sent().await.unwrap();
        assert!(frame.is_control());
        let control = ControlMessage::parse(&frame.payload).unwrap();
        assert_eq!(control.command(), Some("init"));

        bridge.send(Some("4"), Bytes::from_static(b"hello"));
        match recv(&mut transport).await {
            Some(TransportEvent::Recv(frame)) => assert_eq!(&frame.payload[..], b"hello"),
            other => panic!("unexpected event: {other:?}"),
        }

        bridge.close(Some(Problem::Terminated));
        assert_eq!(recv_closed(&mut transport).await, Some(Problem::Terminated));
    }
}
