//! The web service session
//!
//! A session owns one [`Transport`] to a bridge and mediates between that
//! bridge and any number of WebSocket peers. It enforces the `init`
//! handshake in both directions, routes channel-tagged frames to the socket
//! that opened the channel, synthesizes `close` frames when the bridge goes
//! away, and reports when it has gone idle so the owner can dispose of it.

use bytes::Bytes;
use futures_util::{future::poll_fn, SinkExt, StreamExt};
use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot, watch},
    time::{interval, sleep, Interval, Sleep},
};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

use crate::{
    protocol::{close_message, init_message, ControlMessage, Frame, Problem, PROTOCOL_VERSION},
    transport::{Transport, TransportEvent},
};

pub(crate) mod resource;

pub use self::resource::{PackageEntry, PackageListing};

/// Authenticated credentials a session was created for.
///
/// An opaque bag with at minimum a user name and a secret. Sessions cannot
/// exist without credentials; the no-auth path never constructs a session
/// at all (see [`Session::noauth_close`]).
#[derive(Clone, Debug)]
pub struct Credentials {
    user: String,
    secret: Option<String>,
}

impl Credentials {
    /// Creates credentials for `user`.
    ///
    /// # Panics
    ///
    /// Panics when `user` is empty; constructing a session without a real
    /// user is a programmer error.
    pub fn new(user: impl Into<String>, secret: impl Into<String>) -> Self {
        let user = user.into();
        assert!(!user.is_empty(), "session credentials require a user");
        Self { user, secret: Some(secret.into()) }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    /// Forgets the secret; used on `logout` without a disconnect.
    fn invalidate(&mut self) {
        self.secret = None;
    }
}

/// Session tuning knobs.
#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    ping_interval: Option<Duration>,
    idle_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends a `ping` control frame to every attached socket on this
    /// interval.
    ///
    /// Default: disabled
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    /// Disposes the session once it has been idle this long.
    ///
    /// Default: disabled
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}

/// Handle to a running web service session.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    idle: watch::Receiver<bool>,
    user: Arc<str>,
    next_socket: Arc<AtomicU64>,
}

enum Command {
    Attach {
        id: u64,
        sender: mpsc::UnboundedSender<Message>,
    },
    SocketMessage {
        id: u64,
        message: Message,
    },
    SocketGone {
        id: u64,
    },
    OpenResource {
        request: resource::ResourceRequest,
        reply: oneshot::Sender<resource::ResourceChannel>,
    },
    RecordChecksums {
        host: String,
        checksums: Vec<String>,
    },
    ChecksumHost {
        checksum: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Disconnect,
}

impl Session {
    /// Creates a session over `transport`, typically the stdio of a freshly
    /// launched bridge.
    ///
    /// The session immediately sends its own `init` toward the bridge; no
    /// payload travels in either direction until the bridge has answered
    /// with its `init`.
    pub fn new(credentials: Credentials, transport: impl Transport, config: SessionConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (idle_tx, idle_rx) = watch::channel(true);
        let user: Arc<str> = credentials.user().into();

        let mut task = SessionTask {
            transport,
            transport_open: true,
            transport_problem: None,
            credentials,
            commands: command_rx,
            init_received: false,
            queue: Vec::new(),
            sockets: HashMap::new(),
            channels: HashMap::new(),
            resources: HashMap::new(),
            next_channel: 0,
            checksums: HashMap::new(),
            host_key: None,
            host_fingerprint: None,
            idle: idle_tx,
            idle_deadline: config.idle_timeout.map(|timeout| Box::pin(sleep(timeout))),
            ping: config.ping_interval.map(interval),
            config,
            running: true,
        };
        task.transport.send(None, init_message().to_frame().payload);
        tokio::spawn(task.run());

        Self {
            commands: command_tx,
            idle: idle_rx,
            user,
            next_socket: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Binds an upgraded WebSocket to this session.
    ///
    /// The session sends its `init` to the socket right away, relays frames
    /// from the socket onto the bridge transport, and fans bridge frames
    /// back out to the channels this socket has opened.
    pub fn attach_socket<S>(&self, socket: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.next_socket.fetch_add(1, Ordering::Relaxed);
        let (sender, mut outbox) = mpsc::unbounded_channel::<Message>();
        let _ = self.commands.send(Command::Attach { id, sender });

        let (mut sink, mut stream) = socket.split();

        tokio::spawn(async move {
            while let Some(message) = outbox.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let commands = self.commands.clone();
        tokio::spawn(async move {
            while let Some(next) = stream.next().await {
                match next {
                    Ok(message) => {
                        if commands.send(Command::SocketMessage { id, message }).is_err() {
                            return;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = commands.send(Command::SocketGone { id });
        });
    }

    /// Answers a WebSocket that has no authenticated session behind it.
    ///
    /// No session is constructed; the socket receives a single
    /// `close` control frame with reason `no-session` and is shut down.
    pub async fn noauth_close<S>(socket: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut socket = socket;
        let close = close_message(Some("4"), Problem::NoSession).to_frame();
        let _ = socket.send(frame_to_message(&close)).await;
        let _ = socket.close(None).await;
    }

    /// Tears down all sockets and the bridge transport; every channel
    /// synthetically closes with reason `disconnected`.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Observes the idle flag: `true` whenever no sockets are attached and
    /// no bridge work is in flight.
    pub fn idle(&self) -> watch::Receiver<bool> {
        self.idle.clone()
    }

    /// Whether the session is idle right now.
    pub fn is_idle(&self) -> bool {
        *self.idle.borrow()
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub(crate) async fn open_resource(
        &self,
        request: resource::ResourceRequest,
    ) -> Option<resource::ResourceChannel> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::OpenResource { request, reply })
            .ok()?;
        answer.await.ok()
    }

    pub(crate) fn record_checksums(&self, host: &str, checksums: Vec<String>) {
        let _ = self.commands.send(Command::RecordChecksums {
            host: host.to_owned(),
            checksums,
        });
    }

    pub(crate) async fn checksum_host(&self, checksum: &str) -> Option<String> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::ChecksumHost { checksum: checksum.to_owned(), reply })
            .ok()?;
        answer.await.ok().flatten()
    }
}

enum Owner {
    Socket(u64),
    Resource(u64),
}

struct SocketEntry {
    sender: mpsc::UnboundedSender<Message>,
    /// The socket has completed its own `init`.
    ready: bool,
}

struct SessionTask<T: Transport> {
    transport: T,
    transport_open: bool,
    /// The reason the transport closed with, answered to late opens.
    transport_problem: Option<Problem>,
    credentials: Credentials,
    commands: mpsc::UnboundedReceiver<Command>,
    /// The bridge has sent its `init` back.
    init_received: bool,
    /// Frames queued until the bridge `init` arrives.
    queue: Vec<Frame>,
    sockets: HashMap<u64, SocketEntry>,
    channels: HashMap<String, Owner>,
    resources: HashMap<u64, mpsc::UnboundedSender<resource::ResourceEvent>>,
    next_channel: u64,
    /// Checksum → host, learned from package listings.
    checksums: HashMap<String, String>,
    host_key: Option<String>,
    host_fingerprint: Option<String>,
    idle: watch::Sender<bool>,
    idle_deadline: Option<Pin<Box<Sleep>>>,
    ping: Option<Interval>,
    config: SessionConfig,
    running: bool,
}

impl<T: Transport> SessionTask<T> {
    async fn run(mut self) {
        while self.running {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        // Every handle is gone; nothing can reach the
                        // session anymore.
                        None => self.dispose(),
                    }
                }

                event = poll_fn(|cx| self.transport.poll_recv(cx)), if self.transport_open => {
                    match event {
                        Some(TransportEvent::Recv(frame)) => self.handle_transport_frame(frame),
                        Some(TransportEvent::Closed(problem)) => self.handle_transport_closed(problem),
                        None => self.transport_open = false,
                    }
                }

                _ = async { self.ping.as_mut().unwrap().tick().await }, if self.ping.is_some() => {
                    let ping = ControlMessage::new("ping").to_frame();
                    for entry in self.sockets.values() {
                        let _ = entry.sender.send(frame_to_message(&ping));
                    }
                }

                _ = async { self.idle_deadline.as_mut().unwrap().await }, if self.idle_deadline.is_some() => {
                    tracing::info!("session timed out for user {}", self.credentials.user());
                    self.dispose();
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Attach { id, sender } => {
                let _ = sender.send(frame_to_message(&init_message().to_frame()));
                self.sockets.insert(id, SocketEntry { sender, ready: false });
                self.wake();
            }
            Command::SocketMessage { id, message } => self.handle_socket_message(id, message),
            Command::SocketGone { id } => self.drop_socket(id),
            Command::OpenResource { request, reply } => self.open_resource(request, reply),
            Command::RecordChecksums { host, checksums } => {
                for checksum in checksums {
                    self.checksums.insert(checksum, host.clone());
                }
            }
            Command::ChecksumHost { checksum, reply } => {
                let _ = reply.send(self.checksums.get(&checksum).cloned());
            }
            Command::Disconnect => self.dispose(),
        }
    }

    fn handle_socket_message(&mut self, id: u64, message: Message) {
        let data = match message {
            Message::Text(_) | Message::Binary(_) => message.into_data(),
            _ => return,
        };

        let Some(frame) = Frame::parse(&data) else {
            tracing::warn!("socket sent an invalid frame");
            self.protocol_error(id, None);
            return;
        };

        match frame.channel.clone().as_deref() {
            None => self.handle_socket_control(id, frame.payload),
            Some(channel) => {
                // Before its own init a socket may send nothing else, not
                // even payload.
                let ready = match self.sockets.get(&id) {
                    Some(entry) => entry.ready,
                    None => return,
                };
                if !ready {
                    tracing::warn!("socket sent data before init message");
                    self.protocol_error(id, None);
                    return;
                }
                self.handle_socket_payload(id, channel, frame)
            }
        }
    }

    fn handle_socket_control(&mut self, id: u64, payload: Bytes) {
        let Some(control) = ControlMessage::parse(&payload) else {
            tracing::warn!("socket sent an unparsable control frame");
            self.protocol_error(id, None);
            return;
        };
        let command = control.command().unwrap_or_default().to_owned();

        let ready = match self.sockets.get(&id) {
            Some(entry) => entry.ready,
            None => return,
        };
        if !ready {
            if command != "init" {
                tracing::warn!("socket did not send init message first: {command}");
                self.protocol_error(id, None);
                return;
            }
            match control.int_member("version") {
                Some(PROTOCOL_VERSION) => {
                    if let Some(entry) = self.sockets.get_mut(&id) {
                        entry.ready = true;
                    }
                }
                version => {
                    tracing::warn!("socket used unsupported version of the protocol: {version:?}");
                    self.protocol_error(id, None);
                }
            }
            return;
        }

        match command.as_str() {
            "init" => (),
            "open" => {
                let Some(channel) = control.channel().map(str::to_owned) else {
                    tracing::warn!("socket sent open without a channel");
                    self.protocol_error(id, None);
                    return;
                };
                if self.channels.contains_key(&channel) {
                    tracing::warn!("socket reused channel id {channel}");
                    self.protocol_error(id, Some(&channel));
                    return;
                }
                // The bridge is already gone: answer the open with the
                // close it would have produced.
                if !self.transport_open {
                    let reason = self.transport_problem.unwrap_or(Problem::Disconnected);
                    let close = self.synthesized_close(&channel, reason);
                    if let Some(entry) = self.sockets.get(&id) {
                        let _ = entry.sender.send(frame_to_message(&close.to_frame()));
                    }
                    return;
                }
                self.channels.insert(channel, Owner::Socket(id));
                // Forwarded verbatim so options the session does not
                // interpret (host, user, password, host-key, ...) survive.
                self.send_to_bridge(Frame::control(payload));
            }
            "close" => {
                // A close for an unknown channel is not forwarded; that
                // keeps a repeated close from producing a second one at
                // the peer.
                match control.channel() {
                    Some(channel) if self.channels.remove(channel).is_some() => {
                        self.send_to_bridge(Frame::control(payload));
                    }
                    other => tracing::debug!("dropped close for unknown channel {other:?}"),
                }
            }
            "ping" => {
                let pong = ControlMessage::new("pong").to_frame();
                if let Some(entry) = self.sockets.get(&id) {
                    let _ = entry.sender.send(frame_to_message(&pong));
                }
            }
            "pong" => (),
            "logout" => {
                if control.bool_member("disconnect").unwrap_or(false) {
                    tracing::info!("got logout with disconnect");
                    self.dispose();
                } else {
                    self.credentials.invalidate();
                }
            }
            _ => self.send_to_bridge(Frame::control(payload)),
        }
    }

    fn handle_socket_payload(&mut self, id: u64, channel: &str, frame: Frame) {
        match self.channels.get(channel) {
            Some(Owner::Socket(owner)) if *owner == id => self.send_to_bridge(frame),
            _ => tracing::debug!("dropped socket message for unknown channel {channel}"),
        }
    }

    fn handle_transport_frame(&mut self, frame: Frame) {
        match frame.channel.as_deref() {
            None => self.handle_transport_control(frame.payload),
            Some(channel) => match self.channels.get(channel) {
                Some(Owner::Socket(id)) => {
                    if let Some(entry) = self.sockets.get(id) {
                        let _ = entry.sender.send(frame_to_message(&frame));
                    }
                }
                Some(Owner::Resource(id)) => {
                    self.resource_event(*id, resource::ResourceEvent::Data(frame.payload));
                }
                None => {
                    tracing::debug!(
                        "{}: received message for unknown channel {channel}",
                        self.transport.name()
                    );
                }
            },
        }
    }

    fn handle_transport_control(&mut self, payload: Bytes) {
        let Some(control) = ControlMessage::parse(&payload) else {
            tracing::warn!("{}: received unparsable control frame", self.transport.name());
            return;
        };

        match control.command() {
            Some("init") => {
                match control.int_member("version") {
                    Some(PROTOCOL_VERSION) => {
                        self.init_received = true;
                        for frame in std::mem::take(&mut self.queue) {
                            self.transport.send(frame.channel.as_deref(), frame.payload);
                        }
                    }
                    version => {
                        tracing::warn!(
                            "{}: bridge used unsupported version of the protocol: {version:?}",
                            self.transport.name()
                        );
                        self.transport.close(Some(Problem::ProtocolError));
                    }
                }
            }
            Some("ping") => {
                let pong = ControlMessage::new("pong").to_frame();
                self.send_to_bridge(pong);
            }
            Some("pong") => (),
            Some("close") => {
                // A close from the bridge side may describe the peer's host
                // key; keep it for the synthesized closes on teardown.
                if let Some(key) = control.str_member("host-key") {
                    self.host_key = Some(key.to_owned());
                }
                if let Some(fingerprint) = control.str_member("host-fingerprint") {
                    self.host_fingerprint = Some(fingerprint.to_owned());
                }

                match control.channel() {
                    Some(channel) => match self.channels.remove(channel) {
                        Some(Owner::Socket(id)) => {
                            if let Some(entry) = self.sockets.get(&id) {
                                let _ = entry.sender.send(frame_to_message(&Frame::control(payload)));
                            }
                        }
                        Some(Owner::Resource(id)) => {
                            self.close_resource(id, resource::ResourceEvent::Close(control));
                        }
                        None => tracing::debug!("close for unknown channel {channel}"),
                    },
                    None => tracing::debug!("close without a channel from the bridge"),
                }
                self.maybe_idle();
            }
            other => {
                // Other bridge controls addressed to a live channel reach
                // its socket untouched (the bridge echoes opens, announces
                // options, and so on); the rest have no addressee.
                match control.channel().map(|channel| self.channels.get(channel)) {
                    Some(Some(Owner::Socket(id))) => {
                        if let Some(entry) = self.sockets.get(id) {
                            let _ = entry.sender.send(frame_to_message(&Frame::control(payload)));
                        }
                    }
                    _ => tracing::debug!("dropped bridge control frame: {other:?}"),
                }
            }
        }
    }

    /// The bridge went away: every channel closes with one reason derived
    /// from its exit, then the mapping is dropped and later writes are
    /// discarded.
    fn handle_transport_closed(&mut self, problem: Option<Problem>) {
        self.transport_open = false;
        self.transport_problem = problem;
        let reason = problem.unwrap_or(Problem::Disconnected);

        let channels = std::mem::take(&mut self.channels);
        for (channel, owner) in channels {
            match owner {
                Owner::Socket(id) => {
                    let close = self.synthesized_close(&channel, reason);
                    if let Some(entry) = self.sockets.get(&id) {
                        let _ = entry.sender.send(frame_to_message(&close.to_frame()));
                    }
                }
                Owner::Resource(id) => {
                    self.close_resource(id, resource::ResourceEvent::TransportClosed(problem));
                }
            }
        }
        self.maybe_idle();
    }

    /// The close a channel's peer sees when the bridge goes away. For an
    /// unknown host key it carries the key material the UI needs for its
    /// trust prompt.
    fn synthesized_close(&self, channel: &str, reason: Problem) -> ControlMessage {
        let mut close = close_message(Some(channel), reason);
        if reason == Problem::UnknownHostkey {
            if let Some(key) = &self.host_key {
                close = close.with("host-key", key.as_str());
            }
            if let Some(fingerprint) = &self.host_fingerprint {
                close = close.with("host-fingerprint", fingerprint.as_str());
            }
        }
        close
    }

    fn open_resource(
        &mut self,
        request: resource::ResourceRequest,
        reply: oneshot::Sender<resource::ResourceChannel>,
    ) {
        if !self.transport_open {
            let (event_tx, events) = mpsc::unbounded_channel();
            let _ = event_tx.send(resource::ResourceEvent::TransportClosed(self.transport_problem));
            let _ = reply.send(resource::ResourceChannel { events });
            return;
        }

        self.next_channel += 1;
        let id = self.next_channel;
        let channel = format!("0:{id}");

        let (event_tx, events) = mpsc::unbounded_channel();
        self.resources.insert(id, event_tx);
        self.channels.insert(channel.clone(), Owner::Resource(id));
        self.wake();

        let mut open = ControlMessage::new("open")
            .with("channel", channel.as_str())
            .with("payload", "resource1");
        if let Some(package) = &request.package {
            open = open.with("package", package.as_str());
        }
        if let Some(path) = &request.path {
            open = open.with("path", path.as_str());
        }
        if let Some(accept) = &request.accept {
            open = open.with("accept", accept.as_str());
        }
        if let Some(host) = &request.host {
            open = open.with("host", host.as_str());
        }
        self.send_to_bridge(open.to_frame());

        if reply.send(resource::ResourceChannel { events }).is_err() {
            // Requester went away already; the close below travels to the
            // bridge once the channel is cleaned up.
            self.abandon_resource(id);
        }
    }

    fn resource_event(&mut self, id: u64, event: resource::ResourceEvent) {
        let gone = match self.resources.get(&id) {
            Some(sender) => sender.send(event).is_err(),
            None => false,
        };
        if gone {
            self.abandon_resource(id);
        }
    }

    fn close_resource(&mut self, id: u64, event: resource::ResourceEvent) {
        if let Some(sender) = self.resources.remove(&id) {
            let _ = sender.send(event);
        }
        self.channels.retain(|_, owner| !matches!(owner, Owner::Resource(other) if *other == id));
        self.maybe_idle();
    }

    /// The response side stopped listening; close the channel toward the
    /// bridge as well.
    fn abandon_resource(&mut self, id: u64) {
        self.resources.remove(&id);
        let mut closed = Vec::new();
        self.channels.retain(|channel, owner| {
            if matches!(owner, Owner::Resource(other) if *other == id) {
                closed.push(channel.clone());
                false
            } else {
                true
            }
        });
        for channel in closed {
            self.send_to_bridge(ControlMessage::new("close").with("channel", channel).to_frame());
        }
        self.maybe_idle();
    }

    /// Payload toward the bridge is held until both directions of `init`
    /// have completed.
    fn send_to_bridge(&mut self, frame: Frame) {
        if !self.transport_open {
            tracing::debug!("dropped frame for closed transport");
            return;
        }
        if self.init_received {
            self.transport.send(frame.channel.as_deref(), frame.payload);
        } else {
            self.queue.push(frame);
        }
    }

    /// Drops a socket, synthetically closing the channels it owned in both
    /// directions.
    fn drop_socket(&mut self, id: u64) {
        let Some(entry) = self.sockets.remove(&id) else { return };
        let _ = entry.sender.send(Message::Close(None));

        let mut closed = Vec::new();
        self.channels.retain(|channel, owner| {
            if matches!(owner, Owner::Socket(other) if *other == id) {
                closed.push(channel.clone());
                false
            } else {
                true
            }
        });
        for channel in closed {
            self.send_to_bridge(ControlMessage::new("close").with("channel", channel).to_frame());
        }
        self.maybe_idle();
    }

    /// Protocol discipline failed on a socket: tell it why, then drop it.
    fn protocol_error(&mut self, id: u64, channel: Option<&str>) {
        if let Some(entry) = self.sockets.get(&id) {
            let close = close_message(channel, Problem::ProtocolError).to_frame();
            let _ = entry.sender.send(frame_to_message(&close));
        }
        self.drop_socket(id);
    }

    fn wake(&mut self) {
        self.idle.send_replace(false);
        self.idle_deadline = None;
    }

    fn maybe_idle(&mut self) {
        if self.sockets.is_empty() && self.resources.is_empty() && !*self.idle.borrow() {
            tracing::debug!("session is idle for user {}", self.credentials.user());
            self.idle.send_replace(true);
            if let Some(timeout) = self.config.idle_timeout {
                self.idle_deadline = Some(Box::pin(sleep(timeout)));
            }
        }
    }

    /// Forced teardown: used for logout, idle expiry, and dropped handles.
    fn dispose(&mut self) {
        let channels = std::mem::take(&mut self.channels);
        for (channel, owner) in channels {
            match owner {
                Owner::Socket(id) => {
                    if let Some(entry) = self.sockets.get(&id) {
                        let close = close_message(Some(&channel), Problem::Disconnected).to_frame();
                        let _ = entry.sender.send(frame_to_message(&close));
                    }
                }
                Owner::Resource(id) => {
                    if let Some(sender) = self.resources.remove(&id) {
                        let _ = sender.send(resource::ResourceEvent::TransportClosed(Some(
                            Problem::Disconnected,
                        )));
                    }
                }
            }
        }

        for (_, entry) in self.sockets.drain() {
            let _ = entry.sender.send(Message::Close(None));
        }
        self.resources.clear();

        if self.transport_open {
            self.transport.close(Some(Problem::Disconnected));
            self.transport_open = false;
        }
        self.idle.send_replace(true);
        self.running = false;
    }
}

fn frame_to_message(frame: &Frame) -> Message {
    let bytes = frame.to_bytes();
    match std::str::from_utf8(&bytes) {
        Ok(text) => Message::text(text.to_owned()),
        Err(_) => Message::binary(bytes),
    }
}
