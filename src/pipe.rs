//! Byte pipes with queued output and child-process tracking
//!
//! A [`Pipe`] is a bidirectional byte stream similar in concept to a unix
//! shell pipe: reads are delivered as owned chunks, writes are queued and
//! flushed with vectored I/O, and the two directions half-close
//! independently. When the pipe talks to a process the close event is held
//! back until the child has been reaped, and the raw exit status is made
//! available to the caller.

use bytes::{Bytes, BytesMut};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::{
    collections::VecDeque,
    io::{self, IoSlice},
    os::fd::{AsRawFd, OwnedFd},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    pin::Pin,
    process::ExitStatus,
    sync::Arc,
    task::{ready, Context, Poll},
};
use tokio::{
    io::{unix::AsyncFd, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::UnixStream,
    process::{Child, Command},
    sync::mpsc,
};

use crate::protocol::Problem;

const READ_CHUNK: usize = 1024;
const WRITE_BATCH: usize = 4;

/// Events delivered by a [`Pipe`], in order.
#[derive(Debug)]
pub enum PipeEvent {
    /// A chunk of input. Chunks arrive in the order the peer produced them.
    Read(Bytes),
    /// The pipe has fully closed. Delivered exactly once, after input has
    /// ended *and* the child (if any) has been reaped.
    Closed {
        /// `None` for a clean shutdown.
        problem: Option<Problem>,
        /// Raw exit status when the pipe tracked a child process.
        status: Option<ExitStatus>,
    },
}

enum PipeCommand {
    Write(Bytes),
    Close(Option<Problem>),
}

/// A non-blocking byte stream with queued writes and independent half-close.
pub struct Pipe {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<PipeCommand>,
    events: mpsc::UnboundedReceiver<PipeEvent>,
    pid: Option<u32>,
    is_process: bool,
    closing: bool,
}

impl Pipe {
    /// Creates a pipe over an already-connected pair of stream halves.
    pub fn new<R, W>(name: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(name, Some(reader), Some(writer), None, false)
    }

    /// Creates a pipe over a unix stream socket.
    pub fn from_stream(name: &str, stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::start(name, Some(reader), Some(writer), None, false)
    }

    /// Connects to a unix socket address in stream mode.
    ///
    /// If the connection fails a pipe is still returned; it closes with an
    /// appropriate problem as soon as it is polled.
    pub async fn connect(name: &str, address: impl AsRef<Path>) -> Self {
        match UnixStream::connect(address.as_ref()).await {
            Ok(stream) => Self::from_stream(name, stream),
            Err(err) => {
                let problem = match err.kind() {
                    io::ErrorKind::PermissionDenied => Problem::NotAuthorized,
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                        Problem::NotFound
                    }
                    _ => Problem::InternalError,
                };
                if problem == Problem::InternalError {
                    tracing::warn!("{name}: couldn't connect: {err}");
                } else {
                    tracing::debug!("{name}: couldn't connect: {err}");
                }
                Self::dead(name, problem, false)
            }
        }
    }

    /// Launches a child process and pipes its standard in and out.
    ///
    /// A `PATH` in the supplied environment (if any) is honored when
    /// resolving `argv[0]`; otherwise the ambient `PATH` is searched. If the
    /// spawn fails a pipe is still returned; it closes with an appropriate
    /// problem as soon as it is polled.
    pub fn spawn(argv: &[String], env: Option<&[(String, String)]>, directory: Option<&Path>) -> Self {
        let name = basename(&argv[0]);
        let program = match resolve_program(&argv[0], env) {
            Some(program) => program,
            None => {
                tracing::debug!("{name}: couldn't run {}: not found", argv[0]);
                return Self::dead_process(&name, Problem::NotFound);
            }
        };

        let mut command = Command::new(program);
        command
            .args(&argv[1..])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped());
        if let Some(env) = env {
            command.env_clear();
            command.envs(env.iter().map(|(k, v)| (k, v)));
        }
        if let Some(directory) = directory {
            command.current_dir(directory);
        }

        match command.spawn() {
            Ok(mut child) => {
                tracing::debug!("{name}: spawned: {}", argv[0]);
                let stdin = child.stdin.take().expect("child stdin requested");
                let stdout = child.stdout.take().expect("child stdout requested");
                Self::start(&name, Some(stdout), Some(stdin), Some(child), false)
            }
            Err(err) => {
                let problem = spawn_problem(&err);
                if problem == Problem::InternalError {
                    tracing::warn!("{name}: couldn't run {}: {err}", argv[0]);
                } else {
                    tracing::debug!("{name}: couldn't run {}: {err}", argv[0]);
                }
                Self::dead_process(&name, problem)
            }
        }
    }

    /// Launches a child on a pseudo-terminal; parent and child share one
    /// pty descriptor for both directions.
    pub fn pty(argv: &[String], env: Option<&[(String, String)]>, directory: Option<&Path>) -> Self {
        let name = basename(&argv[0]);
        let pty = match nix::pty::openpty(None, None) {
            Ok(pty) => pty,
            Err(err) => {
                tracing::warn!("{name}: couldn't open pty: {err}");
                return Self::dead_process(&name, Problem::InternalError);
            }
        };

        let program = match resolve_program(&argv[0], env) {
            Some(program) => program,
            None => {
                tracing::debug!("{name}: couldn't run {}: not found", argv[0]);
                return Self::dead_process(&name, Problem::NotFound);
            }
        };

        let mut command = Command::new(program);
        command.args(&argv[1..]);
        if let Some(env) = env {
            command.env_clear();
            command.envs(env.iter().map(|(k, v)| (k, v)));
        }
        if let Some(directory) = directory {
            command.current_dir(directory);
        }

        let slave_fd = pty.slave.as_raw_fd();
        unsafe {
            command.pre_exec(move || {
                // Makes the slave the controlling terminal on fds 0/1/2.
                if libc::login_tty(slave_fd) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let problem = spawn_problem(&err);
                tracing::warn!("{name}: couldn't run {}: {err}", argv[0]);
                return Self::dead_process(&name, problem);
            }
        };
        drop(pty.slave);

        match PtyStream::new(pty.master) {
            Ok(master) => {
                let (reader, writer) = tokio::io::split(master);
                Self::start(&name, Some(reader), Some(writer), Some(child), true)
            }
            Err(err) => {
                tracing::warn!("{name}: couldn't set up pty master: {err}");
                Self::dead_process(&name, Problem::InternalError)
            }
        }
    }

    /// Queues `data` for transmission.
    ///
    /// Writing after [`close`](Self::close) has been requested is invalid;
    /// the data is dropped with a log line. Zero length blocks are ignored.
    pub fn write(&mut self, data: Bytes) {
        if self.closing {
            tracing::warn!("{}: dropping message written after close", self.name);
            return;
        }
        if data.is_empty() {
            tracing::debug!("{}: ignoring zero byte data block", self.name);
            return;
        }
        if self.commands.send(PipeCommand::Write(data)).is_err() {
            // The stream is gone but the close has not been observed yet,
            // which happens while waiting for a child to exit.
            tracing::debug!("{}: dropping message while waiting for child to exit", self.name);
        }
    }

    /// Closes the pipe.
    ///
    /// With a `problem` the pipe tears down immediately: queued writes are
    /// discarded and any live child receives SIGTERM. Without one the output
    /// side half-closes after the write queue drains, and the pipe closes
    /// fully once the peer ends its input.
    pub fn close(&mut self, problem: Option<Problem>) {
        self.closing = true;
        let _ = self.commands.send(PipeCommand::Close(problem));
    }

    /// Receives the next pipe event; `None` after `Closed` was delivered.
    pub async fn recv(&mut self) -> Option<PipeEvent> {
        self.events.recv().await
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<PipeEvent>> {
        self.events.poll_recv(cx)
    }

    /// Process id of the child, when the pipe tracks one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether this pipe was created for a child process, successfully or not.
    pub fn is_process(&self) -> bool {
        self.is_process
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn start<R, W>(
        name: &str,
        reader: Option<R>,
        writer: Option<W>,
        child: Option<Child>,
        shared_fd: bool,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name: Arc<str> = name.into();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pid = child.as_ref().and_then(Child::id);
        let is_process = child.is_some();

        let task = PipeTask {
            name: name.clone(),
            reader,
            writer,
            shared_fd,
            child,
            commands: command_rx,
            events: event_tx,
            queue: VecDeque::new(),
            partial: 0,
            closing: false,
            problem: None,
            status: None,
        };
        tokio::spawn(task.run());

        Self {
            name,
            commands: command_tx,
            events: event_rx,
            pid,
            is_process,
            closing: false,
        }
    }

    /// A pipe that is already closed; reports `problem` as soon as polled.
    fn dead(name: &str, problem: Problem, is_process: bool) -> Self {
        let (command_tx, _command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(PipeEvent::Closed { problem: Some(problem), status: None });

        Self {
            name: name.into(),
            commands: command_tx,
            events: event_rx,
            pid: None,
            is_process,
            closing: true,
        }
    }

    fn dead_process(name: &str, problem: Problem) -> Self {
        Self::dead(name, problem, true)
    }
}

struct PipeTask<R, W> {
    name: Arc<str>,
    reader: Option<R>,
    writer: Option<W>,
    shared_fd: bool,
    child: Option<Child>,
    commands: mpsc::UnboundedReceiver<PipeCommand>,
    events: mpsc::UnboundedSender<PipeEvent>,
    queue: VecDeque<Bytes>,
    partial: usize,
    closing: bool,
    problem: Option<Problem>,
    status: Option<ExitStatus>,
}

impl<R, W> PipeTask<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn run(self) {
        let PipeTask {
            name,
            mut reader,
            mut writer,
            shared_fd,
            mut child,
            mut commands,
            events,
            mut queue,
            mut partial,
            mut closing,
            mut problem,
            mut status,
        } = self;

        let mut chunk = BytesMut::with_capacity(READ_CHUNK);

        loop {
            // Output drained on a graceful close: shut the write side down.
            if closing && problem.is_none() && queue.is_empty() && writer.is_some() {
                tracing::debug!("{name}: end of output");
                if let Some(mut w) = writer.take() {
                    if let Err(err) = w.shutdown().await {
                        tracing::warn!("{name}: couldn't shutdown stream: {err}");
                        problem = Some(Problem::InternalError);
                        reader = None;
                    }
                }
                if shared_fd {
                    // One descriptor carries both directions, so ending
                    // output ends input with it.
                    tracing::debug!("{name}: and closing input because same fd");
                    reader = None;
                }
            }

            // Fully closed once input has ended and all output is flushed.
            if reader.is_none() && (queue.is_empty() || problem.is_some() || writer.is_none()) {
                break;
            }

            tokio::select! {
                result = async { reader.as_mut().unwrap().read_buf(&mut chunk).await },
                    if reader.is_some() =>
                {
                    match result {
                        Ok(0) => {
                            tracing::debug!("{name}: end of input");
                            reader = None;
                        }
                        Ok(_) => {
                            let _ = events.send(PipeEvent::Read(chunk.split().freeze()));
                            chunk.reserve(READ_CHUNK);
                        }
                        Err(err) => {
                            tracing::warn!("{name}: couldn't read: {err}");
                            teardown(&name, &mut queue, &mut reader, &mut writer, &mut child,
                                     &mut problem, Problem::InternalError);
                        }
                    }
                }

                result = async { write_batch(writer.as_mut().unwrap(), &queue, partial).await },
                    if writer.is_some() && !queue.is_empty() =>
                {
                    match result {
                        Ok(written) => {
                            advance_queue(&name, &mut queue, &mut partial, written);
                        }
                        Err(err) => {
                            if err.kind() == io::ErrorKind::BrokenPipe {
                                tracing::debug!("{name}: couldn't write: {err}");
                            } else {
                                tracing::warn!("{name}: couldn't write: {err}");
                            }
                            teardown(&name, &mut queue, &mut reader, &mut writer, &mut child,
                                     &mut problem, Problem::InternalError);
                        }
                    }
                }

                command = commands.recv() => {
                    match command {
                        Some(PipeCommand::Write(data)) => {
                            if !closing {
                                queue.push_back(data);
                            }
                        }
                        Some(PipeCommand::Close(request)) => {
                            closing = true;
                            if let Some(requested) = request {
                                teardown(&name, &mut queue, &mut reader, &mut writer, &mut child,
                                         &mut problem, requested);
                            }
                        }
                        // The handle is gone without a close; treat it as a
                        // forced teardown.
                        None => {
                            closing = true;
                            teardown(&name, &mut queue, &mut reader, &mut writer, &mut child,
                                     &mut problem, Problem::Terminated);
                        }
                    }
                }

                result = async { child.as_mut().unwrap().wait().await }, if child.is_some() => {
                    match result {
                        Ok(exit) => {
                            tracing::debug!("{name}: child process quit: {exit}");
                            status = Some(exit);
                        }
                        Err(err) => tracing::warn!("{name}: couldn't wait for child: {err}"),
                    }
                    child = None;
                }
            }
        }

        drop(reader);
        drop(writer);

        // Wait until both the stream has closed *and* the child has exited
        // before reporting the close.
        if let Some(mut child) = child.take() {
            match child.wait().await {
                Ok(exit) => {
                    tracing::debug!("{name}: child process quit: {exit}");
                    status = Some(exit);
                }
                Err(err) => tracing::warn!("{name}: couldn't wait for child: {err}"),
            }
        }

        tracing::debug!(
            "{name}: closed{}{}",
            if problem.is_some() { ": " } else { "" },
            problem.map(|p| p.as_str()).unwrap_or("")
        );
        let _ = events.send(PipeEvent::Closed { problem, status });
    }
}

fn teardown<R, W>(
    name: &str,
    queue: &mut VecDeque<Bytes>,
    reader: &mut Option<R>,
    writer: &mut Option<W>,
    child: &mut Option<Child>,
    problem: &mut Option<Problem>,
    requested: Problem,
) {
    if problem.is_none() {
        *problem = Some(requested);
    }
    queue.clear();
    *reader = None;
    *writer = None;

    if let Some(child) = child {
        if let Some(pid) = child.id() {
            tracing::debug!("{name}: killing child: {pid}");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
}

/// One vectored write of up to [`WRITE_BATCH`] queued buffers.
async fn write_batch<W: AsyncWrite + Unpin>(
    writer: &mut W,
    queue: &VecDeque<Bytes>,
    partial: usize,
) -> io::Result<usize> {
    let mut slices: Vec<IoSlice> = Vec::with_capacity(WRITE_BATCH);
    for (index, buffer) in queue.iter().take(WRITE_BATCH).enumerate() {
        if index == 0 {
            slices.push(IoSlice::new(&buffer[partial..]));
        } else {
            slices.push(IoSlice::new(buffer));
        }
    }
    let written = writer.write_vectored(&slices).await?;
    if written == 0 {
        return Err(io::ErrorKind::WriteZero.into());
    }
    Ok(written)
}

fn advance_queue(name: &str, queue: &mut VecDeque<Bytes>, partial: &mut usize, mut written: usize) {
    while written > 0 {
        let head = queue.front().expect("write covered queued data");
        let remaining = head.len() - *partial;
        if written >= remaining {
            tracing::trace!("{name}: wrote {remaining} bytes");
            queue.pop_front();
            *partial = 0;
            written -= remaining;
        } else {
            tracing::trace!("{name}: partial write {written} of {remaining} bytes");
            *partial += written;
            written = 0;
        }
    }
    if queue.is_empty() {
        tracing::trace!("{name}: output queue empty");
    }
}

fn spawn_problem(err: &io::Error) -> Problem {
    match err.kind() {
        io::ErrorKind::NotFound => Problem::NotFound,
        io::ErrorKind::PermissionDenied => Problem::NotAuthorized,
        _ => Problem::InternalError,
    }
}

fn basename(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_owned())
}

/// Resolves `program` the way an exec would: verbatim when it contains a
/// slash, otherwise searched in the `PATH` of the supplied environment, or
/// the ambient `PATH` when the environment carries none.
fn resolve_program(program: &str, env: Option<&[(String, String)]>) -> Option<PathBuf> {
    if program.contains('/') {
        return Some(PathBuf::from(program));
    }

    let supplied = env.and_then(|env| {
        env.iter()
            .find(|(key, _)| key == "PATH")
            .map(|(_, value)| value.clone())
    });
    let path = match supplied {
        Some(path) => path,
        None => std::env::var("PATH").ok()?,
    };

    for dir in path.split(':').filter(|dir| !dir.is_empty()) {
        let candidate = Path::new(dir).join(program);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Pty master wrapped for the tokio reactor. Reads report EOF once the
/// slave side is gone (the kernel returns `EIO` there).
struct PtyStream {
    fd: AsyncFd<OwnedFd>,
}

impl PtyStream {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        use nix::fcntl::{fcntl, FcntlArg, OFlag};
        let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
        Ok(Self { fd: AsyncFd::new(fd)? })
    }
}

impl AsyncRead for PtyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let mut scratch = [0u8; READ_CHUNK];
            let wanted = scratch.len().min(buf.remaining());
            let result = guard.try_io(|inner| {
                let read = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
                        scratch.as_mut_ptr().cast(),
                        wanted,
                    )
                };
                if read < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EIO) {
                        Ok(0)
                    } else {
                        Err(err)
                    }
                } else {
                    Ok(read as usize)
                }
            });
            match result {
                Ok(Ok(read)) => {
                    buf.put_slice(&scratch[..read]);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for PtyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            let result = guard.try_io(|inner| {
                let written = unsafe {
                    libc::write(inner.get_ref().as_raw_fd(), data.as_ptr().cast(), data.len())
                };
                if written < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(written as usize)
                }
            });
            match result {
                Ok(output) => return Poll::Ready(output),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
