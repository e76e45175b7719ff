use crate::library::{
    http::session::ConnContext,
    network::buffer::Buffer,
    reactor::{
        channel::{Channel, ChannelHandler, WRITE_EVENT},
        event_loop::{EventLoop, LoopHandle},
        poller::Poller,
    },
    server_internals::{ConnectionHooks, Token},
};
use bytes::Bytes;
use socket2::Socket;
use std::{
    fmt,
    io::{self, ErrorKind},
    net::SocketAddr,
    os::fd::{AsRawFd, RawFd},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn};

/// Largest single `send` syscall.
pub const MAX_WRITE_CHUNK: usize = 512 * 1024;
/// Bytes one write-ready callback may push before yielding to other fds.
pub const WRITE_BUDGET: usize = 4 * MAX_WRITE_CHUNK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    Closing,
    Closed,
}

/// One accepted socket living on exactly one worker loop.
///
/// Only ever touched from that loop's thread. Other threads go through a
/// [`ConnectionHandle`].
pub struct Connection {
    // Dropped before the socket so the fd leaves epoll while still open
    channel: Channel,
    socket: Socket,
    fd: RawFd,
    generation: u32,
    peer: Option<SocketAddr>,
    in_buffer: Buffer,
    out_buffer: Buffer,
    state: ConnState,
    close_on_drain: bool,
    last_activity: Instant,
    context: ConnContext,
    hooks: Arc<ConnectionHooks>,
    owner: LoopHandle,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("generation", &self.generation)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("pending_output", &self.out_buffer.readable_bytes())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        poller: Arc<Poller>,
        socket: Socket,
        peer: Option<SocketAddr>,
        generation: u32,
        hooks: Arc<ConnectionHooks>,
        owner: LoopHandle,
    ) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let fd = socket.as_raw_fd();
        let token = Token::connection(fd, generation);
        let mut channel = Channel::new(poller, fd, token);
        channel.enable_edge_triggered();
        channel.enable_reading()?;
        Ok(Self {
            channel,
            socket,
            fd,
            generation: token.generation,
            peer,
            in_buffer: Buffer::new(),
            out_buffer: Buffer::new(),
            state: ConnState::Open,
            close_on_drain: false,
            last_activity: Instant::now(),
            context: ConnContext::None,
            hooks,
            owner,
        })
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline(always)]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    #[inline(always)]
    pub fn is_open(&self) -> bool {
        self.state == ConnState::Open
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// True once `close_after_flush` was asked for and the close is still ahead.
    pub fn close_pending(&self) -> bool {
        self.close_on_drain && self.state == ConnState::Open
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > idle_timeout
    }

    /// Bytes queued but not yet accepted by the kernel.
    pub fn pending_output(&self) -> &[u8] {
        self.out_buffer.peek()
    }

    pub fn context(&self) -> &ConnContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ConnContext {
        &mut self.context
    }

    pub fn set_context(&mut self, context: ConnContext) {
        self.context = context;
    }

    pub fn take_context(&mut self) -> ConnContext {
        std::mem::take(&mut self.context)
    }

    /// Cross-thread handle to this connection.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::new(self.fd, self.generation, self.peer, self.owner.clone())
    }

    /// The loop this connection lives on.
    pub fn owner(&self) -> &LoopHandle {
        &self.owner
    }

    pub(crate) fn channel_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }

    /// Queues `data` and asks for a writable notification. We are on the
    /// owning thread by construction: a `&mut Connection` exists nowhere else.
    pub fn send(&mut self, data: &[u8]) {
        if self.state != ConnState::Open {
            trace!("Send on FD:{} ignored, connection is {:?}", self.fd, self.state);
            return;
        }
        if data.is_empty() {
            return;
        }
        self.out_buffer.append(data);
        if !self.channel.is_writing() {
            if let Err(err) = self.channel.enable_writing() {
                warn!("Failed to arm write on FD:{}: {err}", self.fd);
                self.close();
            }
        }
    }

    /// Owner-initiated close. Fires `on_close` once; queued output is dropped.
    pub fn close(&mut self) {
        if self.state != ConnState::Open {
            return;
        }
        self.state = ConnState::Closing;
        if let Err(err) = self.channel.remove() {
            trace!("FD:{} left epoll uncleanly: {err}", self.fd);
        }
        debug!("Connection FD:{} closing", self.fd);
        let hooks = Arc::clone(&self.hooks);
        if let Some(on_close) = &hooks.on_close {
            on_close(self);
        }
        self.state = ConnState::Closed;
    }

    /// Closes as soon as the queued output has reached the kernel.
    pub fn close_after_flush(&mut self) {
        if self.out_buffer.is_empty() {
            self.close();
        } else {
            self.close_on_drain = true;
        }
    }

    /// Silent close used by the idle sweep and loop shutdown: no callbacks.
    pub(crate) fn evict(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        if let Err(err) = self.channel.remove() {
            trace!("FD:{} left epoll uncleanly: {err}", self.fd);
        }
        self.state = ConnState::Closed;
    }

    fn fail(&mut self, err: io::Error) {
        if self.state != ConnState::Open {
            return;
        }
        warn!("Connection FD:{} failed: {err}", self.fd);
        self.state = ConnState::Closing;
        if let Err(err) = self.channel.remove() {
            trace!("FD:{} left epoll uncleanly: {err}", self.fd);
        }
        let hooks = Arc::clone(&self.hooks);
        if let Some(on_error) = &hooks.on_error {
            on_error(self);
        }
        self.state = ConnState::Closed;
    }

    fn deliver(&mut self) {
        if self.in_buffer.is_empty() {
            return;
        }
        self.last_activity = Instant::now();
        let message: Bytes = self.in_buffer.retrieve_all_as_bytes();
        let hooks = Arc::clone(&self.hooks);
        match &hooks.on_message {
            Some(on_message) => on_message(self, message),
            None => trace!("FD:{} dropped {} unhandled bytes", self.fd, message.len()),
        }
    }
}

impl ChannelHandler for Connection {
    /// Data and the FIN often share one report, so the socket is drained
    /// through the read path before anything is torn down.
    fn handle_close(&mut self) -> io::Result<()> {
        trace!("Peer of FD:{} hung up", self.fd);
        self.handle_read()
    }

    /// Edge triggered: read until the kernel has nothing left.
    fn handle_read(&mut self) -> io::Result<()> {
        let mut peer_closed = false;
        let mut failure: Option<io::Error> = None;
        loop {
            let mut reader: &Socket = &self.socket;
            match self.in_buffer.read_from(&mut reader) {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => trace!("FD:{} read {n} bytes", self.fd),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        self.deliver();
        if let Some(err) = failure {
            warn!("Read on FD:{} failed: {err}", self.fd);
            self.close();
        } else if peer_closed {
            // Half-closed peers still read: flush what the delivery queued
            self.close_after_flush();
        }
        if self.is_open() && self.channel.is_writing() && self.channel.ready() & WRITE_EVENT != 0 {
            // Writability arrived in the same report and was not serviced.
            // Re-arm so epoll reports it again instead of losing the edge.
            if let Err(err) = self.channel.update() {
                self.fail(err);
            }
        }
        Ok(())
    }

    fn handle_write(&mut self) -> io::Result<()> {
        if !self.channel.is_writing() {
            trace!("FD:{} is writable but nothing is queued", self.fd);
            return Ok(());
        }
        let mut written: usize = 0;
        while !self.out_buffer.is_empty() && written < WRITE_BUDGET {
            let chunk = self.out_buffer.readable_bytes().min(MAX_WRITE_CHUNK);
            match self
                .socket
                .send_with_flags(&self.out_buffer.peek()[..chunk], libc::MSG_NOSIGNAL)
            {
                Ok(0) => break,
                Ok(n) => {
                    self.out_buffer.retrieve(n);
                    written += n;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) => {
                    warn!("Write on FD:{} failed: {err}", self.fd);
                    self.close();
                    return Ok(());
                }
            }
        }
        if !self.out_buffer.is_empty() {
            // Budget spent. Re-arm so the next pass comes back here after the others.
            if let Err(err) = self.channel.update() {
                self.fail(err);
            }
            return Ok(());
        }
        if let Err(err) = self.channel.disable_writing() {
            self.fail(err);
            return Ok(());
        }
        let hooks = Arc::clone(&self.hooks);
        if let Some(on_send_complete) = &hooks.on_send_complete {
            on_send_complete(self);
        }
        if self.close_on_drain && self.out_buffer.is_empty() {
            self.close();
        }
        Ok(())
    }

    fn handle_error(&mut self) -> io::Result<()> {
        let err = self
            .socket
            .take_error()
            .ok()
            .flatten()
            .unwrap_or_else(|| io::Error::other("socket reported an error condition"));
        self.fail(err);
        Ok(())
    }
}

/// Thread-safe stand-in for a [`Connection`]. Everything it does is
/// marshalled onto the owning loop; work addressed to a connection that is
/// gone by then is dropped.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    fd: RawFd,
    generation: u32,
    peer: Option<SocketAddr>,
    owner: LoopHandle,
}

impl ConnectionHandle {
    pub(crate) fn new(fd: RawFd, generation: u32, peer: Option<SocketAddr>, owner: LoopHandle) -> Self {
        Self {
            fd,
            generation,
            peer,
            owner,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn owner(&self) -> &LoopHandle {
        &self.owner
    }

    /// Runs `f` on the owning thread against the live connection.
    pub fn run<F>(&self, f: F)
    where
        F: FnOnce(&mut Connection) + Send + 'static,
    {
        let (fd, generation) = (self.fd, self.generation);
        self.owner.queue_in_loop(move |lp: &mut EventLoop| {
            if !lp.with_connection(fd, generation, f) {
                trace!("Task for released connection FD:{fd} dropped");
            }
        });
    }

    pub fn send(&self, data: impl Into<Bytes>) {
        let data: Bytes = data.into();
        self.run(move |conn| conn.send(&data));
    }

    pub fn close(&self) {
        self.run(Connection::close);
    }

    pub fn close_after_flush(&self) {
        self.run(Connection::close_after_flush);
    }
}
