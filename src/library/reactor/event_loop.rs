use crate::library::{
    config::{IdleSweep, LoopConfig},
    error::{ReactorError, Result},
    network::{acceptor::Acceptor, connection::Connection},
    reactor::{
        channel::{self, Channel, ChannelHandler},
        fds::{EventFd, TimerFd},
        poller::{Events, Poller, Ready},
        registry::{ConnectionRegistry, FdArena},
    },
    server_internals::{ConnectionHooks, LoopCallback, Token, TokenKind},
    utils::lock,
};
use socket2::Socket;
use std::{
    fmt,
    io,
    net::SocketAddr,
    os::fd::{AsRawFd, RawFd},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};
use tracing::{debug, info, trace, warn};

/// Work marshalled onto a loop's own thread.
pub type Task = Box<dyn FnOnce(&mut EventLoop) + Send>;

struct Shared {
    name: String,
    tasks: Mutex<Vec<Task>>,
    waker: EventFd,
    stop: AtomicBool,
    draining: AtomicBool,
    owner: Mutex<Option<ThreadId>>,
}

/// The thread-safe face of an [`EventLoop`]: queue work, wake it, stop it.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("name", &self.shared.name)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LoopHandle {
    pub(crate) fn new(name: &str) -> io::Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                name: name.to_owned(),
                tasks: Mutex::new(Vec::new()),
                waker: EventFd::new()?,
                stop: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                owner: Mutex::new(None),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queues `task` to run on the loop thread.
    ///
    /// The loop drains its queue after every dispatch pass, so a task queued
    /// from the loop's own thread outside a drain needs no wakeup. From any
    /// other thread, or from inside a draining task, the eventfd is kicked so
    /// a blocked wait returns.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&mut EventLoop) + Send + 'static,
    {
        if self.is_stopped() {
            trace!("Loop {} is stopped, dropping task", self.shared.name);
            return;
        }
        lock(&self.shared.tasks).push(Box::new(task));
        if !self.is_in_loop_thread() || self.shared.draining.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    pub fn wakeup(&self) {
        if let Err(err) = self.shared.waker.wake() {
            warn!("Failed to wake loop {}: {err}", self.shared.name);
        }
    }

    /// Sets the stop flag and wakes the loop once. In-flight callbacks finish.
    pub fn stop(&self) {
        if !self.shared.stop.swap(true, Ordering::AcqRel) {
            self.wakeup();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        *lock(&self.shared.owner) == Some(thread::current().id())
    }

    pub fn pending_tasks(&self) -> usize {
        lock(&self.shared.tasks).len()
    }

    fn bind_to_current_thread(&self) {
        *lock(&self.shared.owner) = Some(thread::current().id());
    }
}

struct LoopTimer {
    // Declared before the fd it watches
    channel: Channel,
    fd: TimerFd,
    sweep: IdleSweep,
}

/// Single-threaded reactor: one poller, one task queue, optionally one idle
/// timer and one acceptor, and the connections homed here.
pub struct EventLoop {
    handle: LoopHandle,
    poller: Arc<Poller>,
    events: Events,
    poll_timeout: Duration,
    wakeup_channel: Channel,
    timer: Option<LoopTimer>,
    acceptor: Option<Acceptor>,
    connections: FdArena<Connection>,
    hooks: Arc<ConnectionHooks>,
    registry: Option<Arc<ConnectionRegistry>>,
    on_epoll_timeout: Option<LoopCallback>,
}

impl EventLoop {
    pub fn new(config: LoopConfig) -> Result<Self> {
        let handle = LoopHandle::new(&config.name).map_err(ReactorError::setup("eventfd"))?;
        let poller = Arc::new(Poller::new().map_err(ReactorError::setup("epoll"))?);

        let wakeup_fd: RawFd = handle.shared.waker.as_raw_fd();
        let mut wakeup_channel = Channel::new(
            Arc::clone(&poller),
            wakeup_fd,
            Token::new(TokenKind::Wakeup, wakeup_fd),
        );
        wakeup_channel
            .enable_reading()
            .map_err(ReactorError::setup("wakeup channel"))?;

        let timer = match config.sweep {
            Some(sweep) => {
                let fd = TimerFd::new().map_err(ReactorError::setup("timerfd"))?;
                fd.arm(sweep.interval).map_err(ReactorError::setup("timerfd"))?;
                let raw = fd.as_raw_fd();
                let mut channel =
                    Channel::new(Arc::clone(&poller), raw, Token::new(TokenKind::Timer, raw));
                channel
                    .enable_reading()
                    .map_err(ReactorError::setup("timer channel"))?;
                Some(LoopTimer { channel, fd, sweep })
            }
            None => None,
        };

        Ok(Self {
            handle,
            poller,
            events: Events::with_capacity(config.max_events),
            poll_timeout: config.poll_timeout,
            wakeup_channel,
            timer,
            acceptor: None,
            connections: FdArena::new(),
            hooks: Arc::new(ConnectionHooks::default()),
            registry: None,
            on_epoll_timeout: None,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn poller(&self) -> Arc<Poller> {
        Arc::clone(&self.poller)
    }

    pub fn set_hooks(&mut self, hooks: Arc<ConnectionHooks>) {
        self.hooks = hooks;
    }

    pub fn set_registry(&mut self, registry: Arc<ConnectionRegistry>) {
        self.registry = Some(registry);
    }

    pub fn set_epoll_timeout_callback(&mut self, callback: LoopCallback) {
        self.on_epoll_timeout = Some(callback);
    }

    pub fn set_acceptor(&mut self, acceptor: Acceptor) {
        self.acceptor = Some(acceptor);
    }

    pub fn acceptor(&self) -> Option<&Acceptor> {
        self.acceptor.as_ref()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, fd: RawFd, generation: u32) -> Option<&Connection> {
        self.connections.get(fd, generation)
    }

    /// Runs until stopped. Only an epoll or accept failure gets out of here
    /// early, and the caller treats that as fatal.
    pub fn run(&mut self) -> Result<()> {
        self.handle.bind_to_current_thread();
        info!("Event loop {} running", self.name());
        while !self.handle.is_stopped() {
            self.poll_once()?;
        }
        let released = self.evict_all();
        info!("Event loop {} stopped, released {released} connection(s)", self.name());
        Ok(())
    }

    pub fn poll_once(&mut self) -> Result<usize> {
        self.poll_once_with(Some(self.poll_timeout))
    }

    /// One dispatch pass: wait, dispatch every report in order, drain tasks.
    pub fn poll_once_with(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let n = self
            .poller
            .wait(&mut self.events, timeout)
            .map_err(ReactorError::Multiplexer)?;
        if n == 0 {
            trace!("Loop {} wait timed out", self.name());
            if let Some(callback) = self.on_epoll_timeout.clone() {
                callback(self);
            }
        }
        for index in 0..n {
            if let Some(ready) = self.events.get(index) {
                self.dispatch(ready)?;
            }
        }
        self.run_pending();
        Ok(n)
    }

    pub(crate) fn dispatch(&mut self, ready: Ready) -> Result<()> {
        let Some(token) = Token::unpack(ready.token) else {
            warn!("Unknown epoll token {:#x}", ready.token);
            return Ok(());
        };
        match token.kind {
            TokenKind::Wakeup => {
                self.wakeup_channel.set_ready(ready.revents);
                self.handle_wakeup();
            }
            TokenKind::Timer => self.handle_timer(ready.revents),
            TokenKind::Acceptor => {
                if let Some(acceptor) = self.acceptor.as_mut() {
                    acceptor.channel_mut().set_ready(ready.revents);
                    dispatch_listener(ready.revents, acceptor)?;
                }
            }
            TokenKind::Connection => self.dispatch_connection(token, ready.revents),
        }
        Ok(())
    }

    fn dispatch_connection(&mut self, token: Token, revents: u32) {
        let Some(conn) = self.connections.get_mut(token.fd, token.generation) else {
            // Owner already released; the report outlived it
            trace!("Dropping event for released connection FD:{}", token.fd);
            return;
        };
        conn.channel_mut().set_ready(revents);
        if let Err(err) = channel::dispatch(revents, conn) {
            warn!("Connection FD:{} handler failed: {err}", token.fd);
        }
        self.release_if_closed(token.fd, token.generation);
    }

    fn handle_wakeup(&mut self) {
        if let Err(err) = self.handle.shared.waker.drain() {
            warn!("Failed to drain wakeup fd of {}: {err}", self.name());
        }
        self.run_pending();
    }

    fn handle_timer(&mut self, revents: u32) {
        let Some(timer) = self.timer.as_mut() else {
            return;
        };
        timer.channel.set_ready(revents);
        if let Err(err) = timer.fd.drain() {
            warn!("Failed to drain timerfd: {err}");
        }
        if let Err(err) = timer.fd.arm(timer.sweep.interval) {
            warn!("Failed to re-arm idle timer: {err}");
        }
        let idle_timeout = timer.sweep.idle_timeout;
        let evicted = self.sweep_idle(Instant::now(), idle_timeout);
        if evicted > 0 {
            debug!("Loop {} evicted {evicted} idle connection(s)", self.name());
        }
    }

    /// Closes, without any callback, every connection idle longer than `idle_timeout`.
    pub(crate) fn sweep_idle(&mut self, now: Instant, idle_timeout: Duration) -> usize {
        let idle: Vec<(RawFd, u32)> = self
            .connections
            .iter()
            .filter(|(_, _, conn)| conn.is_idle(now, idle_timeout))
            .map(|(fd, generation, _)| (fd, generation))
            .collect();
        for &(fd, generation) in &idle {
            if let Some(conn) = self.connections.get_mut(fd, generation) {
                debug!("Evicting idle connection FD:{fd}");
                conn.evict();
            }
            self.release(fd, generation);
        }
        idle.len()
    }

    /// Takes ownership of an accepted socket and makes this loop its home.
    pub fn adopt(&mut self, socket: Socket, peer: Option<SocketAddr>) -> Option<(RawFd, u32)> {
        let fd: RawFd = socket.as_raw_fd();
        let generation = self.connections.next_generation(fd);
        let conn = match Connection::new(
            Arc::clone(&self.poller),
            socket,
            peer,
            generation,
            Arc::clone(&self.hooks),
            self.handle.clone(),
        ) {
            Ok(conn) => conn,
            Err(err) => {
                warn!("Failed to register FD:{fd}: {err}");
                return None;
            }
        };
        let handle = conn.handle();
        let displaced = self.connections.insert(fd, generation, conn);
        debug_assert!(displaced.is_none(), "FD:{fd} adopted twice");
        if let Some(registry) = &self.registry {
            registry.insert(handle);
        }
        debug!("Connection FD:{fd} from {peer:?} homed on {}", self.name());

        let hooks = Arc::clone(&self.hooks);
        if let Some(on_new_connection) = &hooks.on_new_connection {
            self.with_connection(fd, generation, |conn| on_new_connection(conn));
        }
        Some((fd, generation))
    }

    /// Runs `f` against a live connection and applies the removal protocol if
    /// `f` closed it. Returns false when the connection is already gone.
    pub fn with_connection<F>(&mut self, fd: RawFd, generation: u32, f: F) -> bool
    where
        F: FnOnce(&mut Connection),
    {
        let Some(conn) = self.connections.get_mut(fd, generation) else {
            return false;
        };
        f(conn);
        self.release_if_closed(fd, generation);
        true
    }

    fn release_if_closed(&mut self, fd: RawFd, generation: u32) {
        if self
            .connections
            .get(fd, generation)
            .is_some_and(Connection::is_closed)
        {
            self.release(fd, generation);
        }
    }

    /// The single teardown path: local arena, then the server registry, then
    /// the fd itself when the connection drops.
    pub(crate) fn release(&mut self, fd: RawFd, generation: u32) {
        let Some(conn) = self.connections.remove(fd, generation) else {
            return;
        };
        if let Some(registry) = &self.registry {
            registry.remove(fd, generation);
        }
        trace!("Released connection FD:{fd}");
        drop(conn);
    }

    fn evict_all(&mut self) -> usize {
        let keys = self.connections.keys();
        for &(fd, generation) in &keys {
            if let Some(conn) = self.connections.get_mut(fd, generation) {
                conn.evict();
            }
            self.release(fd, generation);
        }
        keys.len()
    }

    /// Drains the task queue: swap under the lock, run outside it.
    pub(crate) fn run_pending(&mut self) -> usize {
        let tasks: Vec<Task> = std::mem::take(&mut *lock(&self.handle.shared.tasks));
        if tasks.is_empty() {
            return 0;
        }
        let count = tasks.len();
        self.handle.shared.draining.store(true, Ordering::Release);
        for task in tasks {
            task(self);
        }
        self.handle.shared.draining.store(false, Ordering::Release);
        count
    }
}

/// Listener failures leave the loop as [`ReactorError::Accept`]; the caller
/// running the loop decides whether that is fatal.
fn dispatch_listener<H: ChannelHandler + ?Sized>(revents: u32, listener: &mut H) -> Result<()> {
    channel::dispatch(revents, listener)
        .map(drop)
        .map_err(ReactorError::Accept)
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.evict_all();
        // Queued tasks may hold handles back to this loop
        lock(&self.handle.shared.tasks).clear();
    }
}
