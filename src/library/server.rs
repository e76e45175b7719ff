use crate::library::{
    config::ServerConfig,
    error::{Result, fatal},
    network::{acceptor::Acceptor, connection::Connection},
    reactor::{
        event_loop::{EventLoop, LoopHandle},
        registry::ConnectionRegistry,
    },
    server_internals::{ConnectionHooks, LoopCallback, worker_index},
    thread_pool::{PoolConfig, ThreadPool},
};
use bytes::Bytes;
use socket2::Socket;
use std::{
    net::SocketAddr,
    os::fd::AsRawFd,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{info, trace};

/// Registers the lifecycle callbacks, then builds the server.
pub struct TcpServerBuilder {
    config: ServerConfig,
    hooks: ConnectionHooks,
    on_epoll_timeout: Option<LoopCallback>,
}

impl TcpServerBuilder {
    pub fn on_new_connection<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Connection) + Send + Sync + 'static,
    {
        self.hooks.on_new_connection = Some(Arc::new(f));
        self
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Connection, Bytes) + Send + Sync + 'static,
    {
        self.hooks.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_send_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Connection) + Send + Sync + 'static,
    {
        self.hooks.on_send_complete = Some(Arc::new(f));
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Connection) + Send + Sync + 'static,
    {
        self.hooks.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Connection) + Send + Sync + 'static,
    {
        self.hooks.on_error = Some(Arc::new(f));
        self
    }

    /// Fires on every loop, main and workers, when a wait comes back empty.
    pub fn on_epoll_timeout<F>(mut self, f: F) -> Self
    where
        F: Fn(&EventLoop) + Send + Sync + 'static,
    {
        self.on_epoll_timeout = Some(Arc::new(f));
        self
    }

    /// Binds the listener and starts the worker loops. Connections are
    /// accepted once [`TcpServer::run`] drives the main loop.
    pub fn build(self) -> Result<TcpServer> {
        let Self {
            config,
            hooks,
            on_epoll_timeout,
        } = self;
        config.validate()?;
        let hooks = Arc::new(hooks);
        let registry = Arc::new(ConnectionRegistry::new());

        let mut workers: Vec<EventLoop> = Vec::with_capacity(config.get_workers());
        for index in 0..config.get_workers() {
            let mut lp = EventLoop::new(config.worker_loop(index))?;
            lp.set_hooks(Arc::clone(&hooks));
            lp.set_registry(Arc::clone(&registry));
            if let Some(callback) = &on_epoll_timeout {
                lp.set_epoll_timeout_callback(Arc::clone(callback));
            }
            workers.push(lp);
        }
        let worker_handles: Vec<LoopHandle> = workers.iter().map(EventLoop::handle).collect();

        let mut main = EventLoop::new(config.main_loop())?;
        if let Some(callback) = &on_epoll_timeout {
            main.set_epoll_timeout_callback(Arc::clone(callback));
        }
        let targets = worker_handles.clone();
        let acceptor = Acceptor::new(
            main.poller(),
            config.get_addr(),
            config.get_backlog(),
            Box::new(move |socket: Socket, peer: Option<SocketAddr>| {
                let index = worker_index(socket.as_raw_fd(), targets.len());
                trace!("FD:{} goes to worker {index}", socket.as_raw_fd());
                targets[index].queue_in_loop(move |lp: &mut EventLoop| {
                    lp.adopt(socket, peer);
                });
            }),
        )?;
        let local_addr = acceptor.local_addr();
        main.set_acceptor(acceptor);

        let io_pool = ThreadPool::new(PoolConfig {
            name: "io".into(),
            size: config.get_workers(),
            pin_cores: config.get_pin_cores(),
            realtime: config.get_realtime(),
            dispatch: config.get_dispatch().cloned(),
        })?;
        for mut lp in workers {
            io_pool.execute(move || {
                if let Err(err) = lp.run() {
                    fatal(&format!("Event loop {} died", lp.name()), &err);
                }
            })?;
        }

        Ok(TcpServer {
            main,
            workers: worker_handles,
            io_pool,
            registry,
            local_addr,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// One main loop that only accepts, N worker loops that own the connections.
pub struct TcpServer {
    main: EventLoop,
    workers: Vec<LoopHandle>,
    io_pool: ThreadPool,
    registry: Arc<ConnectionRegistry>,
    local_addr: SocketAddr,
    stopped: Arc<AtomicBool>,
}

impl TcpServer {
    pub fn builder(config: ServerConfig) -> TcpServerBuilder {
        TcpServerBuilder {
            config,
            hooks: ConnectionHooks::default(),
            on_epoll_timeout: None,
        }
    }

    /// The bound address. Differs from the configured one when port 0 was asked for.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            main: self.main.handle(),
            workers: self.workers.clone(),
            stopped: Arc::clone(&self.stopped),
        }
    }

    /// Blocks on the main loop until [`ServerHandle::stop`], then brings the
    /// workers down and joins their threads.
    pub fn run(&mut self) -> Result<()> {
        let outcome = self.main.run();
        self.shutdown();
        outcome
    }

    fn shutdown(&mut self) {
        self.handle().stop();
        self.io_pool.stop();
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        // Worker tasks never return on their own; the pool would wait forever
        self.shutdown();
    }
}

/// Cheap, cloneable remote control for a running [`TcpServer`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    main: LoopHandle,
    workers: Vec<LoopHandle>,
    stopped: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Stops the main loop and every worker. Only the first call does anything.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Server stopping");
        self.main.stop();
        for worker in &self.workers {
            worker.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
