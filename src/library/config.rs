use crate::library::{error::ReactorError, reactor::poller::DEFAULT_MAX_EVENTS};
use std::{fmt, net::SocketAddr, time::Duration};
use tracing::Dispatch;

const DEFAULT_BACKLOG: i32 = 4096;
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(80);
const DEFAULT_MAX_BODY_IN_MEMORY: usize = 64 * 1024 * 1024;

/// How often a worker loop looks for idle connections, and what counts as idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleSweep {
    pub interval: Duration,
    pub idle_timeout: Duration,
}

/// Per-loop settings.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub name: String,
    pub poll_timeout: Duration,
    pub max_events: usize,
    pub sweep: Option<IdleSweep>,
}

impl LoopConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            max_events: DEFAULT_MAX_EVENTS,
            sweep: None,
        }
    }

    pub fn set_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn set_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    pub fn set_sweep(mut self, sweep: IdleSweep) -> Self {
        self.sweep = Some(sweep);
        self
    }
}

/// Everything a server needs to know before it binds.
#[derive(Clone)]
pub struct ServerConfig {
    addr: SocketAddr,
    workers: usize,
    app_workers: usize,
    backlog: i32,
    poll_timeout: Duration,
    sweep_interval: Duration,
    idle_timeout: Duration,
    max_events: usize,
    max_body_in_memory: usize,
    pin_cores: bool,
    realtime: bool,
    dispatch: Option<Dispatch>,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("addr", &self.addr)
            .field("workers", &self.workers)
            .field("app_workers", &self.app_workers)
            .field("backlog", &self.backlog)
            .field("poll_timeout", &self.poll_timeout)
            .field("sweep_interval", &self.sweep_interval)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_events", &self.max_events)
            .field("max_body_in_memory", &self.max_body_in_memory)
            .field("pin_cores", &self.pin_cores)
            .field("realtime", &self.realtime)
            .field("logger", &self.dispatch.is_some())
            .finish()
    }
}

impl ServerConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            workers: num_cpus::get().max(1),
            app_workers: 0,
            backlog: DEFAULT_BACKLOG,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_events: DEFAULT_MAX_EVENTS,
            max_body_in_memory: DEFAULT_MAX_BODY_IN_MEMORY,
            pin_cores: false,
            realtime: false,
            dispatch: None,
        }
    }
    #[inline(always)]
    pub fn get_addr(&self) -> SocketAddr {
        self.addr
    }
    #[inline(always)]
    pub fn get_workers(&self) -> usize {
        self.workers
    }
    #[inline(always)]
    pub fn set_workers(&mut self, workers: usize) -> &mut Self {
        self.workers = workers;
        self
    }
    #[inline(always)]
    pub fn get_app_workers(&self) -> usize {
        self.app_workers
    }
    /// Application handler threads. Zero runs handlers inline on the I/O thread.
    #[inline(always)]
    pub fn set_app_workers(&mut self, app_workers: usize) -> &mut Self {
        self.app_workers = app_workers;
        self
    }
    #[inline(always)]
    pub fn get_backlog(&self) -> i32 {
        self.backlog
    }
    #[inline(always)]
    pub fn set_backlog(&mut self, backlog: i32) -> &mut Self {
        self.backlog = backlog;
        self
    }
    #[inline(always)]
    pub fn get_poll_timeout(&self) -> Duration {
        self.poll_timeout
    }
    #[inline(always)]
    pub fn set_poll_timeout(&mut self, poll_timeout: Duration) -> &mut Self {
        self.poll_timeout = poll_timeout;
        self
    }
    #[inline(always)]
    pub fn get_sweep_interval(&self) -> Duration {
        self.sweep_interval
    }
    #[inline(always)]
    pub fn set_sweep_interval(&mut self, sweep_interval: Duration) -> &mut Self {
        self.sweep_interval = sweep_interval;
        self
    }
    #[inline(always)]
    pub fn get_idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
    #[inline(always)]
    pub fn set_idle_timeout(&mut self, idle_timeout: Duration) -> &mut Self {
        self.idle_timeout = idle_timeout;
        self
    }
    #[inline(always)]
    pub fn get_max_events(&self) -> usize {
        self.max_events
    }
    #[inline(always)]
    pub fn set_max_events(&mut self, max_events: usize) -> &mut Self {
        self.max_events = max_events;
        self
    }
    #[inline(always)]
    pub fn get_max_body_in_memory(&self) -> usize {
        self.max_body_in_memory
    }
    #[inline(always)]
    pub fn set_max_body_in_memory(&mut self, limit: usize) -> &mut Self {
        self.max_body_in_memory = limit;
        self
    }
    #[inline(always)]
    pub fn get_pin_cores(&self) -> bool {
        self.pin_cores
    }
    #[inline(always)]
    pub fn set_pin_cores(&mut self, enabled: bool) -> &mut Self {
        self.pin_cores = enabled;
        self
    }
    #[inline(always)]
    pub fn get_realtime(&self) -> bool {
        self.realtime
    }
    #[inline(always)]
    pub fn set_realtime(&mut self, enabled: bool) -> &mut Self {
        self.realtime = enabled;
        self
    }
    pub fn get_dispatch(&self) -> Option<&Dispatch> {
        self.dispatch.as_ref()
    }
    /// Logger installed on every thread the server spawns.
    pub fn set_dispatch(&mut self, dispatch: Dispatch) -> &mut Self {
        self.dispatch = Some(dispatch);
        self
    }
    #[inline(always)]
    pub fn build(&mut self) -> Self {
        self.clone()
    }

    pub fn validate(&self) -> Result<(), ReactorError> {
        if self.workers == 0 {
            return Err(ReactorError::Config("at least one I/O worker is required".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(ReactorError::Config("sweep interval must be positive".into()));
        }
        if self.max_events == 0 {
            return Err(ReactorError::Config("max_events must be positive".into()));
        }
        Ok(())
    }

    pub(crate) fn main_loop(&self) -> LoopConfig {
        LoopConfig::new("main")
            .set_poll_timeout(self.poll_timeout)
            .set_max_events(self.max_events)
    }

    pub(crate) fn worker_loop(&self, index: usize) -> LoopConfig {
        LoopConfig::new(format!("worker-{index}"))
            .set_poll_timeout(self.poll_timeout)
            .set_max_events(self.max_events)
            .set_sweep(IdleSweep {
                interval: self.sweep_interval,
                idle_timeout: self.idle_timeout,
            })
    }
}
