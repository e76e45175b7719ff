use crate::library::{
    error::{ReactorError, Result},
    utils::lock,
};
use core_affinity::CoreId;
use std::{
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
};
use thread_priority::{ThreadBuilderExt, ThreadPriority};
use tracing::{Dispatch, error, info, warn};

type Job = Box<dyn FnOnce() + Send>;

/// How a pool names, places and prioritises its threads.
#[derive(Clone, Default)]
pub struct PoolConfig {
    pub name: String,
    pub size: usize,
    pub pin_cores: bool,
    pub realtime: bool,
    pub dispatch: Option<Dispatch>,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
            ..Default::default()
        }
    }
}

struct Inner {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    stopped: AtomicBool,
}

/// Fixed-size FIFO executor.
///
/// One instance hosts the worker event loops (each task there runs for the
/// server's lifetime), another optionally runs application handlers.
pub struct ThreadPool {
    name: String,
    size: usize,
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl ThreadPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stopped: AtomicBool::new(false),
        });
        let core_ids: Vec<CoreId> = if config.pin_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        let pool = Self {
            name: config.name.clone(),
            size: config.size,
            inner,
            threads: Mutex::new(Vec::with_capacity(config.size)),
        };
        for index in 0..config.size {
            let core = (!core_ids.is_empty()).then(|| core_ids[index % core_ids.len()]);
            let handle = spawn_worker(&config, index, core, Arc::clone(&pool.inner))
                .map_err(ReactorError::setup("pool thread"))?;
            lock(&pool.threads).push(handle);
        }
        info!("Thread pool {} started with {} thread(s)", pool.name, pool.size);
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = lock(&self.inner.queue);
            // Checked under the lock so stop() cannot slip in between
            if self.is_stopped() {
                return Err(ReactorError::PoolStopped(self.name.clone()));
            }
            queue.push_back(Box::new(job));
        }
        self.inner.available.notify_one();
        Ok(())
    }

    /// Like `execute`, with the job's result delivered through a channel.
    pub fn submit<F, R>(&self, job: F) -> Result<mpsc::Receiver<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        self.execute(move || {
            // The caller may have dropped the receiver; nothing to report then
            let _ = tx.send(job());
        })?;
        Ok(rx)
    }

    /// Lets queued jobs finish, then joins every thread. Safe to call twice.
    pub fn stop(&self) {
        {
            let _queue = lock(&self.inner.queue);
            if self.inner.stopped.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        self.inner.available.notify_all();
        let me = thread::current().id();
        let threads: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.threads));
        for handle in threads {
            if handle.thread().id() == me {
                // A job stopping its own pool; that thread exits on its own
                continue;
            }
            if handle.join().is_err() {
                warn!("A thread of pool {} panicked on its way out", self.name);
            }
        }
        info!("Thread pool {} stopped", self.name);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_worker(
    config: &PoolConfig,
    index: usize,
    core: Option<CoreId>,
    inner: Arc<Inner>,
) -> std::io::Result<JoinHandle<()>> {
    let builder = thread::Builder::new().name(format!("{}-{}", config.name, index));
    let dispatch = config.dispatch.clone();
    let body = move || {
        let _log_guard = dispatch.as_ref().map(tracing::dispatcher::set_default);
        if let Some(core) = core {
            if core_affinity::set_for_current(core) {
                info!("Thread {} pinned to {:?}", index, core);
            } else {
                error!("Failed to set core affinity");
            }
        }
        worker_loop(&inner);
    };
    if config.realtime {
        builder.spawn_with_priority(ThreadPriority::Max, move |priority| {
            if let Err(err) = priority {
                warn!("Realtime priority refused: {err:?}");
            }
            body()
        })
    } else {
        builder.spawn(body)
    }
}

fn worker_loop(inner: &Inner) {
    loop {
        let job: Job = {
            let mut queue = lock(&inner.queue);
            loop {
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                if inner.stopped.load(Ordering::Acquire) {
                    return;
                }
                queue = inner
                    .available
                    .wait(queue)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
        };
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Job panicked; worker keeps going");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::atomic::AtomicUsize, time::Duration};

    #[test]
    fn runs_every_job() {
        let pool = ThreadPool::new(PoolConfig::new("test-pool", 4)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn submit_returns_the_result() {
        let pool = ThreadPool::new(PoolConfig::new("submit-pool", 2)).unwrap();
        let rx = pool.submit(|| 6 * 7).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn stop_is_idempotent_and_final() {
        let pool = ThreadPool::new(PoolConfig::new("stop-pool", 1)).unwrap();
        pool.stop();
        pool.stop();
        assert!(pool.is_stopped());
        assert!(matches!(
            pool.execute(|| {}),
            Err(ReactorError::PoolStopped(name)) if name == "stop-pool"
        ));
    }

    #[test]
    fn threads_carry_the_pool_name() {
        let pool = ThreadPool::new(PoolConfig::new("named", 1)).unwrap();
        let rx = pool
            .submit(|| thread::current().name().map(str::to_owned))
            .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap().as_deref(),
            Some("named-0")
        );
    }

    #[test]
    fn panicking_job_does_not_kill_the_worker() {
        let pool = ThreadPool::new(PoolConfig::new("sturdy", 1)).unwrap();
        pool.execute(|| panic!("boom")).unwrap();
        let rx = pool.submit(|| "still alive").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "still alive");
    }

    #[test]
    fn empty_pool_is_allowed() {
        let pool = ThreadPool::new(PoolConfig::new("empty", 0)).unwrap();
        assert!(pool.is_empty());
        pool.stop();
    }
}
