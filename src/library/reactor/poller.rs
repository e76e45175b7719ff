use crate::library::reactor::channel::Channel;
use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};
use tracing::trace;

pub const DEFAULT_MAX_EVENTS: usize = 1024;

/// One readiness report: the packed token and the observed event mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub token: u64,
    pub revents: u32,
}

/// Pre-allocated result array, reused across `wait` calls.
pub struct Events {
    buf: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            len: 0,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The `index`-th report of the last wait. Copied out: the kernel struct is packed.
    #[inline(always)]
    pub fn get(&self, index: usize) -> Option<Ready> {
        if index >= self.len {
            return None;
        }
        let event = self.buf[index];
        Some(Ready {
            token: event.u64,
            revents: event.events,
        })
    }
}

/// The epoll instance. `&self` everywhere: `epoll_ctl` and `epoll_wait` are
/// thread-safe, so channels keep an `Arc` to it and push their own updates.
#[derive(Debug)]
pub struct Poller {
    epfd: OwnedFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Adds the channel on first use, modifies its interest afterwards.
    pub fn register_or_update(&self, channel: &mut Channel) -> io::Result<()> {
        let op = if channel.is_registered() {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.control(op, channel.fd(), channel.interest(), channel.token().pack())?;
        channel.set_registered(true);
        Ok(())
    }

    pub fn unregister(&self, channel: &mut Channel) -> io::Result<()> {
        if !channel.is_registered() {
            return Ok(());
        }
        channel.set_registered(false);
        self.control(libc::EPOLL_CTL_DEL, channel.fd(), 0, 0)
    }

    /// Blocks up to `timeout` (forever when `None`). Zero reports mean timeout.
    /// An interrupted wait is reported as an empty pass, never as an error.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms: i32 = match timeout {
            Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.buf.as_mut_ptr(),
                events.buf.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            events.len = 0;
            if err.kind() == io::ErrorKind::Interrupted {
                trace!("epoll_wait interrupted");
                return Ok(0);
            }
            return Err(err);
        }
        events.len = n as usize;
        Ok(events.len)
    }

    fn control(&self, op: i32, fd: RawFd, interest: u32, data: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest,
            u64: data,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd.as_raw_fd()
    }
}
