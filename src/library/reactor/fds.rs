use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

fn owned(fd: RawFd) -> io::Result<OwnedFd> {
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Reads one 8-byte counter. `EAGAIN` means there was nothing to read.
fn read_counter(fd: RawFd) -> io::Result<u64> {
    let mut value: u64 = 0;
    let n = unsafe { libc::read(fd, &mut value as *mut u64 as *mut libc::c_void, 8) };
    if n == 8 {
        return Ok(value);
    }
    let err = io::Error::last_os_error();
    if n < 0 && err.kind() == io::ErrorKind::WouldBlock {
        return Ok(0);
    }
    Err(err)
}

/// Self-wakeup primitive of an event loop.
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        Ok(Self { fd: owned(fd)? })
    }

    /// Bumps the counter. Never blocks: a saturated counter already means "wake up".
    pub fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n == 8 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(());
        }
        Err(err)
    }

    /// Resets the counter, returning how many wakes were folded into it.
    pub fn drain(&self) -> io::Result<u64> {
        read_counter(self.fd.as_raw_fd())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// One-shot monotonic timer, re-armed by its owner after every fire.
#[derive(Debug)]
pub struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        Ok(Self { fd: owned(fd)? })
    }

    /// Fires once after `after`. A zero duration would disarm, so it is rounded up.
    pub fn arm(&self, after: Duration) -> io::Result<()> {
        let after = after.max(Duration::from_millis(1));
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: after.as_secs() as libc::time_t,
                tv_nsec: after.subsec_nanos() as libc::c_long,
            },
        };
        let rc = unsafe {
            libc::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, std::ptr::null_mut())
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Number of expirations since the last drain.
    pub fn drain(&self) -> io::Result<u64> {
        read_counter(self.fd.as_raw_fd())
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eventfd_folds_wakes() {
        let efd = EventFd::new().unwrap();
        assert_eq!(efd.drain().unwrap(), 0);
        efd.wake().unwrap();
        efd.wake().unwrap();
        assert_eq!(efd.drain().unwrap(), 2);
        assert_eq!(efd.drain().unwrap(), 0);
    }

    #[test]
    fn timerfd_fires_once() {
        let tfd = TimerFd::new().unwrap();
        tfd.arm(Duration::from_millis(5)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(tfd.drain().unwrap(), 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(tfd.drain().unwrap(), 0);
    }
}
