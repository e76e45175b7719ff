use crate::library::{reactor::poller::Poller, server_internals::Token};
use std::{io, os::fd::RawFd, sync::Arc};
use tracing::trace;

pub const NONE_EVENT: u32 = 0;
pub const READ_EVENT: u32 = (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32;
pub const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;
pub const EDGE_TRIGGERED: u32 = libc::EPOLLET as u32;

/// Which single callback an event mask maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Peer half-closed its side.
    Close,
    Read,
    Write,
    Error,
}

impl Readiness {
    /// First match wins: close, then read, then write, then error.
    pub fn classify(revents: u32) -> Self {
        if revents & libc::EPOLLRDHUP as u32 != 0 {
            Readiness::Close
        } else if revents & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0 {
            Readiness::Read
        } else if revents & libc::EPOLLOUT as u32 != 0 {
            Readiness::Write
        } else {
            Readiness::Error
        }
    }
}

/// Owner of a channel. Errors returned from here are fatal for the loop,
/// so connection handlers swallow their own failures.
pub trait ChannelHandler {
    fn handle_close(&mut self) -> io::Result<()>;
    fn handle_read(&mut self) -> io::Result<()>;
    fn handle_write(&mut self) -> io::Result<()>;
    fn handle_error(&mut self) -> io::Result<()>;
}

/// Routes one observed mask to exactly one handler method.
pub fn dispatch<H: ChannelHandler + ?Sized>(revents: u32, handler: &mut H) -> io::Result<Readiness> {
    let readiness = Readiness::classify(revents);
    match readiness {
        Readiness::Close => handler.handle_close()?,
        Readiness::Read => handler.handle_read()?,
        Readiness::Write => handler.handle_write()?,
        Readiness::Error => handler.handle_error()?,
    }
    Ok(readiness)
}

/// One fd, its interest mask and the last observed ready mask.
///
/// Every interest change is pushed to the poller immediately. A channel that
/// is still registered unregisters itself on drop, so owners must declare it
/// before the fd it watches (fields drop in declaration order).
#[derive(Debug)]
pub struct Channel {
    fd: RawFd,
    token: Token,
    interest: u32,
    ready: u32,
    registered: bool,
    poller: Arc<Poller>,
}

impl Channel {
    pub fn new(poller: Arc<Poller>, fd: RawFd, token: Token) -> Self {
        Self {
            fd,
            token,
            interest: NONE_EVENT,
            ready: NONE_EVENT,
            registered: false,
            poller,
        }
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline(always)]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline(always)]
    pub fn interest(&self) -> u32 {
        self.interest
    }

    #[inline(always)]
    pub fn ready(&self) -> u32 {
        self.ready
    }

    pub fn set_ready(&mut self, revents: u32) {
        self.ready = revents;
    }

    #[inline(always)]
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub(crate) fn set_registered(&mut self, registered: bool) {
        self.registered = registered;
    }

    /// Switches to edge-triggered delivery. Takes effect on the next update.
    pub fn enable_edge_triggered(&mut self) {
        self.interest |= EDGE_TRIGGERED;
    }

    pub fn enable_reading(&mut self) -> io::Result<()> {
        self.interest |= READ_EVENT;
        self.update()
    }

    pub fn disable_reading(&mut self) -> io::Result<()> {
        self.interest &= !READ_EVENT;
        self.update()
    }

    pub fn enable_writing(&mut self) -> io::Result<()> {
        self.interest |= WRITE_EVENT;
        self.update()
    }

    pub fn disable_writing(&mut self) -> io::Result<()> {
        self.interest &= !WRITE_EVENT;
        self.update()
    }

    pub fn disable_all(&mut self) -> io::Result<()> {
        self.interest &= EDGE_TRIGGERED;
        self.update()
    }

    #[inline(always)]
    pub fn is_reading(&self) -> bool {
        self.interest & READ_EVENT != 0
    }

    #[inline(always)]
    pub fn is_writing(&self) -> bool {
        self.interest & WRITE_EVENT != 0
    }

    /// Re-submits the current interest. With edge triggering this re-arms
    /// the notification even when nothing changed.
    pub fn update(&mut self) -> io::Result<()> {
        let poller = Arc::clone(&self.poller);
        poller.register_or_update(self)
    }

    /// Drops all interest and takes the fd out of the poller.
    pub fn remove(&mut self) -> io::Result<()> {
        self.interest &= EDGE_TRIGGERED;
        let poller = Arc::clone(&self.poller);
        poller.unregister(self)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.registered {
            if let Err(err) = self.remove() {
                trace!("Channel for FD:{} left the poller uncleanly: {err}", self.fd);
            }
        }
    }
}
