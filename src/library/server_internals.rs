use crate::library::{network::connection::Connection, reactor::event_loop::EventLoop};
use bytes::Bytes;
use std::{os::fd::RawFd, sync::Arc};

const KIND_SHIFT: u64 = 56;
const GENERATION_SHIFT: u64 = 32;
pub const GENERATION_MASK: u32 = 0x00FF_FFFF;

/// Who owns the descriptor behind an epoll event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TokenKind {
    Wakeup = 1,
    Timer = 2,
    Acceptor = 3,
    Connection = 4,
}

impl TokenKind {
    const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(TokenKind::Wakeup),
            2 => Some(TokenKind::Timer),
            3 => Some(TokenKind::Acceptor),
            4 => Some(TokenKind::Connection),
            _ => None,
        }
    }
}

/// The epoll user-data word.
///
/// `kind` in the top byte, a 24-bit `generation` below it, the fd in the low
/// 32 bits. The generation is what lets dispatch tell a live connection from
/// a dead one that happened to leave its fd number behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub generation: u32,
    pub fd: RawFd,
}

impl Token {
    pub const fn new(kind: TokenKind, fd: RawFd) -> Self {
        Self { kind, generation: 0, fd }
    }

    pub const fn connection(fd: RawFd, generation: u32) -> Self {
        Self {
            kind: TokenKind::Connection,
            generation: generation & GENERATION_MASK,
            fd,
        }
    }

    #[inline(always)]
    pub const fn pack(&self) -> u64 {
        ((self.kind as u64) << KIND_SHIFT)
            | (((self.generation & GENERATION_MASK) as u64) << GENERATION_SHIFT)
            | (self.fd as u32 as u64)
    }

    #[inline(always)]
    pub fn unpack(raw: u64) -> Option<Self> {
        let kind = TokenKind::from_u8((raw >> KIND_SHIFT) as u8)?;
        Some(Self {
            kind,
            generation: ((raw >> GENERATION_SHIFT) as u32) & GENERATION_MASK,
            fd: (raw & 0xFFFF_FFFF) as u32 as RawFd,
        })
    }
}

/// Home worker of a connection. Stable for the connection's whole life.
#[inline(always)]
pub fn worker_index(fd: RawFd, workers: usize) -> usize {
    debug_assert!(workers > 0);
    (fd as u32 as usize) % workers
}

pub type ConnectionCallback = Arc<dyn Fn(&mut Connection) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&mut Connection, Bytes) + Send + Sync>;
pub type LoopCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// Lifecycle callbacks fanned out to every connection of a server. All of
/// them run on the connection's own I/O thread.
#[derive(Clone, Default)]
pub struct ConnectionHooks {
    pub on_new_connection: Option<ConnectionCallback>,
    pub on_message: Option<MessageCallback>,
    pub on_send_complete: Option<ConnectionCallback>,
    pub on_close: Option<ConnectionCallback>,
    pub on_error: Option<ConnectionCallback>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_survives_the_epoll_word() {
        let token = Token::connection(1021, 77);
        assert_eq!(Token::unpack(token.pack()), Some(token));

        let wakeup = Token::new(TokenKind::Wakeup, 3);
        assert_eq!(Token::unpack(wakeup.pack()), Some(wakeup));
    }

    #[test]
    fn generation_wraps_inside_its_bits() {
        let token = Token::connection(5, GENERATION_MASK + 2);
        assert_eq!(token.generation, 1);
        assert_eq!(Token::unpack(token.pack()).unwrap().fd, 5);
    }

    #[test]
    fn garbage_word_is_rejected() {
        assert_eq!(Token::unpack(0), None);
        assert_eq!(Token::unpack(0xFF << KIND_SHIFT), None);
    }

    #[test]
    fn fd_mod_n_spreads_evenly() {
        for workers in 1..=8usize {
            let per_worker = 5;
            let mut counts = vec![0usize; workers];
            for fd in 0..(workers * per_worker) as RawFd {
                counts[worker_index(fd, workers)] += 1;
            }
            assert!(counts.iter().all(|&c| c == per_worker), "{counts:?}");
        }
    }
}
