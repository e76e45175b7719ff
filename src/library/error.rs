use std::{fmt::Display, io, net::SocketAddr};
use thiserror::Error;
use tracing::error;

/// Everything that can take the reactor down.
///
/// Connection-level trouble never ends up here: a peer that hangs up or a
/// socket that errors out only closes that one connection.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("failed to set up {what}: {source}")]
    Setup {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("epoll_wait failed: {0}")]
    Multiplexer(#[source] io::Error),
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("thread pool `{0}` is stopped")]
    PoolStopped(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ReactorError {
    pub fn setup(what: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| ReactorError::Setup { what, source }
    }
}

pub type Result<T, E = ReactorError> = std::result::Result<T, E>;

/// Fail-fast exit for errors the reactor cannot recover from (multiplexer
/// and accept failures). Logs first so the reason survives in the sink.
pub fn fatal(context: &str, err: &dyn Display) -> ! {
    error!("{context}: {err}");
    error!("Reactor cannot continue, exiting");
    std::process::exit(1)
}
