use crate::library::{
    error::{ReactorError, Result},
    network::socket_helpers::{build_listener, peer_of, prepare_incoming_socket},
    reactor::{
        channel::{Channel, ChannelHandler},
        poller::Poller,
    },
    server_internals::{Token, TokenKind},
};
use socket2::Socket;
use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    os::fd::AsRawFd,
    sync::Arc,
};
use tracing::{info, trace, warn};

pub type NewConnectionCallback = Box<dyn FnMut(Socket, Option<SocketAddr>) + Send>;

/// Owns the listening socket. Level triggered, one `accept` per readiness
/// report: if more clients are waiting, epoll simply reports again.
pub struct Acceptor {
    channel: Channel,
    listener: Socket,
    local_addr: SocketAddr,
    on_new_connection: NewConnectionCallback,
}

impl Acceptor {
    pub fn new(
        poller: Arc<Poller>,
        addr: SocketAddr,
        backlog: i32,
        on_new_connection: NewConnectionCallback,
    ) -> Result<Self> {
        let listener =
            build_listener(addr, backlog).map_err(|source| ReactorError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .unwrap_or(addr);
        let fd = listener.as_raw_fd();
        let mut channel = Channel::new(poller, fd, Token::new(TokenKind::Acceptor, fd));
        channel
            .enable_reading()
            .map_err(ReactorError::setup("acceptor channel"))?;
        info!("Listening on {local_addr}");
        Ok(Self {
            channel,
            listener,
            local_addr,
            on_new_connection,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn channel_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }
}

/// Someone else got there first, or the client gave up already.
/// Anything else is fatal for the loop.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::ConnectionAborted
    )
}

impl ChannelHandler for Acceptor {
    fn handle_read(&mut self) -> io::Result<()> {
        match self.listener.accept() {
            Ok((socket, addr)) => {
                if let Err(err) = prepare_incoming_socket(&socket) {
                    warn!("Dropping accepted socket: {err}");
                    return Ok(());
                }
                let peer = peer_of(&addr);
                trace!("Accepted FD:{} from {peer:?}", socket.as_raw_fd());
                (self.on_new_connection)(socket, peer);
                Ok(())
            }
            Err(err) if is_transient(&err) => {
                trace!("Accept yielded nothing: {err}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn handle_close(&mut self) -> io::Result<()> {
        warn!("Listener reported hang-up");
        Ok(())
    }

    fn handle_write(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn handle_error(&mut self) -> io::Result<()> {
        match self.listener.take_error() {
            Ok(Some(err)) => Err(err),
            _ => Ok(()),
        }
    }
}
