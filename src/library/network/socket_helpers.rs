use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::{io, net::SocketAddr};
use tracing::trace;

const SEND_BUFFER_SIZE: usize = 1024 * 1024;

/// Builds the non-blocking listening socket: address and port reuse,
/// keep-alive, no-delay, then bind and listen.
pub fn build_listener(addr: SocketAddr, backlog: i32) -> io::Result<Socket> {
    let listener = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    listener.set_reuse_address(true)?;
    listener.set_reuse_port(true)?;
    listener.set_keepalive(true)?;
    listener.set_tcp_nodelay(true)?;
    listener.set_nonblocking(true)?;
    listener.bind(&SockAddr::from(addr))?;
    listener.listen(backlog)?;
    Ok(listener)
}

/// Tunes a freshly accepted socket. Only non-blocking mode is mandatory; the
/// rest is best effort since a unix socketpair in tests has no TCP options.
pub fn prepare_incoming_socket(socket: &Socket) -> io::Result<()> {
    socket.set_nonblocking(true)?;
    // Give the socket a 1MB send buffer, because bigger is always better (probably).
    if let Err(err) = socket.set_send_buffer_size(SEND_BUFFER_SIZE) {
        trace!("SO_SNDBUF not applied: {err}");
    }
    // Check if the OS actually listened to us or just pretended to.
    if let Ok(size) = socket.send_buffer_size() {
        trace!("Real sndbuf client size: {} bytes", size);
    }
    // Disable Nagle's algorithm, small packets need love too.
    if let Err(err) = socket.set_tcp_nodelay(true) {
        trace!("TCP_NODELAY not applied: {err}");
    }
    Ok(())
}

/// The peer address as a std address, when the socket family has one.
pub fn peer_of(addr: &SockAddr) -> Option<SocketAddr> {
    addr.as_socket()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_binds_ephemeral_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = build_listener(addr, 16).unwrap();
        let local = listener.local_addr().unwrap().as_socket().unwrap();
        assert_ne!(local.port(), 0);
        assert!(listener.nonblocking().unwrap());
    }

    #[test]
    fn prepares_unix_pair() {
        let (a, _b) = Socket::pair(Domain::UNIX, Type::STREAM, None).unwrap();
        prepare_incoming_socket(&a).unwrap();
        assert!(a.nonblocking().unwrap());
    }
}
