pub mod acceptor;
pub mod buffer;
pub mod connection;
pub mod socket_helpers;
