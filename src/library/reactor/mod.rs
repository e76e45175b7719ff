pub mod channel;
pub mod event_loop;
pub mod fds;
pub mod poller;
pub mod registry;
