pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod network;
pub mod reactor;
pub mod server;
pub mod server_internals;
pub mod thread_pool;
pub mod utils;
