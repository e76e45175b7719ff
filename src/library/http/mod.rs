pub mod context;
pub mod range;
pub mod request;
pub mod response;
pub mod server;
pub mod session;
