pub mod library;

pub use library::{
    config::{IdleSweep, LoopConfig, ServerConfig},
    error::{ReactorError, Result},
    http::{
        request::{HttpRequest, Method, Version},
        response::{HttpResponse, StatusCode},
        server::{HttpServer, HttpService},
    },
    logging::{FileSink, LogConfig, LogSink, Logger, StderrSink},
    network::connection::{Connection, ConnectionHandle},
    reactor::event_loop::{EventLoop, LoopHandle},
    server::{ServerHandle, TcpServer},
    thread_pool::{PoolConfig, ThreadPool},
};
