use crate::library::http::context::HttpContext;
use bytes::BytesMut;
use std::io::{Read, Write};

/// Per-connection slot owned by the connection and only touched from its
/// loop thread. Exactly one of these at a time.
#[derive(Default)]
pub enum ConnContext {
    #[default]
    None,
    /// Parsing, nothing in flight.
    Http(HttpContext),
    /// A handler is producing the response on the application pool.
    Awaiting(PendingResponse),
    /// The request body goes straight into a sink as it arrives.
    Upload(UploadContext),
    /// A chunked response is being pumped by send-complete.
    Download(DownloadContext),
}

impl ConnContext {
    pub fn kind(&self) -> &'static str {
        match self {
            ConnContext::None => "none",
            ConnContext::Http(_) => "http",
            ConnContext::Awaiting(_) => "awaiting",
            ConnContext::Upload(_) => "upload",
            ConnContext::Download(_) => "download",
        }
    }
}

pub struct PendingResponse {
    pub parser: HttpContext,
    /// Pipelined bytes that arrived while the handler ran.
    pub backlog: BytesMut,
}

pub struct UploadContext {
    pub parser: HttpContext,
    pub sink: Box<dyn Write + Send>,
    pub received: u64,
}

pub struct DownloadContext {
    pub parser: HttpContext,
    pub reader: Box<dyn Read + Send>,
    pub keep_alive: bool,
    pub backlog: BytesMut,
}
