use crate::library::{
    config::ServerConfig,
    error::Result,
    http::{
        context::{HttpContext, ParseSignal, ParseState},
        request::HttpRequest,
        response::{HttpResponse, LAST_CHUNK, StatusCode, encode_chunk},
        session::{ConnContext, DownloadContext, PendingResponse, UploadContext},
    },
    network::connection::Connection,
    server::{ServerHandle, TcpServer},
    thread_pool::{PoolConfig, ThreadPool},
};
use bytes::{Bytes, BytesMut};
use std::{
    io::{self, ErrorKind, Read, Write},
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tracing::{debug, error, trace, warn};

/// Most bytes buffered for a connection while its previous response is
/// still in flight.
pub const MAX_BACKLOG: usize = 1024 * 1024;
/// Size of one chunk of a streamed response body.
pub const STREAM_CHUNK: usize = 64 * 1024;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// The application behind an [`HttpServer`].
///
/// Runs on an I/O thread, or on the application pool when the server has
/// one. Either way a connection never has two requests in a handler at once.
pub trait HttpService: Send + Sync + 'static {
    fn handle(&self, request: &HttpRequest) -> HttpResponse;

    /// Offered once the head of a request is parsed while its body is still
    /// arriving. Returning a sink streams the body into it instead of
    /// collecting it in memory.
    ///
    /// Always called on the I/O thread, application pool or not, and so are
    /// the sink's writes. Keep both cheap: anything slow here stalls every
    /// connection on that loop.
    fn open_upload(&self, _request: &HttpRequest) -> Option<Box<dyn Write + Send>> {
        None
    }

    /// Answers a request whose body went into an upload sink.
    fn finish_upload(&self, request: &HttpRequest, _received: u64) -> HttpResponse {
        self.handle(request)
    }
}

enum Work {
    Handle(HttpRequest),
    FinishUpload(HttpRequest, u64),
}

impl Work {
    fn run(self, service: &dyn HttpService) -> HttpResponse {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match &self {
            Work::Handle(request) => service.handle(request),
            Work::FinishUpload(request, received) => service.finish_upload(request, *received),
        }));
        outcome.unwrap_or_else(|_| {
            error!("Handler panicked");
            let mut response =
                HttpResponse::text(StatusCode::InternalServerError, "Internal Server Error\n");
            response.set_close_connection(true);
            response
        })
    }
}

enum Step {
    Parsed {
        signal: ParseSignal,
        rest: Bytes,
        entered_body: bool,
    },
    Stashed,
    BacklogFull,
    SinkFailed(io::Error),
}

struct HttpCore {
    service: Arc<dyn HttpService>,
    app_pool: Option<ThreadPool>,
    max_body_in_memory: usize,
}

impl HttpCore {
    fn on_connection(&self, conn: &mut Connection) {
        conn.set_context(ConnContext::Http(HttpContext::new()));
    }

    fn on_message(self: &Arc<Self>, conn: &mut Connection, data: Bytes) {
        self.process(conn, data);
    }

    fn on_send_complete(self: &Arc<Self>, conn: &mut Connection) {
        if matches!(conn.context(), ConnContext::Download(_)) {
            self.pump(conn);
        }
    }

    /// Parses as far as `input` goes. Loops over pipelined requests whose
    /// responses could be written right away.
    fn process(self: &Arc<Self>, conn: &mut Connection, mut input: Bytes) {
        loop {
            if !conn.is_open() || conn.close_pending() {
                trace!("FD:{} is closing, ignoring {} bytes", conn.fd(), input.len());
                return;
            }
            let step = match conn.context_mut() {
                ConnContext::None => {
                    conn.set_context(ConnContext::Http(HttpContext::new()));
                    continue;
                }
                ConnContext::Http(parser) => {
                    let entered_body = parser.state() != ParseState::Body;
                    let (signal, consumed) = parser.parse(&input);
                    Step::Parsed {
                        signal,
                        rest: input.split_off(consumed),
                        entered_body,
                    }
                }
                ConnContext::Upload(upload) => {
                    let (signal, consumed) = upload.parser.parse(&input);
                    let chunk = upload.parser.take_body_chunk();
                    match upload.sink.write_all(&chunk) {
                        Ok(()) => {
                            upload.received += chunk.len() as u64;
                            Step::Parsed {
                                signal,
                                rest: input.split_off(consumed),
                                entered_body: false,
                            }
                        }
                        Err(err) => Step::SinkFailed(err),
                    }
                }
                ConnContext::Awaiting(PendingResponse { backlog, .. })
                | ConnContext::Download(DownloadContext { backlog, .. }) => {
                    if backlog.len() + input.len() > MAX_BACKLOG {
                        Step::BacklogFull
                    } else {
                        backlog.extend_from_slice(&input);
                        Step::Stashed
                    }
                }
            };

            match step {
                Step::Stashed => return,
                Step::BacklogFull => {
                    warn!("FD:{} pipelined past {MAX_BACKLOG} bytes, closing", conn.fd());
                    conn.close();
                    return;
                }
                Step::SinkFailed(err) => {
                    warn!("Upload on FD:{} failed: {err}", conn.fd());
                    self.reject(conn, StatusCode::InternalServerError);
                    return;
                }
                Step::Parsed { signal, rest, entered_body } => match signal {
                    ParseSignal::NeedMore => return,
                    ParseSignal::HeadersComplete => {
                        if entered_body {
                            self.headers_complete(conn);
                        }
                        return;
                    }
                    ParseSignal::Invalid(state) => {
                        debug!("FD:{} sent a malformed request ({state:?})", conn.fd());
                        self.reject(conn, StatusCode::BadRequest);
                        return;
                    }
                    ParseSignal::Complete => match self.complete(conn, rest) {
                        Some(next) if !next.is_empty() => input = next,
                        _ => return,
                    },
                },
            }
        }
    }

    /// Head parsed, body still coming: stream it, refuse it, or keep collecting.
    fn headers_complete(&self, conn: &mut Connection) {
        let ConnContext::Http(parser) = conn.context() else {
            return;
        };
        let request = parser.request();
        let expects_continue = request
            .header("Expect")
            .is_some_and(|value| value.eq_ignore_ascii_case("100-continue"));
        let too_large = parser.content_length() > self.max_body_in_memory;

        if let Some(sink) = self.service.open_upload(request) {
            let ConnContext::Http(mut parser) = conn.take_context() else {
                return;
            };
            let chunk = parser.take_body_chunk();
            let mut upload = UploadContext {
                parser,
                sink,
                received: 0,
            };
            if let Err(err) = upload.sink.write_all(&chunk) {
                warn!("Upload on FD:{} failed: {err}", conn.fd());
                self.reject(conn, StatusCode::InternalServerError);
                return;
            }
            upload.received = chunk.len() as u64;
            debug!("FD:{} streaming request body into a sink", conn.fd());
            conn.set_context(ConnContext::Upload(upload));
        } else if too_large {
            debug!("FD:{} body exceeds {} bytes", conn.fd(), self.max_body_in_memory);
            self.reject(conn, StatusCode::PayloadTooLarge);
            return;
        }
        if expects_continue {
            conn.send(CONTINUE);
        }
    }

    /// A request is fully parsed. Returns the bytes to keep parsing when the
    /// response went out synchronously and the connection stays usable.
    fn complete(self: &Arc<Self>, conn: &mut Connection, rest: Bytes) -> Option<Bytes> {
        let (parser, work, keep_alive) = match conn.take_context() {
            ConnContext::Http(mut parser) => {
                let request = parser.take_request();
                if request.body.len() > self.max_body_in_memory {
                    self.reject(conn, StatusCode::PayloadTooLarge);
                    return None;
                }
                let keep_alive = request.is_keep_alive();
                (parser, Work::Handle(request), keep_alive)
            }
            ConnContext::Upload(UploadContext {
                mut parser,
                mut sink,
                received,
            }) => {
                if let Err(err) = sink.flush() {
                    warn!("Upload on FD:{} failed to flush: {err}", conn.fd());
                    self.reject(conn, StatusCode::InternalServerError);
                    return None;
                }
                drop(sink);
                let request = parser.take_request();
                let keep_alive = request.is_keep_alive();
                (parser, Work::FinishUpload(request, received), keep_alive)
            }
            other => {
                conn.set_context(other);
                return None;
            }
        };

        let Some(pool) = &self.app_pool else {
            let response = work.run(self.service.as_ref());
            return self.respond(conn, parser, keep_alive, response, rest);
        };
        conn.set_context(ConnContext::Awaiting(PendingResponse {
            parser,
            backlog: BytesMut::from(&rest[..]),
        }));
        let handle = conn.handle();
        let core = Arc::clone(self);
        let submitted = pool.execute(move || {
            let response = work.run(core.service.as_ref());
            handle.run(move |conn| core.deliver(conn, keep_alive, response));
        });
        if let Err(err) = submitted {
            warn!("FD:{} cannot be served: {err}", conn.fd());
            self.reject(conn, StatusCode::ServiceUnavailable);
        }
        None
    }

    /// Back on the I/O thread with a response from the application pool.
    fn deliver(self: &Arc<Self>, conn: &mut Connection, keep_alive: bool, response: HttpResponse) {
        let PendingResponse { parser, backlog } = match conn.take_context() {
            ConnContext::Awaiting(pending) => pending,
            other => {
                trace!("FD:{} no longer awaits a response ({})", conn.fd(), other.kind());
                conn.set_context(other);
                return;
            }
        };
        if let Some(rest) = self.respond(conn, parser, keep_alive, response, backlog.freeze()) {
            if !rest.is_empty() {
                self.process(conn, rest);
            }
        }
    }

    fn respond(
        &self,
        conn: &mut Connection,
        parser: HttpContext,
        keep_alive: bool,
        mut response: HttpResponse,
        rest: Bytes,
    ) -> Option<Bytes> {
        if !keep_alive {
            response.set_close_connection(true);
        }
        let close = response.close_connection();
        trace!("FD:{} answered {}", conn.fd(), response.status().code());
        let (head, stream) = response.encode();
        conn.send(&head);
        match stream {
            None if close => {
                conn.close_after_flush();
                None
            }
            None => {
                conn.set_context(ConnContext::Http(parser));
                Some(rest)
            }
            Some(reader) => {
                // The first chunk follows once the head has left
                conn.set_context(ConnContext::Download(DownloadContext {
                    parser,
                    reader,
                    keep_alive: !close,
                    backlog: BytesMut::from(&rest[..]),
                }));
                None
            }
        }
    }

    /// Sends the next chunk of a streamed body, or the terminator and then
    /// whatever was pipelined behind it.
    fn pump(self: &Arc<Self>, conn: &mut Connection) {
        let ConnContext::Download(download) = conn.context_mut() else {
            return;
        };
        let mut chunk = vec![0u8; STREAM_CHUNK];
        let read = loop {
            match download.reader.read(&mut chunk) {
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        match read {
            Ok(0) => {}
            Ok(n) => {
                conn.send(&encode_chunk(&chunk[..n]));
                return;
            }
            Err(err) => {
                // Mid-stream there is no way left to report it to the client
                warn!("Streaming to FD:{} failed: {err}", conn.fd());
                conn.close();
                return;
            }
        }

        conn.send(LAST_CHUNK);
        let ConnContext::Download(DownloadContext {
            parser,
            keep_alive,
            backlog,
            ..
        }) = conn.take_context()
        else {
            return;
        };
        if !keep_alive {
            conn.close_after_flush();
            return;
        }
        conn.set_context(ConnContext::Http(parser));
        if !backlog.is_empty() {
            self.process(conn, backlog.freeze());
        }
    }

    /// Error reply, then close once it is out.
    fn reject(&self, conn: &mut Connection, status: StatusCode) {
        let mut response = if status == StatusCode::BadRequest {
            HttpResponse::bad_request()
        } else {
            HttpResponse::text(status, format!("{}\n", status.reason()))
        };
        response.set_close_connection(true);
        let (head, _) = response.encode();
        conn.send(&head);
        conn.set_context(ConnContext::None);
        conn.close_after_flush();
    }
}

/// A [`TcpServer`] that speaks HTTP/1.x to an [`HttpService`].
pub struct HttpServer {
    tcp: TcpServer,
    core: Arc<HttpCore>,
}

impl HttpServer {
    pub fn new<S: HttpService>(config: ServerConfig, service: S) -> Result<Self> {
        let app_pool = match config.get_app_workers() {
            0 => None,
            size => Some(ThreadPool::new(PoolConfig {
                name: "app".into(),
                size,
                dispatch: config.get_dispatch().cloned(),
                ..Default::default()
            })?),
        };
        let core = Arc::new(HttpCore {
            service: Arc::new(service),
            app_pool,
            max_body_in_memory: config.get_max_body_in_memory(),
        });

        let on_connection = Arc::clone(&core);
        let on_message = Arc::clone(&core);
        let on_send_complete = Arc::clone(&core);
        let tcp = TcpServer::builder(config)
            .on_new_connection(move |conn| on_connection.on_connection(conn))
            .on_message(move |conn, data| on_message.on_message(conn, data))
            .on_send_complete(move |conn| on_send_complete.on_send_complete(conn))
            .on_close(|conn| debug!("HTTP connection FD:{} closed ({})", conn.fd(), conn.context().kind()))
            .on_error(|conn| debug!("HTTP connection FD:{} failed ({})", conn.fd(), conn.context().kind()))
            .build()?;
        Ok(Self { tcp, core })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.tcp.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.tcp.connection_count()
    }

    pub fn handle(&self) -> ServerHandle {
        self.tcp.handle()
    }

    /// Serves until stopped, then drains the application pool.
    pub fn run(&mut self) -> Result<()> {
        let outcome = self.tcp.run();
        if let Some(pool) = &self.core.app_pool {
            pool.stop();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::{
        config::LoopConfig,
        reactor::event_loop::EventLoop,
        server_internals::ConnectionHooks,
    };
    use socket2::{Domain, Socket, Type};
    use std::{
        io::Cursor,
        os::unix::net::UnixStream,
        sync::Mutex,
        time::Duration,
    };

    struct Hello;

    impl HttpService for Hello {
        fn handle(&self, request: &HttpRequest) -> HttpResponse {
            match request.url.as_str() {
                "/stream" => {
                    let mut response = HttpResponse::new(StatusCode::Ok);
                    response.set_stream(Box::new(Cursor::new(b"streamed".to_vec())));
                    response
                }
                url => HttpResponse::text(StatusCode::Ok, format!("hello {url}")),
            }
        }
    }

    struct Recorder(Arc<Mutex<Vec<u8>>>);

    impl Write for Recorder {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Uploads(Arc<Mutex<Vec<u8>>>);

    impl HttpService for Uploads {
        fn handle(&self, _: &HttpRequest) -> HttpResponse {
            HttpResponse::text(StatusCode::Ok, "inline")
        }

        fn open_upload(&self, _: &HttpRequest) -> Option<Box<dyn Write + Send>> {
            Some(Box::new(Recorder(Arc::clone(&self.0))))
        }

        fn finish_upload(&self, _: &HttpRequest, received: u64) -> HttpResponse {
            HttpResponse::text(StatusCode::Created, format!("stored {received}"))
        }
    }

    /// A single worker loop wired like an `HttpServer`, driven by hand.
    fn rig<S: HttpService>(service: S, max_body: usize) -> (EventLoop, UnixStream) {
        let core = Arc::new(HttpCore {
            service: Arc::new(service),
            app_pool: None,
            max_body_in_memory: max_body,
        });
        let (a, b, c) = (Arc::clone(&core), Arc::clone(&core), Arc::clone(&core));
        let mut lp = EventLoop::new(
            LoopConfig::new("http-test").set_poll_timeout(Duration::from_millis(20)),
        )
        .unwrap();
        lp.set_hooks(Arc::new(ConnectionHooks {
            on_new_connection: Some(Arc::new(move |conn| a.on_connection(conn))),
            on_message: Some(Arc::new(move |conn, data| b.on_message(conn, data))),
            on_send_complete: Some(Arc::new(move |conn| c.on_send_complete(conn))),
            ..Default::default()
        }));
        let (ours, theirs) = Socket::pair(Domain::UNIX, Type::STREAM, None).unwrap();
        lp.adopt(ours, None).unwrap();
        let theirs: UnixStream = theirs.into();
        theirs.set_nonblocking(true).unwrap();
        (lp, theirs)
    }

    fn exchange(lp: &mut EventLoop, client: &mut UnixStream, request: &[u8], passes: usize) -> String {
        client.write_all(request).unwrap();
        let mut received = Vec::new();
        for _ in 0..passes {
            lp.poll_once_with(Some(Duration::from_millis(20))).unwrap();
            let mut buf = [0u8; 4096];
            loop {
                match client.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                    Err(_) => break,
                }
            }
        }
        String::from_utf8(received).unwrap()
    }

    #[test]
    fn pipelined_requests_answer_in_order() {
        let (mut lp, mut client) = rig(Hello, 1024);
        let text = exchange(
            &mut lp,
            &mut client,
            b"GET /one HTTP/1.1\r\n\r\nGET /two HTTP/1.1\r\n\r\n",
            4,
        );
        let one = text.find("hello /one").unwrap();
        let two = text.find("hello /two").unwrap();
        assert!(one < two);
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
        assert_eq!(lp.connection_count(), 1);
    }

    #[test]
    fn malformed_request_gets_400_and_close() {
        let (mut lp, mut client) = rig(Hello, 1024);
        let text = exchange(&mut lp, &mut client, b"get / HTTP/1.1\r\n\r\n", 4);
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert_eq!(lp.connection_count(), 0);
    }

    #[test]
    fn streamed_body_is_chunked() {
        let (mut lp, mut client) = rig(Hello, 1024);
        let text = exchange(&mut lp, &mut client, b"GET /stream HTTP/1.1\r\n\r\n", 6);
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.ends_with("\r\n\r\n8\r\nstreamed\r\n0\r\n\r\n"));
        assert_eq!(lp.connection_count(), 1);
    }

    #[test]
    fn oversized_body_gets_413() {
        let (mut lp, mut client) = rig(Hello, 8);
        let text = exchange(
            &mut lp,
            &mut client,
            b"POST /big HTTP/1.1\r\nContent-Length: 100\r\n\r\nabc",
            4,
        );
        assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert_eq!(lp.connection_count(), 0);
    }

    #[test]
    fn upload_streams_into_the_sink() {
        let stored = Arc::new(Mutex::new(Vec::new()));
        let (mut lp, mut client) = rig(Uploads(Arc::clone(&stored)), 1024);
        let first = exchange(
            &mut lp,
            &mut client,
            b"POST /up HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123",
            2,
        );
        assert!(first.is_empty());
        let text = exchange(&mut lp, &mut client, b"456789", 3);
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(text.ends_with("stored 10"));
        assert_eq!(&stored.lock().unwrap()[..], b"0123456789");
    }
}
