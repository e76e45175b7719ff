use std::{
    io::{self, Cursor, Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};
use tachyon_reactor::{
    HttpRequest, HttpResponse, HttpServer, HttpService, Method, Result, ServerConfig, ServerHandle,
    StatusCode,
};

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Demo {
    uploads: SharedSink,
}

impl HttpService for Demo {
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        match (request.method, request.url.as_str()) {
            (Method::Get, "/hello") => HttpResponse::text(StatusCode::Ok, "hello"),
            (Method::Get, "/echo") => {
                let word = request.param("word").unwrap_or("nothing").to_string();
                HttpResponse::text(StatusCode::Ok, word)
            }
            (Method::Post, "/form") => {
                let name = request.param("name").unwrap_or_default().to_string();
                HttpResponse::text(StatusCode::Ok, name)
            }
            (Method::Get, "/stream") => {
                let mut response = HttpResponse::new(StatusCode::Ok);
                response.set_stream(Box::new(Cursor::new(vec![b'x'; 200_000])));
                response
            }
            _ => HttpResponse::text(StatusCode::NotFound, "missing"),
        }
    }

    fn open_upload(&self, request: &HttpRequest) -> Option<Box<dyn Write + Send>> {
        (request.url == "/upload").then(|| Box::new(self.uploads.clone()) as Box<dyn Write + Send>)
    }

    fn finish_upload(&self, _request: &HttpRequest, received: u64) -> HttpResponse {
        HttpResponse::text(StatusCode::Created, format!("stored {received}"))
    }
}

struct Running {
    addr: SocketAddr,
    handle: ServerHandle,
    runner: JoinHandle<Result<()>>,
}

impl Running {
    fn start(app_workers: usize, service: Demo) -> Self {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap())
            .set_workers(2)
            .set_app_workers(app_workers)
            .set_max_body_in_memory(1024)
            .set_poll_timeout(Duration::from_millis(50))
            .build();
        let mut server = HttpServer::new(config, service).unwrap();
        let addr = server.local_addr();
        let handle = server.handle();
        let runner = thread::spawn(move || server.run());
        Self {
            addr,
            handle,
            runner,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    fn stop(self) {
        self.handle.stop();
        self.runner.join().unwrap().unwrap();
    }
}

/// Reads until `needle` has been seen `times` times.
fn read_until(stream: &mut TcpStream, needle: &[u8], times: usize) -> Vec<u8> {
    let mut seen = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let found = seen.windows(needle.len()).filter(|w| *w == needle).count();
        if found >= times {
            return seen;
        }
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed early: {}", String::from_utf8_lossy(&seen));
        seen.extend_from_slice(&buf[..n]);
    }
}

#[test]
fn keep_alive_serves_several_requests() {
    for app_workers in [0, 2] {
        let server = Running::start(app_workers, Demo::default());
        let mut stream = server.connect();
        for _ in 0..3 {
            stream.write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
            let reply = read_until(&mut stream, b"hello", 1);
            let text = String::from_utf8(reply).unwrap();
            assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(text.contains("Content-Length: 5\r\n"));
            assert!(text.contains("Connection: Keep-Alive\r\n"));
        }
        server.stop();
    }
}

#[test]
fn pipelined_answers_keep_request_order() {
    for app_workers in [0, 3] {
        let server = Running::start(app_workers, Demo::default());
        let mut stream = server.connect();
        let mut batch = Vec::new();
        for word in ["one", "two", "three", "four"] {
            batch.extend_from_slice(format!("GET /echo?word={word} HTTP/1.1\r\n\r\n").as_bytes());
        }
        stream.write_all(&batch).unwrap();
        let reply = String::from_utf8(read_until(&mut stream, b"HTTP/1.1 200 OK", 4)).unwrap();
        let reply = read_rest(&mut stream, reply, "four");
        let positions: Vec<usize> = ["\r\n\r\none", "\r\n\r\ntwo", "\r\n\r\nthree", "\r\n\r\nfour"]
            .iter()
            .map(|body| reply.find(body).unwrap())
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]), "{reply}");
        server.stop();
    }
}

fn read_rest(stream: &mut TcpStream, mut text: String, tail: &str) -> String {
    let mut buf = [0u8; 1024];
    while !text.ends_with(tail) {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0);
        text.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    text
}

#[test]
fn http10_closes_after_the_reply() {
    let server = Running::start(0, Demo::default());
    let mut stream = server.connect();
    stream.write_all(b"GET /hello HTTP/1.0\r\n\r\n").unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    assert!(reply.contains(" 200 OK\r\n"));
    assert!(reply.contains("Connection: close\r\n"));
    assert!(reply.ends_with("hello"));
    server.stop();
}

#[test]
fn half_closed_client_still_gets_its_reply() {
    let server = Running::start(0, Demo::default());
    let mut stream = server.connect();
    stream.write_all(b"GET /hello HTTP/1.0\r\n\r\n").unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    assert!(reply.contains(" 200 OK\r\n"), "{reply}");
    assert!(reply.ends_with("hello"));
    server.stop();
}

#[test]
fn garbage_gets_400_and_a_close() {
    let server = Running::start(0, Demo::default());
    let mut stream = server.connect();
    stream.write_all(b"BREW /pot HTCPCP/1.0\r\n\r\n").unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(reply.contains("Connection: close\r\n"));
    server.stop();
}

#[test]
fn urlencoded_form_fields_become_params() {
    let server = Running::start(0, Demo::default());
    let mut stream = server.connect();
    let body = "name=alice&x=1";
    let request = format!(
        "POST /form HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).unwrap();
    let reply = String::from_utf8(read_until(&mut stream, b"\r\n\r\nalice", 1)).unwrap();
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
    server.stop();
}

#[test]
fn large_stream_is_chunked_and_complete() {
    let server = Running::start(0, Demo::default());
    let mut stream = server.connect();
    stream.write_all(b"GET /stream HTTP/1.1\r\n\r\n").unwrap();
    let reply = read_until(&mut stream, b"\r\n0\r\n\r\n", 1);
    let split = reply.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let head = String::from_utf8_lossy(&reply[..split]);
    assert!(head.contains("Transfer-Encoding: chunked\r\n"));
    assert_eq!(decode_chunked(&reply[split..]), vec![b'x'; 200_000]);

    // The connection is still usable afterwards
    stream.write_all(b"GET /hello HTTP/1.1\r\n\r\n").unwrap();
    read_until(&mut stream, b"hello", 1);
    server.stop();
}

fn decode_chunked(mut raw: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let line_end = raw.windows(2).position(|w| w == b"\r\n").unwrap();
        let size = usize::from_str_radix(std::str::from_utf8(&raw[..line_end]).unwrap(), 16).unwrap();
        raw = &raw[line_end + 2..];
        if size == 0 {
            return body;
        }
        body.extend_from_slice(&raw[..size]);
        raw = &raw[size + 2..];
    }
}

#[test]
fn uploads_stream_into_the_sink() {
    let demo = Demo::default();
    let uploads = demo.uploads.clone();
    let server = Running::start(0, demo);
    let mut stream = server.connect();

    let payload = vec![b'u'; 64 * 1024];
    let head = format!("POST /upload HTTP/1.1\r\nContent-Length: {}\r\n\r\n", payload.len());
    stream.write_all(head.as_bytes()).unwrap();
    for piece in payload.chunks(5000) {
        stream.write_all(piece).unwrap();
    }
    let reply = String::from_utf8(read_until(&mut stream, b"stored 65536", 1)).unwrap();
    assert!(reply.starts_with("HTTP/1.1 201 Created\r\n"));
    assert_eq!(*uploads.0.lock().unwrap(), payload);
    server.stop();
}

#[test]
fn oversized_bodies_without_a_sink_are_refused() {
    let server = Running::start(0, Demo::default());
    let mut stream = server.connect();
    stream
        .write_all(b"POST /form HTTP/1.1\r\nContent-Length: 4096\r\n\r\n")
        .unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    assert!(reply.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    server.stop();
}

#[test]
fn expect_continue_is_answered_before_the_body() {
    let server = Running::start(0, Demo::default());
    let mut stream = server.connect();
    stream
        .write_all(b"POST /form HTTP/1.1\r\nExpect: 100-continue\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 6\r\n\r\n")
        .unwrap();
    read_until(&mut stream, b"HTTP/1.1 100 Continue\r\n\r\n", 1);
    stream.write_all(b"name=a").unwrap();
    let reply = String::from_utf8(read_until(&mut stream, b"\r\n\r\na", 1)).unwrap();
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
    server.stop();
}

#[test]
fn stop_is_safe_while_clients_are_connected() {
    let server = Running::start(2, Demo::default());
    let mut idle = server.connect();
    let mut active = server.connect();
    active.write_all(b"GET /hello HTTP/1.1\r\n\r\n").unwrap();
    read_until(&mut active, b"hello", 1);
    server.stop();
    let mut buf = [0u8; 8];
    assert_eq!(idle.read(&mut buf).unwrap_or(0), 0);
}
