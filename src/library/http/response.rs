use crate::library::{http::request::Version, utils::http_date::http_date_now};
use bytes::{BufMut, Bytes, BytesMut};
use std::{fmt, io::Read};

pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Continue,
    Ok,
    Created,
    NoContent,
    PartialContent,
    Found,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    PayloadTooLarge,
    RangeNotSatisfiable,
    InternalServerError,
    ServiceUnavailable,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Continue => 100,
            StatusCode::Ok => 200,
            StatusCode::Created => 201,
            StatusCode::NoContent => 204,
            StatusCode::PartialContent => 206,
            StatusCode::Found => 302,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::RangeNotSatisfiable => 416,
            StatusCode::InternalServerError => 500,
            StatusCode::ServiceUnavailable => 503,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Continue => "Continue",
            StatusCode::Ok => "OK",
            StatusCode::Created => "Created",
            StatusCode::NoContent => "No Content",
            StatusCode::PartialContent => "Partial Content",
            StatusCode::Found => "Found",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::RangeNotSatisfiable => "Range Not Satisfiable",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::ServiceUnavailable => "Service Unavailable",
        }
    }
}

/// A response body: bytes already in memory, or a reader sent chunked.
pub enum Body {
    Full(Bytes),
    Stream(Box<dyn Read + Send>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Body::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Full(Bytes::new())
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    version: Version,
    status: StatusCode,
    reason: Option<String>,
    close_connection: bool,
    headers: Vec<(String, String)>,
    body: Body,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::Http11,
            status,
            reason: None,
            close_connection: false,
            headers: Vec::new(),
            body: Body::default(),
        }
    }

    pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let mut response = Self::new(status);
        response
            .set_header("Content-Type", "text/plain; charset=utf-8")
            .set_body(body);
        response
    }

    /// The canned reply for a request that never parsed.
    pub fn bad_request() -> Self {
        let mut response = Self::text(StatusCode::BadRequest, "Bad Request\n");
        response.set_close_connection(true);
        response
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) -> &mut Self {
        self.version = version;
        self
    }

    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) -> &mut Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    pub fn set_close_connection(&mut self, close: bool) -> &mut Self {
        self.close_connection = close;
        self
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) -> &mut Self {
        self.body = Body::Full(body.into());
        self
    }

    pub fn set_stream(&mut self, reader: Box<dyn Read + Send>) -> &mut Self {
        self.body = Body::Stream(reader);
        self
    }

    /// Splits into the wire head (plus the body when it is in memory) and the
    /// reader still to be pumped, if any.
    pub fn encode(self) -> (Bytes, Option<Box<dyn Read + Send>>) {
        self.encode_with_date(&http_date_now())
    }

    pub fn encode_with_date(self, date: &str) -> (Bytes, Option<Box<dyn Read + Send>>) {
        let body_len = match &self.body {
            Body::Full(bytes) => bytes.len(),
            Body::Stream(_) => 0,
        };
        let mut out = BytesMut::with_capacity(256 + body_len);
        let reason: &str = self.reason.as_deref().unwrap_or(self.status.reason());
        out.put_slice(
            format!("{} {} {}\r\n", self.version.as_str(), self.status.code(), reason).as_bytes(),
        );
        match &self.body {
            Body::Full(bytes) => {
                out.put_slice(format!("Content-Length: {}\r\n", bytes.len()).as_bytes())
            }
            Body::Stream(_) => out.put_slice(b"Transfer-Encoding: chunked\r\n"),
        }
        out.put_slice(if self.close_connection {
            b"Connection: close\r\n".as_slice()
        } else {
            b"Connection: Keep-Alive\r\n".as_slice()
        });
        out.put_slice(b"Date: ");
        out.put_slice(date.as_bytes());
        out.put_slice(b"\r\n");
        for (key, value) in &self.headers {
            out.put_slice(key.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        match self.body {
            Body::Full(bytes) => {
                out.put_slice(&bytes);
                (out.freeze(), None)
            }
            Body::Stream(reader) => (out.freeze(), Some(reader)),
        }
    }
}

/// `<hex-size>\r\n<data>\r\n`. An empty `data` yields the terminating chunk.
pub fn encode_chunk(data: &[u8]) -> Bytes {
    if data.is_empty() {
        return Bytes::from_static(LAST_CHUNK);
    }
    let mut out = BytesMut::with_capacity(data.len() + 12);
    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const DATE: &str = "Sun, 06 Nov 1994 08:49:37 GMT";

    #[test]
    fn full_body_layout() {
        let mut response = HttpResponse::new(StatusCode::Ok);
        response.set_header("Content-Type", "text/plain").set_body("hi");
        let (wire, rest) = response.encode_with_date(DATE);
        assert!(rest.is_none());
        assert_eq!(
            &wire[..],
            b"HTTP/1.1 200 OK\r\n\
              Content-Length: 2\r\n\
              Connection: Keep-Alive\r\n\
              Date: Sun, 06 Nov 1994 08:49:37 GMT\r\n\
              Content-Type: text/plain\r\n\
              \r\n\
              hi"
        );
    }

    #[test]
    fn stream_is_chunked_and_returned() {
        let mut response = HttpResponse::new(StatusCode::PartialContent);
        response
            .set_close_connection(true)
            .set_reason("Some Of It")
            .set_stream(Box::new(Cursor::new(b"abc".to_vec())));
        let (wire, rest) = response.encode_with_date(DATE);
        let text = String::from_utf8(wire.to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 206 Some Of It\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\n"));
        let mut body = String::new();
        rest.unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "abc");
    }

    #[test]
    fn http10_status_line() {
        let mut response = HttpResponse::new(StatusCode::NotFound);
        response.set_version(Version::Http10);
        let (wire, _) = response.encode_with_date(DATE);
        assert!(wire.starts_with(b"HTTP/1.0 404 Not Found\r\nContent-Length: 0\r\n"));
    }

    #[test]
    fn chunk_framing() {
        assert_eq!(&encode_chunk(b"hello world, 26 bytes long")[..], b"1a\r\nhello world, 26 bytes long\r\n");
        assert_eq!(&encode_chunk(b"")[..], LAST_CHUNK);
    }

    #[test]
    fn bad_request_closes() {
        let response = HttpResponse::bad_request();
        assert_eq!(response.status(), StatusCode::BadRequest);
        assert!(response.close_connection());
    }
}
