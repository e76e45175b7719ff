use crate::library::{
    http::request::{HttpRequest, Method, Version},
    utils::http::parse_urlencoded,
};
use bytes::{Bytes, BytesMut};

/// Longest single token (method, URL, header name or value, protocol).
pub const MAX_TOKEN_LEN: usize = 8 * 1024;
/// Most header lines one request may carry.
pub const MAX_HEADERS: usize = 100;

/// Where the parser stands inside the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    Start,
    Method,
    BeforeUrl,
    InUrl,
    BeforeUrlParamKey,
    UrlParamKey,
    BeforeUrlParamValue,
    UrlParamValue,
    BeforeProtocol,
    Protocol,
    BeforeVersion,
    Version,
    /// Saw CR, LF must follow.
    WhenCr,
    /// At the start of a header line.
    CrLf,
    HeaderKey,
    HeaderValue,
    /// Saw CR on an empty line.
    CrLfCr,
    Body,
    Complete,
    Invalid,
    InvalidMethod,
    InvalidUrl,
    InvalidVersion,
    InvalidHeader,
}

impl ParseState {
    pub fn is_invalid(&self) -> bool {
        matches!(
            self,
            ParseState::Invalid
                | ParseState::InvalidMethod
                | ParseState::InvalidUrl
                | ParseState::InvalidVersion
                | ParseState::InvalidHeader
        )
    }

    /// The failure reported when a token in this state grows past its bound.
    fn overflow(&self) -> ParseState {
        match self {
            ParseState::Method => ParseState::InvalidMethod,
            ParseState::InUrl
            | ParseState::UrlParamKey
            | ParseState::UrlParamValue => ParseState::InvalidUrl,
            ParseState::Protocol | ParseState::Version => ParseState::InvalidVersion,
            ParseState::HeaderKey | ParseState::HeaderValue => ParseState::InvalidHeader,
            _ => ParseState::Invalid,
        }
    }
}

/// What one `parse` call achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseSignal {
    /// The head is not finished yet.
    NeedMore,
    /// Head parsed, body still short of `Content-Length`.
    HeadersComplete,
    Complete,
    Invalid(ParseState),
}

/// Incremental HTTP/1.x request parser, one per connection.
///
/// Feed it whatever the socket produced. A token split across two chunks is
/// carried over, so the outcome never depends on where the chunks break.
#[derive(Debug, Default)]
pub struct HttpContext {
    state: ParseState,
    request: HttpRequest,
    token: Vec<u8>,
    param_key: String,
    header_key: String,
    header_count: usize,
    content_length: usize,
    body: BytesMut,
    body_seen: usize,
    streaming: bool,
}

#[inline(always)]
fn is_tchar(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&c)
}

impl HttpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    /// The request as far as it has been parsed.
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Body bytes seen so far across every call, taken chunks included.
    pub fn body_seen(&self) -> usize {
        self.body_seen
    }

    /// Hands out the body bytes gathered since the last call and switches the
    /// context to streaming: the finished request will carry no body and no
    /// form-decoded params.
    pub fn take_body_chunk(&mut self) -> Bytes {
        self.streaming = true;
        self.body.split().freeze()
    }

    /// Removes the finished request and installs a fresh one for the next
    /// request on the same connection.
    pub fn take_request(&mut self) -> HttpRequest {
        let request = std::mem::take(&mut self.request);
        self.reset();
        request
    }

    pub fn reset(&mut self) {
        self.state = ParseState::Start;
        self.request = HttpRequest::default();
        self.token.clear();
        self.param_key.clear();
        self.header_key.clear();
        self.header_count = 0;
        self.content_length = 0;
        self.body = BytesMut::new();
        self.body_seen = 0;
        self.streaming = false;
    }

    /// Advances over `data` and reports how many bytes belong to the current
    /// request. Bytes past a `Complete` are left for the next request.
    pub fn parse(&mut self, data: &[u8]) -> (ParseSignal, usize) {
        let mut pos: usize = 0;
        while pos < data.len() && !self.is_terminal() {
            if self.state == ParseState::Body {
                pos += self.consume_body(&data[pos..]);
                continue;
            }
            self.step(data[pos]);
            pos += 1;
        }
        (self.signal(), pos)
    }

    fn is_terminal(&self) -> bool {
        self.state == ParseState::Complete || self.state.is_invalid()
    }

    fn signal(&self) -> ParseSignal {
        match self.state {
            ParseState::Complete => ParseSignal::Complete,
            ParseState::Body => ParseSignal::HeadersComplete,
            state if state.is_invalid() => ParseSignal::Invalid(state),
            _ => ParseSignal::NeedMore,
        }
    }

    #[inline(always)]
    fn push(&mut self, c: u8) {
        if self.token.len() >= MAX_TOKEN_LEN {
            self.state = self.state.overflow();
            return;
        }
        self.token.push(c);
    }

    fn take_token(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.token).into_owned();
        self.token.clear();
        text
    }

    fn finish_param(&mut self) {
        let key = std::mem::take(&mut self.param_key);
        let value = self.take_token();
        self.request.params.insert(key, value);
    }

    fn step(&mut self, c: u8) {
        use ParseState as S;
        match self.state {
            S::Start => match c {
                // Stray line breaks between pipelined requests
                b'\r' | b'\n' | b' ' => {}
                b'A'..=b'Z' => {
                    self.push(c);
                    self.state = S::Method;
                }
                _ => self.state = S::InvalidMethod,
            },
            S::Method => match c {
                b'A'..=b'Z' => self.push(c),
                b' ' => match Method::from_bytes(&self.token) {
                    Some(method) => {
                        self.request.method = method;
                        self.token.clear();
                        self.state = S::BeforeUrl;
                    }
                    None => self.state = S::InvalidMethod,
                },
                _ => self.state = S::InvalidMethod,
            },
            S::BeforeUrl => match c {
                b' ' => {}
                b'/' => {
                    self.push(c);
                    self.state = S::InUrl;
                }
                _ => self.state = S::InvalidUrl,
            },
            S::InUrl => match c {
                b' ' => {
                    self.request.url = self.take_token();
                    self.state = S::BeforeProtocol;
                }
                b'?' => {
                    self.request.url = self.take_token();
                    self.state = S::BeforeUrlParamKey;
                }
                b'\r' | b'\n' => self.state = S::InvalidUrl,
                _ => self.push(c),
            },
            S::BeforeUrlParamKey => match c {
                b' ' => self.state = S::BeforeProtocol,
                b'&' => {}
                b'=' | b'\r' | b'\n' => self.state = S::InvalidUrl,
                _ => {
                    self.push(c);
                    self.state = S::UrlParamKey;
                }
            },
            S::UrlParamKey => match c {
                b'=' => {
                    self.param_key = self.take_token();
                    self.state = S::BeforeUrlParamValue;
                }
                b'&' | b' ' => {
                    self.param_key = self.take_token();
                    self.finish_param();
                    self.state = if c == b' ' {
                        S::BeforeProtocol
                    } else {
                        S::BeforeUrlParamKey
                    };
                }
                b'\r' | b'\n' => self.state = S::InvalidUrl,
                _ => self.push(c),
            },
            S::BeforeUrlParamValue | S::UrlParamValue => match c {
                b'&' => {
                    self.finish_param();
                    self.state = S::BeforeUrlParamKey;
                }
                b' ' => {
                    self.finish_param();
                    self.state = S::BeforeProtocol;
                }
                b'\r' | b'\n' => self.state = S::InvalidUrl,
                _ => {
                    self.push(c);
                    if self.state == S::BeforeUrlParamValue {
                        self.state = S::UrlParamValue;
                    }
                }
            },
            S::BeforeProtocol => match c {
                b' ' => {}
                b'A'..=b'Z' => {
                    self.push(c);
                    self.state = S::Protocol;
                }
                _ => self.state = S::InvalidVersion,
            },
            S::Protocol => match c {
                b'/' => {
                    self.request.protocol = self.take_token();
                    self.state = S::BeforeVersion;
                }
                b'A'..=b'Z' => self.push(c),
                _ => self.state = S::InvalidVersion,
            },
            S::BeforeVersion => match c {
                b'0'..=b'9' => {
                    self.push(c);
                    self.state = S::Version;
                }
                _ => self.state = S::InvalidVersion,
            },
            S::Version => match c {
                b'0'..=b'9' | b'.' => self.push(c),
                b'\r' => match self.token.as_slice() {
                    &[major, b'.', minor] if major.is_ascii_digit() && minor.is_ascii_digit() => {
                        self.request.version = Version::from_digits(major, minor);
                        self.token.clear();
                        self.state = S::WhenCr;
                    }
                    _ => self.state = S::InvalidVersion,
                },
                _ => self.state = S::InvalidVersion,
            },
            S::WhenCr => match c {
                b'\n' => self.state = S::CrLf,
                _ => self.state = S::Invalid,
            },
            S::CrLf => match c {
                b'\r' => self.state = S::CrLfCr,
                c if is_tchar(c) => {
                    self.push(c);
                    self.state = S::HeaderKey;
                }
                _ => self.state = S::InvalidHeader,
            },
            S::HeaderKey => match c {
                b':' => {
                    self.header_key = self.take_token();
                    self.state = S::HeaderValue;
                }
                c if is_tchar(c) => self.push(c),
                _ => self.state = S::InvalidHeader,
            },
            S::HeaderValue => match c {
                b'\r' => self.finish_header(),
                b'\n' => self.state = S::InvalidHeader,
                b' ' | b'\t' if self.token.is_empty() => {}
                _ => self.push(c),
            },
            S::CrLfCr => match c {
                b'\n' => {
                    if self.content_length > 0 {
                        self.state = S::Body;
                    } else {
                        self.finish();
                    }
                }
                _ => self.state = S::InvalidHeader,
            },
            // Handled in bulk by consume_body
            S::Body => {}
            S::Complete
            | S::Invalid
            | S::InvalidMethod
            | S::InvalidUrl
            | S::InvalidVersion
            | S::InvalidHeader => {}
        }
    }

    fn finish_header(&mut self) {
        if self.header_count >= MAX_HEADERS {
            self.state = ParseState::InvalidHeader;
            return;
        }
        while self.token.last().is_some_and(|c| *c == b' ' || *c == b'\t') {
            self.token.pop();
        }
        let key = std::mem::take(&mut self.header_key);
        let value = self.take_token();
        if key.eq_ignore_ascii_case("Content-Length") {
            match value.parse::<usize>() {
                Ok(length) => self.content_length = length,
                Err(_) => {
                    self.state = ParseState::InvalidHeader;
                    return;
                }
            }
        }
        self.request.headers.push((key, value));
        self.header_count += 1;
        self.state = ParseState::WhenCr;
    }

    fn consume_body(&mut self, data: &[u8]) -> usize {
        let wanted = self.content_length - self.body_seen;
        let n = wanted.min(data.len());
        self.body.extend_from_slice(&data[..n]);
        self.body_seen += n;
        if self.body_seen == self.content_length {
            self.finish();
        }
        n
    }

    fn finish(&mut self) {
        if !self.streaming {
            self.request.body = self.body.split().freeze();
            if self.request.method == Method::Post && self.request.is_form_urlencoded() {
                let body = self.request.body.clone();
                parse_urlencoded(&body, &mut self.request.params);
            }
        }
        self.state = ParseState::Complete;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &[u8] = b"GET /a?x=1&y=2 HTTP/1.1\r\nHost: h\r\n\r\n";

    fn parse_all(chunks: &[&[u8]]) -> (HttpContext, ParseSignal) {
        let mut ctx = HttpContext::new();
        let mut signal = ParseSignal::NeedMore;
        for chunk in chunks {
            let (s, consumed) = ctx.parse(chunk);
            assert_eq!(consumed, chunk.len());
            signal = s;
        }
        (ctx, signal)
    }

    #[test]
    fn simple_get_in_one_chunk() {
        let (mut ctx, signal) = parse_all(&[SIMPLE]);
        assert_eq!(signal, ParseSignal::Complete);
        let req = ctx.take_request();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.url, "/a");
        assert_eq!(req.param("x"), Some("1"));
        assert_eq!(req.param("y"), Some("2"));
        assert_eq!(req.params.len(), 2);
        assert_eq!(req.protocol, "HTTP");
        assert_eq!(req.version, Version::Http11);
        assert_eq!(req.header("Host"), Some("h"));
        assert!(req.body.is_empty());
        // Reset contract
        assert_eq!(ctx.state(), ParseState::Start);
        assert_eq!(ctx.request(), &HttpRequest::default());
    }

    #[test]
    fn every_split_point_gives_the_same_request() {
        let (mut whole, _) = parse_all(&[SIMPLE]);
        let expected = whole.take_request();
        for split in 1..SIMPLE.len() {
            let (mut ctx, signal) = parse_all(&[&SIMPLE[..split], &SIMPLE[split..]]);
            assert_eq!(signal, ParseSignal::Complete, "split at {split}");
            assert_eq!(ctx.take_request(), expected, "split at {split}");
        }
    }

    #[test]
    fn byte_at_a_time() {
        let chunks: Vec<&[u8]> = SIMPLE.chunks(1).collect();
        let (ctx, signal) = parse_all(&chunks);
        assert_eq!(signal, ParseSignal::Complete);
        assert_eq!(ctx.request().header("host"), Some("h"));
    }

    #[test]
    fn short_body_waits_for_the_rest() {
        let mut ctx = HttpContext::new();
        let head = b"POST /up HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123";
        let (signal, consumed) = ctx.parse(head);
        assert_eq!(signal, ParseSignal::HeadersComplete);
        assert_eq!(consumed, head.len());
        assert_eq!(ctx.body_seen(), 4);

        let (signal, _) = ctx.parse(b"456789");
        assert_eq!(signal, ParseSignal::Complete);
        assert_eq!(&ctx.take_request().body[..], b"0123456789");
    }

    #[test]
    fn lowercase_method_never_completes() {
        let mut ctx = HttpContext::new();
        let (signal, _) = ctx.parse(b"get / HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(signal, ParseSignal::Invalid(ParseState::InvalidMethod));
        assert!(ctx.state().is_invalid());
        // Terminal: more input changes nothing
        let (signal, consumed) = ctx.parse(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(signal, ParseSignal::Invalid(ParseState::InvalidMethod));
        assert_eq!(consumed, 0);
    }

    #[test]
    fn malformed_pieces_map_to_their_state() {
        let cases: [(&[u8], ParseState); 5] = [
            (b"BREW / HTTP/1.1\r\n", ParseState::InvalidMethod),
            (b"GET index HTTP/1.1\r\n", ParseState::InvalidUrl),
            (b"GET / HTTP/x.1\r\n", ParseState::InvalidVersion),
            (b"GET / HTTP/1.1\r\nBad Key: v\r\n", ParseState::InvalidHeader),
            (
                b"GET / HTTP/1.1\r\nContent-Length: ten\r\n\r\n",
                ParseState::InvalidHeader,
            ),
        ];
        for (input, expected) in cases {
            let mut ctx = HttpContext::new();
            assert_eq!(ctx.parse(input).0, ParseSignal::Invalid(expected));
        }
    }

    #[test]
    fn pipelined_requests_leave_the_tail() {
        let mut input = SIMPLE.to_vec();
        input.extend_from_slice(b"GET /b HTTP/1.1\r\n\r\n");
        let mut ctx = HttpContext::new();
        let (signal, consumed) = ctx.parse(&input);
        assert_eq!(signal, ParseSignal::Complete);
        assert_eq!(consumed, SIMPLE.len());
        assert_eq!(ctx.take_request().url, "/a");

        let (signal, _) = ctx.parse(&input[consumed..]);
        assert_eq!(signal, ParseSignal::Complete);
        assert_eq!(ctx.take_request().url, "/b");
    }

    #[test]
    fn form_body_becomes_params() {
        let body = b"user=neo&pass=zion";
        let request = format!(
            "POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let (mut ctx, signal) = parse_all(&[request.as_bytes(), body]);
        assert_eq!(signal, ParseSignal::Complete);
        let req = ctx.take_request();
        assert_eq!(req.param("user"), Some("neo"));
        assert_eq!(req.param("pass"), Some("zion"));
        assert_eq!(&req.body[..], body);
    }

    #[test]
    fn streamed_body_is_handed_out_in_pieces() {
        let mut ctx = HttpContext::new();
        ctx.parse(b"POST /up HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 6\r\n\r\na=");
        assert_eq!(&ctx.take_body_chunk()[..], b"a=");
        let (signal, _) = ctx.parse(b"1234");
        assert_eq!(signal, ParseSignal::Complete);
        assert_eq!(&ctx.take_body_chunk()[..], b"1234");
        assert_eq!(ctx.body_seen(), 6);
        let req = ctx.take_request();
        assert!(req.body.is_empty());
        assert!(req.params.is_empty());
    }

    #[test]
    fn header_value_whitespace_is_trimmed() {
        let (ctx, _) = parse_all(&[b"GET / HTTP/1.0\r\nX-Pad: \t spaced out  \r\n\r\n"]);
        assert_eq!(ctx.request().header("x-pad"), Some("spaced out"));
        assert_eq!(ctx.request().version, Version::Http10);
    }

    #[test]
    fn url_params_without_values() {
        let (ctx, signal) = parse_all(&[b"GET /q?flag&k=&&z=9 HTTP/1.1\r\n\r\n"]);
        assert_eq!(signal, ParseSignal::Complete);
        let req = ctx.request();
        assert_eq!(req.param("flag"), Some(""));
        assert_eq!(req.param("k"), Some(""));
        assert_eq!(req.param("z"), Some("9"));
    }

    #[test]
    fn oversized_token_is_rejected() {
        let mut ctx = HttpContext::new();
        let mut input = b"GET /".to_vec();
        input.extend(std::iter::repeat_n(b'a', MAX_TOKEN_LEN + 1));
        assert_eq!(ctx.parse(&input).0, ParseSignal::Invalid(ParseState::InvalidUrl));
    }

    #[test]
    fn too_many_headers_is_rejected() {
        let mut input = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..=MAX_HEADERS {
            input.extend_from_slice(format!("X-{i}: v\r\n").as_bytes());
        }
        let mut ctx = HttpContext::new();
        assert_eq!(ctx.parse(&input).0, ParseSignal::Invalid(ParseState::InvalidHeader));
    }
}
