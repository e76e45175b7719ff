use memchr::memmem::Finder;
use std::collections::BTreeMap;

thread_local! {
    // HTTP can't commit to one newline like a normal protocol, so we hunt for both bytes.
    static CRLF: Finder<'static> = Finder::new(b"\r\n");
}

/// Offset of the first `\r\n` in `buffer`, if any.
#[inline(always)]
pub fn find_crlf(buffer: &[u8]) -> Option<usize> {
    CRLF.with(|f| f.find(buffer))
}

/// Splits an `application/x-www-form-urlencoded` body into `out`.
///
/// Values are taken verbatim (no percent decoding). Pairs without `=` are
/// skipped, later keys overwrite earlier ones.
pub fn parse_urlencoded(mut body: &[u8], out: &mut BTreeMap<String, String>) {
    while !body.is_empty() {
        let end: usize = memchr::memchr(b'&', body).unwrap_or(body.len());
        let pair: &[u8] = &body[..end];
        if let Some(eq) = memchr::memchr(b'=', pair) {
            out.insert(
                String::from_utf8_lossy(&pair[..eq]).into_owned(),
                String::from_utf8_lossy(&pair[eq + 1..]).into_owned(),
            );
        }
        body = body.get(end + 1..).unwrap_or(&[]);
    }
}
