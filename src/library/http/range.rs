use thiserror::Error;

/// An inclusive byte range inside a resource of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for the `Content-Range` header of a 206.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("requested range not satisfiable")]
pub struct RangeNotSatisfiable;

/// Value for the `Content-Range` header of a 416.
pub fn unsatisfied_range(total: u64) -> String {
    format!("bytes */{total}")
}

/// Reads a single `bytes=S-E` or `bytes=S-` range.
///
/// Forms this server does not serve partially (suffix ranges, multiple
/// ranges, garbage) come back as `Ok(None)` and get the whole resource.
pub fn parse_range(header: &str, total: u64) -> Result<Option<ByteRange>, RangeNotSatisfiable> {
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Ok(None);
    }
    let Some((start, end)) = spec.split_once('-') else {
        return Ok(None);
    };
    let Ok(start) = start.trim().parse::<u64>() else {
        return Ok(None);
    };
    let end = match end.trim() {
        "" => None,
        text => match text.parse::<u64>() {
            Ok(end) => Some(end),
            Err(_) => return Ok(None),
        },
    };
    if start >= total {
        return Err(RangeNotSatisfiable);
    }
    let last = total - 1;
    let end = end.map_or(last, |end| end.min(last));
    if end < start {
        return Ok(None);
    }
    Ok(Some(ByteRange { start, end }))
}
