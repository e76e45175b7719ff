use crate::library::utils::http::find_crlf;
use bytes::Bytes;
use std::io::{self, Read};

/// Room reserved in front of the readable region so a length or header can be
/// prepended without shuffling the payload.
pub const CHEAP_PREPEND: usize = 8;
pub const INITIAL_SIZE: usize = 4096;
/// Minimum free space offered to a single `read` call.
const READ_RESERVE: usize = 16 * 1024;

/// Growable byte queue.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0      <=      read_cursor   <=   write_cursor    <=    len
/// ```
#[derive(Debug, Clone)]
pub struct Buffer {
    storage: Vec<u8>,
    read_cursor: usize,
    write_cursor: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; CHEAP_PREPEND + capacity],
            read_cursor: CHEAP_PREPEND,
            write_cursor: CHEAP_PREPEND,
        }
    }

    #[inline(always)]
    pub fn readable_bytes(&self) -> usize {
        self.write_cursor - self.read_cursor
    }

    #[inline(always)]
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_cursor
    }

    #[inline(always)]
    pub fn prependable_bytes(&self) -> usize {
        self.read_cursor
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// The readable region, without consuming it.
    #[inline(always)]
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_cursor..self.write_cursor]
    }

    pub fn find_crlf(&self) -> Option<usize> {
        find_crlf(self.peek())
    }

    /// Consumes `len` bytes. Asking for more than is readable drains the buffer.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.read_cursor += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_cursor = CHEAP_PREPEND;
        self.write_cursor = CHEAP_PREPEND;
    }

    pub fn retrieve_as_bytes(&mut self, len: usize) -> Bytes {
        let len = len.min(self.readable_bytes());
        let out = Bytes::copy_from_slice(&self.peek()[..len]);
        self.retrieve(len);
        out
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Bytes {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let len = len.min(self.readable_bytes());
        let out = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        out
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.write_cursor..self.write_cursor + data.len()].copy_from_slice(data);
        self.write_cursor += data.len();
    }

    /// Writes `data` right in front of the readable region.
    ///
    /// # Panics
    /// If `data` is longer than `prependable_bytes()`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.prependable_bytes(),
            "prepend of {} bytes into {} bytes of headroom",
            data.len(),
            self.prependable_bytes()
        );
        self.read_cursor -= data.len();
        self.storage[self.read_cursor..self.read_cursor + data.len()].copy_from_slice(data);
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Free tail space, valid until the next mutation.
    pub fn begin_write(&mut self) -> &mut [u8] {
        &mut self.storage[self.write_cursor..]
    }

    /// Commits `len` bytes written through `begin_write`.
    pub fn has_written(&mut self, len: usize) {
        debug_assert!(len <= self.writable_bytes());
        self.write_cursor = (self.write_cursor + len).min(self.storage.len());
    }

    /// Releases spare capacity, keeping `reserve` writable bytes.
    pub fn shrink(&mut self, reserve: usize) {
        let readable = self.readable_bytes();
        let mut fresh = Vec::with_capacity(CHEAP_PREPEND + readable + reserve);
        fresh.resize(CHEAP_PREPEND, 0);
        fresh.extend_from_slice(self.peek());
        fresh.resize(CHEAP_PREPEND + readable + reserve, 0);
        self.storage = fresh;
        self.read_cursor = CHEAP_PREPEND;
        self.write_cursor = CHEAP_PREPEND + readable;
    }

    /// Reads once from `reader` into the writable region.
    pub fn read_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        self.ensure_writable(READ_RESERVE);
        let n = reader.read(self.begin_write())?;
        self.has_written(n);
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            // Not enough slack even after compaction: grow
            self.storage.resize(self.write_cursor + len, 0);
        } else {
            // Slide the readable bytes back to the front
            let readable = self.readable_bytes();
            self.storage
                .copy_within(self.read_cursor..self.write_cursor, CHEAP_PREPEND);
            self.read_cursor = CHEAP_PREPEND;
            self.write_cursor = CHEAP_PREPEND + readable;
        }
    }
}
