//! Rolling read-ahead buffer over a single file handle (spec.md §4.3).
//!
//! A [`Prefetcher`] is bound to one scanning thread/task at a time; it is not
//! `Sync` across concurrent scans of the same ledger.

use std::io;

use crate::ledger::fs::PositionedFile;

/// Default read-ahead size, used whenever a caller asks for fewer bytes than
/// this (spec.md §11: `PREFETCH_BYTES = 64 * 1024`).
pub const PREFETCH_BYTES: usize = 64 * 1024;

struct Chunk {
    start: u64,
    bytes: Vec<u8>,
}

impl Chunk {
    fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }

    fn covers(&self, offset: u64, len: usize) -> bool {
        offset >= self.start && offset + len as u64 <= self.end()
    }

    fn slice(&self, offset: u64, len: usize) -> Vec<u8> {
        let start = (offset - self.start) as usize;
        self.bytes[start..start + len].to_vec()
    }
}

/// Reads `(offset, len)` ranges from a file, satisfying requests from a
/// single contiguous in-memory chunk when possible.
pub struct Prefetcher {
    chunk: Option<Chunk>,
    prefetch_bytes: usize,
}

impl Prefetcher {
    pub fn new(prefetch_bytes: usize) -> Self {
        Prefetcher {
            chunk: None,
            prefetch_bytes,
        }
    }

    /// Reads `len` bytes starting at `offset` from `file`, returning a fresh
    /// owned copy independent of the internal chunk.
    ///
    /// On a miss (the requested range isn't fully inside the current chunk),
    /// issues a single read of `max(len, prefetch_bytes)` bytes at `offset`,
    /// replacing the chunk. A short read (EOF before `len` bytes are
    /// available) is surfaced as an `UnexpectedEof` I/O error.
    pub async fn read<F: PositionedFile>(
        &mut self,
        file: &mut F,
        offset: u64,
        len: usize,
    ) -> io::Result<Vec<u8>> {
        if let Some(chunk) = &self.chunk {
            if chunk.covers(offset, len) {
                return Ok(chunk.slice(offset, len));
            }
        }

        let want = len.max(self.prefetch_bytes);
        let mut buf = vec![0u8; want];
        let n = file.read_at(offset, &mut buf).await?;
        buf.truncate(n);

        if buf.len() < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "prefetch read fewer bytes than requested",
            ));
        }

        let result = buf[..len].to_vec();
        self.chunk = Some(Chunk {
            start: offset,
            bytes: buf,
        });
        Ok(result)
    }

    /// Drops the current chunk, forcing the next read to hit the file.
    pub fn clear(&mut self) {
        self.chunk = None;
    }
}
