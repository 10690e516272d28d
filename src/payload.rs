use std::io::{self, Read};
use std::sync::OnceLock;

use bytes::{Buf, Bytes};
use rand::RngCore;

/// Size of the shared random pool, the largest prime below 1 MiB.
pub const POOL_SIZE: usize = 1_048_573;

static POOL: OnceLock<Bytes> = OnceLock::new();

/// Process-wide random pool, filled on first use and read-only afterwards.
pub fn pool() -> &'static Bytes {
    POOL.get_or_init(|| {
        let mut buf = vec![0u8; POOL_SIZE];
        rand::rng().fill_bytes(&mut buf);
        Bytes::from(buf)
    })
}

/// Lazy sequence of chunks totaling exactly `len` bytes.
///
/// Yields the whole pool while at least a pool's worth remains, then a
/// prefix for the remainder. Chunks are cheap slices of the pool. To
/// replay the same bytes, build a new `Payload` with the same length.
#[derive(Clone, Debug)]
pub struct Payload {
    pool: Bytes,
    remaining: u64,
}

impl Payload {
    pub fn new(len: u64) -> Self {
        Self::with_pool(len, pool().clone())
    }

    pub fn with_pool(len: u64, pool: Bytes) -> Self {
        // An empty pool can only ever produce an empty payload.
        let remaining = if pool.is_empty() { 0 } else { len };
        Self { pool, remaining }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn into_reader(self) -> PayloadReader {
        PayloadReader {
            payload: self,
            current: Bytes::new(),
        }
    }
}

impl Iterator for Payload {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.remaining == 0 {
            return None;
        }
        let pool_len = self.pool.len() as u64;
        let chunk = if self.remaining >= pool_len {
            self.pool.clone()
        } else {
            self.pool.slice(..self.remaining as usize)
        };
        self.remaining -= chunk.len() as u64;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let pool_len = self.pool.len().max(1) as u64;
        let chunks = self.remaining.div_ceil(pool_len);
        let chunks = usize::try_from(chunks).unwrap_or(usize::MAX);
        (chunks, Some(chunks))
    }
}

/// `Read` adapter over a [`Payload`], for sized request and response bodies.
#[derive(Debug)]
pub struct PayloadReader {
    payload: Payload,
    current: Bytes,
}

impl Read for PayloadReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.current.has_remaining() {
            match self.payload.next() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        self.current.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }
}
