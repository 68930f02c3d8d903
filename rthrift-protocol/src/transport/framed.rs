//! Length-prefixed framing.
//!
//! ```text
//! +-------------+-------------------+
//! | length (BE) | payload           |
//! | 4 bytes     | length bytes      |
//! +-------------+-------------------+
//! ```

use super::read_frame_len;
use crate::error::TransportError;
use bytes::{BufMut, BytesMut};
use std::io::{self, Read, Write};

const LEN_PREFIX: usize = 4;

pub struct FramedTransport<S> {
    inner: S,
    max_frame_size: u32,
    /// Bytes left in the frame being read.
    read_remaining: usize,
    /// Outgoing frame; the first four bytes are reserved for the length.
    wbuf: BytesMut,
}

impl<S> FramedTransport<S> {
    pub fn new(inner: S, max_frame_size: u32) -> Self {
        let mut wbuf = BytesMut::with_capacity(crate::channel::DEFAULT_BUFFER_SIZE);
        wbuf.put_u32(0);
        Self {
            inner,
            max_frame_size,
            read_remaining: 0,
            wbuf,
        }
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Bytes of the current frame not yet read.
    pub fn read_remaining(&self) -> usize {
        self.read_remaining
    }

    pub fn reset(&mut self) {
        self.read_remaining = 0;
        self.wbuf.truncate(LEN_PREFIX);
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Read> Read for FramedTransport<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // Zero-length frames carry nothing; move on to the next one.
        while self.read_remaining == 0 {
            let Some(len) = read_frame_len(&mut self.inner)? else {
                return Ok(0);
            };
            if len > self.max_frame_size {
                return Err(TransportError::FrameTooLarge {
                    size: u64::from(len),
                    max: self.max_frame_size,
                }
                .into());
            }
            self.read_remaining = len as usize;
        }

        let want = buf.len().min(self.read_remaining);
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed inside a frame",
            ));
        }
        self.read_remaining -= n;
        Ok(n)
    }
}

impl<S: Write> Write for FramedTransport<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let size = (self.wbuf.len() - LEN_PREFIX + buf.len()) as u64;
        if size > u64::from(self.max_frame_size) {
            self.wbuf.truncate(LEN_PREFIX);
            return Err(TransportError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            }
            .into());
        }
        self.wbuf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let len = self.wbuf.len() - LEN_PREFIX;
        if len > 0 {
            self.wbuf[..LEN_PREFIX].copy_from_slice(&(len as u32).to_be_bytes());
            let result = self.inner.write_all(&self.wbuf);
            self.wbuf.truncate(LEN_PREFIX);
            result?;
        }
        self.inner.flush()
    }
}
