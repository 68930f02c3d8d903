//! Buffered byte channel used by the codecs.
//!
//! The channel sits between a codec and its transport. Reads are served from
//! an owned buffer that is refilled on demand, so the protocol façade can
//! peek at upcoming bytes without consuming them. Writes accumulate until
//! [`BufferedChannel::flush`] hands the whole batch to the transport, which
//! lets framing transports see one message per flush.
//!
//! While a capture is active every consumed byte is also copied into a side
//! buffer; this is how an encoded value is snapshot without re-encoding it.

use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read, Write};

/// Default size of each read/write buffer (8 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Read and write buffers that can outlive a single channel.
#[derive(Debug)]
pub struct ChannelBuffers {
    read: BytesMut,
    write: BytesMut,
}

impl ChannelBuffers {
    pub fn new() -> Self {
        Self {
            read: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            write: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
        }
    }

    /// Drops any content while keeping the allocations.
    pub fn clear(&mut self) {
        self.read.clear();
        self.write.clear();
    }

    /// Total capacity held by both buffers.
    pub fn capacity(&self) -> usize {
        self.read.capacity() + self.write.capacity()
    }
}

impl Default for ChannelBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// A byte stream with read-ahead, write batching and optional byte capture.
pub struct BufferedChannel<T> {
    inner: T,
    rbuf: BytesMut,
    wbuf: BytesMut,
    capture: Option<BytesMut>,
}

impl<T: Read + Write> BufferedChannel<T> {
    pub fn new(inner: T) -> Self {
        Self::with_buffers(inner, ChannelBuffers::new())
    }

    /// Creates a channel that reuses previously allocated buffers.
    pub fn with_buffers(inner: T, mut buffers: ChannelBuffers) -> Self {
        buffers.clear();
        Self {
            inner,
            rbuf: buffers.read,
            wbuf: buffers.write,
            capture: None,
        }
    }

    /// Splits the channel into its transport and its (cleared) buffers.
    pub fn into_parts(self) -> (T, ChannelBuffers) {
        let mut buffers = ChannelBuffers {
            read: self.rbuf,
            write: self.wbuf,
        };
        buffers.clear();
        (self.inner, buffers)
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Number of bytes read ahead but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.rbuf.len()
    }

    /// Number of bytes written but not yet flushed.
    pub fn pending_write(&self) -> usize {
        self.wbuf.len()
    }

    /// Reads from the transport until at least `n` bytes are buffered.
    ///
    /// The buffer grows by at most [`DEFAULT_BUFFER_SIZE`] per read, so a
    /// large declared length only costs memory for bytes that arrive.
    fn fill(&mut self, n: usize) -> io::Result<()> {
        while self.rbuf.len() < n {
            let start = self.rbuf.len();
            self.rbuf.resize(start + DEFAULT_BUFFER_SIZE, 0);
            match self.inner.read(&mut self.rbuf[start..]) {
                Ok(0) => {
                    self.rbuf.truncate(start);
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed by peer",
                    ));
                }
                Ok(read) => self.rbuf.truncate(start + read),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => self.rbuf.truncate(start),
                Err(e) => {
                    self.rbuf.truncate(start);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn consume(&mut self, n: usize) {
        if let Some(capture) = self.capture.as_mut() {
            capture.extend_from_slice(&self.rbuf[..n]);
        }
        self.rbuf.advance(n);
    }

    /// Returns the next `n` bytes without consuming them.
    pub fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        self.fill(n)?;
        Ok(&self.rbuf[..n])
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let n = buf.len();
        self.fill(n)?;
        buf.copy_from_slice(&self.rbuf[..n]);
        self.consume(n);
        Ok(())
    }

    pub fn read_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut out = [0u8; N];
        self.read_exact(&mut out)?;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        self.fill(1)?;
        let byte = self.rbuf[0];
        self.consume(1);
        Ok(byte)
    }

    /// Reads `n` bytes as a shared slice of the read buffer.
    pub fn read_bytes(&mut self, n: usize) -> io::Result<Bytes> {
        self.fill(n)?;
        let bytes = self.rbuf.split_to(n).freeze();
        if let Some(capture) = self.capture.as_mut() {
            capture.extend_from_slice(&bytes);
        }
        Ok(bytes)
    }

    pub fn write_all(&mut self, data: &[u8]) {
        self.wbuf.extend_from_slice(data);
    }

    pub fn write_u8(&mut self, byte: u8) {
        self.wbuf.extend_from_slice(&[byte]);
    }

    /// Hands buffered writes to the transport and flushes it.
    pub fn flush(&mut self) -> io::Result<()> {
        if !self.wbuf.is_empty() {
            let result = self.inner.write_all(&self.wbuf);
            self.wbuf.clear();
            result?;
        }
        self.inner.flush()
    }

    /// Drops any unflushed output.
    pub fn discard_write(&mut self) {
        self.wbuf.clear();
    }

    pub fn start_capture(&mut self) {
        self.capture = Some(BytesMut::new());
    }

    /// Stops capturing and returns every byte consumed since `start_capture`.
    pub fn stop_capture(&mut self) -> Bytes {
        self.capture.take().map(BytesMut::freeze).unwrap_or_default()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }
}

/// In-memory duplex stream: reads drain `input`, writes append to `output`.
#[derive(Debug, Default, Clone)]
pub struct MemoryStream {
    input: Vec<u8>,
    pos: usize,
    output: Vec<u8>,
    read_chunk: Option<usize>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(input: impl Into<Vec<u8>>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    /// Limits every `read` call to at most `chunk` bytes.
    pub fn with_read_chunk(mut self, chunk: usize) -> Self {
        self.read_chunk = Some(chunk.max(1));
        self
    }

    pub fn push_input(&mut self, data: &[u8]) {
        self.input.extend_from_slice(data);
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    /// Number of input bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    /// Moves everything written so far to the read side.
    pub fn loopback(&mut self) {
        let output = std::mem::take(&mut self.output);
        self.input.extend_from_slice(&output);
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut n = buf.len().min(self.remaining());
        if let Some(chunk) = self.read_chunk {
            n = n.min(chunk);
        }
        buf[..n].copy_from_slice(&self.input[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
