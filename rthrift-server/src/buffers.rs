//! Reusable per-connection channel buffers.

use parking_lot::Mutex;
use rthrift_protocol::ChannelBuffers;

/// Free-list of [`ChannelBuffers`] shared by all connections.
///
/// Buffers are cleared on return and carry no state between connections.
/// Buffers that grew past `max_capacity` are dropped instead of kept.
pub struct BufferPool {
    free: Mutex<Vec<ChannelBuffers>>,
    max_pooled: usize,
    max_capacity: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize, max_capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            max_capacity,
        }
    }

    /// Takes a pooled buffer set, or allocates a fresh one.
    pub fn get(&self) -> ChannelBuffers {
        self.free.lock().pop().unwrap_or_default()
    }

    pub fn put(&self, mut buffers: ChannelBuffers) {
        if buffers.capacity() > self.max_capacity {
            return;
        }
        buffers.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buffers);
        }
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(256, 1024 * 1024)
    }
}
