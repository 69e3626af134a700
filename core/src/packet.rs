use std::fmt;
use std::sync::{Arc, Mutex};

/// Bounded arena of fixed-size buffers reused by chunk tasks.
#[derive(Debug)]
pub struct PacketPool {
    block_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Vec<u8>>>,
}

impl PacketPool {
    pub fn new(block_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            block_size: block_size.max(1),
            max_idle,
            idle: Mutex::new(Vec::new()),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn idle_buffers(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Copies up to one block of `src` into a pooled buffer. The caller
    /// advances through `src` by the returned packet's length.
    pub fn checkout(self: &Arc<Self>, position: u64, src: &[u8]) -> Packet {
        let mut data = self
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop())
            .unwrap_or_else(|| vec![0u8; self.block_size]);
        let length = src.len().min(self.block_size);
        data[..length].copy_from_slice(&src[..length]);
        Packet {
            position,
            data,
            length,
            pool: Some(Arc::clone(self)),
        }
    }

    fn give_back(&self, data: Vec<u8>) {
        if data.len() != self.block_size {
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_idle {
                idle.push(data);
            }
        }
    }
}

/// A buffer unit moving bytes from a network read to a storage write.
///
/// Ownership makes reuse after disposal impossible: `dispose` consumes the
/// packet and hands its buffer back to the pool.
pub struct Packet {
    position: u64,
    data: Vec<u8>,
    length: usize,
    pool: Option<Arc<PacketPool>>,
}

impl Packet {
    pub fn new(position: u64, data: Vec<u8>, length: usize) -> Self {
        let length = length.min(data.len());
        Self {
            position,
            data,
            length,
            pool: None,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn end_offset(&self) -> u64 {
        self.position + self.length as u64
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The valid bytes of the packet.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.length]
    }

    /// The whole backing buffer, including bytes past `len()`.
    pub fn buffer(&self) -> &[u8] {
        &self.data
    }

    /// Drops the bytes past `length`, used when a server sends more than the
    /// requested range.
    pub fn truncate(&mut self, length: usize) {
        self.length = self.length.min(length);
    }

    pub fn dispose(self) {}
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.give_back(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("position", &self.position)
            .field("length", &self.length)
            .field("capacity", &self.data.len())
            .finish()
    }
}
