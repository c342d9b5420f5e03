use std::sync::Mutex;

/// Thread-safe pool of page-sized receive buffers.
///
/// Buffers are lazily allocated on pool miss and handed back when the
/// `Event` that borrowed one is dropped. There is no upper bound on the
/// free list; in-flight memory is bounded by the output channel capacity
/// plus the one buffer currently being filled.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buffer_size: page_size(),
        }
    }

    /// Size of the buffers handed out by this pool, in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Pop a free buffer, or allocate a fresh zeroed one on miss.
    pub fn get(&self) -> Vec<u8> {
        let reused = self.free.lock().unwrap().pop();
        reused.unwrap_or_else(|| vec![0u8; self.buffer_size])
    }

    /// Return a buffer to the free list.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.buffer_size {
            // Foreign buffer; dropping it is cheaper than resizing.
            return;
        }
        self.free.lock().unwrap().push(buf);
    }

    /// Number of buffers currently sitting on the free list.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 { sz as usize } else { 4096 }
}
