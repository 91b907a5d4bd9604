use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
};

// Size of the splicing and parse buffers.
pub(crate) const BUFFER_SIZE: usize = 32 * 1024;

// How many idle buffers the pool retains before freeing returns.
const MAX_POOLED: usize = 64;

// Process-wide pool of fixed-size byte buffers. Splicing tasks and HTTP
// processors check buffers out and the guard returns them on drop, so every
// exit path (including panics unwinding through a task) gives the buffer
// back.
#[derive(Default)]
pub(crate) struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .buffers
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE]);
        PooledBuffer {
            buf: Some(buf),
            pool: Some(Arc::clone(self)),
        }
    }
}

// A checked-out buffer. Dereferences to `Vec<u8>`; the HTTP processor may
// grow it past `BUFFER_SIZE` during in-place rewrites, so it is restored to
// its pooled shape on return.
pub(crate) struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Option<Arc<BufferPool>>,
}

impl PooledBuffer {
    // A buffer that belongs to no pool. Used by tests exercising the HTTP
    // processor with odd buffer sizes.
    #[cfg(test)]
    pub(crate) fn unpooled(size: usize) -> Self {
        PooledBuffer {
            buf: Some(vec![0u8; size]),
            pool: None,
        }
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        self.buf.as_ref().unwrap()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().unwrap()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let (Some(mut buf), Some(pool)) = (self.buf.take(), self.pool.take()) else {
            return;
        };
        buf.clear();
        buf.resize(BUFFER_SIZE, 0);
        let mut buffers = pool.buffers.lock().unwrap();
        if buffers.len() < MAX_POOLED {
            buffers.push(buf);
        }
    }
}
