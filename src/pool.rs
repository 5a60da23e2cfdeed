//! Bounded pool of equally sized byte buffers.
//!
//! Exhaustion degrades gracefully: `get` falls back to a fresh
//! allocation and `put` drops the buffer when the pool is full.

use parking_lot::Mutex;

pub struct Pool {
    size: usize,
    capacity: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl Pool {
    pub fn new(size: usize, capacity: usize) -> Self {
        let mut buffers = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            buffers.push(vec![0u8; size]);
        }
        Self {
            size,
            capacity,
            buffers: Mutex::new(buffers),
        }
    }

    /// Buffer length handed out by this pool.
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    pub fn get(&self) -> Vec<u8> {
        match self.buffers.lock().pop() {
            Some(b) => b,
            None => vec![0u8; self.size],
        }
    }

    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.size {
            return;
        }
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.capacity {
            buffers.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_buffers() {
        let pool = Pool::new(16, 1);
        let a = pool.get();
        assert_eq!(a.len(), 16);
        pool.put(a);
        assert_eq!(pool.buffers.lock().len(), 1);
    }

    #[test]
    fn allocates_when_empty_and_drops_when_full() {
        let pool = Pool::new(8, 1);
        let a = pool.get();
        let b = pool.get(); // pool exhausted, freshly allocated
        assert_eq!(b.len(), 8);
        pool.put(a);
        pool.put(b); // pool already full, dropped
        assert_eq!(pool.buffers.lock().len(), 1);
    }

    #[test]
    fn rejects_foreign_sizes() {
        let pool = Pool::new(8, 2);
        pool.get();
        pool.put(vec![0u8; 4]);
        assert_eq!(pool.buffers.lock().len(), 1);
    }
}
