//! Object pools
//!
//! Bounded pools of reusable slices for hot per-query allocations:
//! operator lists and channel lists. `get` returns an empty slice with
//! reserved capacity, `put` clears it before recycling. Reuse is an
//! optimization only; correctness never depends on it.

use std::sync::Mutex;

use super::{ItemSender, Operator};

/// How many recycled buffers a pool retains.
const POOL_RETAIN: usize = 64;

/// Generic bounded slice pool.
pub struct SlicePool<T> {
    cap: usize,
    buffers: Mutex<Vec<Vec<T>>>,
}

impl<T> SlicePool<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buffers: Mutex::new(Vec::new()),
        }
    }

    /// An empty buffer with at least `cap` reserved slots.
    pub fn get(&self) -> Vec<T> {
        if let Ok(mut buffers) = self.buffers.lock() {
            if let Some(buf) = buffers.pop() {
                debug_assert!(buf.is_empty());
                return buf;
            }
        }
        Vec::with_capacity(self.cap)
    }

    /// Recycle a buffer. Length is reset; capacity is retained.
    pub fn put(&self, mut buf: Vec<T>) {
        buf.clear();
        if let Ok(mut buffers) = self.buffers.lock() {
            debug_assert!(
                !buffers.iter().any(|b| b.as_ptr() == buf.as_ptr() && b.capacity() > 0),
                "buffer returned to pool twice"
            );
            if buffers.len() < POOL_RETAIN {
                buffers.push(buf);
            }
        }
    }

    pub fn slice_cap(&self) -> usize {
        self.cap
    }
}

/// Pool of operator slices.
pub type OperatorPool = SlicePool<Box<dyn Operator>>;

/// Pool of channel-sender slices.
pub type ChannelPool = SlicePool<ItemSender>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_empty_with_capacity() {
        let pool: SlicePool<u32> = SlicePool::new(3);
        let buf = pool.get();
        assert_eq!(buf.len(), 0);
        assert!(buf.capacity() >= 3);
    }

    #[test]
    fn test_put_resets_length() {
        let pool: SlicePool<u32> = SlicePool::new(3);
        let mut buf = pool.get();
        buf.extend([1, 2, 3]);
        pool.put(buf);
        let buf = pool.get();
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_reuse_returns_recycled_buffer() {
        let pool: SlicePool<u32> = SlicePool::new(8);
        let mut buf = pool.get();
        buf.push(7);
        let ptr = buf.as_ptr();
        pool.put(buf);
        let buf = pool.get();
        assert_eq!(buf.as_ptr(), ptr);
    }

    #[test]
    fn test_concurrent_use() {
        use std::sync::Arc;
        let pool: Arc<SlicePool<u64>> = Arc::new(SlicePool::new(4));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let mut buf = pool.get();
                    assert_eq!(buf.len(), 0);
                    buf.push(i);
                    pool.put(buf);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
