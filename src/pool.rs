//! A tiny size-bucketed buffer pool.
//!
//! Per-rectangle scratch buffers (decoder intermediate storage, AES-EAX
//! ciphertext/plaintext) are churned at a high rate on a busy connection;
//! allocating and freeing a fresh `Vec<u8>` for every tile would put real
//! pressure on the allocator. Buffers are bucketed by their requested
//! size rounded up to the next power of two so that a pool entry can be
//! reused for any request that fits in it.

use std::sync::{Arc, Mutex};

struct Bucket {
    size: usize,
    free: Vec<Vec<u8>>,
}

/// A buffer checked out from a [`BufferPool`]. Returns its backing
/// storage to the pool on drop instead of freeing it.
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    bucket: usize,
    data: Vec<u8>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        &self.data
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut data = std::mem::take(&mut self.data);
        data.clear();
        let mut buckets = self.pool.buckets.lock().unwrap();
        if let Some(bucket) = buckets.iter_mut().find(|b| b.size == self.bucket) {
            if bucket.free.len() < self.pool.max_free_per_bucket {
                bucket.free.push(data);
            }
        }
    }
}

/// Size-bucketed pool of reusable `Vec<u8>` scratch buffers.
pub struct BufferPool {
    buckets: Mutex<Vec<Bucket>>,
    max_free_per_bucket: usize,
}

impl BufferPool {
    pub fn new() -> BufferPool {
        BufferPool {
            buckets: Mutex::new(Vec::new()),
            max_free_per_bucket: 8,
        }
    }

    fn bucket_size(requested: usize) -> usize {
        requested.next_power_of_two().max(64)
    }

    /// Checks out a buffer with at least `len` bytes of capacity, zeroed
    /// up to `len`. The returned buffer is returned to the pool on drop.
    pub fn take(self: &Arc<Self>, len: usize) -> PooledBuffer {
        let bucket_size = Self::bucket_size(len);
        let mut data = {
            let mut buckets = self.buckets.lock().unwrap();
            let bucket = match buckets.iter_mut().find(|b| b.size == bucket_size) {
                Some(b) => b,
                None => {
                    buckets.push(Bucket { size: bucket_size, free: Vec::new() });
                    buckets.last_mut().unwrap()
                }
            };
            bucket.free.pop().unwrap_or_default()
        };
        data.resize(len, 0);
        PooledBuffer {
            pool: self.clone(),
            bucket: bucket_size,
            data,
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn checked_out_buffer_has_requested_length() {
        let pool = Arc::new(BufferPool::new());
        let buf = pool.take(100);
        assert_eq!(buf.len(), 100);
    }

    #[test]
    fn buffer_is_reused_after_drop() {
        let pool = Arc::new(BufferPool::new());
        {
            let mut buf = pool.take(4096);
            buf[0] = 0xAB;
        }
        let buf = pool.take(4096);
        // Reused storage is cleared before handing it back out.
        assert_eq!(buf.len(), 4096);
        assert!(buf.iter().all(|&b| b == 0));
    }
}
