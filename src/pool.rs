//! Size-classed byte buffer pool.
//!
//! Tiers double in size from `min` up to and including `max`; each tier is
//! an independent free list. `get` rounds a request *up* to the next tier so
//! callers are never under-provisioned, while `put` rounds a capacity *down*
//! so an oversized buffer can never poison a smaller tier. Buffers outside
//! `[min, max]` bypass the pool entirely.

use parking_lot::Mutex;

/// A pooled free list of buffers that all share one capacity.
struct Tier {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl Tier {
    fn new(size: usize) -> Self {
        Self {
            size,
            free: Mutex::new(Vec::new()),
        }
    }

    fn take(&self, len: usize) -> Vec<u8> {
        let mut buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.size));
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    fn give(&self, buf: Vec<u8>) {
        self.free.lock().push(buf);
    }
}

/// Pool of byte buffers in power-of-two size classes.
pub struct BufferPool {
    min_size: usize,
    max_size: usize,
    tiers: Vec<Tier>,
}

impl BufferPool {
    /// Build a pool with tiers at `min, 2*min, 4*min, …` plus a final tier
    /// of exactly `max`.
    ///
    /// # Panics
    ///
    /// Panics if `max < min` or `min == 0`.
    pub fn new(min_size: usize, max_size: usize) -> Self {
        assert!(min_size > 0, "pool min size must be non-zero");
        assert!(max_size >= min_size, "pool max size must be >= min size");

        let mut tiers = Vec::new();
        let mut cur = min_size;
        while cur < max_size {
            tiers.push(Tier::new(cur));
            cur *= 2;
        }
        tiers.push(Tier::new(max_size));

        Self {
            min_size,
            max_size,
            tiers,
        }
    }

    /// Tier index for an allocation of `n` bytes: the smallest tier whose
    /// size is >= n (ceiling log2 of n/min).
    fn get_index(&self, n: usize) -> Option<usize> {
        if n > self.max_size {
            return None;
        }
        let ratio = (n + self.min_size - 1) / self.min_size;
        let idx = ratio.next_power_of_two().trailing_zeros() as usize;
        if idx >= self.tiers.len() {
            // Between the last doubled tier and the exact-max tier.
            return Some(self.tiers.len() - 1);
        }
        Some(idx)
    }

    /// Tier index for returning a buffer of capacity `cap`: the largest
    /// tier whose size is <= cap (floor log2 of cap/min).
    fn put_index(&self, cap: usize) -> Option<usize> {
        if cap > self.max_size || cap < self.min_size {
            return None;
        }
        let idx = (cap / self.min_size).ilog2() as usize;
        Some(idx.min(self.tiers.len() - 1))
    }

    /// Fetch a buffer with `len() == n`.
    ///
    /// Requests beyond the largest tier fall back to a fresh allocation of
    /// exactly `n` bytes; such buffers are discarded again on [`put`].
    ///
    /// [`put`]: BufferPool::put
    pub fn get(&self, n: usize) -> Vec<u8> {
        match self.get_index(n) {
            Some(idx) => self.tiers[idx].take(n),
            None => vec![0; n],
        }
    }

    /// Return a buffer to the tier matching its capacity; buffers outside
    /// the pool bounds are dropped. Call at most once per [`get`].
    ///
    /// [`get`]: BufferPool::get
    pub fn put(&self, buf: Vec<u8>) {
        if let Some(idx) = self.put_index(buf.capacity()) {
            self.tiers[idx].give(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn get_sizes_exactly() {
        let pool = BufferPool::new(512, 512 * 1024);
        for n in [0, 1, 511, 512, 513, 1024, 4096, 512 * 1024] {
            let buf = pool.get(n);
            assert_eq!(buf.len(), n);
            assert!(buf.capacity() >= n);
            pool.put(buf);
        }
    }

    #[test]
    fn get_rounds_up_to_the_next_tier() {
        let pool = BufferPool::new(4, 64);
        assert_eq!(pool.get(1).capacity(), 4);
        assert_eq!(pool.get(4).capacity(), 4);
        assert_eq!(pool.get(5).capacity(), 8);
        assert_eq!(pool.get(12).capacity(), 16);
        assert_eq!(pool.get(64).capacity(), 64);
    }

    #[test]
    fn oversized_requests_bypass_the_pool() {
        let pool = BufferPool::new(4, 64);
        let buf = pool.get(65);
        assert_eq!(buf.len(), 65);
        // Returning it is a discard, not a poison of the 64-byte tier.
        pool.put(buf);
        assert_eq!(pool.get(64).capacity(), 64);
    }

    #[test]
    fn put_rounds_down() {
        let pool = BufferPool::new(4, 64);
        // A 12-capacity buffer must land in the 8-byte tier, never the
        // 16-byte tier where it would under-provision a later get.
        pool.put(Vec::with_capacity(12));
        assert_eq!(pool.put_index(12), Some(1));
        // Below-minimum capacities are dropped.
        assert_eq!(pool.put_index(3), None);
    }

    #[test]
    fn reused_buffers_do_not_alias() {
        let pool = BufferPool::new(4, 64);
        let mut a = pool.get(8);
        a.copy_from_slice(b"aaaaaaaa");
        let mut b = pool.get(8);
        b.copy_from_slice(b"bbbbbbbb");
        pool.put(b);
        assert_eq!(a, b"aaaaaaaa");
        let c = pool.get(8);
        assert_eq!(c.len(), 8);
        assert_eq!(a, b"aaaaaaaa");
    }

    #[test]
    fn random_sizes_hold_the_length_invariant() {
        let pool = BufferPool::new(16, 4096);
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let n = rng.gen_range(0..=8192);
            let buf = pool.get(n);
            assert_eq!(buf.len(), n);
            assert!(buf.capacity() >= n);
            pool.put(buf);
        }
    }

    #[test]
    #[should_panic(expected = "max size must be >= min size")]
    fn max_below_min_panics() {
        let _ = BufferPool::new(64, 4);
    }
}
