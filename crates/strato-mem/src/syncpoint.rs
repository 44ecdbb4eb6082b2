use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Hardware syncpoint counters (CheetAh-class engines).
///
/// Syncpoints are id-addressed monotonic `u32` counters, a parallel
/// primitive to memory semaphores: the engine increments, waiters compare
/// against a threshold with wraparound-safe ordering.
#[derive(Clone, Debug)]
pub struct SyncpointTable {
    counters: Arc<[AtomicU32]>,
}

impl SyncpointTable {
    pub fn new(count: usize) -> Self {
        assert!(count > 0);
        let counters: Arc<[AtomicU32]> = (0..count).map(|_| AtomicU32::new(0)).collect();
        Self { counters }
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn read(&self, id: u32) -> u32 {
        self.counters[id as usize].load(Ordering::Acquire)
    }

    /// Engine-side increment; returns the post-increment value.
    pub fn increment(&self, id: u32) -> u32 {
        self.counters[id as usize]
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1)
    }

    /// Whether the counter has reached `threshold`, tolerant of wraparound:
    /// a counter is "at" a threshold once `counter - threshold` is small in
    /// wrapping arithmetic.
    pub fn reached(&self, id: u32, threshold: u32) -> bool {
        self.read(id).wrapping_sub(threshold) < 0x8000_0000
    }
}
