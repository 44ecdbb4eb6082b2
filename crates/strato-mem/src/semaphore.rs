use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::GpuVa;

/// A semaphore cell: a fixed memory location the engine writes on command
/// completion and the CPU (or another channel) polls.
///
/// The payload is stored as 64 bits; 32-bit releases write the low half and
/// zero the high half, which matches how a 32-bit engine write into a zeroed
/// cell reads back. The timestamp slot models the optional
/// release-with-timestamp write at `gpu_va + 8`.
///
/// Writers are append-only by convention: the engine performs monotonic
/// releases and the CPU must never read-modify-write concurrently with an
/// outstanding GPU release.
#[derive(Clone, Debug)]
pub struct SemaphoreCell {
    payload: Arc<AtomicU64>,
    timestamp: Arc<AtomicU64>,
    gpu_va: GpuVa,
}

impl SemaphoreCell {
    /// `gpu_va` must be 4-aligned (the wire format carries it split into
    /// hi/lo method payloads).
    pub fn new(gpu_va: GpuVa) -> Self {
        assert_eq!(gpu_va & 3, 0, "semaphore gpu_va must be word aligned");
        Self {
            payload: Arc::new(AtomicU64::new(0)),
            timestamp: Arc::new(AtomicU64::new(0)),
            gpu_va,
        }
    }

    pub fn gpu_va(&self) -> GpuVa {
        self.gpu_va
    }

    pub fn read(&self) -> u64 {
        self.payload.load(Ordering::Acquire)
    }

    pub fn write(&self, value: u64) {
        self.payload.store(value, Ordering::Release);
    }

    pub fn write32(&self, value: u32) {
        self.payload.store(u64::from(value), Ordering::Release);
    }

    /// Atomic reduction used by `SemOp::Reduction` releases.
    pub fn fetch_update(&self, f: impl Fn(u64) -> u64) -> u64 {
        let mut cur = self.payload.load(Ordering::Acquire);
        loop {
            let next = f(cur);
            match self.payload.compare_exchange_weak(
                cur,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn read_timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    pub fn write_timestamp(&self, value: u64) {
        self.timestamp.store(value, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_then_read() {
        let sem = SemaphoreCell::new(0x4000);
        assert_eq!(sem.read(), 0);
        sem.write32(7);
        assert_eq!(sem.read(), 7);
        sem.write(u64::from(u32::MAX) + 1);
        assert_eq!(sem.read(), u64::from(u32::MAX) + 1);
    }

    #[test]
    fn reduction_applies_atomically_from_either_handle() {
        let sem = SemaphoreCell::new(0x4000);
        let other = sem.clone();
        sem.write(10);
        other.fetch_update(|v| v.max(4));
        assert_eq!(sem.read(), 10);
        other.fetch_update(|v| v + 1);
        assert_eq!(sem.read(), 11);
    }
}
