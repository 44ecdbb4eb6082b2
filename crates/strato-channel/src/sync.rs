//! Semaphore and syncpoint command emission.
//!
//! The five semaphore methods are contiguous, so every operation goes out as
//! a single incrementing command: address hi/lo, payload lo/hi, execute.
//! Payload width and awaken behavior are generation-gated; violations are
//! caught here, before anything reaches the ring.

use bitflags::bitflags;

use strato_mem::SemaphoreCell;
use strato_protocol::{
    ReductionOp, SemExecute, SemOp, SyncptExecute, SyncptOp, SEM_ADDR_HI, SYNCPT_PAYLOAD,
};

use crate::channel::Channel;
use crate::error::ChannelError;

bitflags! {
    /// Options for a semaphore release.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ReleaseFlags: u32 {
        /// Raise a non-blocking completion notification. Attribution across
        /// channels sharing one notification path is unspecified; poll the
        /// semaphore when strict ordering matters.
        const AWAKEN = 1 << 0;
        /// Drain the engine before writing the payload.
        const WFI = 1 << 1;
        /// Also write an engine timestamp at `gpu_va + 8`.
        const TIMESTAMP = 1 << 2;
        /// Force a 64-bit payload write even for small values.
        const PAYLOAD64 = 1 << 3;
    }
}

impl Channel {
    /// Stall the engine on this channel until the semaphore equals `value`.
    pub fn semaphore_acquire(
        &mut self,
        sem: &SemaphoreCell,
        value: u64,
    ) -> Result<(), ChannelError> {
        self.sem_op(sem, value, SemExecute::acquire())
    }

    /// Stall until the semaphore is at or past `value` (monotonic form).
    pub fn semaphore_acquire_geq(
        &mut self,
        sem: &SemaphoreCell,
        value: u64,
    ) -> Result<(), ChannelError> {
        let mut exec = SemExecute::acquire();
        exec.op = SemOp::AcquireGeq;
        self.sem_op(sem, value, exec)
    }

    /// Write `value` to the semaphore when all prior work completes.
    pub fn semaphore_release(
        &mut self,
        sem: &SemaphoreCell,
        value: u64,
        flags: ReleaseFlags,
    ) -> Result<(), ChannelError> {
        let mut exec = SemExecute::release(flags.contains(ReleaseFlags::AWAKEN));
        exec.release_wfi = flags.contains(ReleaseFlags::WFI);
        exec.release_timestamp = flags.contains(ReleaseFlags::TIMESTAMP);
        exec.payload64 = flags.contains(ReleaseFlags::PAYLOAD64);
        self.sem_op(sem, value, exec)
    }

    /// Atomic read-modify-write of the semaphore on completion.
    pub fn semaphore_reduction(
        &mut self,
        sem: &SemaphoreCell,
        op: ReductionOp,
        value: u64,
        flags: ReleaseFlags,
    ) -> Result<(), ChannelError> {
        let exec = SemExecute {
            op: SemOp::Reduction,
            awaken: flags.contains(ReleaseFlags::AWAKEN),
            release_wfi: flags.contains(ReleaseFlags::WFI),
            release_timestamp: flags.contains(ReleaseFlags::TIMESTAMP),
            payload64: flags.contains(ReleaseFlags::PAYLOAD64),
            reduction: Some(op),
        };
        self.sem_op(sem, value, exec)
    }

    fn sem_op(
        &mut self,
        sem: &SemaphoreCell,
        value: u64,
        mut exec: SemExecute,
    ) -> Result<(), ChannelError> {
        if value > u64::from(u32::MAX) {
            exec.payload64 = true;
        }
        if exec.payload64 && !self.caps().sem64 {
            return Err(ChannelError::Unsupported {
                what: "64-bit semaphore payload",
                generation: self.generation(),
            });
        }
        let va = sem.gpu_va();
        self.write(
            0,
            u32::from(SEM_ADDR_HI),
            &[
                (va >> 32) as u32,
                va as u32,
                value as u32,
                (value >> 32) as u32,
                exec.encode(),
            ],
        )
    }

    /// Increment a hardware syncpoint counter when prior work completes.
    pub fn syncpoint_increment(&mut self, id: u32) -> Result<(), ChannelError> {
        self.syncpt_op(SyncptOp::Increment, id, 0)
    }

    /// Stall the engine until syncpoint `id` reaches `threshold`.
    pub fn syncpoint_wait(&mut self, id: u32, threshold: u32) -> Result<(), ChannelError> {
        self.syncpt_op(SyncptOp::Wait, id, threshold)
    }

    fn syncpt_op(&mut self, op: SyncptOp, id: u32, threshold: u32) -> Result<(), ChannelError> {
        if !self.caps().syncpoints {
            return Err(ChannelError::Unsupported {
                what: "syncpoint counters",
                generation: self.generation(),
            });
        }
        if id > SyncptExecute::MAX_ID {
            return Err(ChannelError::Misuse("syncpoint id out of range"));
        }
        let exec = SyncptExecute { op, id };
        self.write(0, u32::from(SYNCPT_PAYLOAD), &[threshold, exec.encode()])
    }
}
