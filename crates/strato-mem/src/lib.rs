//! Shared memory primitives for the command-submission channel.
//!
//! Everything here is visible to both the CPU producer and the engine
//! consumer: the pushbuffer and GPFIFO backing stores, semaphore cells and
//! the syncpoint counter table. The consumer never mutates ring contents; it
//! only reads them and advances its own cursors, so plain release/acquire
//! pairs on word-sized atomics are sufficient.

#![forbid(unsafe_code)]

mod dma;
mod semaphore;
mod syncpoint;

pub use dma::{DmaBuf, GpuVa};
pub use semaphore::SemaphoreCell;
pub use syncpoint::SyncpointTable;
