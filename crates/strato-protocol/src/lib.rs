//! Strato wire formats.
//!
//! This crate intentionally stays dependency-free: it defines the exact bit
//! layouts shared between the CPU producer and the engine consumer — method
//! header words, GPFIFO entries (including side-band control entries), the
//! channel-method map for semaphore/syncpoint operations, and the
//! per-generation capability table.
//!
//! Layouts are fixed per hardware generation and only ever grow along the
//! generation chain; see `class.rs`.

#![forbid(unsafe_code)]

mod class;
mod entry;
mod method;
mod sem;

pub use class::{ClassError, GenCaps, Generation};
pub use entry::{ControlOpcode, EntryDecodeError, EntryEncodeError, GpEntry, RawEntry};
pub use method::{MethodDecodeError, MethodEncodeError, MethodHeader, MethodMode, PAD_WORD};
pub use sem::{
    ReductionOp, SemDecodeError, SemExecute, SemOp, SyncptExecute, SyncptOp, CRC_CHECK,
    SEM_ADDR_HI, SEM_ADDR_LO, SEM_EXECUTE, SEM_PAYLOAD_HI, SEM_PAYLOAD_LO, SET_OBJECT,
    SYNCPT_EXECUTE, SYNCPT_PAYLOAD,
};

/// Methods below this offset are channel methods executed by the engine
/// itself (semaphores, syncpoints, CRC); everything at or above it addresses
/// the object bound to the command's subchannel.
pub const CHANNEL_METHOD_LIMIT: u16 = 0x0100;
