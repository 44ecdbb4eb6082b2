//! Channel-method map: semaphore, syncpoint and CRC operations.
//!
//! These methods are executed by the engine itself regardless of the
//! subchannel that carries them. A semaphore operation is a five-method
//! sequence (address hi/lo, payload lo[/hi], execute); syncpoint operations
//! are payload + execute.

use core::fmt;

/// Binds an object handle to the command's subchannel.
pub const SET_OBJECT: u16 = 0x0000;

pub const SEM_ADDR_HI: u16 = 0x0010;
pub const SEM_ADDR_LO: u16 = 0x0014;
pub const SEM_PAYLOAD_LO: u16 = 0x0018;
pub const SEM_PAYLOAD_HI: u16 = 0x001C;
pub const SEM_EXECUTE: u16 = 0x0020;

pub const SYNCPT_PAYLOAD: u16 = 0x0024;
pub const SYNCPT_EXECUTE: u16 = 0x0028;

/// Payload: CRC-32 over the words of the current entry span that precede
/// this command's header.
pub const CRC_CHECK: u16 = 0x002C;

const SEM_OP_MASK: u32 = 0x7;
const SEM_AWAKEN_BIT: u32 = 1 << 12;
const SEM_RELEASE_WFI_BIT: u32 = 1 << 16;
const SEM_RELEASE_TIMESTAMP_BIT: u32 = 1 << 20;
const SEM_PAYLOAD64_BIT: u32 = 1 << 24;
const SEM_REDUCTION_SHIFT: u32 = 27;
const SEM_REDUCTION_MASK: u32 = 0xF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SemOp {
    /// Stall until the semaphore equals the payload.
    Acquire,
    /// Write the payload on completion.
    Release,
    /// Stall until the semaphore is at or past the payload (monotonic form).
    AcquireGeq,
    /// Atomic read-modify-write with the payload; see [`ReductionOp`].
    Reduction,
}

impl SemOp {
    const fn to_bits(self) -> u32 {
        match self {
            SemOp::Acquire => 1,
            SemOp::Release => 2,
            SemOp::AcquireGeq => 3,
            SemOp::Reduction => 4,
        }
    }

    const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            1 => Some(SemOp::Acquire),
            2 => Some(SemOp::Release),
            3 => Some(SemOp::AcquireGeq),
            4 => Some(SemOp::Reduction),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReductionOp {
    Add,
    Min,
    Max,
    And,
    Or,
    Xor,
    Exchange,
}

impl ReductionOp {
    const fn to_bits(self) -> u32 {
        match self {
            ReductionOp::Add => 0,
            ReductionOp::Min => 1,
            ReductionOp::Max => 2,
            ReductionOp::And => 3,
            ReductionOp::Or => 4,
            ReductionOp::Xor => 5,
            ReductionOp::Exchange => 6,
        }
    }

    const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(ReductionOp::Add),
            1 => Some(ReductionOp::Min),
            2 => Some(ReductionOp::Max),
            3 => Some(ReductionOp::And),
            4 => Some(ReductionOp::Or),
            5 => Some(ReductionOp::Xor),
            6 => Some(ReductionOp::Exchange),
            _ => None,
        }
    }

    pub fn apply(self, current: u64, payload: u64) -> u64 {
        match self {
            ReductionOp::Add => current.wrapping_add(payload),
            ReductionOp::Min => current.min(payload),
            ReductionOp::Max => current.max(payload),
            ReductionOp::And => current & payload,
            ReductionOp::Or => current | payload,
            ReductionOp::Xor => current ^ payload,
            ReductionOp::Exchange => payload,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SemDecodeError {
    BadOperation { word: u32 },
    BadReductionOp { word: u32 },
}

impl fmt::Display for SemDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadOperation { word } => {
                write!(f, "SEM_EXECUTE {word:#010x} has undefined operation")
            }
            Self::BadReductionOp { word } => {
                write!(f, "SEM_EXECUTE {word:#010x} has undefined reduction op")
            }
        }
    }
}

impl std::error::Error for SemDecodeError {}

/// Decoded `SEM_EXECUTE` word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemExecute {
    pub op: SemOp,
    /// Raise a non-blocking completion notification on release. Attribution
    /// across channels sharing one notification path is unspecified; callers
    /// needing strict ordering poll the semaphore instead.
    pub awaken: bool,
    /// Drain the engine before performing the release.
    pub release_wfi: bool,
    /// Also write an engine timestamp at `addr + 8`.
    pub release_timestamp: bool,
    /// 64-bit payload (requires the `sem64` capability).
    pub payload64: bool,
    /// Only meaningful when `op == SemOp::Reduction`.
    pub reduction: Option<ReductionOp>,
}

impl SemExecute {
    pub fn encode(&self) -> u32 {
        let mut word = self.op.to_bits();
        if self.awaken {
            word |= SEM_AWAKEN_BIT;
        }
        if self.release_wfi {
            word |= SEM_RELEASE_WFI_BIT;
        }
        if self.release_timestamp {
            word |= SEM_RELEASE_TIMESTAMP_BIT;
        }
        if self.payload64 {
            word |= SEM_PAYLOAD64_BIT;
        }
        if let Some(red) = self.reduction {
            word |= red.to_bits() << SEM_REDUCTION_SHIFT;
        }
        word
    }

    pub fn decode(word: u32) -> Result<Self, SemDecodeError> {
        let op =
            SemOp::from_bits(word & SEM_OP_MASK).ok_or(SemDecodeError::BadOperation { word })?;
        let reduction = if op == SemOp::Reduction {
            Some(
                ReductionOp::from_bits((word >> SEM_REDUCTION_SHIFT) & SEM_REDUCTION_MASK)
                    .ok_or(SemDecodeError::BadReductionOp { word })?,
            )
        } else {
            None
        };
        Ok(Self {
            op,
            awaken: word & SEM_AWAKEN_BIT != 0,
            release_wfi: word & SEM_RELEASE_WFI_BIT != 0,
            release_timestamp: word & SEM_RELEASE_TIMESTAMP_BIT != 0,
            payload64: word & SEM_PAYLOAD64_BIT != 0,
            reduction,
        })
    }

    pub fn release(awaken: bool) -> Self {
        Self {
            op: SemOp::Release,
            awaken,
            release_wfi: false,
            release_timestamp: false,
            payload64: false,
            reduction: None,
        }
    }

    pub fn acquire() -> Self {
        Self {
            op: SemOp::Acquire,
            awaken: false,
            release_wfi: false,
            release_timestamp: false,
            payload64: false,
            reduction: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncptOp {
    Increment,
    Wait,
}

/// Decoded `SYNCPT_EXECUTE` word: `[0]` op, `[27:16]` syncpoint id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncptExecute {
    pub op: SyncptOp,
    pub id: u32,
}

impl SyncptExecute {
    pub const MAX_ID: u32 = 0xFFF;

    pub fn encode(&self) -> u32 {
        let op = match self.op {
            SyncptOp::Increment => 0,
            SyncptOp::Wait => 1,
        };
        op | ((self.id & Self::MAX_ID) << 16)
    }

    pub fn decode(word: u32) -> Self {
        Self {
            op: if word & 1 == 0 {
                SyncptOp::Increment
            } else {
                SyncptOp::Wait
            },
            id: (word >> 16) & Self::MAX_ID,
        }
    }
}
