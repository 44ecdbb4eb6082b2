//! Command header words.
//!
//! Every command in the pushbuffer is one header word followed by payload
//! words. The header packs the subchannel, the method byte offset (stored as
//! a dword address), the payload word count and the increment mode.

use core::fmt;

/// Padding word. The consumer skips it without touching any subchannel
/// state; the producer uses it to fill a span up to the ring wrap boundary.
pub const PAD_WORD: u32 = 0;

const MODE_SHIFT: u32 = 29;
const COUNT_SHIFT: u32 = 16;
const COUNT_MAX: u32 = 0x1FFF;
const SUBCH_SHIFT: u32 = 13;
const SUBCH_MAX: u32 = 7;
const METHOD_DWORD_MAX: u32 = 0x1FFF;

/// How the method address advances across the payload words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodMode {
    /// Method address advances by 4 for every payload word.
    Increment,
    /// Every payload word targets the same method.
    NonIncrement,
    /// Address advances once after the first word, then stays.
    IncrementOnce,
    /// No payload words; the 13-bit count field carries the data inline.
    Immediate,
}

impl MethodMode {
    const fn to_bits(self) -> u32 {
        match self {
            MethodMode::Increment => 1,
            MethodMode::NonIncrement => 3,
            MethodMode::IncrementOnce => 5,
            MethodMode::Immediate => 4,
        }
    }

    const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            1 => Some(MethodMode::Increment),
            3 => Some(MethodMode::NonIncrement),
            5 => Some(MethodMode::IncrementOnce),
            4 => Some(MethodMode::Immediate),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodEncodeError {
    /// Subchannel out of 0..=7.
    BadSubchannel { subchannel: u32 },
    /// Method byte offset misaligned or past the 13-bit dword address space.
    BadMethod { method: u32 },
    /// Payload word count exceeds the 13-bit count field.
    CountTooLarge { count: u32 },
    /// Immediate data exceeds the 13-bit inline field.
    ImmediateTooLarge { data: u32 },
}

impl fmt::Display for MethodEncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSubchannel { subchannel } => write!(f, "subchannel {subchannel} out of range"),
            Self::BadMethod { method } => write!(f, "method offset {method:#x} invalid"),
            Self::CountTooLarge { count } => write!(f, "payload count {count} too large"),
            Self::ImmediateTooLarge { data } => write!(f, "immediate data {data:#x} too large"),
        }
    }
}

impl std::error::Error for MethodEncodeError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodDecodeError {
    /// Header mode bits do not name a defined mode.
    BadMode { word: u32 },
}

impl fmt::Display for MethodDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMode { word } => write!(f, "header word {word:#010x} has undefined mode"),
        }
    }
}

impl std::error::Error for MethodDecodeError {}

/// A decoded command header.
///
/// `count_or_data` is the payload word count, except in `Immediate` mode
/// where it is the inline payload itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodHeader {
    pub mode: MethodMode,
    pub subchannel: u32,
    /// Method byte offset (4-aligned).
    pub method: u32,
    pub count_or_data: u32,
}

impl MethodHeader {
    /// Largest payload word count a single header can carry.
    pub const MAX_COUNT: u32 = COUNT_MAX;

    pub fn new(
        mode: MethodMode,
        subchannel: u32,
        method: u32,
        count_or_data: u32,
    ) -> Result<Self, MethodEncodeError> {
        if subchannel > SUBCH_MAX {
            return Err(MethodEncodeError::BadSubchannel { subchannel });
        }
        if method & 3 != 0 || method / 4 > METHOD_DWORD_MAX {
            return Err(MethodEncodeError::BadMethod { method });
        }
        match mode {
            MethodMode::Immediate => {
                if count_or_data > COUNT_MAX {
                    return Err(MethodEncodeError::ImmediateTooLarge {
                        data: count_or_data,
                    });
                }
            }
            _ => {
                if count_or_data > COUNT_MAX {
                    return Err(MethodEncodeError::CountTooLarge {
                        count: count_or_data,
                    });
                }
            }
        }
        Ok(Self {
            mode,
            subchannel,
            method,
            count_or_data,
        })
    }

    /// Number of payload words that follow this header in the stream.
    pub fn payload_words(&self) -> u32 {
        match self.mode {
            MethodMode::Immediate => 0,
            _ => self.count_or_data,
        }
    }

    pub fn encode(&self) -> u32 {
        (self.mode.to_bits() << MODE_SHIFT)
            | (self.count_or_data << COUNT_SHIFT)
            | (self.subchannel << SUBCH_SHIFT)
            | (self.method / 4)
    }

    /// Decode a header word. `PAD_WORD` is not a header; callers skip it
    /// before decoding.
    pub fn decode(word: u32) -> Result<Self, MethodDecodeError> {
        let mode =
            MethodMode::from_bits(word >> MODE_SHIFT).ok_or(MethodDecodeError::BadMode { word })?;
        Ok(Self {
            mode,
            subchannel: (word >> SUBCH_SHIFT) & SUBCH_MAX,
            method: (word & METHOD_DWORD_MAX) * 4,
            count_or_data: (word >> COUNT_SHIFT) & COUNT_MAX,
        })
    }
}
