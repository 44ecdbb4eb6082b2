//! GPFIFO entries.
//!
//! Each entry is two little-endian words referencing a physically-contiguous
//! span of encoded command words. A zero length field marks a side-band
//! control entry whose opcode/operand live in word 0; the only defined
//! control operation sets the sticky extended base (address bits `[63:40]`)
//! used by subsequent entries on extended-addressing generations.

use core::fmt;

use crate::class::GenCaps;

const LEN_SHIFT: u32 = 10;
const LEN_MAX: u32 = 0x1F_FFFF;
const SUBROUTINE_BIT: u32 = 1 << 9;
const BASE_HI_MASK: u32 = 0xFF;
const SUBDEV_MASK: u32 = 0x3;
/// Base addresses at or past this need an extended-base control entry.
const DIRECT_BASE_LIMIT: u64 = 1 << 40;

/// A raw two-word ring slot, exactly as it sits in GPFIFO memory.
pub type RawEntry = [u32; 2];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlOpcode {
    Nop,
    /// Operand carries base gpu_va bits `[63:40]`, sticky until rewritten.
    SetExtendedBase,
}

impl ControlOpcode {
    const fn to_bits(self) -> u32 {
        match self {
            ControlOpcode::Nop => 0,
            ControlOpcode::SetExtendedBase => 1,
        }
    }

    const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(ControlOpcode::Nop),
            1 => Some(ControlOpcode::SetExtendedBase),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryEncodeError {
    /// Span base is not word aligned.
    MisalignedBase { base: u64 },
    /// Span length of zero (zero marks control entries) or past the 21-bit
    /// length field.
    BadLength { len_words: u32 },
    /// Base needs extended addressing but the generation has none.
    BaseNeedsExtendedAddressing { base: u64 },
    /// Subdevice mask wider than the 2-bit entry field.
    BadSubdeviceMask { mask: u32 },
}

impl fmt::Display for EntryEncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MisalignedBase { base } => write!(f, "entry base {base:#x} misaligned"),
            Self::BadLength { len_words } => write!(f, "entry length {len_words} out of range"),
            Self::BaseNeedsExtendedAddressing { base } => {
                write!(f, "entry base {base:#x} exceeds direct addressing")
            }
            Self::BadSubdeviceMask { mask } => write!(f, "subdevice mask {mask:#x} too wide"),
        }
    }
}

impl std::error::Error for EntryEncodeError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryDecodeError {
    /// Control entry with an undefined opcode.
    BadControlOpcode { word0: u32 },
}

impl fmt::Display for EntryDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadControlOpcode { word0 } => {
                write!(f, "control entry {word0:#010x} has undefined opcode")
            }
        }
    }
}

impl std::error::Error for EntryDecodeError {}

/// A decoded ring slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpEntry {
    Span {
        /// GPU virtual address of the first command word. Bits `[63:40]`
        /// come from the sticky extended base on extended generations and
        /// are zero otherwise.
        base: u64,
        len_words: u32,
        /// Call into a separately-addressed command block rather than an
        /// inline ring span.
        subroutine: bool,
        /// 2-bit subdevice mask; 0 targets all subunits.
        subdev_mask: u32,
    },
    Control {
        opcode: ControlOpcode,
        operand: u32,
    },
}

impl GpEntry {
    pub const MAX_LEN_WORDS: u32 = LEN_MAX;

    /// Encode a span entry. `base` bits `[39:0]` go into the entry itself;
    /// callers on extended generations are responsible for having emitted a
    /// `SetExtendedBase` control entry carrying bits `[63:40]` beforehand.
    pub fn encode_span(
        caps: &GenCaps,
        base: u64,
        len_words: u32,
        subroutine: bool,
        subdev_mask: u32,
    ) -> Result<RawEntry, EntryEncodeError> {
        if base & 3 != 0 {
            return Err(EntryEncodeError::MisalignedBase { base });
        }
        if len_words == 0 || len_words > LEN_MAX {
            return Err(EntryEncodeError::BadLength { len_words });
        }
        if subdev_mask > SUBDEV_MASK {
            return Err(EntryEncodeError::BadSubdeviceMask { mask: subdev_mask });
        }
        if base >= DIRECT_BASE_LIMIT && !caps.extended_base {
            return Err(EntryEncodeError::BaseNeedsExtendedAddressing { base });
        }
        let word0 = (base as u32 & !SUBDEV_MASK) | subdev_mask;
        let mut word1 = ((base >> 32) as u32 & BASE_HI_MASK) | (len_words << LEN_SHIFT);
        if subroutine {
            word1 |= SUBROUTINE_BIT;
        }
        Ok([word0, word1])
    }

    /// Encode the side-band entry carrying base bits `[63:40]`.
    pub fn encode_extended_base(base: u64) -> RawEntry {
        let operand = (base >> 40) as u32 & 0x00FF_FFFF;
        [(operand << 8) | ControlOpcode::SetExtendedBase.to_bits(), 0]
    }

    /// Decode a ring slot. `ext_base` is the current sticky extended base
    /// (bits `[63:40]`, already shifted into place) maintained by the
    /// consumer; pass 0 on generations without extended addressing.
    pub fn decode(raw: RawEntry, ext_base: u64) -> Result<Self, EntryDecodeError> {
        let [word0, word1] = raw;
        let len_words = (word1 >> LEN_SHIFT) & LEN_MAX;
        if len_words == 0 {
            let opcode = ControlOpcode::from_bits(word0 & 0xFF)
                .ok_or(EntryDecodeError::BadControlOpcode { word0 })?;
            return Ok(GpEntry::Control {
                opcode,
                operand: word0 >> 8,
            });
        }
        let base = ext_base
            | (u64::from(word1 & BASE_HI_MASK) << 32)
            | u64::from(word0 & !SUBDEV_MASK);
        Ok(GpEntry::Span {
            base,
            len_words,
            subroutine: word1 & SUBROUTINE_BIT != 0,
            subdev_mask: word0 & SUBDEV_MASK,
        })
    }

    /// Sticky extended base value (bits `[63:40]`) set by a decoded
    /// `SetExtendedBase` control entry.
    pub fn extended_base_value(operand: u32) -> u64 {
        u64::from(operand & 0x00FF_FFFF) << 40
    }
}
