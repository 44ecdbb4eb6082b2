//! Hardware generations and their capability table.
//!
//! A generation is selected once, at channel construction, from the class id
//! the engine reports. Capabilities only ever accumulate along the chain —
//! newer generations add or widen, never restructure the ring protocol — so
//! code never branches on the generation itself, only on `GenCaps` fields.

use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Generation {
    Fermi,
    Kepler,
    Volta,
    Ampere,
    Hopper,
    Blackwell,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassError {
    UnknownClass { class_id: u32 },
}

impl fmt::Display for ClassError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownClass { class_id } => write!(f, "unknown engine class {class_id:#06x}"),
        }
    }
}

impl std::error::Error for ClassError {}

/// Per-generation protocol capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenCaps {
    /// Syncpoint counters are available (CheetAh-class engines).
    pub syncpoints: bool,
    /// Completion notification by doorbell ring instead of register polling.
    pub doorbell: bool,
    /// 64-bit semaphore payloads.
    pub sem64: bool,
    /// Side-band extended-base entries for spans past 40-bit addresses.
    pub extended_base: bool,
    /// CRC check mode over command spans.
    pub crc: bool,
}

impl Generation {
    pub const ALL: [Generation; 6] = [
        Generation::Fermi,
        Generation::Kepler,
        Generation::Volta,
        Generation::Ampere,
        Generation::Hopper,
        Generation::Blackwell,
    ];

    /// Engine class id, as reported by the resource manager.
    pub const fn class_id(self) -> u32 {
        match self {
            Generation::Fermi => 0x1F01,
            Generation::Kepler => 0x1F02,
            Generation::Volta => 0x1F03,
            Generation::Ampere => 0x1F04,
            Generation::Hopper => 0x1F05,
            Generation::Blackwell => 0x1F06,
        }
    }

    pub fn from_class(class_id: u32) -> Result<Self, ClassError> {
        Generation::ALL
            .into_iter()
            .find(|g| g.class_id() == class_id)
            .ok_or(ClassError::UnknownClass { class_id })
    }

    pub const fn caps(self) -> GenCaps {
        let mut caps = GenCaps {
            syncpoints: false,
            doorbell: false,
            sem64: false,
            extended_base: false,
            crc: false,
        };
        // Strict superset chain: each arm adds to everything before it.
        if self as u32 >= Generation::Kepler as u32 {
            caps.syncpoints = true;
        }
        if self as u32 >= Generation::Volta as u32 {
            caps.doorbell = true;
            caps.sem64 = true;
        }
        if self as u32 >= Generation::Ampere as u32 {
            caps.extended_base = true;
        }
        if self as u32 >= Generation::Hopper as u32 {
            caps.crc = true;
        }
        caps
    }
}
