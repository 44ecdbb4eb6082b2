use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::Threshold;
use strato_protocol::{ClassError, GpEntry, MethodHeader};

/// Largest single command burst: one header plus a maximal payload. The
/// rings must be able to hold one of these or construction fails.
pub(crate) const MAX_BURST_WORDS: u64 = 1 + MethodHeader::MAX_COUNT as u64;

/// Channel construction parameters.
///
/// Capacities are fixed for the life of the channel; the rings are never
/// resized. Validation happens once, in `Channel::new` — submission-time
/// code may assume every field here is consistent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub chid: u32,
    /// Pushbuffer capacity in words; power of two.
    pub pushbuf_words: u64,
    /// GPFIFO capacity in entries; power of two.
    pub entry_count: u32,
    /// GPU virtual address the pushbuffer is mapped at; the GPFIFO follows
    /// it. Assigned by the resource manager in a real system.
    pub gpu_va_base: u64,
    /// Bound on every internal blocking wait (ring room, drain, idle).
    pub timeout: Duration,
    /// Subdevice mask stamped into entries (0 = all subunits).
    pub subdev_mask: u32,
    /// Close the open span once it holds this many bytes.
    pub auto_flush_bytes: Option<Threshold>,
    /// Publish once this many entries are staged.
    pub auto_entry_count: Option<Threshold>,
    /// Append a CRC trailer to each span (CRC-capable generations only).
    pub crc_mode: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            chid: 0,
            pushbuf_words: 0x8000,
            entry_count: 0x100,
            gpu_va_base: 0x4000_0000,
            timeout: Duration::from_secs(1),
            subdev_mask: 0,
            auto_flush_bytes: None,
            auto_entry_count: None,
            crc_mode: false,
        }
    }
}

/// Construction-time configuration errors. Fatal; never degraded.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pushbuffer capacity {words:#x} words invalid: {why}")]
    BadPushbufCapacity { words: u64, why: &'static str },

    #[error("entry ring capacity {entries:#x} invalid: {why}")]
    BadEntryCapacity { entries: u32, why: &'static str },

    #[error("auto-flush threshold out of range for the configured ring")]
    BadAutoFlushThreshold,

    #[error("auto-entry threshold out of range for the configured ring")]
    BadAutoEntryThreshold,

    #[error("timeout must be non-zero")]
    ZeroTimeout,

    #[error("gpu_va_base {base:#x} must be non-zero and word aligned")]
    BadGpuVaBase { base: u64 },

    #[error("subdevice mask {mask:#x} wider than the entry field")]
    BadSubdevMask { mask: u32 },

    #[error("CRC mode requested but the generation has no CRC capability")]
    CrcUnsupported,

    #[error(transparent)]
    UnknownClass(#[from] ClassError),
}

impl ChannelConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !self.pushbuf_words.is_power_of_two() {
            return Err(ConfigError::BadPushbufCapacity {
                words: self.pushbuf_words,
                why: "not a power of two",
            });
        }
        // A span must fit the entry length field, and the ring must hold one
        // maximal burst plus worst-case wrap padding.
        if self.pushbuf_words > u64::from(GpEntry::MAX_LEN_WORDS) + 1 {
            return Err(ConfigError::BadPushbufCapacity {
                words: self.pushbuf_words,
                why: "exceeds the entry length field",
            });
        }
        if self.pushbuf_words < MAX_BURST_WORDS * 2 {
            return Err(ConfigError::BadPushbufCapacity {
                words: self.pushbuf_words,
                why: "smaller than one maximal command burst",
            });
        }
        if !self.entry_count.is_power_of_two() {
            return Err(ConfigError::BadEntryCapacity {
                entries: self.entry_count,
                why: "not a power of two",
            });
        }
        // One burst can take a span entry, a wrap-padding entry and an
        // extended-base side-band entry.
        if self.entry_count < 4 {
            return Err(ConfigError::BadEntryCapacity {
                entries: self.entry_count,
                why: "smaller than one maximal command burst",
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.gpu_va_base == 0 || self.gpu_va_base & 3 != 0 {
            return Err(ConfigError::BadGpuVaBase {
                base: self.gpu_va_base,
            });
        }
        if self.subdev_mask > 3 {
            return Err(ConfigError::BadSubdevMask {
                mask: self.subdev_mask,
            });
        }
        if let Some(t) = self.auto_flush_bytes {
            if !t.valid_for(self.pushbuf_words * 4) {
                return Err(ConfigError::BadAutoFlushThreshold);
            }
        }
        if let Some(t) = self.auto_entry_count {
            if !t.valid_for(u64::from(self.entry_count)) {
                return Err(ConfigError::BadAutoEntryThreshold);
            }
        }
        Ok(())
    }
}
