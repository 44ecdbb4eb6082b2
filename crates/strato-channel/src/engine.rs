//! The seam between a channel and its engine.
//!
//! Everything the channel needs from the device side — cursor reads, cursor
//! publication, doorbell, object binding, scheduling and fault reporting —
//! goes through [`EngineBus`]. The device/resource manager behind it is an
//! external collaborator; the channel never assumes anything about its
//! internals beyond this contract.

use core::fmt;

use strato_mem::DmaBuf;

/// Ring locations handed to the engine at channel construction.
#[derive(Clone, Debug)]
pub struct RingDesc {
    pub chid: u32,
    /// Pushbuffer backing store; capacity is `pushbuf.len_words()`.
    pub pushbuf: DmaBuf,
    /// GPFIFO backing store; holds `entry_count` two-word slots.
    pub gpfifo: DmaBuf,
    pub entry_count: u32,
}

/// Fault classes an engine reports asynchronously.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultCode {
    /// The engine rejected a command it fetched (bad method/subchannel).
    MalformedCommand,
    /// A `CRC_CHECK` trailer did not match the span contents.
    CrcMismatch,
    /// Address translation failed while fetching a span.
    MmuFault { va: u64 },
    /// The engine stopped making progress and was reset.
    EngineHung,
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedCommand => write!(f, "malformed command"),
            Self::CrcMismatch => write!(f, "command CRC mismatch"),
            Self::MmuFault { va } => write!(f, "mmu fault at {va:#x}"),
            Self::EngineHung => write!(f, "engine hung"),
        }
    }
}

/// An asynchronously-reported robust channel error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultInfo {
    pub chid: u32,
    pub code: FaultCode,
    /// False when the engine could not restore a consistent state; the
    /// channel must close instead of recovering.
    pub recoverable: bool,
}

/// Authoritative cursor state after a fault quiesce.
///
/// The device may have discarded or only partially consumed outstanding
/// work, so the producer resets its cursors to these values rather than its
/// own bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CursorSnapshot {
    /// Words of in-ring pushbuffer data actually consumed.
    pub pb_get_words: u64,
    /// Entries actually consumed.
    pub gp_get: u32,
}

/// Per-channel engine interface. Implementations are shared with the
/// consumer side (the engine model runs on another thread), so all methods
/// take `&self`.
pub trait EngineBus: Send + Sync {
    /// Engine class id; selects the generation strategy at construction.
    fn class_id(&self) -> u32;

    /// Number of physical subunits consuming this channel (1 for
    /// single-unit devices).
    fn subunits(&self) -> u32 {
        1
    }

    /// Register the rings. Called once from `Channel::new`.
    fn configure(&self, rings: RingDesc);

    /// Consumption cursor into the pushbuffer, in words, for one subunit.
    /// Monotonic; never exceeds the published work.
    fn pb_get_words(&self, subunit: u32) -> u64;

    /// Entry-ring consumption cursor (wrapping monotonic index).
    fn gp_get(&self) -> u32;

    /// Publish the entry-ring write cursor. The only operation that makes
    /// previously-written entries eligible for execution.
    fn publish_gp_put(&self, gp_put: u32);

    /// Doorbell ring (doorbell generations only). `token` comes from
    /// [`EngineBus::work_submit_token`].
    fn ring_doorbell(&self, token: u32);

    /// Token identifying this channel on the doorbell path.
    fn work_submit_token(&self) -> u32;

    /// Allocate an object handle bound to `subchannel`.
    fn bind_object(&self, subchannel: u32, class: u32) -> u32;

    /// Make the channel (or its group) eligible/ineligible for execution.
    fn set_scheduled(&self, scheduled: bool);

    /// Pending robust channel error, if any. Pure poll; never clears.
    fn fault(&self) -> Option<FaultInfo>;

    /// Quiesce after a fault: stop consumption, drop outstanding work, clear
    /// the fault and report the authoritative cursors.
    fn acknowledge_fault(&self) -> CursorSnapshot;

    /// Full engine reset (unrecoverable faults).
    fn reset_engine(&self);

    /// Engine has no fetched or in-flight work for this channel.
    fn is_idle(&self) -> bool;
}
