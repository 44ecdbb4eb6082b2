//! Robust channel error detection and recovery.
//!
//! Faults arrive asynchronously from the engine. `detect_error` is a pure
//! poll usable in tight loops; `check_error` is the only operation with the
//! quiesce/cleanup side effect. Until it runs, the channel keeps accepting
//! writes into its local cursors — an unreported fault never corrupts the
//! rings, it only stalls forward progress on the next flush or wait.

use tracing::warn;

use crate::channel::{Channel, ChannelState};
use crate::engine::FaultInfo;
use crate::error::ChannelError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryState {
    Active,
    /// A fault is pending and has not been consumed by `check_error`.
    FaultDetected,
    /// Inside the quiesce/reset window of `check_error`.
    Recovering,
    Closed,
}

impl Channel {
    /// Non-mutating fault poll.
    pub fn detect_error(&self) -> bool {
        self.fault_sticky || self.engine().fault().is_some()
    }

    pub fn recovery_state(&self) -> RecoveryState {
        match self.state() {
            ChannelState::Closed => RecoveryState::Closed,
            _ if self.fault_sticky => RecoveryState::FaultDetected,
            _ => RecoveryState::Active,
        }
    }

    /// Observe, quiesce and clear a pending fault.
    ///
    /// On a recoverable fault the cached cursors are reset to the values the
    /// engine reports authoritative — the device may have discarded or only
    /// partially consumed outstanding work, so local bookkeeping is not to
    /// be trusted — and the channel returns to `Active`. An unrecoverable
    /// fault resets the engine and closes the channel.
    ///
    /// Returns the consumed fault, or `None` when nothing was pending.
    pub fn check_error(&mut self) -> Result<Option<FaultInfo>, ChannelError> {
        if self.state() == ChannelState::Closed {
            return Err(ChannelError::Closed);
        }
        // Latch an engine-reported fault we have not seen yet.
        let _ = self.observe_fault();
        if !self.fault_sticky {
            return Ok(None);
        }
        let info = self.last_fault.expect("sticky flag without fault info");
        warn!(
            chid = self.chid(),
            code = %info.code,
            recoverable = info.recoverable,
            "recovering robust channel error"
        );

        self.clear_pushbuffer();
        self.fault_sticky = false;

        if info.recoverable {
            self.set_state(ChannelState::Active);
        } else {
            self.engine().reset_engine();
            self.engine().set_scheduled(false);
            self.set_state(ChannelState::Closed);
        }
        Ok(Some(info))
    }

    /// `check_error` discarding the fault details.
    pub fn clear_error(&mut self) -> Result<(), ChannelError> {
        self.check_error().map(|_| ())
    }

    /// Quiesce the engine and reset cached Put/Get (and GpPut/GpGet) to the
    /// hardware-reported state, invalidating outstanding pushbuffer content.
    pub(crate) fn clear_pushbuffer(&mut self) {
        let snap = self.engine().acknowledge_fault();
        self.flow.reset_to(snap);
    }
}
