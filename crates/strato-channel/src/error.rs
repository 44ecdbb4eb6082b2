use std::time::Duration;

use thiserror::Error;

use crate::engine::FaultCode;
use strato_protocol::{EntryEncodeError, Generation, MethodEncodeError};

/// Runtime errors of an active channel.
///
/// Construction-time problems are [`crate::ConfigError`]; they never appear
/// here. Capacity problems are retried internally by blocking and only
/// surface as `Timeout` once the configured bound expires.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout {
        what: &'static str,
        timeout: Duration,
    },

    /// A robust channel error is pending; flush/wait refuse to touch
    /// hardware until `check_error()` observes and clears it.
    #[error("channel faulted ({code}); call check_error() to recover")]
    Faulted { code: FaultCode },

    #[error("channel is closed")]
    Closed,

    /// Programming error at the call site; never retried.
    #[error("misuse: {0}")]
    Misuse(&'static str),

    #[error("command encoding: {0}")]
    Encode(#[from] MethodEncodeError),

    #[error("entry encoding: {0}")]
    Entry(#[from] EntryEncodeError),

    #[error("{what} requires a capability {generation:?} does not have")]
    Unsupported {
        what: &'static str,
        generation: Generation,
    },
}
