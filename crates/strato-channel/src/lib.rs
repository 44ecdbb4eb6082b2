//! Host-side GPU command-submission channel.
//!
//! A channel owns two shared-memory rings: a **pushbuffer** of encoded
//! command words and a **GPFIFO** of two-word entries, each referencing a
//! physically-contiguous span of the pushbuffer. The CPU producer encodes
//! commands, closes spans into entries, and publishes the entry-ring write
//! cursor to make work visible; the engine consumes entries fully
//! asynchronously and only ever advances its own read cursors. There are no
//! interrupts on the hot path: completion is observed by polling cursors, by
//! semaphore releases, or (on doorbell generations) by ringing the engine
//! after a cursor publish.
//!
//! ```no_run
//! use std::sync::Arc;
//! use strato_channel::{Channel, ChannelConfig, EngineBus};
//!
//! fn submit(engine: Arc<dyn EngineBus>) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut ch = Channel::new(ChannelConfig::default(), engine)?;
//!     ch.write(0, 0x0104, &[1, 2, 3])?;
//!     ch.flush()?;
//!     ch.wait_idle(std::time::Duration::from_secs(1))?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

mod channel;
mod config;
mod engine;
mod error;
mod filter;
mod flow;
mod gpfifo;
mod group;
mod policy;
mod pushbuf;
mod recovery;
mod sync;
mod wait;

#[cfg(test)]
mod tests;

pub use channel::{Channel, ChannelState};
pub use config::{ChannelConfig, ConfigError};
pub use engine::{CursorSnapshot, EngineBus, FaultCode, FaultInfo, RingDesc};
pub use error::ChannelError;
pub use filter::{crc32, CrcFilter, SpanView, SubmitFilter, TraceFilter};
pub use gpfifo::GpFifo;
pub use group::ChannelGroup;
pub use policy::Threshold;
pub use pushbuf::Pushbuffer;
pub use recovery::RecoveryState;
pub use sync::ReleaseFlags;
pub use wait::poll_until;
