//! Channel groups: channels scheduled and recovered as a unit.
//!
//! Members share one execution context on the engine, so a fault on any
//! member quiesces every member. Cross-member ordering is imposed the only
//! way the protocol allows it — explicit semaphore acquire/release pairs
//! keyed by a shared monotonic ticket — never by locking.

use tracing::warn;

use strato_mem::SemaphoreCell;

use crate::channel::{Channel, ChannelState};
use crate::engine::FaultInfo;
use crate::error::ChannelError;
use crate::sync::ReleaseFlags;

pub struct ChannelGroup {
    channels: Vec<Channel>,
    /// Shared hand-off semaphore; the engine is its only writer while work
    /// is outstanding.
    sem: SemaphoreCell,
    /// Next hand-off ticket. The semaphore starts at 0, so ticket 0's
    /// acquire passes immediately.
    ticket: u64,
}

impl ChannelGroup {
    pub fn new(channels: Vec<Channel>, sem: SemaphoreCell) -> Result<Self, ChannelError> {
        if channels.is_empty() {
            return Err(ChannelError::Misuse("channel group needs members"));
        }
        Ok(Self {
            channels,
            sem,
            ticket: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channel(&self, index: usize) -> &Channel {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut Channel {
        &mut self.channels[index]
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Run `body` on member `index` inside an acquire/release bracket on the
    /// shared semaphore, so submissions through this call execute in ticket
    /// order across the whole group regardless of engine scheduling.
    pub fn submit_ordered(
        &mut self,
        index: usize,
        body: impl FnOnce(&mut Channel) -> Result<(), ChannelError>,
    ) -> Result<(), ChannelError> {
        let ticket = self.ticket;
        let sem = self.sem.clone();
        let ch = &mut self.channels[index];
        ch.semaphore_acquire(&sem, ticket)?;
        body(ch)?;
        ch.semaphore_release(&sem, ticket + 1, ReleaseFlags::empty())?;
        ch.flush()?;
        self.ticket += 1;
        Ok(())
    }

    /// Schedule or deschedule every member.
    pub fn set_scheduled(&mut self, scheduled: bool) {
        for ch in &self.channels {
            ch.engine().set_scheduled(scheduled);
        }
    }

    /// True if any member has a pending fault.
    pub fn detect_error(&self) -> bool {
        self.channels.iter().any(Channel::detect_error)
    }

    /// Coordinated recovery: a fault on one member requires quiescing every
    /// member sharing the execution context, faulted or not.
    ///
    /// Returns the faults that were consumed, tagged with the member index.
    pub fn check_error(&mut self) -> Result<Vec<(usize, FaultInfo)>, ChannelError> {
        if !self.detect_error() {
            return Ok(Vec::new());
        }
        warn!(members = self.channels.len(), "group recovery fan-out");
        let mut faults = Vec::new();
        for (i, ch) in self.channels.iter_mut().enumerate() {
            if ch.state() == ChannelState::Closed {
                continue;
            }
            match ch.check_error()? {
                Some(info) => faults.push((i, info)),
                // Sibling without its own fault: still reset to the
                // engine-authoritative cursors, since the shared context was
                // torn down around it.
                None => ch.clear_pushbuffer(),
            }
        }
        Ok(faults)
    }
}
