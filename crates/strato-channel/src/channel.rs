//! The channel proper: construction, command encoding, flush and waits.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use strato_mem::DmaBuf;
use strato_protocol::{GenCaps, Generation, MethodHeader, MethodMode, SET_OBJECT};

use crate::config::{ChannelConfig, ConfigError};
use crate::engine::{EngineBus, FaultInfo, RingDesc};
use crate::error::ChannelError;
use crate::filter::{CrcFilter, SubmitFilter};
use crate::flow::Flow;
use crate::gpfifo::GpFifo;
use crate::policy::PolicyState;
use crate::pushbuf::Pushbuffer;
use crate::wait::poll_until;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Active,
    /// A robust channel error was observed and not yet recovered.
    Faulted,
    Closed,
}

/// A command-submission channel bound to one engine.
///
/// Single producer: one thread owns the channel and is the only writer of
/// `put`/`gp_put`. The engine behind [`EngineBus`] runs fully asynchronously
/// and only advances its own read cursors.
pub struct Channel {
    chid: u32,
    generation: Generation,
    caps: GenCaps,
    engine: Arc<dyn EngineBus>,
    pub(crate) flow: Flow,
    pub(crate) timeout: Duration,
    state: ChannelState,
    pub(crate) filters: Vec<Box<dyn SubmitFilter>>,
    auto_flush: Option<PolicyState>,
    auto_entry: Option<PolicyState>,
    pub(crate) last_fault: Option<FaultInfo>,
    pub(crate) fault_sticky: bool,
    /// Payload words still owed after a raw `write_header`.
    pending_data: u32,
}

impl Channel {
    /// Construct and register a channel. Configuration problems are fatal
    /// here; nothing is deferred to submission time.
    pub fn new(config: ChannelConfig, engine: Arc<dyn EngineBus>) -> Result<Self, ConfigError> {
        config.validate()?;
        let generation = Generation::from_class(engine.class_id())?;
        let caps = generation.caps();
        if config.crc_mode && !caps.crc {
            return Err(ConfigError::CrcUnsupported);
        }

        let mut ch = Self::build(config, engine, generation, caps);
        ch.state = ChannelState::Active;
        ch.engine.set_scheduled(true);
        debug!(
            chid = ch.chid,
            ?generation,
            pushbuf_words = ch.flow.pb.capacity_words(),
            entries = ch.flow.gp.capacity_entries(),
            "channel active"
        );
        Ok(ch)
    }

    fn build(
        config: ChannelConfig,
        engine: Arc<dyn EngineBus>,
        generation: Generation,
        caps: GenCaps,
    ) -> Self {
        let pushbuf = DmaBuf::new(config.pushbuf_words as usize, config.gpu_va_base);
        let gpfifo = DmaBuf::new(
            config.entry_count as usize * 2,
            config.gpu_va_base + config.pushbuf_words * 4,
        );
        engine.configure(RingDesc {
            chid: config.chid,
            pushbuf: pushbuf.clone(),
            gpfifo: gpfifo.clone(),
            entry_count: config.entry_count,
        });
        let doorbell_token = engine.work_submit_token();

        let mut filters: Vec<Box<dyn SubmitFilter>> = Vec::new();
        if config.crc_mode {
            filters.push(Box::new(CrcFilter));
        }

        Self {
            chid: config.chid,
            generation,
            caps,
            flow: Flow::new(
                Pushbuffer::new(pushbuf),
                GpFifo::new(gpfifo, config.entry_count),
                caps,
                config.subdev_mask,
                doorbell_token,
            ),
            timeout: config.timeout,
            engine,
            state: ChannelState::Uninitialized,
            filters,
            auto_flush: config.auto_flush_bytes.map(|t| t.state()),
            auto_entry: config.auto_entry_count.map(|t| t.state()),
            last_fault: None,
            fault_sticky: false,
            pending_data: 0,
        }
    }

    pub fn chid(&self) -> u32 {
        self.chid
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn caps(&self) -> &GenCaps {
        &self.caps
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn engine(&self) -> Arc<dyn EngineBus> {
        self.engine.clone()
    }

    /// Append a submit filter to the interceptor chain.
    pub fn add_filter(&mut self, filter: Box<dyn SubmitFilter>) {
        self.filters.push(filter);
    }

    // ---- diagnostic accessors -------------------------------------------

    pub fn put_words(&self) -> u64 {
        self.flow.pb.put_words()
    }

    pub fn get_words(&self) -> u64 {
        self.flow.pb.get_words()
    }

    pub fn free_words(&self) -> u64 {
        self.flow.pb.free_words()
    }

    pub fn gp_put(&self) -> u32 {
        self.flow.gp.gp_put()
    }

    pub fn gp_get(&self) -> u32 {
        self.flow.gp.gp_get()
    }

    // ---- policy knobs ---------------------------------------------------

    /// Enable/disable the implicit span close once the open span holds
    /// `threshold` bytes.
    pub fn set_auto_flush(&mut self, threshold: Option<crate::policy::Threshold>) {
        self.auto_flush = threshold.map(|t| t.state());
    }

    /// Enable/disable the implicit publish once `threshold` entries are
    /// staged.
    pub fn set_auto_entry(&mut self, threshold: Option<crate::policy::Threshold>) {
        self.auto_entry = threshold.map(|t| t.state());
    }

    // ---- command encoding -----------------------------------------------

    /// One incrementing-method command.
    pub fn write(&mut self, subchannel: u32, method: u32, data: &[u32]) -> Result<(), ChannelError> {
        self.emit(MethodMode::Increment, subchannel, method, data)
    }

    /// One non-incrementing command (all payload words hit `method`).
    pub fn write_non_inc(
        &mut self,
        subchannel: u32,
        method: u32,
        data: &[u32],
    ) -> Result<(), ChannelError> {
        self.emit(MethodMode::NonIncrement, subchannel, method, data)
    }

    /// Increment-once command (first word at `method`, rest at `method+4`).
    pub fn write_inc_once(
        &mut self,
        subchannel: u32,
        method: u32,
        data: &[u32],
    ) -> Result<(), ChannelError> {
        self.emit(MethodMode::IncrementOnce, subchannel, method, data)
    }

    /// Immediate-data command; the 13-bit value rides in the header.
    pub fn write_imm(&mut self, subchannel: u32, method: u32, value: u32) -> Result<(), ChannelError> {
        self.ensure_writable()?;
        let hdr = MethodHeader::new(MethodMode::Immediate, subchannel, method, value)?;
        self.flow
            .reserve_command(self.engine.as_ref(), self.timeout, &mut self.filters, 1)?;
        self.flow.pb.write(&[hdr.encode()]);
        self.flow.pb.commit();
        self.run_auto_policies()
    }

    /// Raw header write; the caller owes exactly `count` payload words via
    /// [`Channel::write_data`] before any other operation.
    pub fn write_header(
        &mut self,
        subchannel: u32,
        method: u32,
        count: u32,
    ) -> Result<(), ChannelError> {
        self.ensure_writable()?;
        let hdr = MethodHeader::new(MethodMode::Increment, subchannel, method, count)?;
        self.flow.reserve_command(
            self.engine.as_ref(),
            self.timeout,
            &mut self.filters,
            1 + u64::from(count),
        )?;
        self.flow.pb.write(&[hdr.encode()]);
        self.pending_data = count;
        if count == 0 {
            self.flow.pb.commit();
            return self.run_auto_policies();
        }
        Ok(())
    }

    /// Payload words for an open [`Channel::write_header`].
    pub fn write_data(&mut self, data: &[u32]) -> Result<(), ChannelError> {
        if self.pending_data == 0 {
            return Err(ChannelError::Misuse("write_data without an open header"));
        }
        if data.len() as u64 > u64::from(self.pending_data) {
            return Err(ChannelError::Misuse("write_data exceeds the header count"));
        }
        self.flow.pb.write(data);
        self.pending_data -= data.len() as u32;
        if self.pending_data == 0 {
            self.flow.pb.commit();
            return self.run_auto_policies();
        }
        Ok(())
    }

    /// Allocate an engine object on `subchannel` and bind it with a
    /// `SET_OBJECT` command. Returns the handle.
    pub fn bind_object(&mut self, subchannel: u32, class: u32) -> Result<u32, ChannelError> {
        let handle = self.engine.bind_object(subchannel, class);
        self.write(subchannel, u32::from(SET_OBJECT), &[handle])?;
        Ok(handle)
    }

    /// Stage a call to a separately-addressed command block (subroutine
    /// entry). Any open span is closed first so the call sits at the right
    /// point in the stream.
    pub fn call_subroutine(&mut self, base: u64, len_words: u32) -> Result<(), ChannelError> {
        self.ensure_writable()?;
        // Close the open span first so the call sits at the right point in
        // the stream.
        self.flow.close_entry(
            self.engine.as_ref(),
            self.timeout,
            &mut self.filters,
            false,
            true,
        )?;
        self.flow.push_external_entry(
            self.engine.as_ref(),
            self.timeout,
            &mut self.filters,
            base,
            len_words,
        )
    }

    pub(crate) fn emit(
        &mut self,
        mode: MethodMode,
        subchannel: u32,
        method: u32,
        data: &[u32],
    ) -> Result<(), ChannelError> {
        self.ensure_writable()?;
        let hdr = MethodHeader::new(mode, subchannel, method, data.len() as u32)?;
        self.flow.reserve_command(
            self.engine.as_ref(),
            self.timeout,
            &mut self.filters,
            1 + data.len() as u64,
        )?;
        self.flow.pb.write(&[hdr.encode()]);
        self.flow.pb.write(data);
        self.flow.pb.commit();
        self.run_auto_policies()
    }

    fn ensure_writable(&self) -> Result<(), ChannelError> {
        match self.state {
            // Writes into local cursors stay legal while faulted; only
            // hardware-touching operations insist on recovery first.
            ChannelState::Active | ChannelState::Faulted => {}
            ChannelState::Closed | ChannelState::Uninitialized => {
                return Err(ChannelError::Closed)
            }
        }
        if self.pending_data != 0 {
            return Err(ChannelError::Misuse(
                "previous write_header still owes payload words",
            ));
        }
        Ok(())
    }

    fn run_auto_policies(&mut self) -> Result<(), ChannelError> {
        if let Some(policy) = &mut self.auto_flush {
            if policy.crossed(self.flow.open_span_words() * 4) {
                policy.redraw();
                self.flow.close_entry(
                    self.engine.as_ref(),
                    self.timeout,
                    &mut self.filters,
                    false,
                    true,
                )?;
            }
        }
        if let Some(policy) = &mut self.auto_entry {
            if policy.crossed(u64::from(self.flow.gp.staged_entries())) {
                policy.redraw();
                self.flow.publish(self.engine.as_ref(), &mut self.filters);
            }
        }
        Ok(())
    }

    // ---- flush and waits -------------------------------------------------

    /// Close the open span and publish the cursors. Publishing is the only
    /// thing that makes work visible to the engine; calling `flush` twice
    /// with no intervening writes performs exactly one hardware-visible
    /// cursor update.
    pub fn flush(&mut self) -> Result<(), ChannelError> {
        if self.state == ChannelState::Closed {
            return Err(ChannelError::Closed);
        }
        self.observe_fault()?;
        if self.pending_data != 0 {
            return Err(ChannelError::Misuse(
                "flush with an open write_header payload",
            ));
        }
        self.flow.close_entry(
            self.engine.as_ref(),
            self.timeout,
            &mut self.filters,
            false,
            true,
        )?;
        self.flow.publish(self.engine.as_ref(), &mut self.filters);
        Ok(())
    }

    /// Block until the engine has consumed everything published so far.
    pub fn wait_for_dma_push(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        if self.state == ChannelState::Closed {
            return Err(ChannelError::Closed);
        }
        self.observe_fault()?;
        let engine = self.engine.clone();
        let flow = &mut self.flow;
        let res = poll_until(timeout, || {
            flow.refresh_cursors(engine.as_ref());
            engine.fault().is_some() || flow.drained()
        });
        self.observe_fault()?;
        res.map_err(|()| ChannelError::Timeout {
            what: "dma push drain",
            timeout,
        })
    }

    /// Drain plus engine idle: stronger than `wait_for_dma_push`.
    pub fn wait_idle(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        if self.state == ChannelState::Closed {
            return Err(ChannelError::Closed);
        }
        self.observe_fault()?;
        let engine = self.engine.clone();
        let flow = &mut self.flow;
        let res = poll_until(timeout, || {
            flow.refresh_cursors(engine.as_ref());
            engine.fault().is_some() || (flow.drained() && engine.is_idle())
        });
        self.observe_fault()?;
        res.map_err(|()| ChannelError::Timeout {
            what: "engine idle",
            timeout,
        })
    }

    /// Quiesce and close. Requires the channel to be idle (or recovered);
    /// a channel with outstanding work is not destroyed out from under the
    /// engine.
    pub fn close(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        match self.state {
            ChannelState::Closed => return Ok(()),
            ChannelState::Active => {
                self.flush()?;
                self.wait_idle(timeout)?;
            }
            // An unrecovered fault still needs the quiesce before the
            // channel can be torn down.
            ChannelState::Faulted => {
                self.clear_pushbuffer();
                self.fault_sticky = false;
            }
            ChannelState::Uninitialized => {}
        }
        self.engine.set_scheduled(false);
        self.state = ChannelState::Closed;
        debug!(chid = self.chid, "channel closed");
        Ok(())
    }

    /// Record a pending fault (making it sticky) and refuse the operation.
    pub(crate) fn observe_fault(&mut self) -> Result<(), ChannelError> {
        if !self.fault_sticky {
            if let Some(info) = self.engine.fault() {
                self.fault_sticky = true;
                self.last_fault = Some(info);
                self.state = ChannelState::Faulted;
            }
        }
        match self.last_fault {
            Some(info) if self.fault_sticky => Err(ChannelError::Faulted { code: info.code }),
            _ => Ok(()),
        }
    }

    pub(crate) fn set_state(&mut self, state: ChannelState) {
        self.state = state;
    }
}
