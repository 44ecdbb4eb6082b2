//! Method-stream execution for one span.
//!
//! The interpreter models the transport contract only: channel methods
//! (semaphores, syncpoints, CRC, object binding) are executed; methods at or
//! above [`CHANNEL_METHOD_LIMIT`] belong to whatever object is bound on the
//! subchannel and are accepted without interpretation. An acquire or
//! syncpoint wait that is not satisfied parks the span exactly where it
//! stopped; execution resumes at that word, never re-running completed
//! commands.

use strato_channel::{crc32, FaultCode};
use strato_mem::{SemaphoreCell, SyncpointTable};
use strato_protocol::{
    GenCaps, MethodHeader, MethodMode, SemExecute, SemOp, SyncptExecute, SyncptOp,
    CHANNEL_METHOD_LIMIT, CRC_CHECK, PAD_WORD, SEM_ADDR_HI, SEM_ADDR_LO, SEM_EXECUTE,
    SEM_PAYLOAD_HI, SEM_PAYLOAD_LO, SET_OBJECT, SYNCPT_EXECUTE, SYNCPT_PAYLOAD,
};

/// Per-channel execution state that survives across spans (and across a
/// parked span).
#[derive(Debug, Default)]
pub(crate) struct ExecState {
    sem_addr: u64,
    sem_payload_lo: u32,
    sem_payload_hi: u32,
    syncpt_payload: u32,
    bindings: [Option<u32>; 8],
    /// Parked position: (header index in the span, payload words already
    /// applied by the in-progress command).
    resume: Option<(usize, usize)>,
}

impl ExecState {
    pub(crate) fn parked(&self) -> bool {
        self.resume.is_some()
    }

    pub(crate) fn clear_park(&mut self) {
        self.resume = None;
    }

    pub(crate) fn binding(&self, subchannel: usize) -> Option<u32> {
        self.bindings[subchannel]
    }
}

pub(crate) enum SpanOutcome {
    Done,
    Blocked,
    Fault(FaultCode),
}

enum Step {
    Continue,
    Blocked,
}

pub(crate) struct SpanRunner<'a> {
    pub caps: &'a GenCaps,
    pub chid: u32,
    pub semaphores: &'a [SemaphoreCell],
    pub syncpoints: &'a SyncpointTable,
    pub awaken_log: &'a mut Vec<u32>,
    pub timestamp: &'a mut u64,
    pub exec: &'a mut ExecState,
}

impl SpanRunner<'_> {
    /// Execute `words`, honoring a parked position from a previous attempt.
    pub(crate) fn run(&mut self, words: &[u32]) -> SpanOutcome {
        let (mut i, mut skip) = self.exec.resume.take().unwrap_or((0, 0));
        while i < words.len() {
            let w = words[i];
            if w == PAD_WORD {
                i += 1;
                continue;
            }
            let Ok(hdr) = MethodHeader::decode(w) else {
                return SpanOutcome::Fault(FaultCode::MalformedCommand);
            };
            let n = hdr.payload_words() as usize;
            if i + 1 + n > words.len() {
                // Truncated command: the span ends inside the payload.
                return SpanOutcome::Fault(FaultCode::MalformedCommand);
            }
            match self.run_command(&hdr, &words[i + 1..i + 1 + n], &words[..i], skip) {
                Ok(Step::Continue) => {
                    i += 1 + n;
                    skip = 0;
                }
                Ok(Step::Blocked) => {
                    // `run_command` already recorded how far it got.
                    let (_, applied) = self.exec.resume.take().unwrap_or((0, 0));
                    self.exec.resume = Some((i, applied));
                    return SpanOutcome::Blocked;
                }
                Err(code) => return SpanOutcome::Fault(code),
            }
        }
        SpanOutcome::Done
    }

    /// Run one command, skipping the first `skip` payload applications (they
    /// completed before the span parked).
    fn run_command(
        &mut self,
        hdr: &MethodHeader,
        payload: &[u32],
        span_prefix: &[u32],
        skip: usize,
    ) -> Result<Step, FaultCode> {
        if hdr.mode == MethodMode::Immediate {
            if skip > 0 {
                return Ok(Step::Continue);
            }
            return match self.apply(hdr.subchannel, hdr.method, hdr.count_or_data, span_prefix)? {
                Step::Blocked => {
                    self.exec.resume = Some((0, 0));
                    Ok(Step::Blocked)
                }
                Step::Continue => Ok(Step::Continue),
            };
        }

        for (k, value) in payload.iter().enumerate().skip(skip) {
            let method = match hdr.mode {
                MethodMode::Increment => hdr.method + 4 * k as u32,
                MethodMode::NonIncrement => hdr.method,
                MethodMode::IncrementOnce => hdr.method + 4 * k.min(1) as u32,
                MethodMode::Immediate => unreachable!(),
            };
            match self.apply(hdr.subchannel, method, *value, span_prefix)? {
                Step::Continue => {}
                Step::Blocked => {
                    self.exec.resume = Some((0, k));
                    return Ok(Step::Blocked);
                }
            }
        }
        Ok(Step::Continue)
    }

    fn apply(
        &mut self,
        subchannel: u32,
        method: u32,
        value: u32,
        span_prefix: &[u32],
    ) -> Result<Step, FaultCode> {
        if method >= u32::from(CHANNEL_METHOD_LIMIT) {
            // Object method: forwarded to whatever is bound; the transport
            // does not interpret it.
            return Ok(Step::Continue);
        }
        let st = &mut *self.exec;
        match method as u16 {
            SET_OBJECT => st.bindings[subchannel as usize] = Some(value),
            SEM_ADDR_HI => st.sem_addr = (st.sem_addr & 0xFFFF_FFFF) | (u64::from(value) << 32),
            SEM_ADDR_LO => {
                if value & 3 != 0 {
                    return Err(FaultCode::MalformedCommand);
                }
                st.sem_addr = (st.sem_addr & !0xFFFF_FFFF) | u64::from(value);
            }
            SEM_PAYLOAD_LO => st.sem_payload_lo = value,
            SEM_PAYLOAD_HI => st.sem_payload_hi = value,
            SEM_EXECUTE => return self.sem_execute(value),
            SYNCPT_PAYLOAD => st.syncpt_payload = value,
            SYNCPT_EXECUTE => return self.syncpt_execute(value),
            CRC_CHECK => {
                if !self.caps.crc {
                    return Err(FaultCode::MalformedCommand);
                }
                if crc32(span_prefix) != value {
                    return Err(FaultCode::CrcMismatch);
                }
            }
            _ => return Err(FaultCode::MalformedCommand),
        }
        Ok(Step::Continue)
    }

    fn sem_execute(&mut self, word: u32) -> Result<Step, FaultCode> {
        let Ok(exec) = SemExecute::decode(word) else {
            return Err(FaultCode::MalformedCommand);
        };
        if exec.payload64 && !self.caps.sem64 {
            return Err(FaultCode::MalformedCommand);
        }
        let st = &*self.exec;
        let payload = if exec.payload64 {
            (u64::from(st.sem_payload_hi) << 32) | u64::from(st.sem_payload_lo)
        } else {
            u64::from(st.sem_payload_lo)
        };
        let va = st.sem_addr;
        let Some(cell) = self.semaphores.iter().find(|c| c.gpu_va() == va) else {
            return Err(FaultCode::MmuFault { va });
        };

        match exec.op {
            SemOp::Acquire => {
                if cell.read() != payload {
                    return Ok(Step::Blocked);
                }
            }
            SemOp::AcquireGeq => {
                if cell.read() < payload {
                    return Ok(Step::Blocked);
                }
            }
            SemOp::Release => {
                if exec.payload64 {
                    cell.write(payload);
                } else {
                    cell.write32(payload as u32);
                }
                self.complete_release(cell, &exec);
            }
            SemOp::Reduction => {
                let op = exec.reduction.expect("decode guarantees a reduction op");
                cell.fetch_update(|cur| op.apply(cur, payload));
                self.complete_release(cell, &exec);
            }
        }
        Ok(Step::Continue)
    }

    fn complete_release(&mut self, cell: &SemaphoreCell, exec: &SemExecute) {
        if exec.release_timestamp {
            *self.timestamp += 1;
            cell.write_timestamp(*self.timestamp);
        }
        if exec.awaken {
            self.awaken_log.push(self.chid);
        }
    }

    fn syncpt_execute(&mut self, word: u32) -> Result<Step, FaultCode> {
        if !self.caps.syncpoints {
            return Err(FaultCode::MalformedCommand);
        }
        let exec = SyncptExecute::decode(word);
        match exec.op {
            SyncptOp::Increment => {
                self.syncpoints.increment(exec.id);
            }
            SyncptOp::Wait => {
                if !self.syncpoints.reached(exec.id, self.exec.syncpt_payload) {
                    return Ok(Step::Blocked);
                }
            }
        }
        Ok(Step::Continue)
    }
}
