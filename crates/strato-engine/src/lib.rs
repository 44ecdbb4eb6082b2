//! A software model of the consuming engine.
//!
//! `SimEngine` implements the channel's [`EngineBus`] seam faithfully enough
//! to exercise the whole submission protocol without hardware: it fetches
//! entries slot-by-slot, interprets channel methods (semaphores, syncpoints,
//! CRC trailers, object binds), parks a channel on an unsatisfied acquire
//! without advancing any cursor, honors polled-vs-doorbell notification per
//! generation, and reports injected or execution faults as robust channel
//! errors. One engine hosts many channels, mirroring how channels in a group
//! share an execution context.
//!
//! This is a device model, not a test harness; the integration tests under
//! `tests/` drive it the way a machine would tick a device.

#![forbid(unsafe_code)]

mod exec;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use strato_channel::{CursorSnapshot, EngineBus, FaultCode, FaultInfo, RingDesc};
use strato_mem::{DmaBuf, SemaphoreCell, SyncpointTable};
use strato_protocol::{ControlOpcode, GenCaps, Generation, GpEntry};

use exec::{ExecState, SpanOutcome, SpanRunner};

const TOKEN_TAG: u32 = 0xD000_0000;

/// Number of syncpoint counters the engine exposes.
pub const SYNCPOINT_COUNT: usize = 64;

#[derive(Debug, Default)]
struct ChState {
    rings: Option<RingDesc>,
    published_gp_put: u32,
    gp_get: u32,
    pb_get: u64,
    scheduled: bool,
    doorbell_pending: bool,
    fault: Option<FaultInfo>,
    ext_base: u64,
    exec: ExecState,
}

#[derive(Default)]
struct EngineInner {
    channels: BTreeMap<u32, ChState>,
    semaphores: Vec<SemaphoreCell>,
    blocks: Vec<DmaBuf>,
    awaken_log: Vec<u32>,
    timestamp: u64,
    next_handle: u32,
    doorbells: u64,
}

/// One engine, many channels. Thread-safe: a pump thread ticks it while
/// producer threads submit.
pub struct SimEngine {
    generation: Generation,
    caps: GenCaps,
    syncpoints: SyncpointTable,
    inner: Mutex<EngineInner>,
}

impl SimEngine {
    pub fn new(generation: Generation) -> Self {
        Self {
            generation,
            caps: generation.caps(),
            syncpoints: SyncpointTable::new(SYNCPOINT_COUNT),
            inner: Mutex::new(EngineInner::default()),
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Register a semaphore cell so spans can address it by GPU VA.
    pub fn map_semaphore(&self, cell: &SemaphoreCell) {
        self.inner.lock().unwrap().semaphores.push(cell.clone());
    }

    /// Register an external command block (for subroutine calls).
    pub fn map_block(&self, buf: &DmaBuf) {
        self.inner.lock().unwrap().blocks.push(buf.clone());
    }

    /// Handle onto the engine's syncpoint counters (host waits and test
    /// nudging go through this).
    pub fn syncpoints(&self) -> SyncpointTable {
        self.syncpoints.clone()
    }

    /// Report a robust channel error on `chid`, as hardware would
    /// asynchronously.
    pub fn inject_fault(&self, chid: u32, code: FaultCode, recoverable: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ch) = inner.channels.get_mut(&chid) {
            warn!(chid, %code, "fault injected");
            ch.fault = Some(FaultInfo {
                chid,
                code,
                recoverable,
            });
        }
    }

    pub fn set_scheduled(&self, chid: u32, scheduled: bool) {
        if let Some(ch) = self.inner.lock().unwrap().channels.get_mut(&chid) {
            ch.scheduled = scheduled;
        }
    }

    /// Drain the awaken event log. Ordering across channels sharing the
    /// notification path is unspecified; only per-channel counts are
    /// meaningful.
    pub fn take_awaken_events(&self) -> Vec<u32> {
        std::mem::take(&mut self.inner.lock().unwrap().awaken_log)
    }

    pub fn doorbell_count(&self) -> u64 {
        self.inner.lock().unwrap().doorbells
    }

    /// The pushbuffer backing store registered for `chid`.
    pub fn pushbuf(&self, chid: u32) -> Option<DmaBuf> {
        self.inner
            .lock()
            .unwrap()
            .channels
            .get(&chid)
            .and_then(|ch| ch.rings.as_ref().map(|r| r.pushbuf.clone()))
    }

    /// Object handle bound on a subchannel, if any.
    pub fn object_binding(&self, chid: u32, subchannel: usize) -> Option<u32> {
        self.inner
            .lock()
            .unwrap()
            .channels
            .get(&chid)
            .and_then(|ch| ch.exec.binding(subchannel))
    }

    /// One scheduling pass over every channel.
    pub fn tick(&self) {
        let mut inner = self.inner.lock().unwrap();
        let chids: Vec<u32> = inner.channels.keys().copied().collect();
        for chid in chids {
            Self::process_channel(&mut inner, &self.caps, &self.syncpoints, chid);
        }
    }

    fn process_channel(
        inner: &mut EngineInner,
        caps: &GenCaps,
        syncpoints: &SyncpointTable,
        chid: u32,
    ) {
        loop {
            let EngineInner {
                channels,
                semaphores,
                blocks,
                awaken_log,
                timestamp,
                ..
            } = inner;
            let Some(ch) = channels.get_mut(&chid) else {
                return;
            };
            if !ch.scheduled || ch.fault.is_some() {
                return;
            }
            // Doorbell generations only fetch after a ring; the pending flag
            // stays up until the channel drains so a parked span keeps
            // getting scheduled.
            if caps.doorbell && !ch.doorbell_pending {
                return;
            }
            if ch.gp_get == ch.published_gp_put {
                ch.doorbell_pending = false;
                return;
            }
            let Some(rings) = ch.rings.clone() else {
                return;
            };

            let mask = rings.entry_count - 1;
            let slot = (ch.gp_get & mask) as usize;
            let mut raw = [0u32; 2];
            rings.gpfifo.read_span(slot * 2, &mut raw);

            let entry = match GpEntry::decode(raw, ch.ext_base) {
                Ok(entry) => entry,
                Err(_) => {
                    ch.fault = Some(FaultInfo {
                        chid,
                        code: FaultCode::MalformedCommand,
                        recoverable: true,
                    });
                    return;
                }
            };

            match entry {
                GpEntry::Control { opcode, operand } => {
                    if opcode == ControlOpcode::SetExtendedBase {
                        ch.ext_base = GpEntry::extended_base_value(operand);
                    }
                    ch.gp_get = ch.gp_get.wrapping_add(1);
                }
                GpEntry::Span {
                    base, len_words, ..
                } => {
                    let Some((words, in_ring)) =
                        Self::fetch_span(&rings, blocks, base, len_words)
                    else {
                        ch.fault = Some(FaultInfo {
                            chid,
                            code: FaultCode::MmuFault { va: base },
                            recoverable: true,
                        });
                        return;
                    };
                    let mut runner = SpanRunner {
                        caps,
                        chid,
                        semaphores: semaphores.as_slice(),
                        syncpoints,
                        awaken_log,
                        timestamp,
                        exec: &mut ch.exec,
                    };
                    match runner.run(&words) {
                        SpanOutcome::Done => {
                            if in_ring {
                                ch.pb_get += u64::from(len_words);
                            }
                            ch.gp_get = ch.gp_get.wrapping_add(1);
                            ch.exec.clear_park();
                        }
                        SpanOutcome::Blocked => return,
                        SpanOutcome::Fault(code) => {
                            ch.fault = Some(FaultInfo {
                                chid,
                                code,
                                recoverable: true,
                            });
                            return;
                        }
                    }
                }
            }
        }
    }

    fn fetch_span(
        rings: &RingDesc,
        blocks: &[DmaBuf],
        base: u64,
        len_words: u32,
    ) -> Option<(Vec<u32>, bool)> {
        let len = len_words as usize;
        if let Some(idx) = rings.pushbuf.word_index_of(base) {
            if idx + len <= rings.pushbuf.len_words() {
                let mut words = vec![0u32; len];
                rings.pushbuf.read_span(idx, &mut words);
                return Some((words, true));
            }
            return None;
        }
        for buf in blocks {
            if let Some(idx) = buf.word_index_of(base) {
                if idx + len <= buf.len_words() {
                    let mut words = vec![0u32; len];
                    buf.read_span(idx, &mut words);
                    return Some((words, false));
                }
                return None;
            }
        }
        None
    }

    fn idle(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.channels.values().all(|ch| {
            // Faulted channels are halted; they do not hold up idle.
            ch.fault.is_some() || (ch.gp_get == ch.published_gp_put && !ch.exec.parked())
        })
    }
}

/// Per-channel [`EngineBus`] handle.
pub struct SimChannelBus {
    engine: Arc<SimEngine>,
    chid: u32,
}

impl SimChannelBus {
    /// Register `chid` on the engine and create the per-channel bus handle a
    /// `Channel` is constructed over.
    pub fn attach(engine: &Arc<SimEngine>, chid: u32) -> Arc<Self> {
        engine
            .inner
            .lock()
            .unwrap()
            .channels
            .entry(chid)
            .or_default();
        Arc::new(Self {
            engine: engine.clone(),
            chid,
        })
    }

    pub fn engine(&self) -> &Arc<SimEngine> {
        &self.engine
    }

    pub fn chid(&self) -> u32 {
        self.chid
    }
}

impl EngineBus for SimChannelBus {
    fn class_id(&self) -> u32 {
        self.engine.generation.class_id()
    }

    fn configure(&self, rings: RingDesc) {
        debug_assert_eq!(rings.chid, self.chid, "ring descriptor chid mismatch");
        let mut inner = self.engine.inner.lock().unwrap();
        let ch = inner.channels.entry(self.chid).or_default();
        ch.rings = Some(rings);
        debug!(chid = self.chid, "rings configured");
    }

    fn pb_get_words(&self, _subunit: u32) -> u64 {
        self.engine
            .inner
            .lock()
            .unwrap()
            .channels
            .get(&self.chid)
            .map_or(0, |ch| ch.pb_get)
    }

    fn gp_get(&self) -> u32 {
        self.engine
            .inner
            .lock()
            .unwrap()
            .channels
            .get(&self.chid)
            .map_or(0, |ch| ch.gp_get)
    }

    fn publish_gp_put(&self, gp_put: u32) {
        let mut inner = self.engine.inner.lock().unwrap();
        if let Some(ch) = inner.channels.get_mut(&self.chid) {
            ch.published_gp_put = gp_put;
        }
    }

    fn ring_doorbell(&self, token: u32) {
        let mut inner = self.engine.inner.lock().unwrap();
        inner.doorbells += 1;
        let chid = token & !TOKEN_TAG;
        if let Some(ch) = inner.channels.get_mut(&chid) {
            ch.doorbell_pending = true;
        }
    }

    fn work_submit_token(&self) -> u32 {
        TOKEN_TAG | self.chid
    }

    fn bind_object(&self, _subchannel: u32, class: u32) -> u32 {
        let mut inner = self.engine.inner.lock().unwrap();
        inner.next_handle += 1;
        (class << 16) | inner.next_handle
    }

    fn set_scheduled(&self, scheduled: bool) {
        self.engine.set_scheduled(self.chid, scheduled);
    }

    fn fault(&self) -> Option<FaultInfo> {
        self.engine
            .inner
            .lock()
            .unwrap()
            .channels
            .get(&self.chid)
            .and_then(|ch| ch.fault)
    }

    fn acknowledge_fault(&self) -> CursorSnapshot {
        let mut inner = self.engine.inner.lock().unwrap();
        let ch = inner.channels.entry(self.chid).or_default();
        // Quiesce: outstanding entries are discarded, the partially-consumed
        // span is abandoned, and the sticky extended base resets with the
        // producer's.
        ch.fault = None;
        ch.gp_get = ch.published_gp_put;
        ch.exec.clear_park();
        ch.ext_base = 0;
        ch.doorbell_pending = false;
        debug!(
            chid = self.chid,
            pb_get = ch.pb_get,
            gp_get = ch.gp_get,
            "fault acknowledged"
        );
        CursorSnapshot {
            pb_get_words: ch.pb_get,
            gp_get: ch.gp_get,
        }
    }

    fn reset_engine(&self) {
        let mut inner = self.engine.inner.lock().unwrap();
        for ch in inner.channels.values_mut() {
            ch.fault = None;
            ch.gp_get = ch.published_gp_put;
            ch.exec.clear_park();
            ch.doorbell_pending = false;
        }
        warn!("engine reset");
    }

    fn is_idle(&self) -> bool {
        self.engine.idle()
    }
}

/// Background pump: ticks the engine until dropped.
pub struct EnginePump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EnginePump {
    pub fn spawn(engine: Arc<SimEngine>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                engine.tick();
                std::thread::sleep(Duration::from_micros(50));
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for EnginePump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
