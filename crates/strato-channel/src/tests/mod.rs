//! In-crate tests and the `TestBus` engine double.
//!
//! `TestBus` gives tests direct control over cursors, faults and idle state.
//! In auto-drain mode it decodes published entries and retires them
//! immediately, recording every span it saw; in manual mode cursors move
//! only when the test moves them. The full consumer model (method
//! interpretation, stalling acquires, doorbell gating) lives in the engine
//! crate; this double is just enough hardware for the producer-side paths.

mod channel_ops;

use std::sync::Mutex;

use crate::engine::{CursorSnapshot, EngineBus, FaultInfo, RingDesc};
use strato_protocol::GpEntry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SeenSpan {
    pub base: u64,
    pub len_words: u32,
    pub subroutine: bool,
}

#[derive(Default)]
pub(crate) struct TestBusState {
    pub rings: Option<RingDesc>,
    pub pb_get: Vec<u64>,
    pub gp_get: u32,
    pub publishes: Vec<u32>,
    pub doorbells: Vec<u32>,
    pub fault: Option<FaultInfo>,
    pub snapshot: CursorSnapshot,
    pub scheduled: bool,
    pub idle: bool,
    pub ext_base: u64,
    pub spans: Vec<SeenSpan>,
    pub objects: u32,
}

pub(crate) struct TestBus {
    class: u32,
    auto_drain: bool,
    pub state: Mutex<TestBusState>,
}

impl TestBus {
    pub fn new(class: u32, auto_drain: bool) -> Self {
        Self {
            class,
            auto_drain,
            state: Mutex::new(TestBusState {
                pb_get: vec![0],
                snapshot: CursorSnapshot {
                    pb_get_words: 0,
                    gp_get: 0,
                },
                idle: true,
                ..Default::default()
            }),
        }
    }

    pub fn with_subunits(class: u32, subunits: usize) -> Self {
        let bus = Self::new(class, false);
        bus.state.lock().unwrap().pb_get = vec![0; subunits];
        bus
    }

    fn drain(state: &mut TestBusState, gp_put: u32) {
        let Some(rings) = state.rings.clone() else {
            return;
        };
        let mask = rings.entry_count - 1;
        let pb_va = rings.pushbuf.gpu_va();
        let pb_end = pb_va + rings.pushbuf.len_words() as u64 * 4;
        while state.gp_get != gp_put {
            let slot = (state.gp_get & mask) as usize;
            let mut raw = [0u32; 2];
            rings.gpfifo.read_span(slot * 2, &mut raw);
            match GpEntry::decode(raw, state.ext_base).expect("well-formed entry") {
                GpEntry::Control { operand, .. } => {
                    state.ext_base = GpEntry::extended_base_value(operand);
                }
                GpEntry::Span {
                    base,
                    len_words,
                    subroutine,
                    ..
                } => {
                    state.spans.push(SeenSpan {
                        base,
                        len_words,
                        subroutine,
                    });
                    if base >= pb_va && base + u64::from(len_words) * 4 <= pb_end {
                        for get in state.pb_get.iter_mut() {
                            *get += u64::from(len_words);
                        }
                    }
                }
            }
            state.gp_get = state.gp_get.wrapping_add(1);
        }
    }
}

impl EngineBus for TestBus {
    fn class_id(&self) -> u32 {
        self.class
    }

    fn subunits(&self) -> u32 {
        self.state.lock().unwrap().pb_get.len() as u32
    }

    fn configure(&self, rings: RingDesc) {
        self.state.lock().unwrap().rings = Some(rings);
    }

    fn pb_get_words(&self, subunit: u32) -> u64 {
        self.state.lock().unwrap().pb_get[subunit as usize]
    }

    fn gp_get(&self) -> u32 {
        self.state.lock().unwrap().gp_get
    }

    fn publish_gp_put(&self, gp_put: u32) {
        let mut state = self.state.lock().unwrap();
        state.publishes.push(gp_put);
        if self.auto_drain {
            Self::drain(&mut state, gp_put);
        }
    }

    fn ring_doorbell(&self, token: u32) {
        self.state.lock().unwrap().doorbells.push(token);
    }

    fn work_submit_token(&self) -> u32 {
        let state = self.state.lock().unwrap();
        0x1000 + state.rings.as_ref().map_or(0, |r| r.chid)
    }

    fn bind_object(&self, _subchannel: u32, class: u32) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.objects += 1;
        (class << 8) | state.objects
    }

    fn set_scheduled(&self, scheduled: bool) {
        self.state.lock().unwrap().scheduled = scheduled;
    }

    fn fault(&self) -> Option<FaultInfo> {
        self.state.lock().unwrap().fault
    }

    fn acknowledge_fault(&self) -> CursorSnapshot {
        let mut state = self.state.lock().unwrap();
        state.fault = None;
        let snap = state.snapshot;
        for get in state.pb_get.iter_mut() {
            *get = snap.pb_get_words;
        }
        state.gp_get = snap.gp_get;
        state.ext_base = 0;
        snap
    }

    fn reset_engine(&self) {
        let mut state = self.state.lock().unwrap();
        state.fault = None;
        state.idle = true;
    }

    fn is_idle(&self) -> bool {
        self.state.lock().unwrap().idle
    }
}
