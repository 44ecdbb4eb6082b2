use std::sync::Arc;
use std::time::Duration;

use super::TestBus;
use crate::config::MAX_BURST_WORDS;
use crate::engine::{CursorSnapshot, FaultCode, FaultInfo};
use crate::policy::Threshold;
use crate::{Channel, ChannelConfig, ChannelError, ChannelState, ConfigError};
use strato_protocol::{Generation, MethodHeader, SET_OBJECT};

fn config() -> ChannelConfig {
    ChannelConfig {
        pushbuf_words: 0x4000,
        entry_count: 8,
        timeout: Duration::from_millis(100),
        ..Default::default()
    }
}

fn active_channel(gen: Generation, auto_drain: bool) -> (Channel, Arc<TestBus>) {
    let bus = Arc::new(TestBus::new(gen.class_id(), auto_drain));
    let ch = Channel::new(config(), bus.clone()).unwrap();
    (ch, bus)
}

#[test]
fn construction_registers_rings_and_schedules() {
    let (ch, bus) = active_channel(Generation::Volta, false);
    assert_eq!(ch.state(), ChannelState::Active);
    let state = bus.state.lock().unwrap();
    let rings = state.rings.as_ref().unwrap();
    assert_eq!(rings.entry_count, 8);
    assert_eq!(rings.pushbuf.len_words(), 0x4000);
    assert!(state.scheduled);
}

#[test]
fn crc_mode_requires_the_capability() {
    let bus = Arc::new(TestBus::new(Generation::Volta.class_id(), false));
    let cfg = ChannelConfig {
        crc_mode: true,
        ..config()
    };
    assert_eq!(
        Channel::new(cfg, bus).err(),
        Some(ConfigError::CrcUnsupported)
    );
}

#[test]
fn unknown_class_is_a_config_error() {
    let bus = Arc::new(TestBus::new(0xDEAD, false));
    assert!(matches!(
        Channel::new(config(), bus),
        Err(ConfigError::UnknownClass(_))
    ));
}

#[test]
fn write_advances_put_by_header_plus_payload() {
    let (mut ch, _bus) = active_channel(Generation::Fermi, false);
    ch.write(0, 0x0104, &[1, 2, 3]).unwrap();
    assert_eq!(ch.put_words(), 4);
    assert_eq!(ch.free_words(), 0x4000 - 4);
    assert_eq!(ch.gp_put(), 0, "nothing staged before a close");
}

#[test]
fn flush_is_idempotent() {
    let (mut ch, bus) = active_channel(Generation::Fermi, true);
    ch.write(0, 0x0104, &[7]).unwrap();
    ch.flush().unwrap();
    ch.flush().unwrap();
    let state = bus.state.lock().unwrap();
    assert_eq!(state.publishes.len(), 1, "one hardware-visible update");
    assert_eq!(state.publishes[0], 1);
}

#[test]
fn doorbell_rings_only_on_doorbell_generations() {
    let (mut ch, bus) = active_channel(Generation::Fermi, true);
    ch.write(0, 0x0104, &[7]).unwrap();
    ch.flush().unwrap();
    assert!(bus.state.lock().unwrap().doorbells.is_empty());

    let (mut ch, bus) = active_channel(Generation::Volta, true);
    ch.write(0, 0x0104, &[7]).unwrap();
    ch.flush().unwrap();
    let state = bus.state.lock().unwrap();
    assert_eq!(state.doorbells.len(), 1);
    assert_eq!(state.doorbells[0], 0x1000);
}

#[test]
fn spans_round_trip_through_entries() {
    let (mut ch, bus) = active_channel(Generation::Fermi, true);
    ch.write(2, 0x0200, &[0xAA, 0xBB]).unwrap();
    ch.flush().unwrap();

    let state = bus.state.lock().unwrap();
    assert_eq!(state.spans.len(), 1);
    let span = state.spans[0];
    assert_eq!(span.len_words, 3);
    assert!(!span.subroutine);

    // The referenced bytes are exactly the bytes written between the entry
    // boundaries.
    let rings = state.rings.as_ref().unwrap();
    let start = rings.pushbuf.word_index_of(span.base).unwrap();
    let mut words = [0u32; 3];
    rings.pushbuf.read_span(start, &mut words);
    let hdr = MethodHeader::decode(words[0]).unwrap();
    assert_eq!(hdr.subchannel, 2);
    assert_eq!(hdr.method, 0x0200);
    assert_eq!(&words[1..], &[0xAA, 0xBB]);
}

#[test]
fn wrap_pads_to_boundary_and_never_splits_a_command() {
    let (mut ch, bus) = active_channel(Generation::Fermi, true);
    let cap = 0x4000u64;

    // Two maximal commands leave two words before the physical end.
    for _ in 0..2 {
        ch.write_header(0, 0x0100, 0x1FFE).unwrap();
        ch.write_data(&vec![0u32; 0x1FFE]).unwrap();
    }
    assert_eq!(ch.put_words(), cap - 2);
    ch.flush().unwrap();

    // The next 4-word command cannot fit the remaining 2 words: the line is
    // padded, the span closes at the boundary and the command restarts at
    // offset zero.
    ch.write(0, 0x0104, &[1, 2, 3]).unwrap();
    assert_eq!(ch.put_words(), cap + 4);
    ch.flush().unwrap();

    let state = bus.state.lock().unwrap();
    let rings = state.rings.as_ref().unwrap();
    let pb_va = rings.pushbuf.gpu_va();
    for span in &state.spans {
        assert!(span.base >= pb_va);
        assert!(
            span.base + u64::from(span.len_words) * 4 <= pb_va + cap * 4,
            "span crosses the physical end: {span:?}"
        );
    }
    // Pad-only span covering the two dead words, then the wrapped command at
    // offset zero.
    let pad = state.spans[state.spans.len() - 2];
    assert_eq!(pad.len_words, 2);
    assert_eq!(pad.base, pb_va + (cap - 2) * 4);
    let wrapped = state.spans[state.spans.len() - 1];
    assert_eq!(wrapped.base, pb_va);
    assert_eq!(wrapped.len_words, 4);
}

#[test]
fn pushbuffer_backpressure_times_out_without_drain() {
    let (mut ch, _bus) = active_channel(Generation::Fermi, false);
    // Fill the ring to two words short of capacity.
    for _ in 0..2 {
        ch.write_header(0, 0x0100, 0x1FFE).unwrap();
        ch.write_data(&vec![0u32; 0x1FFE]).unwrap();
    }
    let err = ch.write(0, 0x0104, &[1, 2, 3]).unwrap_err();
    assert!(
        matches!(err, ChannelError::Timeout { what, .. } if what == "pushbuffer space"),
        "unexpected error: {err:?}"
    );
}

#[test]
fn entry_ring_backpressure_times_out_without_drain() {
    let (mut ch, _bus) = active_channel(Generation::Fermi, false);
    for _ in 0..8 {
        ch.write(0, 0x0104, &[0]).unwrap();
        ch.flush().unwrap();
    }
    ch.write(0, 0x0104, &[0]).unwrap();
    let err = ch.flush().unwrap_err();
    assert!(
        matches!(err, ChannelError::Timeout { what, .. } if what == "entry ring room"),
        "unexpected error: {err:?}"
    );
}

#[test]
fn blocking_reserve_publishes_staged_work_first() {
    let (mut ch, bus) = active_channel(Generation::Fermi, false);
    for _ in 0..2 {
        ch.write_header(0, 0x0100, 0x1FFE).unwrap();
        ch.write_data(&vec![0u32; 0x1FFE]).unwrap();
    }
    // No flush was called; the blocked write must publish on its own so the
    // engine could drain, even though this bus never does.
    let _ = ch.write(0, 0x0104, &[1, 2, 3]);
    assert!(!bus.state.lock().unwrap().publishes.is_empty());
}

#[test]
fn cached_get_uses_the_slowest_subunit() {
    let bus = Arc::new(TestBus::with_subunits(Generation::Fermi.class_id(), 2));
    let mut ch = Channel::new(config(), bus.clone()).unwrap();
    ch.write(0, 0x0104, &[0; 8]).unwrap();
    ch.flush().unwrap();
    {
        let mut state = bus.state.lock().unwrap();
        state.pb_get = vec![9, 4];
        state.gp_get = 1;
    }
    // Drain wait refreshes the cache; it cannot finish because the slow
    // subunit is behind.
    let err = ch.wait_for_dma_push(Duration::from_millis(20)).unwrap_err();
    assert!(matches!(err, ChannelError::Timeout { .. }));
    assert_eq!(ch.get_words(), 4);
}

#[test]
fn wait_for_dma_push_completes_on_drain() {
    let (mut ch, _bus) = active_channel(Generation::Fermi, true);
    ch.write(0, 0x0104, &[1, 2, 3]).unwrap();
    ch.flush().unwrap();
    ch.wait_for_dma_push(Duration::from_millis(100)).unwrap();
    assert_eq!(ch.get_words(), ch.put_words());
}

#[test]
fn wait_idle_requires_engine_idle() {
    let (mut ch, bus) = active_channel(Generation::Fermi, true);
    ch.write(0, 0x0104, &[1]).unwrap();
    ch.flush().unwrap();
    bus.state.lock().unwrap().idle = false;
    assert!(matches!(
        ch.wait_idle(Duration::from_millis(20)),
        Err(ChannelError::Timeout { .. })
    ));
    bus.state.lock().unwrap().idle = true;
    ch.wait_idle(Duration::from_millis(100)).unwrap();
}

#[test]
fn auto_flush_closes_spans_and_auto_entry_publishes() {
    let bus = Arc::new(TestBus::new(Generation::Fermi.class_id(), true));
    let cfg = ChannelConfig {
        auto_flush_bytes: Some(Threshold::Fixed(16)),
        auto_entry_count: Some(Threshold::Fixed(1)),
        ..config()
    };
    let mut ch = Channel::new(cfg, bus.clone()).unwrap();
    // 4 words = 16 bytes: crosses the span threshold, which stages an entry,
    // which crosses the entry threshold and publishes - no explicit flush.
    ch.write(0, 0x0104, &[1, 2, 3]).unwrap();
    let state = bus.state.lock().unwrap();
    assert_eq!(state.spans.len(), 1);
    assert_eq!(state.publishes.len(), 1);
}

#[test]
fn header_payload_discipline_is_enforced() {
    let (mut ch, _bus) = active_channel(Generation::Fermi, false);
    assert!(matches!(
        ch.write_data(&[1]),
        Err(ChannelError::Misuse(_))
    ));
    ch.write_header(0, 0x0100, 4).unwrap();
    assert!(matches!(
        ch.write(0, 0x0104, &[1]),
        Err(ChannelError::Misuse(_))
    ));
    assert!(matches!(
        ch.write_data(&[1, 2, 3, 4, 5]),
        Err(ChannelError::Misuse(_))
    ));
    ch.write_data(&[1, 2]).unwrap();
    ch.write_data(&[3, 4]).unwrap();
    assert_eq!(ch.put_words(), 5);
    ch.flush().unwrap();
}

#[test]
fn encoding_errors_fail_fast() {
    let (mut ch, _bus) = active_channel(Generation::Fermi, false);
    assert!(matches!(
        ch.write(9, 0x0104, &[1]),
        Err(ChannelError::Encode(_))
    ));
    assert!(matches!(
        ch.write_imm(0, 0x0104, 0x2000),
        Err(ChannelError::Encode(_))
    ));
    assert_eq!(ch.put_words(), 0, "nothing lands on an encode error");
}

#[test]
fn fault_gates_flush_until_check_error() {
    let (mut ch, bus) = active_channel(Generation::Fermi, true);
    ch.write(0, 0x0104, &[1]).unwrap();
    ch.flush().unwrap();

    let fault = FaultInfo {
        chid: 0,
        code: FaultCode::MmuFault { va: 0xBAD0 },
        recoverable: true,
    };
    {
        let mut state = bus.state.lock().unwrap();
        state.fault = Some(fault);
        state.snapshot = CursorSnapshot {
            pb_get_words: 2,
            gp_get: 1,
        };
    }

    // detect_error is pure: repeated calls see the fault, nothing changes.
    assert!(ch.detect_error());
    assert!(ch.detect_error());

    // Writes into local cursors stay legal; hardware-touching ops refuse.
    ch.write(0, 0x0104, &[2]).unwrap();
    assert!(matches!(ch.flush(), Err(ChannelError::Faulted { .. })));
    assert_eq!(ch.state(), ChannelState::Faulted);

    // check_error consumes the fault and resets cursors to the snapshot.
    let info = ch.check_error().unwrap().unwrap();
    assert_eq!(info, fault);
    assert_eq!(ch.state(), ChannelState::Active);
    assert_eq!(ch.put_words(), 2);
    assert_eq!(ch.get_words(), 2);
    assert_eq!(ch.gp_put(), 1);
    assert!(!ch.detect_error());
    assert_eq!(ch.check_error().unwrap(), None);

    // The channel is usable again.
    ch.write(0, 0x0104, &[3]).unwrap();
    ch.flush().unwrap();
}

#[test]
fn unrecoverable_fault_closes_the_channel() {
    let (mut ch, bus) = active_channel(Generation::Fermi, true);
    bus.state.lock().unwrap().fault = Some(FaultInfo {
        chid: 0,
        code: FaultCode::EngineHung,
        recoverable: false,
    });
    let info = ch.check_error().unwrap().unwrap();
    assert!(!info.recoverable);
    assert_eq!(ch.state(), ChannelState::Closed);
    assert!(matches!(ch.write(0, 0x0104, &[1]), Err(ChannelError::Closed)));
    assert!(matches!(ch.check_error(), Err(ChannelError::Closed)));
}

#[test]
fn unsupported_capabilities_are_refused() {
    let (mut ch, _bus) = active_channel(Generation::Fermi, false);
    let sem = strato_mem::SemaphoreCell::new(0x9000);
    assert!(matches!(
        ch.semaphore_release(&sem, u64::from(u32::MAX) + 1, crate::ReleaseFlags::empty()),
        Err(ChannelError::Unsupported { .. })
    ));
    assert!(matches!(
        ch.syncpoint_increment(3),
        Err(ChannelError::Unsupported { .. })
    ));

    let (mut ch, _bus) = active_channel(Generation::Volta, false);
    ch.semaphore_release(&sem, u64::from(u32::MAX) + 1, crate::ReleaseFlags::empty())
        .unwrap();
    ch.syncpoint_increment(3).unwrap();
}

#[test]
fn bind_object_emits_set_object() {
    let (mut ch, bus) = active_channel(Generation::Fermi, true);
    let handle = ch.bind_object(3, 0x0051).unwrap();
    ch.flush().unwrap();

    let state = bus.state.lock().unwrap();
    let span = state.spans[0];
    let rings = state.rings.as_ref().unwrap();
    let start = rings.pushbuf.word_index_of(span.base).unwrap();
    let mut words = [0u32; 2];
    rings.pushbuf.read_span(start, &mut words);
    let hdr = MethodHeader::decode(words[0]).unwrap();
    assert_eq!(hdr.method, u32::from(SET_OBJECT));
    assert_eq!(hdr.subchannel, 3);
    assert_eq!(words[1], handle);
}

#[test]
fn call_subroutine_stages_an_external_entry() {
    let (mut ch, bus) = active_channel(Generation::Fermi, true);
    ch.write(0, 0x0104, &[1]).unwrap();
    ch.call_subroutine(0x8_0000, 16).unwrap();
    ch.flush().unwrap();

    let state = bus.state.lock().unwrap();
    assert_eq!(state.spans.len(), 2);
    assert!(!state.spans[0].subroutine);
    let call = state.spans[1];
    assert!(call.subroutine);
    assert_eq!(call.base, 0x8_0000);
    assert_eq!(call.len_words, 16);
}

#[test]
fn close_drains_and_deschedules() {
    let (mut ch, bus) = active_channel(Generation::Fermi, true);
    ch.write(0, 0x0104, &[1]).unwrap();
    ch.close(Duration::from_millis(100)).unwrap();
    assert_eq!(ch.state(), ChannelState::Closed);
    assert!(!bus.state.lock().unwrap().scheduled);
    // Closing twice is a no-op.
    ch.close(Duration::from_millis(100)).unwrap();
}

#[test]
fn max_burst_constant_matches_the_header_field() {
    assert_eq!(MAX_BURST_WORDS, 0x2000);
}
