//! Robust channel errors: detection, quiesce, cursor restore, group fan-out.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use strato_channel::{
    Channel, ChannelConfig, ChannelError, ChannelGroup, ChannelState, FaultCode,
};
use strato_engine::{SimChannelBus, SimEngine};
use strato_mem::SemaphoreCell;
use strato_protocol::Generation;

fn config(chid: u32) -> ChannelConfig {
    ChannelConfig {
        chid,
        pushbuf_words: 0x4000,
        entry_count: 8,
        timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

#[test]
fn injected_fault_detect_then_recover() {
    let engine = Arc::new(SimEngine::new(Generation::Fermi));
    let mut ch = Channel::new(config(5), SimChannelBus::attach(&engine, 5)).unwrap();

    // One consumed command so the authoritative cursors are non-trivial.
    ch.write(0, 0x0104, &[1]).unwrap();
    ch.flush().unwrap();
    engine.tick();

    engine.inject_fault(5, FaultCode::EngineHung, true);

    // detect_error is pure: poll it as often as you like.
    assert!(ch.detect_error());
    assert!(ch.detect_error());

    // Local writes still land; hardware-touching calls refuse.
    ch.write(0, 0x0104, &[2, 3]).unwrap();
    assert!(matches!(ch.flush(), Err(ChannelError::Faulted { .. })));
    assert_eq!(ch.state(), ChannelState::Faulted);

    let info = ch.check_error().unwrap().unwrap();
    assert_eq!(info.code, FaultCode::EngineHung);
    assert_eq!(ch.state(), ChannelState::Active);
    // Cursors restored to what the engine actually consumed: the first
    // 2-word command; the post-fault write was invalidated.
    assert_eq!(ch.put_words(), 2);
    assert_eq!(ch.get_words(), 2);
    assert!(!ch.detect_error());

    // Forward progress resumes.
    ch.write(0, 0x0104, &[4]).unwrap();
    ch.flush().unwrap();
    engine.tick();
    ch.wait_for_dma_push(Duration::from_secs(1)).unwrap();
}

#[test]
fn malformed_channel_method_faults_mid_stream() {
    let engine = Arc::new(SimEngine::new(Generation::Fermi));
    let mut ch = Channel::new(config(6), SimChannelBus::attach(&engine, 6)).unwrap();

    ch.write(0, 0x0104, &[1]).unwrap();
    ch.flush().unwrap();
    // 0x00F0 is inside the channel-method range but assigned to nothing.
    ch.write(0, 0x00F0, &[0]).unwrap();
    ch.flush().unwrap();
    engine.tick();

    assert!(ch.detect_error());
    let info = ch.check_error().unwrap().unwrap();
    assert_eq!(info.code, FaultCode::MalformedCommand);
    // The good entry was consumed before the fault; the bad one was
    // discarded, not partially applied.
    assert_eq!(ch.put_words(), 2);
    assert_eq!(ch.get_words(), 2);
    assert_eq!(ch.gp_put(), ch.gp_get());
}

#[test]
fn unmapped_subroutine_target_is_an_mmu_fault() {
    let engine = Arc::new(SimEngine::new(Generation::Fermi));
    let mut ch = Channel::new(config(7), SimChannelBus::attach(&engine, 7)).unwrap();

    ch.call_subroutine(0xDEAD_0000, 4).unwrap();
    ch.flush().unwrap();
    engine.tick();

    let info = ch.check_error().unwrap().unwrap();
    assert_eq!(info.code, FaultCode::MmuFault { va: 0xDEAD_0000 });
}

#[test]
fn unrecoverable_fault_closes_after_engine_reset() {
    let engine = Arc::new(SimEngine::new(Generation::Fermi));
    let mut ch = Channel::new(config(8), SimChannelBus::attach(&engine, 8)).unwrap();

    engine.inject_fault(8, FaultCode::EngineHung, false);
    let info = ch.check_error().unwrap().unwrap();
    assert!(!info.recoverable);
    assert_eq!(ch.state(), ChannelState::Closed);
    assert!(matches!(
        ch.write(0, 0x0104, &[0]),
        Err(ChannelError::Closed)
    ));
}

#[test]
fn group_fault_recovers_every_member() {
    let engine = Arc::new(SimEngine::new(Generation::Fermi));
    let a = Channel::new(config(1), SimChannelBus::attach(&engine, 1)).unwrap();
    let b = Channel::new(config(2), SimChannelBus::attach(&engine, 2)).unwrap();

    let sem = SemaphoreCell::new(0xB_0000);
    engine.map_semaphore(&sem);
    let mut group = ChannelGroup::new(vec![a, b], sem).unwrap();

    group
        .submit_ordered(0, |ch| ch.write(0, 0x0104, &[1]))
        .unwrap();
    group
        .submit_ordered(1, |ch| ch.write(0, 0x0104, &[2]))
        .unwrap();
    for _ in 0..4 {
        engine.tick();
    }
    assert!(!group.detect_error());

    engine.inject_fault(1, FaultCode::MalformedCommand, true);
    assert!(group.detect_error());

    let faults = group.check_error().unwrap();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].0, 0);
    assert_eq!(faults[0].1.code, FaultCode::MalformedCommand);

    // Both members quiesced back to consistent cursors and stay usable.
    for i in 0..2 {
        let ch = group.channel_mut(i);
        assert_eq!(ch.state(), ChannelState::Active);
        assert_eq!(ch.put_words(), ch.get_words());
        ch.write(0, 0x0104, &[9]).unwrap();
        ch.flush().unwrap();
    }
    for _ in 0..4 {
        engine.tick();
    }
    assert!(!group.detect_error());
}
