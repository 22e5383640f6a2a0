mod common;

use std::time::{Duration, Instant};

use selink::{Config, Event, SessionId};

use crate::common::*;

fn counter_synced(c: &mut selink::SecureChannel) -> Option<SessionId> {
    while let Some(event) = c.poll_event() {
        if let Event::CounterSynced { session } = event {
            return Some(session);
        }
    }
    None
}

fn session_evicted(c: &mut selink::SecureChannel) -> Option<SessionId> {
    while let Some(event) = c.poll_event() {
        if let Event::SessionEvicted { session } = event {
            return Some(session);
        }
    }
    None
}

#[test]
fn desynchronized_window_is_repaired_by_sync_exchange() {
    init_log();
    let now = Instant::now();
    let ca = TestCa::new();

    let commissioner_addr = addr(6000);
    let device_addr = addr(6001);

    let mut commissioner = channel(&ca);
    let mut device = channel(&ca);
    device.set_pase_verifier(pase_verifier());

    let c_id = commissioner
        .connect_pase(now, device_addr, prover())
        .unwrap();
    drive(now, &mut commissioner, commissioner_addr, &mut device, device_addr);
    established(&mut commissioner).unwrap();
    let (d_id, _, _, _) = established(&mut device).unwrap();

    // The device's receive window jumps far ahead, as if its state were
    // restored from a stale snapshot. Everything the commissioner sends now
    // looks ancient.
    device
        .session_mut(d_id)
        .unwrap()
        .receive_counter_mut()
        .reset_to(1_000_000);

    // Three consecutive too-old rejections trip the sync request.
    for _ in 0..3 {
        commissioner.send(c_id, b"lost").unwrap();
        drive(now, &mut commissioner, commissioner_addr, &mut device, device_addr);
    }
    assert_eq!(counter_synced(&mut device), Some(d_id));
    assert!(received(&mut device).is_none());

    // The repaired window admits fresh traffic again.
    commissioner.send(c_id, b"after repair").unwrap();
    drive(now, &mut commissioner, commissioner_addr, &mut device, device_addr);
    let (got, payload) = received(&mut device).unwrap();
    assert_eq!(got, d_id);
    assert_eq!(payload, b"after repair");
}

#[test]
fn exhausted_sync_retries_leave_the_session_up() {
    init_log();
    let now = Instant::now();
    let ca = TestCa::new();

    let commissioner_addr = addr(6010);
    let device_addr = addr(6011);

    let mut commissioner = channel(&ca);
    let mut device = channel_with(Config::builder().sync_retries(2).build().unwrap(), &ca);
    device.set_pase_verifier(pase_verifier());

    commissioner.connect_pase(now, device_addr, prover()).unwrap();
    drive(now, &mut commissioner, commissioner_addr, &mut device, device_addr);
    established(&mut commissioner).unwrap();
    let (d_id, _, _, _) = established(&mut device).unwrap();

    device.request_counter_sync(now, d_id).unwrap();

    // The peer never answers; every retry datagram is lost.
    let mut rounds = 0;
    while let Some(at) = device.poll_timeout() {
        assert!(rounds < 10, "sync retries must be bounded");
        rounds += 1;
        device.handle_timeout(at + Duration::from_millis(1));
        while device.poll_datagram().is_some() {}
    }

    // Giving up does not tear the session down.
    assert!(device.session(d_id).is_some());
    assert_eq!(device.poll_timeout(), None);
}

#[test]
fn replayed_datagram_is_delivered_once() {
    init_log();
    let now = Instant::now();
    let ca = TestCa::new();

    let commissioner_addr = addr(6020);
    let device_addr = addr(6021);

    let mut commissioner = channel(&ca);
    let mut device = channel(&ca);
    device.set_pase_verifier(pase_verifier());

    let c_id = commissioner.connect_pase(now, device_addr, prover()).unwrap();
    drive(now, &mut commissioner, commissioner_addr, &mut device, device_addr);
    established(&mut commissioner).unwrap();
    established(&mut device).unwrap();

    commissioner.send(c_id, b"once").unwrap();
    let (_, datagram) = commissioner.poll_datagram().unwrap();

    device.handle_receive(now, commissioner_addr, &datagram).unwrap();
    device.handle_receive(now, commissioner_addr, &datagram).unwrap();

    assert!(received(&mut device).is_some());
    assert!(received(&mut device).is_none());
}

#[test]
fn full_table_evicts_oldest_commissioning_session() {
    init_log();
    let now = Instant::now();
    let ca = TestCa::new();

    let device_addr = addr(6031);

    let mut device = channel_with(Config::builder().max_sessions(1).build().unwrap(), &ca);
    device.set_pase_verifier(pase_verifier());

    let mut first = channel(&ca);
    first.connect_pase(now, device_addr, prover()).unwrap();
    drive(now, &mut first, addr(6030), &mut device, device_addr);
    established(&mut first).unwrap();
    let (old_id, _, _, _) = established(&mut device).unwrap();

    // The table is full; a new pairing displaces the old commissioning
    // session instead of failing.
    let mut second = channel(&ca);
    second.connect_pase(now, device_addr, prover()).unwrap();
    drive(now, &mut second, addr(6032), &mut device, device_addr);

    assert!(established(&mut second).is_some());
    assert_eq!(session_evicted(&mut device), Some(old_id));
    assert!(established(&mut device).is_some());
    assert_eq!(device.sessions().count(), 1);
}
