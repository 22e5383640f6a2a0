mod common;

use std::time::{Duration, Instant};

use selink::{Config, Error, Role, SessionKind, Spake2pProver};

use crate::common::*;

#[test]
fn pairing_establishes_matching_sessions() {
    init_log();
    let now = Instant::now();
    let ca = TestCa::new();

    let commissioner_addr = addr(4000);
    let device_addr = addr(4001);

    let mut commissioner = channel(&ca);
    let mut device = channel(&ca);
    device.set_pase_verifier(pase_verifier());

    let local_id = commissioner
        .connect_pase(now, device_addr, prover())
        .unwrap();
    drive(now, &mut commissioner, commissioner_addr, &mut device, device_addr);

    let (c_id, c_kind, c_role, c_peer) = established(&mut commissioner).unwrap();
    assert_eq!(c_id, local_id);
    assert_eq!(c_kind, SessionKind::Pase);
    assert_eq!(c_role, Role::Initiator);
    assert_eq!(c_peer, None);

    let (d_id, d_kind, d_role, _) = established(&mut device).unwrap();
    assert_eq!(d_kind, SessionKind::Pase);
    assert_eq!(d_role, Role::Responder);

    // Application traffic flows both ways over the new session.
    commissioner.send(c_id, b"read attribute").unwrap();
    drive(now, &mut commissioner, commissioner_addr, &mut device, device_addr);
    let (got, payload) = received(&mut device).unwrap();
    assert_eq!(got, d_id);
    assert_eq!(payload, b"read attribute");

    device.send(d_id, b"attribute value").unwrap();
    drive(now, &mut commissioner, commissioner_addr, &mut device, device_addr);
    let (_, payload) = received(&mut commissioner).unwrap();
    assert_eq!(payload, b"attribute value");
}

#[test]
fn wrong_passcode_commits_nothing() {
    init_log();
    let now = Instant::now();
    let ca = TestCa::new();

    let commissioner_addr = addr(4010);
    let device_addr = addr(4011);

    let mut commissioner = channel(&ca);
    let mut device = channel(&ca);
    device.set_pase_verifier(pase_verifier());

    let wrong = Spake2pProver::from_password(b"11111111", PASE_SALT, PASE_ITERATIONS);
    commissioner.connect_pase(now, device_addr, wrong).unwrap();
    drive(now, &mut commissioner, commissioner_addr, &mut device, device_addr);

    let (_, error) = handshake_failed(&mut commissioner).unwrap();
    assert_eq!(error, Error::AuthenticationFailed);
    assert!(handshake_failed(&mut device).is_some());

    assert_eq!(commissioner.sessions().count(), 0);
    assert_eq!(device.sessions().count(), 0);
}

#[test]
fn repeated_failures_trigger_cooldown() {
    init_log();
    let now = Instant::now();
    let ca = TestCa::new();

    let commissioner_addr = addr(4020);
    let device_addr = addr(4021);

    let mut commissioner = channel(&ca);
    let mut device = channel_with(
        Config::builder().pase_failure_limit(1).build().unwrap(),
        &ca,
    );
    device.set_pase_verifier(pase_verifier());

    // A pairing attempt with the correct passcode, sabotaged on the wire:
    // the confirmation tag in pake3 arrives corrupted.
    commissioner.connect_pase(now, device_addr, prover()).unwrap();

    let (_, pake1) = commissioner.poll_datagram().unwrap();
    device.handle_receive(now, commissioner_addr, &pake1).unwrap();
    let (_, pake2) = device.poll_datagram().unwrap();
    commissioner.handle_receive(now, device_addr, &pake2).unwrap();

    let (_, mut pake3) = commissioner.poll_datagram().unwrap();
    let last = pake3.len() - 1;
    pake3[last] ^= 1;
    device.handle_receive(now, commissioner_addr, &pake3).unwrap();

    assert!(handshake_failed(&mut device).is_some());

    // The failure report addressed to the first commissioner is never
    // delivered; drop it before pumping the second pairing.
    while device.poll_datagram().is_some() {}

    // The device is now in cooldown and turns away even a legitimate
    // attempt.
    let mut second = channel(&ca);
    second.connect_pase(now, device_addr, prover()).unwrap();
    drive(now, &mut second, addr(4022), &mut device, device_addr);

    let (_, error) = handshake_failed(&mut second).unwrap();
    assert_eq!(error, Error::PeerStatus(2));
    assert_eq!(device.sessions().count(), 0);
}

#[test]
fn cleanup_discards_the_pending_attempt() {
    init_log();
    let now = Instant::now();
    let ca = TestCa::new();

    let mut commissioner = channel(&ca);
    commissioner.connect_pase(now, addr(4041), prover()).unwrap();
    assert!(commissioner.poll_timeout().is_some());

    commissioner.cleanup();
    commissioner.cleanup();

    assert_eq!(commissioner.poll_timeout(), None);
    assert!(handshake_failed(&mut commissioner).is_none());
    assert_eq!(commissioner.sessions().count(), 0);
}

#[test]
fn unanswered_handshake_times_out() {
    init_log();
    let now = Instant::now();
    let ca = TestCa::new();

    let mut commissioner = channel(&ca);
    commissioner.connect_pase(now, addr(4031), prover()).unwrap();
    // The pake1 datagram is lost.
    commissioner.poll_datagram().unwrap();

    let deadline = commissioner.poll_timeout().unwrap();
    assert!(deadline > now);

    commissioner.handle_timeout(deadline + Duration::from_millis(1));
    let (_, error) = handshake_failed(&mut commissioner).unwrap();
    assert_eq!(error, Error::HandshakeTimeout);
    assert_eq!(commissioner.poll_timeout(), None);
}
