#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Instant;

use rand::rngs::OsRng;

use selink::p256::ecdsa::signature::{Signer, Verifier};
use selink::p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use selink::{
    CertificateVerifier, Config, Error, Event, LocalIdentity, MemoryEpochStore, PeerIdentity,
    Role, SecureChannel, SessionId, SessionKind, Spake2pProver, Spake2pVerifier, VerifiedPeer,
};

pub const PASSCODE: &[u8] = b"20202021";
pub const PASE_SALT: &[u8] = b"SPAKE2P Key Salt";
pub const PASE_ITERATIONS: u32 = 1000;

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn prover() -> Spake2pProver {
    Spake2pProver::from_password(PASSCODE, PASE_SALT, PASE_ITERATIONS)
}

pub fn pase_verifier() -> Spake2pVerifier {
    Spake2pVerifier::from_password(PASSCODE, PASE_SALT, PASE_ITERATIONS)
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Test certificate format: fabric id (8, LE), node id (8, LE), SEC1 public
/// key (65), anchor signature over the preceding 81 bytes (64).
const CERT_TBS_LEN: usize = 81;
const CERT_LEN: usize = CERT_TBS_LEN + 64;

/// A throwaway certificate authority issuing test identities.
pub struct TestCa {
    anchor: SigningKey,
}

impl TestCa {
    pub fn new() -> Self {
        TestCa {
            anchor: SigningKey::random(&mut OsRng),
        }
    }

    pub fn verifier(&self) -> CaVerifier {
        CaVerifier {
            anchor: VerifyingKey::from(&self.anchor),
        }
    }

    pub fn identity(&self, fabric_id: u64, node_id: u64) -> LocalIdentity {
        let signing_key = SigningKey::random(&mut OsRng);
        let public = VerifyingKey::from(&signing_key).to_encoded_point(false);

        let mut certificate = Vec::with_capacity(CERT_LEN);
        certificate.extend_from_slice(&fabric_id.to_le_bytes());
        certificate.extend_from_slice(&node_id.to_le_bytes());
        certificate.extend_from_slice(public.as_bytes());

        let signature: Signature = self.anchor.sign(&certificate);
        certificate.extend_from_slice(&signature.to_bytes());

        LocalIdentity::new(fabric_id, node_id, ipk(fabric_id), signing_key, certificate)
    }
}

/// Every member of a fabric shares the identity-protection key. Derive it
/// from the fabric id so independently built identities agree.
pub fn ipk(fabric_id: u64) -> [u8; 16] {
    let mut ipk = [0x5C; 16];
    ipk[..8].copy_from_slice(&fabric_id.to_le_bytes());
    ipk
}

pub struct CaVerifier {
    anchor: VerifyingKey,
}

impl CertificateVerifier for CaVerifier {
    fn verify(&self, certificate: &[u8]) -> Result<VerifiedPeer, Error> {
        if certificate.len() != CERT_LEN {
            return Err(Error::AuthenticationFailed);
        }
        let signature = Signature::from_slice(&certificate[CERT_TBS_LEN..])
            .map_err(|_| Error::AuthenticationFailed)?;
        self.anchor
            .verify(&certificate[..CERT_TBS_LEN], &signature)
            .map_err(|_| Error::AuthenticationFailed)?;

        let mut fabric = [0u8; 8];
        fabric.copy_from_slice(&certificate[..8]);
        let mut node = [0u8; 8];
        node.copy_from_slice(&certificate[8..16]);

        Ok(VerifiedPeer {
            identity: PeerIdentity {
                fabric_id: u64::from_le_bytes(fabric),
                node_id: u64::from_le_bytes(node),
            },
            public_key: certificate[16..CERT_TBS_LEN].to_vec(),
        })
    }
}

pub fn channel_with(config: Config, ca: &TestCa) -> SecureChannel {
    SecureChannel::new(
        config,
        Box::new(ca.verifier()),
        Box::new(MemoryEpochStore::new()),
    )
}

pub fn channel(ca: &TestCa) -> SecureChannel {
    let config = Config::builder().rng_seed(7).build().unwrap();
    channel_with(config, ca)
}

/// Shuttle queued datagrams between two channels until both queues drain.
/// Returns the number of datagrams delivered.
pub fn drive(
    now: Instant,
    a: &mut SecureChannel,
    a_addr: SocketAddr,
    b: &mut SecureChannel,
    b_addr: SocketAddr,
) -> usize {
    let mut delivered = 0;
    loop {
        let mut moved = false;
        while let Some((dst, datagram)) = a.poll_datagram() {
            assert_eq!(dst, b_addr);
            b.handle_receive(now, a_addr, &datagram).unwrap();
            delivered += 1;
            moved = true;
        }
        while let Some((dst, datagram)) = b.poll_datagram() {
            assert_eq!(dst, a_addr);
            a.handle_receive(now, b_addr, &datagram).unwrap();
            delivered += 1;
            moved = true;
        }
        if !moved {
            return delivered;
        }
    }
}

/// Pop events until a `SessionEstablished` shows up.
pub fn established(
    c: &mut SecureChannel,
) -> Option<(SessionId, SessionKind, Role, Option<PeerIdentity>)> {
    while let Some(event) = c.poll_event() {
        if let Event::SessionEstablished {
            session,
            kind,
            role,
            peer,
        } = event
        {
            return Some((session, kind, role, peer));
        }
    }
    None
}

/// Pop events until a `HandshakeFailed` shows up.
pub fn handshake_failed(c: &mut SecureChannel) -> Option<(SocketAddr, Error)> {
    while let Some(event) = c.poll_event() {
        if let Event::HandshakeFailed { peer, error } = event {
            return Some((peer, error));
        }
    }
    None
}

/// Pop events until an `ApplicationData` shows up.
pub fn received(c: &mut SecureChannel) -> Option<(SessionId, Vec<u8>)> {
    while let Some(event) = c.poll_event() {
        if let Event::ApplicationData { session, payload } = event {
            return Some((session, payload));
        }
    }
    None
}
