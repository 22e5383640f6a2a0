//! Crypto session context: the derived keys and counters of one established
//! session.
//!
//! A `SecureSession` is exclusively owned by the registry entry that created
//! it. Call sites refer to it by [`SessionId`]; a dangling id is a typed
//! lookup miss, never aliasing. Keys are zeroed when the session is evicted
//! and never change after the handshake completes; rotating keys means
//! establishing a new session.

use std::net::SocketAddr;
use std::time::Instant;

use zeroize::Zeroize;

use crate::counter::{LocalCounter, PeerCounter, RejectReason};
use crate::crypto::{aead_open, aead_seal, message_nonce};
use crate::error::Error;
use crate::message::MessageHeader;
use crate::registry::SessionId;
use crate::sync::SyncState;

/// Which side of the handshake this node played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Which handshake produced the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Password-authenticated, commissioning only. Always evictable under
    /// resource pressure.
    Pase,
    /// Certificate-authenticated operational session.
    Case,
}

/// Fabric-scoped peer identity. Only assigned after a successful
/// certificate-authenticated handshake; password-authenticated sessions
/// authenticate to a shared secret, not an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    pub fabric_id: u64,
    pub node_id: u64,
}

/// Directional AES-128 session keys.
pub(crate) struct SessionKeys {
    pub encrypt: [u8; 16],
    pub decrypt: [u8; 16],
}

impl SessionKeys {
    /// Split derived key material into directional keys. The first half is
    /// the initiator-to-responder key on both sides.
    pub fn derive(role: Role, okm: &[u8; 32]) -> Self {
        let mut i2r = [0u8; 16];
        let mut r2i = [0u8; 16];
        i2r.copy_from_slice(&okm[..16]);
        r2i.copy_from_slice(&okm[16..]);

        match role {
            Role::Initiator => SessionKeys {
                encrypt: i2r,
                decrypt: r2i,
            },
            Role::Responder => SessionKeys {
                encrypt: r2i,
                decrypt: i2r,
            },
        }
    }
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.encrypt.zeroize();
        self.decrypt.zeroize();
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKeys")
    }
}

/// Material enabling a future abbreviated certificate-authenticated run.
/// Single use, expiring.
#[derive(Clone)]
pub struct ResumptionRecord {
    pub id: [u8; 16],
    pub(crate) shared_secret: [u8; 32],
    pub peer: PeerIdentity,
    pub(crate) created_at: Instant,
}

impl Drop for ResumptionRecord {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

impl std::fmt::Debug for ResumptionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumptionRecord")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Everything fixed at commit time for a new session.
pub(crate) struct SessionSetup {
    pub role: Role,
    pub kind: SessionKind,
    pub local_id: SessionId,
    pub peer_session_id: u16,
    pub peer_addr: SocketAddr,
    pub peer: Option<PeerIdentity>,
    pub local_node: Option<u64>,
    pub peer_node: Option<u64>,
    pub resumption: Option<ResumptionRecord>,
}

/// Why an inbound session datagram was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenError {
    /// AEAD rejected the datagram. Never disclosed to the network.
    Auth,
    /// Counter admission rejected the datagram after the AEAD verified.
    Replay(RejectReason),
}

/// One established session: role, keys, counters and peer facts.
pub struct SecureSession {
    role: Role,
    kind: SessionKind,
    local_id: SessionId,
    peer_session_id: u16,
    peer_addr: SocketAddr,
    peer: Option<PeerIdentity>,
    local_node: Option<u64>,
    peer_node: Option<u64>,
    keys: SessionKeys,
    send_counter: LocalCounter,
    recv_counter: PeerCounter,
    resumption: Option<ResumptionRecord>,
    created_at: Instant,

    /// In-flight counter sync exchange, if any.
    pub(crate) sync: Option<SyncState>,

    /// Consecutive too-old rejections since the last accepted message.
    pub(crate) desync_strikes: u32,
}

impl SecureSession {
    pub(crate) fn new(
        setup: SessionSetup,
        okm: &[u8; 32],
        send_counter: LocalCounter,
        now: Instant,
    ) -> Self {
        SecureSession {
            role: setup.role,
            kind: setup.kind,
            local_id: setup.local_id,
            peer_session_id: setup.peer_session_id,
            peer_addr: setup.peer_addr,
            peer: setup.peer,
            local_node: setup.local_node,
            peer_node: setup.peer_node,
            keys: SessionKeys::derive(setup.role, okm),
            send_counter,
            recv_counter: PeerCounter::new(),
            resumption: setup.resumption,
            created_at: now,
            sync: None,
            desync_strikes: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn local_id(&self) -> SessionId {
        self.local_id
    }

    /// The session id the peer allocated; goes into outbound headers.
    pub fn peer_session_id(&self) -> u16 {
        self.peer_session_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn peer(&self) -> Option<PeerIdentity> {
        self.peer
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Resumption record issued with this session, if any.
    pub fn resumption(&self) -> Option<&ResumptionRecord> {
        self.resumption.as_ref()
    }

    /// Last allocated send counter value.
    pub fn send_counter_current(&self) -> u32 {
        self.send_counter.current()
    }

    /// Mutable access to the receive window. Exposed for embedders that
    /// repair counters through an out-of-band path.
    pub fn receive_counter_mut(&mut self) -> &mut PeerCounter {
        &mut self.recv_counter
    }

    /// Encrypt a payload into a complete outbound datagram.
    ///
    /// Allocates the next send counter and binds the encoded header as
    /// associated data.
    pub(crate) fn seal(&mut self, control: bool, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let counter = self.send_counter.next()?;

        let header = MessageHeader {
            session_id: self.peer_session_id,
            counter,
            source: self.local_node,
            dest: self.peer_node,
            encrypted: true,
            control,
        };

        let mut out = Vec::with_capacity(plaintext.len() + 64);
        header.encode(&mut out);

        let nonce = message_nonce(counter, self.local_node.unwrap_or(0));
        let ciphertext = aead_seal(&self.keys.encrypt, &nonce, &out, plaintext)?;
        out.extend_from_slice(&ciphertext);

        Ok(out)
    }

    /// Decrypt an inbound datagram and admit its counter.
    ///
    /// The counter is only admitted after the AEAD verified, so a forged
    /// counter cannot poison the receive window.
    pub(crate) fn open(
        &mut self,
        header: &MessageHeader,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, OpenError> {
        let plaintext = self.open_unwindowed(header, aad, ciphertext)?;
        self.recv_counter
            .admit(header.counter)
            .map_err(OpenError::Replay)?;
        self.desync_strikes = 0;
        Ok(plaintext)
    }

    /// Decrypt without counter admission. Only for control messages whose
    /// freshness is proven by a challenge instead of the window.
    pub(crate) fn open_unwindowed(
        &mut self,
        header: &MessageHeader,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, OpenError> {
        let nonce = message_nonce(header.counter, header.source.unwrap_or(0));
        aead_open(&self.keys.decrypt, &nonce, aad, ciphertext).map_err(|_| OpenError::Auth)
    }
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("role", &self.role)
            .field("kind", &self.kind)
            .field("local_id", &self.local_id)
            .field("peer_session_id", &self.peer_session_id)
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{CounterEpoch, MemoryEpochStore};
    use crate::message::Reader;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn counter() -> LocalCounter {
        let epoch = Rc::new(RefCell::new(CounterEpoch::new(Box::new(
            MemoryEpochStore::new(),
        ))));
        LocalCounter::new(epoch, 100)
    }

    fn pair() -> (SecureSession, SecureSession) {
        let okm = [0x5A; 32];
        let addr: SocketAddr = "127.0.0.1:5540".parse().unwrap();
        let now = Instant::now();

        let a = SecureSession::new(
            SessionSetup {
                role: Role::Initiator,
                kind: SessionKind::Case,
                local_id: SessionId(1),
                peer_session_id: 2,
                peer_addr: addr,
                peer: None,
                local_node: Some(0x1111),
                peer_node: Some(0x2222),
                resumption: None,
            },
            &okm,
            counter(),
            now,
        );
        let b = SecureSession::new(
            SessionSetup {
                role: Role::Responder,
                kind: SessionKind::Case,
                local_id: SessionId(2),
                peer_session_id: 1,
                peer_addr: addr,
                peer: None,
                local_node: Some(0x2222),
                peer_node: Some(0x1111),
                resumption: None,
            },
            &okm,
            counter(),
            now,
        );
        (a, b)
    }

    fn open_datagram(receiver: &mut SecureSession, datagram: &[u8]) -> Result<Vec<u8>, OpenError> {
        let mut r = Reader::new(datagram);
        let header = MessageHeader::decode(&mut r).unwrap();
        let aad_len = r.pos();
        let ciphertext = r.rest();
        receiver.open(&header, &datagram[..aad_len], ciphertext)
    }

    #[test]
    fn seal_open_between_roles() {
        let (mut a, mut b) = pair();
        let datagram = a.seal(false, b"hello").unwrap();
        let plaintext = open_datagram(&mut b, &datagram).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn replayed_datagram_rejected_after_open() {
        let (mut a, mut b) = pair();
        let datagram = a.seal(false, b"once").unwrap();

        assert!(open_datagram(&mut b, &datagram).is_ok());
        assert_eq!(
            open_datagram(&mut b, &datagram).unwrap_err(),
            OpenError::Replay(RejectReason::Duplicate)
        );
    }

    #[test]
    fn tampered_datagram_does_not_advance_window() {
        let (mut a, mut b) = pair();
        let good = a.seal(false, b"payload").unwrap();

        let mut bad = good.clone();
        let last = bad.len() - 1;
        bad[last] ^= 1;
        assert_eq!(open_datagram(&mut b, &bad).unwrap_err(), OpenError::Auth);

        // The genuine datagram is still admissible.
        assert!(open_datagram(&mut b, &good).is_ok());
    }

    #[test]
    fn directional_keys_differ() {
        // Distinct halves, as real key material would have.
        let mut okm = [1u8; 32];
        okm[0] = 0;
        let a = SessionKeys::derive(Role::Initiator, &okm);
        let b = SessionKeys::derive(Role::Responder, &okm);
        assert_eq!(a.encrypt, b.decrypt);
        assert_eq!(a.decrypt, b.encrypt);
        assert_ne!(a.encrypt, a.decrypt);
    }
}
