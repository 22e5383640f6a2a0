//! The secure channel: handshake dispatch, session traffic, and the poll
//! surface.
//!
//! `SecureChannel` performs no I/O and reads no clocks. The embedding
//! application feeds it inbound datagrams via [`SecureChannel::handle_receive`]
//! and the current time via [`SecureChannel::handle_timeout`], then drains
//! outbound datagrams with [`SecureChannel::poll_datagram`] and state changes
//! with [`SecureChannel::poll_event`]. [`SecureChannel::poll_timeout`] tells
//! the application when to call back in.
//!
//! One handshake attempt is tracked at a time. A second initiation from the
//! same peer replaces the first (the peer evidently gave up on it); attempts
//! from other peers while busy are answered with a busy status.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use log::{debug, warn};

use crate::case::{self, CaseInitiator, CaseResponder, LocalIdentity};
use crate::config::Config;
use crate::counter::{CounterEpoch, EpochStore, LocalCounter};
use crate::crypto::spake2p::{Spake2pProver, Spake2pVerifier};
use crate::crypto::CertificateVerifier;
use crate::error::Error;
use crate::event::Event;
use crate::message::{
    ControlPayload, HandshakePayload, MessageHeader, Pake1, Pake2, Pake3, Reader, Sigma1, Sigma2,
    Sigma2Resume, Sigma3, StatusReport, STATUS_BUSY, STATUS_FAILED, STATUS_OK,
};
use crate::pase::{self, PaseInitiator, PaseResponder};
use crate::registry::{SessionId, SessionRegistry};
use crate::rng::SeededRng;
use crate::session::{
    OpenError, PeerIdentity, ResumptionRecord, Role, SecureSession, SessionKind, SessionSetup,
};
use crate::sync::SyncState;

/// One in-flight handshake attempt, either side, either kind.
struct Attempt {
    peer: SocketAddr,
    reserved: SessionId,
    deadline: Instant,
    /// Session id the peer allocated; learned from Pake1/Pake2 on the
    /// password path, carried inside the handshake result on the
    /// certificate path.
    peer_session_id: u16,
    state: AttemptState,
}

enum AttemptState {
    PaseInitiator(PaseInitiator),
    PaseResponder(PaseResponder),
    CaseInitiator(CaseInitiator),
    CaseResponder(CaseResponder),
}

/// Sans-IO secure session layer over an unreliable datagram transport.
pub struct SecureChannel {
    config: Config,
    registry: SessionRegistry,
    verifier: Box<dyn CertificateVerifier>,
    identities: Vec<LocalIdentity>,
    pase_verifier: Option<Spake2pVerifier>,

    attempt: Option<Attempt>,

    /// Issued resumption records, oldest first. Single use, TTL bounded.
    resumptions: Vec<ResumptionRecord>,

    pase_failures: u32,
    cooldown_until: Option<Instant>,

    queue_tx: VecDeque<(SocketAddr, Vec<u8>)>,
    events: VecDeque<Event>,

    rng: SeededRng,
    epoch: Rc<RefCell<CounterEpoch>>,
}

impl SecureChannel {
    pub fn new(
        config: Config,
        verifier: Box<dyn CertificateVerifier>,
        epoch_store: Box<dyn EpochStore>,
    ) -> Self {
        let rng = SeededRng::new(config.rng_seed());
        let registry = SessionRegistry::new(config.max_sessions());
        let epoch = Rc::new(RefCell::new(CounterEpoch::new(epoch_store)));

        SecureChannel {
            config,
            registry,
            verifier,
            identities: Vec::new(),
            pase_verifier: None,
            attempt: None,
            resumptions: Vec::new(),
            pase_failures: 0,
            cooldown_until: None,
            queue_tx: VecDeque::new(),
            events: VecDeque::new(),
            rng,
            epoch,
        }
    }

    /// Install a fabric identity this node answers for.
    pub fn add_identity(&mut self, identity: LocalIdentity) {
        self.identities.push(identity);
    }

    /// Install the password verifier that inbound pairing attempts are
    /// checked against.
    pub fn set_pase_verifier(&mut self, verifier: Spake2pVerifier) {
        self.pase_verifier = Some(verifier);
    }

    /// Start a password-authenticated handshake toward `peer`.
    ///
    /// Returns the session id the session will get once established.
    pub fn connect_pase(
        &mut self,
        now: Instant,
        peer: SocketAddr,
        prover: Spake2pProver,
    ) -> Result<SessionId, Error> {
        self.ensure_idle(peer)?;

        let id = self.allocate(Role::Initiator, now)?;
        let (initiator, mut pake1) = PaseInitiator::start(prover);
        pake1.initiator_session_id = id.0;

        self.queue_handshake(peer, &HandshakePayload::Pake1(pake1));
        self.attempt = Some(Attempt {
            peer,
            reserved: id,
            deadline: now + self.config.handshake_timeout(),
            peer_session_id: 0,
            state: AttemptState::PaseInitiator(initiator),
        });

        Ok(id)
    }

    /// Start a certificate-authenticated handshake toward the given node.
    ///
    /// A cached, unexpired resumption record for that node is attempted
    /// automatically; the responder decides whether to honor it.
    pub fn connect_case(
        &mut self,
        now: Instant,
        peer_addr: SocketAddr,
        fabric_id: u64,
        node_id: u64,
    ) -> Result<SessionId, Error> {
        self.ensure_idle(peer_addr)?;

        let identity_idx = self
            .identities
            .iter()
            .position(|i| i.fabric_id == fabric_id)
            .ok_or(Error::UnknownFabric(fabric_id))?;

        let id = self.allocate(Role::Initiator, now)?;

        let peer = PeerIdentity { fabric_id, node_id };
        let ttl = self.config.resumption_ttl();
        let record = self
            .resumptions
            .iter()
            .find(|r| r.peer == peer && now.duration_since(r.created_at) < ttl);

        let started = CaseInitiator::start(&self.identities[identity_idx], peer, id, record);
        let (initiator, sigma1) = match started {
            Ok(v) => v,
            Err(e) => {
                self.registry.release(id);
                return Err(e);
            }
        };

        self.queue_handshake(peer_addr, &HandshakePayload::Sigma1(sigma1));
        self.attempt = Some(Attempt {
            peer: peer_addr,
            reserved: id,
            deadline: now + self.config.handshake_timeout(),
            peer_session_id: 0,
            state: AttemptState::CaseInitiator(initiator),
        });

        Ok(id)
    }

    /// Process one inbound datagram.
    ///
    /// Errors are local decode problems; protocol-level failures surface as
    /// [`Event::HandshakeFailed`] or silent drops, never as wire-visible
    /// detail.
    pub fn handle_receive(
        &mut self,
        now: Instant,
        peer: SocketAddr,
        datagram: &[u8],
    ) -> Result<(), Error> {
        let mut r = Reader::new(datagram);
        let header = MessageHeader::decode(&mut r)?;

        if header.encrypted {
            let aad_len = r.pos();
            let ciphertext = r.rest();
            self.on_session_datagram(now, &header, &datagram[..aad_len], ciphertext)
        } else {
            if header.session_id != 0 {
                debug!("Dropping unencrypted datagram with nonzero session id");
                return Ok(());
            }
            let payload = r.rest();
            let message = HandshakePayload::decode(payload)?;
            self.on_handshake(now, peer, message, payload)
        }
    }

    /// Drive timers: handshake deadline, counter sync retries, resumption
    /// record expiry.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.attempt.as_ref().map(|a| now >= a.deadline).unwrap_or(false) {
            self.fail_attempt(Error::HandshakeTimeout);
        }

        for (id, session) in self.registry.sessions_mut() {
            let due = matches!(&session.sync, Some(s) if s.next_attempt <= now);
            if !due {
                continue;
            }
            let retry = match session.sync.as_mut() {
                Some(s) => s.schedule_retry(&mut self.rng, now),
                None => false,
            };
            if retry {
                let challenge = match &session.sync {
                    Some(s) => s.challenge(),
                    None => continue,
                };
                let payload = ControlPayload::SyncRequest { challenge }.to_bytes();
                match session.seal(true, &payload) {
                    Ok(datagram) => {
                        debug!("Retrying counter sync on session {}", id);
                        self.queue_tx.push_back((session.peer_addr(), datagram));
                    }
                    Err(e) => debug!("Counter sync retry on session {} failed: {}", id, e),
                }
            } else {
                // Out of retries. The session stays up with its counter
                // state as-is.
                debug!("Counter sync on session {} gave up", id);
                session.sync = None;
                session.desync_strikes = 0;
            }
        }

        let ttl = self.config.resumption_ttl();
        self.resumptions
            .retain(|r| now.duration_since(r.created_at) < ttl);
    }

    /// When [`handle_timeout`] next wants to run.
    ///
    /// [`handle_timeout`]: SecureChannel::handle_timeout
    pub fn poll_timeout(&self) -> Option<Instant> {
        let mut next = self.attempt.as_ref().map(|a| a.deadline);
        for (_, session) in self.registry.sessions() {
            if let Some(sync) = &session.sync {
                next = Some(match next {
                    Some(n) => n.min(sync.next_attempt),
                    None => sync.next_attempt,
                });
            }
        }
        next
    }

    /// Next outbound datagram, if any.
    pub fn poll_datagram(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        self.queue_tx.pop_front()
    }

    /// Next pending event, if any.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Encrypt and queue an application payload on an established session.
    pub fn send(&mut self, session: SessionId, payload: &[u8]) -> Result<(), Error> {
        let s = self
            .registry
            .get_mut(session)
            .ok_or(Error::UnknownSession(session))?;
        let datagram = s.seal(false, payload)?;
        let peer = s.peer_addr();
        self.queue_tx.push_back((peer, datagram));
        Ok(())
    }

    /// Explicitly start a counter sync exchange on a session.
    ///
    /// Also triggered automatically once a session accumulates
    /// [`Config::desync_threshold`] consecutive too-old rejections.
    ///
    /// [`Config::desync_threshold`]: crate::Config::desync_threshold
    pub fn request_counter_sync(&mut self, now: Instant, id: SessionId) -> Result<(), Error> {
        let session = self
            .registry
            .get_mut(id)
            .ok_or(Error::UnknownSession(id))?;

        let sync = SyncState::new(&self.config, &mut self.rng, now);
        let payload = ControlPayload::SyncRequest {
            challenge: sync.challenge(),
        }
        .to_bytes();
        let datagram = session.seal(true, &payload)?;
        session.sync = Some(sync);

        let peer = session.peer_addr();
        self.queue_tx.push_back((peer, datagram));
        Ok(())
    }

    /// Discard any in-progress handshake attempt and go back to listening.
    ///
    /// Idempotent. A caller-initiated discard emits no event; the peer is
    /// simply never answered.
    pub fn cleanup(&mut self) {
        if let Some(attempt) = self.discard_attempt() {
            debug!("Discarded in-progress handshake with {}", attempt.peer);
        }
    }

    /// Tear down a session. Keys are zeroed as the context drops.
    pub fn close(&mut self, session: SessionId) -> bool {
        let removed = self.registry.evict(session);
        if removed {
            self.events.push_back(Event::SessionEvicted { session });
        }
        removed
    }

    /// Remove a fabric: its identity, its sessions, and its resumption
    /// records.
    pub fn remove_fabric(&mut self, fabric_id: u64) {
        for id in self.registry.evict_fabric(fabric_id) {
            self.events.push_back(Event::SessionEvicted { session: id });
        }
        self.identities.retain(|i| i.fabric_id != fabric_id);
        self.resumptions.retain(|r| r.peer.fabric_id != fabric_id);
    }

    pub fn session(&self, id: SessionId) -> Option<&SecureSession> {
        self.registry.get(id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut SecureSession> {
        self.registry.get_mut(id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = (SessionId, &SecureSession)> {
        self.registry.sessions()
    }

    // ---- handshake dispatch ----

    fn on_handshake(
        &mut self,
        now: Instant,
        peer: SocketAddr,
        message: HandshakePayload,
        raw: &[u8],
    ) -> Result<(), Error> {
        match message {
            HandshakePayload::Pake1(m) => self.on_pake1(now, peer, &m),
            HandshakePayload::Pake2(m) => self.on_pake2(peer, &m),
            HandshakePayload::Pake3(m) => self.on_pake3(now, peer, &m),
            HandshakePayload::Sigma1(m) => self.on_sigma1(now, peer, &m, raw),
            HandshakePayload::Sigma2(m) => self.on_sigma2(now, peer, &m, raw),
            HandshakePayload::Sigma2Resume(m) => self.on_sigma2_resume(now, peer, &m),
            HandshakePayload::Sigma3(m) => self.on_sigma3(now, peer, &m, raw),
            HandshakePayload::Status(m) => self.on_status(now, peer, m.code),
        }
    }

    fn on_pake1(&mut self, now: Instant, peer: SocketAddr, pake1: &Pake1) -> Result<(), Error> {
        if let Some(until) = self.cooldown_until {
            if now < until {
                debug!("Rejecting pairing attempt from {} during cooldown", peer);
                self.queue_status(peer, STATUS_BUSY);
                return Ok(());
            }
            self.cooldown_until = None;
        }

        match &self.attempt {
            Some(a) if a.peer == peer => self.fail_attempt(Error::HandshakeBusy),
            Some(_) => {
                debug!("Dropping pairing attempt from {} while busy", peer);
                self.queue_status(peer, STATUS_BUSY);
                return Ok(());
            }
            None => {}
        }

        if self.pase_verifier.is_none() {
            warn!("Pairing attempt from {} but no password verifier installed", peer);
            self.queue_status(peer, STATUS_FAILED);
            return Ok(());
        }

        let id = match self.allocate(Role::Responder, now) {
            Ok(id) => id,
            Err(e) => {
                debug!("Cannot accept pairing attempt from {}: {}", peer, e);
                self.queue_status(peer, STATUS_BUSY);
                return Ok(());
            }
        };

        let responded = match self.pase_verifier.as_ref() {
            Some(v) => PaseResponder::respond(v, pake1),
            None => Err(Error::NoPaseVerifier),
        };
        let (responder, mut pake2) = match responded {
            Ok(v) => v,
            Err(e) => {
                debug!("Rejecting malformed pairing attempt from {}: {}", peer, e);
                self.registry.release(id);
                self.queue_status(peer, STATUS_FAILED);
                return Ok(());
            }
        };
        pake2.responder_session_id = id.0;

        self.queue_handshake(peer, &HandshakePayload::Pake2(pake2));
        self.attempt = Some(Attempt {
            peer,
            reserved: id,
            deadline: now + self.config.handshake_timeout(),
            peer_session_id: pake1.initiator_session_id,
            state: AttemptState::PaseResponder(responder),
        });

        Ok(())
    }

    fn on_pake2(&mut self, peer: SocketAddr, pake2: &Pake2) -> Result<(), Error> {
        let Some(attempt) = self.attempt.as_mut() else {
            debug!("Ignoring pake2 with no handshake in progress");
            return Ok(());
        };
        if attempt.peer != peer {
            debug!("Ignoring pake2 from unexpected peer {}", peer);
            return Ok(());
        }
        let AttemptState::PaseInitiator(initiator) = &mut attempt.state else {
            debug!("Ignoring pake2 outside a pairing attempt");
            return Ok(());
        };

        match initiator.handle_pake2(pake2) {
            Ok(pake3) => {
                attempt.peer_session_id = pake2.responder_session_id;
                self.queue_handshake(peer, &HandshakePayload::Pake3(pake3));
            }
            Err(e) => {
                self.fail_attempt(e);
                self.queue_status(peer, STATUS_FAILED);
            }
        }
        Ok(())
    }

    fn on_pake3(&mut self, now: Instant, peer: SocketAddr, pake3: &Pake3) -> Result<(), Error> {
        let Some(attempt) = self.attempt.as_mut() else {
            debug!("Ignoring pake3 with no handshake in progress");
            return Ok(());
        };
        if attempt.peer != peer {
            debug!("Ignoring pake3 from unexpected peer {}", peer);
            return Ok(());
        }
        let AttemptState::PaseResponder(responder) = &mut attempt.state else {
            debug!("Ignoring pake3 outside a pairing attempt");
            return Ok(());
        };

        match responder.handle_pake3(pake3) {
            Ok(secret) => {
                let okm = pase::session_key_material(&secret)?;
                if let Some(a) = self.attempt.take() {
                    self.commit_pase(a, &okm, Role::Responder, now)?;
                }
                self.pase_failures = 0;
                self.queue_status(peer, STATUS_OK);
            }
            Err(e) => {
                self.pase_failures += 1;
                if self.pase_failures >= self.config.pase_failure_limit() {
                    warn!("Pairing failure limit reached, entering cooldown");
                    self.cooldown_until = Some(now + self.config.pase_cooldown());
                    self.pase_failures = 0;
                }
                self.fail_attempt(e);
                self.queue_status(peer, STATUS_FAILED);
            }
        }
        Ok(())
    }

    fn on_sigma1(
        &mut self,
        now: Instant,
        peer: SocketAddr,
        sigma1: &Sigma1,
        raw: &[u8],
    ) -> Result<(), Error> {
        match &self.attempt {
            Some(a) if a.peer == peer => self.fail_attempt(Error::HandshakeBusy),
            Some(_) => {
                debug!("Dropping handshake attempt from {} while busy", peer);
                self.queue_status(peer, STATUS_BUSY);
                return Ok(());
            }
            None => {}
        }

        // A commissioning session with this peer is done once the peer moves
        // on to the operational handshake.
        let stale: Vec<SessionId> = self
            .registry
            .sessions()
            .filter(|(_, s)| s.kind() == SessionKind::Pase && s.peer_addr() == peer)
            .map(|(id, _)| id)
            .collect();
        for id in stale {
            debug!("Evicting commissioning session {} with {}", id, peer);
            self.registry.evict(id);
            self.events.push_back(Event::SessionEvicted { session: id });
        }

        // Resumption attempt first. A failed match falls back to the full
        // path rather than erroring.
        let ttl = self.config.resumption_ttl();
        let matched_id = {
            let fresh = self
                .resumptions
                .iter()
                .filter(|r| now.duration_since(r.created_at) < ttl);
            case::try_resume(sigma1, fresh).map(|r| r.id)
        };

        if let Some(record_id) = matched_id {
            let id = match self.allocate(Role::Responder, now) {
                Ok(id) => id,
                Err(e) => {
                    debug!("Cannot accept handshake from {}: {}", peer, e);
                    self.queue_status(peer, STATUS_BUSY);
                    return Ok(());
                }
            };

            // Single use: the record is consumed whether or not the rest of
            // the exchange completes.
            let Some(idx) = self.resumptions.iter().position(|r| r.id == record_id) else {
                self.registry.release(id);
                self.queue_status(peer, STATUS_FAILED);
                return Ok(());
            };
            let record = self.resumptions.remove(idx);

            match CaseResponder::resume(&record, sigma1, id, now) {
                Ok((responder, reply)) => {
                    self.queue_handshake(peer, &HandshakePayload::Sigma2Resume(reply));
                    self.attempt = Some(Attempt {
                        peer,
                        reserved: id,
                        deadline: now + self.config.handshake_timeout(),
                        peer_session_id: sigma1.initiator_session_id,
                        state: AttemptState::CaseResponder(responder),
                    });
                }
                Err(e) => {
                    debug!("Resumption attempt from {} failed: {}", peer, e);
                    self.registry.release(id);
                    self.queue_status(peer, STATUS_FAILED);
                }
            }
            return Ok(());
        }

        // Full path: find which of our identities the destination digest
        // names.
        let Some(identity_idx) = self
            .identities
            .iter()
            .position(|i| i.matches_destination(sigma1))
        else {
            debug!("Handshake from {} addresses no local identity", peer);
            self.queue_status(peer, STATUS_FAILED);
            return Ok(());
        };

        let id = match self.allocate(Role::Responder, now) {
            Ok(id) => id,
            Err(e) => {
                debug!("Cannot accept handshake from {}: {}", peer, e);
                self.queue_status(peer, STATUS_BUSY);
                return Ok(());
            }
        };

        match CaseResponder::respond(&self.identities[identity_idx], sigma1, raw, id) {
            Ok((responder, sigma2)) => {
                self.queue_handshake(peer, &HandshakePayload::Sigma2(sigma2));
                self.attempt = Some(Attempt {
                    peer,
                    reserved: id,
                    deadline: now + self.config.handshake_timeout(),
                    peer_session_id: sigma1.initiator_session_id,
                    state: AttemptState::CaseResponder(responder),
                });
            }
            Err(e) => {
                debug!("Rejecting handshake from {}: {}", peer, e);
                self.registry.release(id);
                self.queue_status(peer, STATUS_FAILED);
            }
        }
        Ok(())
    }

    fn on_sigma2(
        &mut self,
        now: Instant,
        peer: SocketAddr,
        sigma2: &Sigma2,
        raw: &[u8],
    ) -> Result<(), Error> {
        let Some(attempt) = self.attempt.as_mut() else {
            debug!("Ignoring sigma2 with no handshake in progress");
            return Ok(());
        };
        if attempt.peer != peer {
            debug!("Ignoring sigma2 from unexpected peer {}", peer);
            return Ok(());
        }
        let AttemptState::CaseInitiator(initiator) = &mut attempt.state else {
            debug!("Ignoring sigma2 outside an initiated handshake");
            return Ok(());
        };

        match initiator.handle_sigma2(sigma2, raw, self.verifier.as_ref(), now) {
            Ok(sigma3) => {
                self.queue_handshake(peer, &HandshakePayload::Sigma3(sigma3));
            }
            Err(e) => {
                self.fail_attempt(e);
                self.queue_status(peer, STATUS_FAILED);
            }
        }
        Ok(())
    }

    fn on_sigma2_resume(
        &mut self,
        now: Instant,
        peer: SocketAddr,
        msg: &Sigma2Resume,
    ) -> Result<(), Error> {
        let Some(attempt) = self.attempt.as_mut() else {
            debug!("Ignoring sigma2_resume with no handshake in progress");
            return Ok(());
        };
        if attempt.peer != peer {
            debug!("Ignoring sigma2_resume from unexpected peer {}", peer);
            return Ok(());
        }
        let AttemptState::CaseInitiator(initiator) = &mut attempt.state else {
            debug!("Ignoring sigma2_resume outside an initiated handshake");
            return Ok(());
        };

        match initiator.handle_sigma2_resume(msg, now) {
            Ok(established) => {
                if let Some(a) = self.attempt.take() {
                    self.commit_case(a, Role::Initiator, &established, now)?;
                }
                self.queue_status(peer, STATUS_OK);
            }
            Err(e) => {
                self.fail_attempt(e);
                self.queue_status(peer, STATUS_FAILED);
            }
        }
        Ok(())
    }

    fn on_sigma3(
        &mut self,
        now: Instant,
        peer: SocketAddr,
        sigma3: &Sigma3,
        raw: &[u8],
    ) -> Result<(), Error> {
        let Some(attempt) = self.attempt.as_mut() else {
            debug!("Ignoring sigma3 with no handshake in progress");
            return Ok(());
        };
        if attempt.peer != peer {
            debug!("Ignoring sigma3 from unexpected peer {}", peer);
            return Ok(());
        }
        let AttemptState::CaseResponder(responder) = &mut attempt.state else {
            debug!("Ignoring sigma3 outside a responding handshake");
            return Ok(());
        };

        match responder.handle_sigma3(sigma3, raw, self.verifier.as_ref(), now) {
            Ok(established) => {
                if let Some(a) = self.attempt.take() {
                    self.commit_case(a, Role::Responder, &established, now)?;
                }
                self.queue_status(peer, STATUS_OK);
            }
            Err(e) => {
                self.fail_attempt(e);
                self.queue_status(peer, STATUS_FAILED);
            }
        }
        Ok(())
    }

    fn on_status(&mut self, now: Instant, peer: SocketAddr, code: u16) -> Result<(), Error> {
        let Some(attempt) = self.attempt.as_mut() else {
            debug!("Ignoring status report with no handshake in progress");
            return Ok(());
        };
        if attempt.peer != peer {
            debug!("Ignoring status report from unexpected peer {}", peer);
            return Ok(());
        }

        match &mut attempt.state {
            AttemptState::PaseInitiator(initiator) => match initiator.handle_status(code) {
                Ok(secret) => {
                    let okm = pase::session_key_material(&secret)?;
                    if let Some(a) = self.attempt.take() {
                        self.commit_pase(a, &okm, Role::Initiator, now)?;
                    }
                }
                Err(e) => self.finish_status_error(code, e),
            },
            AttemptState::CaseInitiator(initiator) => match initiator.handle_status(code) {
                Ok(established) => {
                    if let Some(a) = self.attempt.take() {
                        self.commit_case(a, Role::Initiator, &established, now)?;
                    }
                }
                Err(e) => self.finish_status_error(code, e),
            },
            AttemptState::CaseResponder(responder) => match responder.handle_status(code) {
                Ok(established) => {
                    if let Some(a) = self.attempt.take() {
                        self.commit_case(a, Role::Responder, &established, now)?;
                    }
                }
                Err(e) => self.finish_status_error(code, e),
            },
            AttemptState::PaseResponder(_) => {
                // The responder never awaits a status; a failure report from
                // the initiator aborts the attempt.
                if code != STATUS_OK {
                    self.fail_attempt(Error::PeerStatus(code));
                }
            }
        }
        Ok(())
    }

    /// A status report that the state machine did not accept. An unexpected
    /// success report is dropped; a failure report aborts the attempt.
    fn finish_status_error(&mut self, code: u16, error: Error) {
        match error {
            Error::UnexpectedMessage(_) if code == STATUS_OK => {
                debug!("Ignoring unexpected success status");
            }
            Error::UnexpectedMessage(_) => self.fail_attempt(Error::PeerStatus(code)),
            e => self.fail_attempt(e),
        }
    }

    // ---- session traffic ----

    fn on_session_datagram(
        &mut self,
        now: Instant,
        header: &MessageHeader,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<(), Error> {
        let id = SessionId(header.session_id);
        let Some(session) = self.registry.get_mut(id) else {
            debug!("Dropping datagram for unknown session {}", id);
            return Ok(());
        };

        if header.control {
            // Control traffic bypasses the receive window; freshness comes
            // from the challenge, not the counter.
            let plaintext = match session.open_unwindowed(header, aad, ciphertext) {
                Ok(p) => p,
                Err(_) => {
                    debug!("Dropping unauthentic control datagram on session {}", id);
                    return Ok(());
                }
            };
            let control = match ControlPayload::decode(&plaintext) {
                Ok(c) => c,
                Err(e) => {
                    debug!("Dropping malformed control payload on session {}: {}", id, e);
                    return Ok(());
                }
            };
            match control {
                ControlPayload::SyncRequest { challenge } => {
                    let reply = ControlPayload::SyncResponse {
                        challenge,
                        counter: session.send_counter_current(),
                    }
                    .to_bytes();
                    let datagram = session.seal(true, &reply)?;
                    let peer = session.peer_addr();
                    self.queue_tx.push_back((peer, datagram));
                }
                ControlPayload::SyncResponse { challenge, counter } => {
                    let fresh = session
                        .sync
                        .as_ref()
                        .map(|s| s.matches(&challenge))
                        .unwrap_or(false);
                    if fresh {
                        session.receive_counter_mut().reset_to(counter);
                        session.sync = None;
                        session.desync_strikes = 0;
                        self.events.push_back(Event::CounterSynced { session: id });
                    } else {
                        debug!("Dropping stale sync response on session {}", id);
                    }
                }
            }
            return Ok(());
        }

        match session.open(header, aad, ciphertext) {
            Ok(payload) => {
                self.events.push_back(Event::ApplicationData {
                    session: id,
                    payload,
                });
            }
            Err(OpenError::Auth) => {
                debug!("Dropping unauthentic datagram on session {}", id);
            }
            Err(OpenError::Replay(crate::counter::RejectReason::Duplicate)) => {
                debug!("Dropping duplicate datagram on session {}", id);
            }
            Err(OpenError::Replay(crate::counter::RejectReason::TooOld)) => {
                session.desync_strikes += 1;
                let start_sync = session.desync_strikes >= self.config.desync_threshold()
                    && session.sync.is_none();
                debug!("Dropping stale datagram on session {}", id);
                if start_sync {
                    self.request_counter_sync(now, id)?;
                }
            }
        }
        Ok(())
    }

    // ---- internals ----

    /// Reject a new attempt while one is running against another peer;
    /// replace an attempt against the same peer.
    fn ensure_idle(&mut self, peer: SocketAddr) -> Result<(), Error> {
        match &self.attempt {
            Some(a) if a.peer == peer => {
                self.fail_attempt(Error::HandshakeBusy);
                Ok(())
            }
            Some(_) => Err(Error::HandshakeBusy),
            None => Ok(()),
        }
    }

    /// Reserve a session id, evicting the oldest commissioning session when
    /// the table is full.
    fn allocate(&mut self, role: Role, now: Instant) -> Result<SessionId, Error> {
        match self.registry.allocate(role, now) {
            Ok(id) => Ok(id),
            Err(Error::ResourceExhausted) => {
                let evicted = self
                    .registry
                    .evict_oldest_pase()
                    .ok_or(Error::ResourceExhausted)?;
                self.events.push_back(Event::SessionEvicted { session: evicted });
                self.registry.allocate(role, now)
            }
            Err(e) => Err(e),
        }
    }

    /// Abort the attempt state machine and release its reservation.
    fn discard_attempt(&mut self) -> Option<Attempt> {
        let mut attempt = self.attempt.take()?;
        match &mut attempt.state {
            AttemptState::PaseInitiator(i) => i.abort(),
            AttemptState::PaseResponder(r) => r.abort(),
            AttemptState::CaseInitiator(i) => i.abort(),
            AttemptState::CaseResponder(r) => r.abort(),
        }
        self.registry.release(attempt.reserved);
        Some(attempt)
    }

    fn fail_attempt(&mut self, error: Error) {
        let Some(attempt) = self.discard_attempt() else {
            return;
        };
        debug!("Handshake with {} failed: {}", attempt.peer, error);
        self.events.push_back(Event::HandshakeFailed {
            peer: attempt.peer,
            error,
        });
    }

    fn commit_pase(
        &mut self,
        attempt: Attempt,
        okm: &[u8; 32],
        role: Role,
        now: Instant,
    ) -> Result<(), Error> {
        let counter = LocalCounter::new(Rc::clone(&self.epoch), self.config.counter_epoch_step());
        let session = SecureSession::new(
            SessionSetup {
                role,
                kind: SessionKind::Pase,
                local_id: attempt.reserved,
                peer_session_id: attempt.peer_session_id,
                peer_addr: attempt.peer,
                peer: None,
                local_node: None,
                peer_node: None,
                resumption: None,
            },
            okm,
            counter,
            now,
        );
        self.registry.commit(attempt.reserved, session)?;
        self.events.push_back(Event::SessionEstablished {
            session: attempt.reserved,
            kind: SessionKind::Pase,
            role,
            peer: None,
        });
        Ok(())
    }

    fn commit_case(
        &mut self,
        attempt: Attempt,
        role: Role,
        established: &case::EstablishedCase,
        now: Instant,
    ) -> Result<(), Error> {
        let local_node = self
            .identities
            .iter()
            .find(|i| i.fabric_id == established.peer.fabric_id)
            .map(|i| i.node_id);

        let counter = LocalCounter::new(Rc::clone(&self.epoch), self.config.counter_epoch_step());
        let session = SecureSession::new(
            SessionSetup {
                role,
                kind: SessionKind::Case,
                local_id: attempt.reserved,
                peer_session_id: established.peer_session_id,
                peer_addr: attempt.peer,
                peer: Some(established.peer),
                local_node,
                peer_node: Some(established.peer.node_id),
                resumption: Some(established.resumption.clone()),
            },
            &established.keys_okm,
            counter,
            now,
        );
        debug!(
            "Committing {} session {} with {:?}",
            if established.resumed { "resumed" } else { "fresh" },
            attempt.reserved,
            established.peer
        );

        // Prior keys for this peer are superseded by the new establishment.
        for evicted in self.registry.evict_peer(&established.peer) {
            self.events.push_back(Event::SessionEvicted { session: evicted });
        }

        self.registry.commit(attempt.reserved, session)?;
        self.cache_resumption(established.resumption.clone());
        self.events.push_back(Event::SessionEstablished {
            session: attempt.reserved,
            kind: SessionKind::Case,
            role,
            peer: Some(established.peer),
        });
        Ok(())
    }

    /// Retain at most one record per peer, capped at the configured size,
    /// oldest evicted first.
    fn cache_resumption(&mut self, record: ResumptionRecord) {
        let cap = self.config.resumption_cache_size();
        if cap == 0 {
            return;
        }
        self.resumptions.retain(|r| r.peer != record.peer);
        while self.resumptions.len() >= cap {
            self.resumptions.remove(0);
        }
        self.resumptions.push(record);
    }

    fn queue_handshake(&mut self, peer: SocketAddr, payload: &HandshakePayload) {
        let mut out = Vec::new();
        MessageHeader::plain().encode(&mut out);
        payload.encode(&mut out);
        self.queue_tx.push_back((peer, out));
    }

    fn queue_status(&mut self, peer: SocketAddr, code: u16) {
        self.queue_handshake(peer, &HandshakePayload::Status(StatusReport { code }));
    }
}
