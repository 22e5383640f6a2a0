// CASE handshake flow (certificate-authenticated session establishment):
//
// Full path:
//
// 1. Initiator sends Sigma1: a random, its session id, a keyed destination
//    digest naming the responder identity it wants, and an ephemeral ECDH
//    share. A resumption attempt piggybacks as an id plus proof-of-possession
//    tag.
// 2. Responder answers Sigma2: its random, session id, ephemeral share, and
//    an encrypted blob (certificate + signature over both shares) sealed
//    under a key derived from the fresh shared secret.
// 3. Initiator validates the responder certificate and signature, answers
//    Sigma3 with its own encrypted certificate + signature.
// 4. Responder validates and confirms with a success status report.
//
// Abbreviated path: when the responder recognizes the resumption id and the
// tag verifies, it skips straight to Sigma2Resume carrying a fresh resumption
// id and a tag proving it still holds the original shared secret. Session
// keys are rederived from that secret; no certificates or signatures are
// exchanged.
//
// Every validation failure collapses into a generic authentication error so
// a probing peer cannot learn which check rejected it.

use std::time::Instant;

use elliptic_curve::sec1::ToEncodedPoint;
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::crypto::{aead_open, aead_seal, hkdf_sha256, hmac_sha256, sha256, CertificateVerifier};
use crate::error::Error;
use crate::message::{
    Reader, Sigma1, Sigma1Resumption, Sigma2, Sigma2Resume, Sigma3, HandshakePayload,
    P256_POINT_LEN, RESUMPTION_ID_LEN, TAG_LEN, STATUS_OK,
};
use crate::registry::SessionId;
use crate::session::{PeerIdentity, ResumptionRecord};

const NONCE_SIGMA2: &[u8; 12] = b"NCASE_Sigma2";
const NONCE_SIGMA3: &[u8; 12] = b"NCASE_Sigma3";
const NONCE_SIGMA1_RESUME: &[u8; 12] = b"Sigma1Resume";
const NONCE_SIGMA2_RESUME: &[u8; 12] = b"Sigma2Resume";

/// One fabric-scoped identity this node can answer for: its operational
/// certificate, signing key, and the fabric's shared identity-protection key.
pub struct LocalIdentity {
    pub fabric_id: u64,
    pub node_id: u64,
    pub(crate) ipk: [u8; 16],
    pub(crate) signing_key: SigningKey,
    pub(crate) certificate: Vec<u8>,
}

impl LocalIdentity {
    pub fn new(
        fabric_id: u64,
        node_id: u64,
        ipk: [u8; 16],
        signing_key: SigningKey,
        certificate: Vec<u8>,
    ) -> Self {
        LocalIdentity {
            fabric_id,
            node_id,
            ipk,
            signing_key,
            certificate,
        }
    }

    /// The (fabric, node) pair this identity answers for.
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity {
            fabric_id: self.fabric_id,
            node_id: self.node_id,
        }
    }

    /// Does an inbound Sigma1 address this identity? Compared in constant
    /// time; an unmatched destination is indistinguishable from any other
    /// rejection.
    pub(crate) fn matches_destination(&self, sigma1: &Sigma1) -> bool {
        let expected = destination_id(
            &self.ipk,
            &sigma1.initiator_random,
            self.fabric_id,
            self.node_id,
        );
        expected.ct_eq(&sigma1.destination_id).into()
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("fabric_id", &self.fabric_id)
            .field("node_id", &self.node_id)
            .finish()
    }
}

/// Keyed digest naming one (fabric, node) behind the shared fabric key.
/// Only holders of the fabric's identity-protection key can recognize who a
/// Sigma1 is addressed to.
pub(crate) fn destination_id(
    ipk: &[u8; 16],
    initiator_random: &[u8; 32],
    fabric_id: u64,
    node_id: u64,
) -> [u8; 32] {
    let mut data = Vec::with_capacity(48);
    data.extend_from_slice(initiator_random);
    data.extend_from_slice(&fabric_id.to_le_bytes());
    data.extend_from_slice(&node_id.to_le_bytes());
    hmac_sha256(ipk, &data)
}

/// Outcome of a completed certificate-authenticated handshake, either path.
pub(crate) struct EstablishedCase {
    pub keys_okm: [u8; 32],
    pub peer: PeerIdentity,
    pub peer_session_id: u16,
    pub resumption: ResumptionRecord,
    pub resumed: bool,
}

impl Drop for EstablishedCase {
    fn drop(&mut self) {
        self.keys_okm.zeroize();
    }
}

fn ecdh_shared(secret: &EphemeralSecret, peer_point: &[u8; P256_POINT_LEN]) -> Result<[u8; 32], Error> {
    let peer = PublicKey::from_sec1_bytes(peer_point).map_err(|_| Error::AuthenticationFailed)?;
    let shared = secret.diffie_hellman(&peer);
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes());
    Ok(out)
}

fn encode_public(secret: &EphemeralSecret) -> [u8; P256_POINT_LEN] {
    let point = secret.public_key().to_encoded_point(false);
    let mut out = [0u8; P256_POINT_LEN];
    out.copy_from_slice(point.as_bytes());
    out
}

/// Blob inside Sigma2/Sigma3: certificate, then a 64-byte transcript
/// signature.
fn encode_evidence(certificate: &[u8], signature: &Signature) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + certificate.len() + 64);
    out.extend_from_slice(&(certificate.len() as u16).to_le_bytes());
    out.extend_from_slice(certificate);
    out.extend_from_slice(&signature.to_bytes());
    out
}

fn decode_evidence(blob: &[u8]) -> Result<(&[u8], Signature), Error> {
    let mut r = Reader::new(blob);
    let len = r.u16()? as usize;
    let certificate = r.take(len)?;
    let signature =
        Signature::from_slice(r.take(64)?).map_err(|_| Error::AuthenticationFailed)?;
    r.expect_end("evidence")?;
    Ok((certificate, signature))
}

fn sign_tbs(key: &SigningKey, certificate: &[u8], first: &[u8], second: &[u8]) -> Signature {
    let mut tbs = Vec::with_capacity(certificate.len() + 2 * P256_POINT_LEN);
    tbs.extend_from_slice(certificate);
    tbs.extend_from_slice(first);
    tbs.extend_from_slice(second);
    key.sign(&tbs)
}

fn verify_tbs(
    public_key: &[u8],
    certificate: &[u8],
    first: &[u8],
    second: &[u8],
    signature: &Signature,
) -> Result<(), Error> {
    let key = VerifyingKey::from_sec1_bytes(public_key).map_err(|_| Error::AuthenticationFailed)?;
    let mut tbs = Vec::with_capacity(certificate.len() + 2 * P256_POINT_LEN);
    tbs.extend_from_slice(certificate);
    tbs.extend_from_slice(first);
    tbs.extend_from_slice(second);
    key.verify(&tbs, signature)
        .map_err(|_| Error::AuthenticationFailed)
}

fn sigma2_key(shared: &[u8; 32], ipk: &[u8; 16], sigma2: &Sigma2, sigma1_hash: &[u8; 32]) -> Result<[u8; 16], Error> {
    let mut salt = Vec::with_capacity(16 + 32 + P256_POINT_LEN + 32);
    salt.extend_from_slice(ipk);
    salt.extend_from_slice(&sigma2.responder_random);
    salt.extend_from_slice(&sigma2.ephemeral_pub);
    salt.extend_from_slice(sigma1_hash);

    let mut key = [0u8; 16];
    hkdf_sha256(shared, &salt, b"Sigma2", &mut key)?;
    Ok(key)
}

fn sigma3_key(shared: &[u8; 32], ipk: &[u8; 16], transcript_hash: &[u8; 32]) -> Result<[u8; 16], Error> {
    let mut salt = Vec::with_capacity(16 + 32);
    salt.extend_from_slice(ipk);
    salt.extend_from_slice(transcript_hash);

    let mut key = [0u8; 16];
    hkdf_sha256(shared, &salt, b"Sigma3", &mut key)?;
    Ok(key)
}

fn session_okm(shared: &[u8; 32], ipk: &[u8; 16], transcript_hash: &[u8; 32]) -> Result<[u8; 32], Error> {
    let mut salt = Vec::with_capacity(16 + 32);
    salt.extend_from_slice(ipk);
    salt.extend_from_slice(transcript_hash);

    let mut okm = [0u8; 32];
    hkdf_sha256(shared, &salt, b"SessionKeys", &mut okm)?;
    Ok(okm)
}

fn resume_key(
    shared: &[u8; 32],
    initiator_random: &[u8; 32],
    resumption_id: &[u8; RESUMPTION_ID_LEN],
    info: &[u8],
) -> Result<[u8; 16], Error> {
    let mut salt = Vec::with_capacity(32 + RESUMPTION_ID_LEN);
    salt.extend_from_slice(initiator_random);
    salt.extend_from_slice(resumption_id);

    let mut key = [0u8; 16];
    hkdf_sha256(shared, &salt, info, &mut key)?;
    Ok(key)
}

fn resumed_session_okm(
    shared: &[u8; 32],
    initiator_random: &[u8; 32],
    resumption_id: &[u8; RESUMPTION_ID_LEN],
) -> Result<[u8; 32], Error> {
    let mut salt = Vec::with_capacity(32 + RESUMPTION_ID_LEN);
    salt.extend_from_slice(initiator_random);
    salt.extend_from_slice(resumption_id);

    let mut okm = [0u8; 32];
    hkdf_sha256(shared, &salt, b"SessionResumptionKeys", &mut okm)?;
    Ok(okm)
}

/// Resumption id for a freshly established full handshake. Derived on both
/// sides from the shared secret, so it never travels in clear.
fn fresh_resumption_id(shared: &[u8; 32], transcript_hash: &[u8; 32]) -> Result<[u8; RESUMPTION_ID_LEN], Error> {
    let mut id = [0u8; RESUMPTION_ID_LEN];
    hkdf_sha256(shared, transcript_hash, b"ResumptionID", &mut id)?;
    Ok(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitiatorState {
    AwaitingSigma2,
    AwaitingStatus,
    Established,
    Aborted,
}

/// Initiator side of the certificate-authenticated handshake.
pub(crate) struct CaseInitiator {
    state: InitiatorState,
    eph_secret: EphemeralSecret,
    eph_pub: [u8; P256_POINT_LEN],
    initiator_random: [u8; 32],
    ipk: [u8; 16],
    certificate: Vec<u8>,
    signing_key: SigningKey,
    expected_peer: PeerIdentity,
    resumption_attempt: Option<ResumptionRecord>,
    sigma1_bytes: Vec<u8>,
    pending: Option<EstablishedCase>,
}

impl CaseInitiator {
    pub fn start(
        identity: &LocalIdentity,
        peer: PeerIdentity,
        local_session_id: SessionId,
        resumption: Option<&ResumptionRecord>,
    ) -> Result<(Self, Sigma1), Error> {
        let mut initiator_random = [0u8; 32];
        OsRng.fill_bytes(&mut initiator_random);

        let eph_secret = EphemeralSecret::random(&mut OsRng);
        let eph_pub = encode_public(&eph_secret);

        let resumption_field = match resumption {
            Some(record) => {
                let s1rk = resume_key(
                    &record.shared_secret,
                    &initiator_random,
                    &record.id,
                    b"Sigma1_Resume",
                )?;
                let mic = aead_seal(&s1rk, NONCE_SIGMA1_RESUME, &[], &[])?;
                let mut tag = [0u8; TAG_LEN];
                tag.copy_from_slice(&mic);
                Some(Sigma1Resumption {
                    id: record.id,
                    mic: tag,
                })
            }
            None => None,
        };

        let sigma1 = Sigma1 {
            initiator_random,
            initiator_session_id: local_session_id.0,
            destination_id: destination_id(
                &identity.ipk,
                &initiator_random,
                peer.fabric_id,
                peer.node_id,
            ),
            ephemeral_pub: eph_pub,
            resumption: resumption_field,
        };

        let sigma1_bytes = HandshakePayload::Sigma1(sigma1.clone()).to_bytes();

        Ok((
            CaseInitiator {
                state: InitiatorState::AwaitingSigma2,
                eph_secret,
                eph_pub,
                initiator_random,
                ipk: identity.ipk,
                certificate: identity.certificate.clone(),
                signing_key: identity.signing_key.clone(),
                expected_peer: peer,
                resumption_attempt: resumption.cloned(),
                sigma1_bytes,
                pending: None,
            },
            sigma1,
        ))
    }

    /// Full path: validate Sigma2, answer Sigma3, keep the derived session
    /// pending until the responder's status report.
    pub fn handle_sigma2(
        &mut self,
        sigma2: &Sigma2,
        raw: &[u8],
        verifier: &dyn CertificateVerifier,
        now: Instant,
    ) -> Result<Sigma3, Error> {
        if self.state != InitiatorState::AwaitingSigma2 {
            return Err(Error::UnexpectedMessage("sigma2"));
        }

        match self.process_sigma2(sigma2, raw, verifier, now) {
            Ok(sigma3) => {
                self.state = InitiatorState::AwaitingStatus;
                Ok(sigma3)
            }
            Err(e) => {
                self.state = InitiatorState::Aborted;
                Err(e)
            }
        }
    }

    fn process_sigma2(
        &mut self,
        sigma2: &Sigma2,
        raw: &[u8],
        verifier: &dyn CertificateVerifier,
        now: Instant,
    ) -> Result<Sigma3, Error> {
        let shared = ecdh_shared(&self.eph_secret, &sigma2.ephemeral_pub)?;
        let sigma1_hash = sha256(&self.sigma1_bytes);

        let s2k = sigma2_key(&shared, &self.ipk, sigma2, &sigma1_hash)?;
        let evidence = aead_open(&s2k, NONCE_SIGMA2, &[], &sigma2.encrypted)?;
        let (certificate, signature) = decode_evidence(&evidence)?;

        let peer = verifier.verify(certificate).map_err(|_| Error::AuthenticationFailed)?;
        if peer.identity != self.expected_peer {
            return Err(Error::AuthenticationFailed);
        }
        verify_tbs(
            &peer.public_key,
            certificate,
            &sigma2.ephemeral_pub,
            &self.eph_pub,
            &signature,
        )?;

        // Our own evidence over the mirrored share order.
        let own_signature = sign_tbs(
            &self.signing_key,
            &self.certificate,
            &self.eph_pub,
            &sigma2.ephemeral_pub,
        );
        let own_evidence = encode_evidence(&self.certificate, &own_signature);

        let mut transcript = self.sigma1_bytes.clone();
        transcript.extend_from_slice(raw);
        let s3k = sigma3_key(&shared, &self.ipk, &sha256(&transcript))?;
        let encrypted = aead_seal(&s3k, NONCE_SIGMA3, &[], &own_evidence)?;
        let sigma3 = Sigma3 { encrypted };

        transcript.extend_from_slice(&HandshakePayload::Sigma3(sigma3.clone()).to_bytes());
        let transcript_hash = sha256(&transcript);

        let keys_okm = session_okm(&shared, &self.ipk, &transcript_hash)?;
        let resumption = ResumptionRecord {
            id: fresh_resumption_id(&shared, &transcript_hash)?,
            shared_secret: shared,
            peer: self.expected_peer,
            created_at: now,
        };

        self.pending = Some(EstablishedCase {
            keys_okm,
            peer: self.expected_peer,
            peer_session_id: sigma2.responder_session_id,
            resumption,
            resumed: false,
        });

        Ok(sigma3)
    }

    /// Abbreviated path: verify the responder's possession tag and rederive
    /// session keys from the cached secret. Completes immediately; the
    /// initiator's status report is the responder's confirmation.
    pub fn handle_sigma2_resume(
        &mut self,
        msg: &Sigma2Resume,
        now: Instant,
    ) -> Result<EstablishedCase, Error> {
        if self.state != InitiatorState::AwaitingSigma2 {
            return Err(Error::UnexpectedMessage("sigma2_resume"));
        }

        let record = match self.resumption_attempt.take() {
            Some(record) => record,
            None => {
                self.state = InitiatorState::Aborted;
                return Err(Error::UnexpectedMessage("sigma2_resume"));
            }
        };

        let s2rk = resume_key(
            &record.shared_secret,
            &self.initiator_random,
            &msg.resumption_id,
            b"Sigma2_Resume",
        )?;
        if aead_open(&s2rk, NONCE_SIGMA2_RESUME, &[], &msg.resume_mic).is_err() {
            self.state = InitiatorState::Aborted;
            return Err(Error::AuthenticationFailed);
        }

        let keys_okm = resumed_session_okm(
            &record.shared_secret,
            &self.initiator_random,
            &msg.resumption_id,
        )?;

        self.state = InitiatorState::Established;
        Ok(EstablishedCase {
            keys_okm,
            peer: record.peer,
            peer_session_id: msg.responder_session_id,
            resumption: ResumptionRecord {
                id: msg.resumption_id,
                shared_secret: record.shared_secret,
                peer: record.peer,
                created_at: now,
            },
            resumed: true,
        })
    }

    /// Full path closing status report from the responder.
    pub fn handle_status(&mut self, code: u16) -> Result<EstablishedCase, Error> {
        if self.state != InitiatorState::AwaitingStatus {
            return Err(Error::UnexpectedMessage("status"));
        }
        if code != STATUS_OK {
            self.state = InitiatorState::Aborted;
            return Err(Error::PeerStatus(code));
        }

        self.state = InitiatorState::Established;
        self.pending.take().ok_or(Error::UnexpectedMessage("status"))
    }

    pub fn abort(&mut self) {
        self.state = InitiatorState::Aborted;
        self.pending = None;
        self.resumption_attempt = None;
    }
}

/// Locate the cached record an inbound resumption attempt refers to and check
/// its possession tag. `None` means the responder falls back to the full
/// handshake path.
pub(crate) fn try_resume<'a>(
    sigma1: &Sigma1,
    records: impl Iterator<Item = &'a ResumptionRecord>,
) -> Option<&'a ResumptionRecord> {
    let attempt = sigma1.resumption.as_ref()?;

    for record in records {
        if !bool::from(record.id.ct_eq(&attempt.id)) {
            continue;
        }
        let s1rk = resume_key(
            &record.shared_secret,
            &sigma1.initiator_random,
            &record.id,
            b"Sigma1_Resume",
        )
        .ok()?;
        if aead_open(&s1rk, NONCE_SIGMA1_RESUME, &[], &attempt.mic).is_ok() {
            return Some(record);
        }
        return None;
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponderState {
    AwaitingSigma3,
    AwaitingStatus,
    Established,
    Aborted,
}

/// Responder side of the certificate-authenticated handshake.
pub(crate) struct CaseResponder {
    state: ResponderState,
    shared: [u8; 32],
    ipk: [u8; 16],
    fabric_id: u64,
    eph_pub: [u8; P256_POINT_LEN],
    initiator_eph_pub: [u8; P256_POINT_LEN],
    initiator_session_id: u16,
    transcript: Vec<u8>,
    pending: Option<EstablishedCase>,
}

impl CaseResponder {
    /// Full path: answer Sigma1 with Sigma2.
    pub fn respond(
        identity: &LocalIdentity,
        sigma1: &Sigma1,
        raw: &[u8],
        local_session_id: SessionId,
    ) -> Result<(Self, Sigma2), Error> {
        let eph_secret = EphemeralSecret::random(&mut OsRng);
        let eph_pub = encode_public(&eph_secret);
        let shared = ecdh_shared(&eph_secret, &sigma1.ephemeral_pub)?;

        let mut responder_random = [0u8; 32];
        OsRng.fill_bytes(&mut responder_random);

        let signature = sign_tbs(
            &identity.signing_key,
            &identity.certificate,
            &eph_pub,
            &sigma1.ephemeral_pub,
        );
        let evidence = encode_evidence(&identity.certificate, &signature);

        let mut sigma2 = Sigma2 {
            responder_random,
            responder_session_id: local_session_id.0,
            ephemeral_pub: eph_pub,
            encrypted: Vec::new(),
        };

        let s2k = sigma2_key(&shared, &identity.ipk, &sigma2, &sha256(raw))?;
        sigma2.encrypted = aead_seal(&s2k, NONCE_SIGMA2, &[], &evidence)?;

        let mut transcript = raw.to_vec();
        transcript.extend_from_slice(&HandshakePayload::Sigma2(sigma2.clone()).to_bytes());

        Ok((
            CaseResponder {
                state: ResponderState::AwaitingSigma3,
                shared,
                ipk: identity.ipk,
                fabric_id: identity.fabric_id,
                eph_pub,
                initiator_eph_pub: sigma1.ephemeral_pub,
                initiator_session_id: sigma1.initiator_session_id,
                transcript,
                pending: None,
            },
            sigma2,
        ))
    }

    /// Abbreviated path: answer a verified resumption attempt with
    /// Sigma2Resume and wait for the initiator's status report.
    pub fn resume(
        record: &ResumptionRecord,
        sigma1: &Sigma1,
        local_session_id: SessionId,
        now: Instant,
    ) -> Result<(Self, Sigma2Resume), Error> {
        let mut new_id = [0u8; RESUMPTION_ID_LEN];
        OsRng.fill_bytes(&mut new_id);

        let s2rk = resume_key(
            &record.shared_secret,
            &sigma1.initiator_random,
            &new_id,
            b"Sigma2_Resume",
        )?;
        let mic = aead_seal(&s2rk, NONCE_SIGMA2_RESUME, &[], &[])?;
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&mic);

        let keys_okm = resumed_session_okm(
            &record.shared_secret,
            &sigma1.initiator_random,
            &new_id,
        )?;

        let pending = EstablishedCase {
            keys_okm,
            peer: record.peer,
            peer_session_id: sigma1.initiator_session_id,
            resumption: ResumptionRecord {
                id: new_id,
                shared_secret: record.shared_secret,
                peer: record.peer,
                created_at: now,
            },
            resumed: true,
        };

        Ok((
            CaseResponder {
                state: ResponderState::AwaitingStatus,
                shared: record.shared_secret,
                ipk: [0u8; 16],
                fabric_id: record.peer.fabric_id,
                eph_pub: [0u8; P256_POINT_LEN],
                initiator_eph_pub: sigma1.ephemeral_pub,
                initiator_session_id: sigma1.initiator_session_id,
                transcript: Vec::new(),
                pending: Some(pending),
            },
            Sigma2Resume {
                resumption_id: new_id,
                resume_mic: tag,
                responder_session_id: local_session_id.0,
            },
        ))
    }

    /// Full path: validate the initiator's Sigma3 evidence and finish.
    pub fn handle_sigma3(
        &mut self,
        sigma3: &Sigma3,
        raw: &[u8],
        verifier: &dyn CertificateVerifier,
        now: Instant,
    ) -> Result<EstablishedCase, Error> {
        if self.state != ResponderState::AwaitingSigma3 {
            return Err(Error::UnexpectedMessage("sigma3"));
        }

        match self.process_sigma3(sigma3, raw, verifier, now) {
            Ok(established) => {
                self.state = ResponderState::Established;
                Ok(established)
            }
            Err(e) => {
                self.state = ResponderState::Aborted;
                Err(e)
            }
        }
    }

    fn process_sigma3(
        &mut self,
        sigma3: &Sigma3,
        raw: &[u8],
        verifier: &dyn CertificateVerifier,
        now: Instant,
    ) -> Result<EstablishedCase, Error> {
        let s3k = sigma3_key(&self.shared, &self.ipk, &sha256(&self.transcript))?;
        let evidence = aead_open(&s3k, NONCE_SIGMA3, &[], &sigma3.encrypted)?;
        let (certificate, signature) = decode_evidence(&evidence)?;

        let peer = verifier.verify(certificate).map_err(|_| Error::AuthenticationFailed)?;
        if peer.identity.fabric_id != self.fabric_id {
            return Err(Error::AuthenticationFailed);
        }
        verify_tbs(
            &peer.public_key,
            certificate,
            &self.initiator_eph_pub,
            &self.eph_pub,
            &signature,
        )?;

        self.transcript.extend_from_slice(raw);
        let transcript_hash = sha256(&self.transcript);

        let keys_okm = session_okm(&self.shared, &self.ipk, &transcript_hash)?;
        let resumption = ResumptionRecord {
            id: fresh_resumption_id(&self.shared, &transcript_hash)?,
            shared_secret: self.shared,
            peer: peer.identity,
            created_at: now,
        };

        Ok(EstablishedCase {
            keys_okm,
            peer: peer.identity,
            peer_session_id: self.initiator_session_id,
            resumption,
            resumed: false,
        })
    }

    /// Abbreviated path: the initiator's status report confirms the resumed
    /// session.
    pub fn handle_status(&mut self, code: u16) -> Result<EstablishedCase, Error> {
        if self.state != ResponderState::AwaitingStatus {
            return Err(Error::UnexpectedMessage("status"));
        }
        if code != STATUS_OK {
            self.state = ResponderState::Aborted;
            return Err(Error::PeerStatus(code));
        }

        self.state = ResponderState::Established;
        self.pending.take().ok_or(Error::UnexpectedMessage("status"))
    }

    pub fn abort(&mut self) {
        self.state = ResponderState::Aborted;
        self.pending = None;
        self.shared.zeroize();
    }
}

impl Drop for CaseResponder {
    fn drop(&mut self) {
        self.shared.zeroize();
    }
}
