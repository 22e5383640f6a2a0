// PASE handshake flow (password-authenticated session establishment):
//
// 1. Initiator sends Pake1 (its blinded ephemeral share pA).
// 2. Responder answers Pake2 (its share pB plus confirmation tag cB keyed
//    on the freshly derived shared secret).
// 3. Initiator verifies cB, answers Pake3 (its own confirmation tag cA).
// 4. Responder verifies cA and confirms with a success status report.
//
// Keys graduate into a session only after both confirmation tags verified;
// no partial result ever installs keys, so an unauthenticated peer can never
// obtain a working session. Any cryptographic failure, malformed message or
// deadline expiry lands in Aborted, which is terminal.

use log::debug;

use crate::crypto::hkdf_sha256;
use crate::crypto::spake2p::{PakeSecret, ProverState, Spake2pProver, Spake2pVerifier, VerifierState};
use crate::error::Error;
use crate::message::{Pake1, Pake2, Pake3, STATUS_OK};

/// States of a password-authenticated handshake, either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PaseState {
    AwaitingPake2,
    AwaitingPake3,
    AwaitingStatus,
    Confirmed,
    Aborted,
}

/// Derive directional session key material from the confirmed shared secret.
pub(crate) fn session_key_material(secret: &PakeSecret) -> Result<[u8; 32], Error> {
    let mut okm = [0u8; 32];
    hkdf_sha256(secret.bytes(), &[], b"SessionKeys", &mut okm)?;
    Ok(okm)
}

/// Initiator (commissioner) side of the exchange.
pub(crate) struct PaseInitiator {
    state: PaseState,
    exchange: Option<ProverState>,
    secret: Option<PakeSecret>,
}

impl PaseInitiator {
    /// Kick off the exchange. The caller fills in the session id it
    /// allocated before the message goes out.
    pub fn start(prover: Spake2pProver) -> (Self, Pake1) {
        let (exchange, pa) = prover.start();
        (
            PaseInitiator {
                state: PaseState::AwaitingPake2,
                exchange: Some(exchange),
                secret: None,
            },
            Pake1 {
                initiator_session_id: 0,
                pa,
            },
        )
    }

    pub fn state(&self) -> PaseState {
        self.state
    }

    /// Verify the responder share and confirmation tag, produce our own tag.
    pub fn handle_pake2(&mut self, pake2: &Pake2) -> Result<Pake3, Error> {
        if self.state != PaseState::AwaitingPake2 {
            return Err(Error::UnexpectedMessage("pake2"));
        }

        let exchange = self
            .exchange
            .take()
            .ok_or(Error::UnexpectedMessage("pake2"))?;

        match exchange.finish(&pake2.pb, &pake2.cb) {
            Ok((ca, secret)) => {
                self.secret = Some(secret);
                self.state = PaseState::AwaitingStatus;
                Ok(Pake3 { ca })
            }
            Err(e) => {
                debug!("PASE initiator aborted: responder confirmation failed");
                self.state = PaseState::Aborted;
                Err(e)
            }
        }
    }

    /// Process the responder's closing status report.
    pub fn handle_status(&mut self, code: u16) -> Result<PakeSecret, Error> {
        if self.state != PaseState::AwaitingStatus {
            return Err(Error::UnexpectedMessage("status"));
        }
        if code != STATUS_OK {
            self.state = PaseState::Aborted;
            return Err(Error::PeerStatus(code));
        }

        self.state = PaseState::Confirmed;
        self.secret.take().ok_or(Error::UnexpectedMessage("status"))
    }

    pub fn abort(&mut self) {
        self.state = PaseState::Aborted;
        self.exchange = None;
        self.secret = None;
    }
}

/// Responder (device) side of the exchange. Holds only the verifier, never
/// the passcode.
pub(crate) struct PaseResponder {
    state: PaseState,
    exchange: Option<VerifierState>,
}

impl PaseResponder {
    /// Answer an inbound Pake1 with Pake2. The caller fills in the session
    /// id it allocated before the message goes out.
    pub fn respond(verifier: &Spake2pVerifier, pake1: &Pake1) -> Result<(Self, Pake2), Error> {
        let (exchange, pb, cb) = verifier.respond(&pake1.pa)?;
        Ok((
            PaseResponder {
                state: PaseState::AwaitingPake3,
                exchange: Some(exchange),
            },
            Pake2 {
                responder_session_id: 0,
                pb,
                cb,
            },
        ))
    }

    pub fn state(&self) -> PaseState {
        self.state
    }

    /// Verify the initiator's confirmation tag. Success yields the shared
    /// secret; the caller answers with a success status report.
    pub fn handle_pake3(&mut self, pake3: &Pake3) -> Result<PakeSecret, Error> {
        if self.state != PaseState::AwaitingPake3 {
            return Err(Error::UnexpectedMessage("pake3"));
        }

        let exchange = self
            .exchange
            .take()
            .ok_or(Error::UnexpectedMessage("pake3"))?;

        match exchange.confirm(&pake3.ca) {
            Ok(secret) => {
                self.state = PaseState::Confirmed;
                Ok(secret)
            }
            Err(e) => {
                debug!("PASE responder aborted: initiator confirmation failed");
                self.state = PaseState::Aborted;
                Err(e)
            }
        }
    }

    pub fn abort(&mut self) {
        self.state = PaseState::Aborted;
        self.exchange = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: &[u8] = b"commissioning salt";
    const ITERATIONS: u32 = 100;

    fn prover(code: &[u8]) -> Spake2pProver {
        Spake2pProver::from_password(code, SALT, ITERATIONS)
    }

    fn verifier(code: &[u8]) -> Spake2pVerifier {
        Spake2pVerifier::from_password(code, SALT, ITERATIONS)
    }

    #[test]
    fn matching_verifier_confirms_and_agrees_on_keys() {
        let (mut initiator, pake1) = PaseInitiator::start(prover(b"20202021"));
        let (mut responder, pake2) = PaseResponder::respond(&verifier(b"20202021"), &pake1).unwrap();

        let pake3 = initiator.handle_pake2(&pake2).unwrap();
        let responder_secret = responder.handle_pake3(&pake3).unwrap();
        assert_eq!(responder.state(), PaseState::Confirmed);

        let initiator_secret = initiator.handle_status(STATUS_OK).unwrap();
        assert_eq!(initiator.state(), PaseState::Confirmed);

        let a = session_key_material(&initiator_secret).unwrap();
        let b = session_key_material(&responder_secret).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn mismatched_verifier_aborts_initiator() {
        let (mut initiator, pake1) = PaseInitiator::start(prover(b"20202021"));
        let (_responder, pake2) = PaseResponder::respond(&verifier(b"11111111"), &pake1).unwrap();

        assert_eq!(
            initiator.handle_pake2(&pake2).unwrap_err(),
            Error::AuthenticationFailed
        );
        assert_eq!(initiator.state(), PaseState::Aborted);
    }

    #[test]
    fn forged_pake3_aborts_responder() {
        let (mut initiator, pake1) = PaseInitiator::start(prover(b"20202021"));
        let (mut responder, pake2) = PaseResponder::respond(&verifier(b"20202021"), &pake1).unwrap();

        let mut pake3 = initiator.handle_pake2(&pake2).unwrap();
        pake3.ca[0] ^= 1;

        assert_eq!(
            responder.handle_pake3(&pake3).unwrap_err(),
            Error::AuthenticationFailed
        );
        assert_eq!(responder.state(), PaseState::Aborted);
    }

    #[test]
    fn aborted_machine_rejects_further_messages() {
        let (mut initiator, pake1) = PaseInitiator::start(prover(b"1"));
        let (_responder, pake2) = PaseResponder::respond(&verifier(b"2"), &pake1).unwrap();

        let _ = initiator.handle_pake2(&pake2);
        assert!(matches!(
            initiator.handle_pake2(&pake2),
            Err(Error::UnexpectedMessage(_))
        ));
    }

    #[test]
    fn failure_status_aborts_initiator() {
        let (mut initiator, pake1) = PaseInitiator::start(prover(b"20202021"));
        let (_responder, pake2) = PaseResponder::respond(&verifier(b"20202021"), &pake1).unwrap();
        let _pake3 = initiator.handle_pake2(&pake2).unwrap();

        assert!(matches!(
            initiator.handle_status(7),
            Err(Error::PeerStatus(7))
        ));
        assert_eq!(initiator.state(), PaseState::Aborted);
    }
}
