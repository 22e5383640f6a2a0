use thiserror::Error;

use crate::registry::SessionId;

/// Errors surfaced by the session layer.
///
/// Failures that an attacker could probe (verifier mismatch, bad signature,
/// untrusted certificate, bad confirmation tag) all collapse into the single
/// [`Error::AuthenticationFailed`] variant so the wire behavior does not leak
/// which internal check rejected the peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Too short")]
    TooShort,

    #[error("Malformed {0} message")]
    Decode(&'static str),

    #[error("Unknown handshake opcode {0}")]
    UnknownOpcode(u8),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Another handshake is in progress")]
    HandshakeBusy,

    #[error("Unexpected {0} message for current handshake state")]
    UnexpectedMessage(&'static str),

    #[error("Session table full")]
    ResourceExhausted,

    #[error("Unknown session {0}")]
    UnknownSession(SessionId),

    #[error("Send counter exhausted")]
    CounterExhausted,

    #[error("Too many failed pairing attempts, in cooldown")]
    PaseCooldown,

    #[error("No password verifier installed")]
    NoPaseVerifier,

    #[error("No local identity for fabric {0:#x}")]
    UnknownFabric(u64),

    #[error("Peer rejected the handshake with status {0}")]
    PeerStatus(u16),

    #[error("Invalid configuration: {0}")]
    Config(&'static str),

    #[error("Crypto failure: {0}")]
    Crypto(&'static str),
}
