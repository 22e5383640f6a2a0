use std::net::SocketAddr;

use crate::error::Error;
use crate::registry::SessionId;
use crate::session::{PeerIdentity, Role, SessionKind};

/// Events surfaced through [`SecureChannel::poll_event`].
///
/// [`SecureChannel::poll_event`]: crate::SecureChannel::poll_event
#[derive(Debug)]
pub enum Event {
    /// A handshake completed and the session is committed to the registry.
    SessionEstablished {
        session: SessionId,
        kind: SessionKind,
        role: Role,
        /// Peer identity for certificate-authenticated sessions; `None` for
        /// commissioning sessions.
        peer: Option<PeerIdentity>,
    },

    /// A handshake attempt was abandoned.
    HandshakeFailed { peer: SocketAddr, error: Error },

    /// Decrypted application payload from an established session.
    ApplicationData { session: SessionId, payload: Vec<u8> },

    /// A counter sync exchange repaired the session's receive window.
    CounterSynced { session: SessionId },

    /// A session was removed to make room or by explicit close.
    SessionEvicted { session: SessionId },
}
