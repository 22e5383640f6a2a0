//! Session registry: the table of live cryptographic session contexts.
//!
//! An explicitly owned value, passed by reference to collaborators; its
//! lifecycle is tied to the enclosing [`SecureChannel`], never a process-wide
//! static. Ids are handed out in two steps: `allocate` reserves an id that is
//! already unique on the wire, `commit` fills it with an established session.
//! An aborted handshake releases its reservation.
//!
//! [`SecureChannel`]: crate::SecureChannel

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use log::debug;

use crate::error::Error;
use crate::session::{PeerIdentity, Role, SecureSession, SessionKind};

/// Locally allocated session identifier. Unique among live and reserved
/// sessions at any instant; reused only after the prior session using it has
/// been fully evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u16);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum Slot {
    /// Id handed out to an in-progress handshake.
    Reserved { role: Role, at: Instant },
    Active(Box<SecureSession>),
}

/// Arena of live sessions keyed by session id.
pub struct SessionRegistry {
    slots: HashMap<u16, Slot>,
    max: usize,
    next_id: u16,
}

impl SessionRegistry {
    pub fn new(max: usize) -> Self {
        SessionRegistry {
            slots: HashMap::with_capacity(max),
            max,
            next_id: 0,
        }
    }

    /// Number of live slots (committed or reserved).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reserve a fresh session id.
    ///
    /// Fails with [`Error::ResourceExhausted`] when the configured maximum is
    /// reached; the caller is expected to evict a low-priority session (a
    /// commissioning-only one, see [`evict_oldest_pase`]) and retry.
    ///
    /// [`evict_oldest_pase`]: SessionRegistry::evict_oldest_pase
    pub fn allocate(&mut self, role: Role, now: Instant) -> Result<SessionId, Error> {
        if self.slots.len() >= self.max {
            return Err(Error::ResourceExhausted);
        }

        // Id 0 is reserved for unencrypted traffic on the wire.
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                continue;
            }
            if !self.slots.contains_key(&self.next_id) {
                break;
            }
        }

        let id = SessionId(self.next_id);
        self.slots.insert(id.0, Slot::Reserved { role, at: now });
        Ok(id)
    }

    /// Fill a reserved slot with an established session.
    pub fn commit(&mut self, id: SessionId, session: SecureSession) -> Result<(), Error> {
        match self.slots.get_mut(&id.0) {
            Some(slot @ Slot::Reserved { .. }) => {
                *slot = Slot::Active(Box::new(session));
                Ok(())
            }
            _ => Err(Error::UnknownSession(id)),
        }
    }

    /// Drop a reservation that will never be committed. No-op for active or
    /// unknown slots.
    pub fn release(&mut self, id: SessionId) {
        if let Some(Slot::Reserved { .. }) = self.slots.get(&id.0) {
            self.slots.remove(&id.0);
        }
    }

    pub fn get(&self, id: SessionId) -> Option<&SecureSession> {
        match self.slots.get(&id.0) {
            Some(Slot::Active(session)) => Some(session),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut SecureSession> {
        match self.slots.get_mut(&id.0) {
            Some(Slot::Active(session)) => Some(session),
            _ => None,
        }
    }

    /// Remove a session (or reservation). Idempotent; keys are zeroed as the
    /// context drops.
    pub fn evict(&mut self, id: SessionId) -> bool {
        let removed = self.slots.remove(&id.0).is_some();
        if removed {
            debug!("Evicted session {}", id);
        }
        removed
    }

    /// Remove every session bound to the given peer identity.
    pub fn evict_peer(&mut self, peer: &PeerIdentity) -> Vec<SessionId> {
        self.evict_matching(|s| s.peer() == Some(*peer))
    }

    /// Remove every session belonging to a fabric. Used when the fabric is
    /// removed from the node.
    pub fn evict_fabric(&mut self, fabric_id: u64) -> Vec<SessionId> {
        self.evict_matching(|s| s.peer().map(|p| p.fabric_id) == Some(fabric_id))
    }

    fn evict_matching<F: Fn(&SecureSession) -> bool>(&mut self, f: F) -> Vec<SessionId> {
        let ids: Vec<SessionId> = self
            .sessions()
            .filter(|(_, s)| f(s))
            .map(|(id, _)| id)
            .collect();
        for id in &ids {
            self.evict(*id);
        }
        ids
    }

    /// Evict the oldest commissioning-only session to make room for an
    /// operational one. Returns the evicted id, if any.
    pub fn evict_oldest_pase(&mut self) -> Option<SessionId> {
        let oldest = self
            .sessions()
            .filter(|(_, s)| s.kind() == SessionKind::Pase)
            .min_by_key(|(_, s)| s.created_at())
            .map(|(id, _)| id)?;
        self.evict(oldest);
        Some(oldest)
    }

    /// Iterate over committed sessions.
    pub fn sessions(&self) -> impl Iterator<Item = (SessionId, &SecureSession)> {
        self.slots.iter().filter_map(|(id, slot)| match slot {
            Slot::Active(session) => Some((SessionId(*id), session.as_ref())),
            Slot::Reserved { .. } => None,
        })
    }

    /// Iterate mutably over committed sessions.
    pub fn sessions_mut(&mut self) -> impl Iterator<Item = (SessionId, &mut SecureSession)> {
        self.slots.iter_mut().filter_map(|(id, slot)| match slot {
            Slot::Active(session) => Some((SessionId(*id), session.as_mut())),
            Slot::Reserved { .. } => None,
        })
    }
}
