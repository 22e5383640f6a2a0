//! State for one in-flight message counter sync exchange.
//!
//! When a session's receive window has consistently rejected inbound traffic
//! as too old, the channel sends a sync request carrying a random challenge,
//! sealed under the existing session key. Counter desynchronization does not
//! imply loss of the session key, so the exchange rides on the session
//! itself. The echoed challenge proves the response is fresh and from the
//! genuine session holder; the resulting window reset is a one-shot
//! correction. Exhausting all retries leaves the counter state as-is — the
//! session stays up and a later legitimate message may resynchronize
//! naturally.

use std::time::Instant;

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::config::Config;
use crate::rng::SeededRng;
use crate::timer::ExponentialBackoff;

pub(crate) struct SyncState {
    challenge: [u8; 8],
    backoff: ExponentialBackoff,
    pub next_attempt: Instant,
}

impl SyncState {
    pub fn new(config: &Config, rng: &mut SeededRng, now: Instant) -> Self {
        let mut challenge = [0u8; 8];
        OsRng.fill_bytes(&mut challenge);

        let backoff = ExponentialBackoff::new(config.sync_start_rto(), config.sync_retries(), rng);
        let next_attempt = now + backoff.rto();

        SyncState {
            challenge,
            backoff,
            next_attempt,
        }
    }

    pub fn challenge(&self) -> [u8; 8] {
        self.challenge
    }

    /// Constant-time check of an echoed challenge.
    pub fn matches(&self, echoed: &[u8; 8]) -> bool {
        self.challenge.ct_eq(echoed).into()
    }

    /// Account for a retry. Returns false when the retry budget is spent;
    /// the caller then discards this state without touching the counters.
    pub fn schedule_retry(&mut self, rng: &mut SeededRng, now: Instant) -> bool {
        if !self.backoff.can_retry() {
            return false;
        }
        self.backoff.attempt(rng);
        self.next_attempt = now + self.backoff.rto();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn retries_are_bounded() {
        let config = Config::builder()
            .sync_retries(2)
            .sync_start_rto(Duration::from_millis(100))
            .build()
            .unwrap();
        let mut rng = SeededRng::new(Some(1));
        let now = Instant::now();

        let mut sync = SyncState::new(&config, &mut rng, now);
        assert!(sync.schedule_retry(&mut rng, now));
        assert!(sync.schedule_retry(&mut rng, now));
        assert!(!sync.schedule_retry(&mut rng, now));
    }

    #[test]
    fn challenge_match_is_exact() {
        let config = Config::default();
        let mut rng = SeededRng::new(Some(1));
        let sync = SyncState::new(&config, &mut rng, Instant::now());

        let good = sync.challenge();
        assert!(sync.matches(&good));

        let mut bad = good;
        bad[0] ^= 1;
        assert!(!sync.matches(&bad));
    }
}
