//! Per-session message counters.
//!
//! Each session tracks one send counter and one receive window per direction.
//! The receive side maintains the highest accepted counter and a 32-bit
//! bitmap of the preceding values to reject duplicates and stale messages on
//! a transport that reorders and duplicates datagrams.
//!
//! The send side never regresses, including across process restart: send
//! counters draw their start value from a persisted epoch ceiling that is
//! advanced in steps, so a rebooting device always resumes counting above
//! anything it may have used before the crash.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Error;

/// Receive window width in messages.
pub const WINDOW_SIZE: u32 = 32;

/// Why an inbound counter was not admitted.
///
/// Rejection is a silent local drop of the datagram. It never tears down the
/// session; a stale message is not a compromised session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The counter was already accepted once.
    Duplicate,
    /// The counter is below the window floor.
    TooOld,
}

/// Sliding receive window over peer message counters.
///
/// Starts unsynchronized: the first admitted value seeds the window. A value
/// above the current maximum is always accepted and slides the window
/// forward, clearing bits that fall out of range (far-ahead values are
/// accepted immediately rather than held for corroboration; the counter sync
/// protocol repairs the opposite case, a peer that fell behind).
#[derive(Debug, Default)]
pub struct PeerCounter {
    max: u32,
    window: u32,
    synced: bool,
}

impl PeerCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any value has been admitted yet.
    pub fn is_synchronized(&self) -> bool {
        self.synced
    }

    /// Check an inbound counter and update the window state.
    pub fn admit(&mut self, counter: u32) -> Result<(), RejectReason> {
        if !self.synced {
            // First received value seeds the window.
            self.reset_to(counter);
            return Ok(());
        }

        if counter > self.max {
            let delta = counter - self.max;
            if delta >= WINDOW_SIZE {
                // Everything previously seen fell out of range; a capped
                // shift would leave stale bits shadowing unseen counters.
                self.window = 1;
            } else {
                self.window <<= delta;
                self.window |= 1; // mark newest as seen
            }
            self.max = counter;
            Ok(())
        } else {
            let offset = self.max - counter;
            if offset >= WINDOW_SIZE {
                return Err(RejectReason::TooOld);
            }
            let mask = 1u32 << offset;
            if (self.window & mask) != 0 {
                return Err(RejectReason::Duplicate);
            }
            self.window |= mask;
            Ok(())
        }
    }

    /// Reseed the window at the given value, marking it as seen.
    ///
    /// Used when the first value arrives and by the counter sync protocol as
    /// a one-shot correction.
    pub fn reset_to(&mut self, counter: u32) {
        self.max = counter;
        self.window = 1;
        self.synced = true;
    }
}

/// Persistence hook for the send counter epoch ceiling.
///
/// A platform backs this with its key-value store. The contract is only that
/// `load` after a restart returns the last value passed to `store`.
pub trait EpochStore {
    fn load(&mut self) -> Option<u32>;
    fn store(&mut self, ceiling: u32);
}

/// In-memory [`EpochStore`] whose backing cell survives the store value
/// itself, so tests can simulate a reboot by constructing a second store
/// from the same handle.
#[derive(Debug, Default, Clone)]
pub struct MemoryEpochStore {
    cell: Rc<RefCell<Option<u32>>>,
}

impl MemoryEpochStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EpochStore for MemoryEpochStore {
    fn load(&mut self) -> Option<u32> {
        *self.cell.borrow()
    }

    fn store(&mut self, ceiling: u32) {
        *self.cell.borrow_mut() = Some(ceiling);
    }
}

/// Shared epoch ceiling for all send counters of one node.
///
/// Guarantees that every counter value handed out is strictly below the
/// persisted ceiling, so a restart (which resumes at the ceiling) can never
/// reuse a value.
pub struct CounterEpoch {
    store: Box<dyn EpochStore>,
    ceiling: u32,
}

impl CounterEpoch {
    pub fn new(mut store: Box<dyn EpochStore>) -> Self {
        let ceiling = store.load().unwrap_or(0);
        CounterEpoch { store, ceiling }
    }

    /// Reserve a start value for a new counter and advance the ceiling.
    fn issue_start(&mut self, step: u32) -> u32 {
        let start = self.ceiling;
        self.advance_beyond(start, step);
        start
    }

    /// Make sure the persisted ceiling is strictly above `used`.
    fn advance_beyond(&mut self, used: u32, step: u32) {
        if used >= self.ceiling {
            self.ceiling = used.saturating_add(step);
            self.store.store(self.ceiling);
        }
    }
}

/// Monotonic send counter for one session.
///
/// Values are never reused for the lifetime of the session, and thanks to
/// the shared [`CounterEpoch`] never reused across restarts either. The u32
/// space running out is terminal for the session; keys must be rotated by
/// establishing a new session anyway.
pub struct LocalCounter {
    current: u32,
    step: u32,
    epoch: Rc<RefCell<CounterEpoch>>,
}

impl LocalCounter {
    pub fn new(epoch: Rc<RefCell<CounterEpoch>>, step: u32) -> Self {
        let current = epoch.borrow_mut().issue_start(step);
        LocalCounter {
            current,
            step,
            epoch,
        }
    }

    /// The last allocated value (the start value if nothing was sent yet).
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Allocate the next send counter value.
    pub fn next(&mut self) -> Result<u32, Error> {
        let value = self.current.checked_add(1).ok_or(Error::CounterExhausted)?;
        self.epoch
            .borrow_mut()
            .advance_beyond(value, self.step);
        self.current = value;
        Ok(value)
    }
}

impl std::fmt::Debug for LocalCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCounter")
            .field("current", &self.current)
            .field("step", &self.step)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch() -> Rc<RefCell<CounterEpoch>> {
        Rc::new(RefCell::new(CounterEpoch::new(Box::new(
            MemoryEpochStore::new(),
        ))))
    }

    #[test]
    fn first_value_seeds_window() {
        let mut w = PeerCounter::new();
        assert!(!w.is_synchronized());
        assert!(w.admit(500).is_ok());
        assert!(w.is_synchronized());
        assert_eq!(w.admit(500), Err(RejectReason::Duplicate));
        assert!(w.admit(501).is_ok());
    }

    #[test]
    fn duplicate_within_window_rejected() {
        let mut w = PeerCounter::new();
        for c in [5, 6, 7] {
            assert!(w.admit(c).is_ok());
        }
        assert_eq!(w.admit(6), Err(RejectReason::Duplicate));
    }

    #[test]
    fn far_ahead_slides_window() {
        let mut w = PeerCounter::new();
        for c in [5, 6, 7] {
            assert!(w.admit(c).is_ok());
        }
        // Immediate-accept policy for large gaps.
        assert!(w.admit(40).is_ok());
        // Below the new window floor.
        assert_eq!(w.admit(1), Err(RejectReason::TooOld));
        // Within the new window and unseen.
        assert!(w.admit(39).is_ok());
    }

    #[test]
    fn far_jump_clears_the_whole_window() {
        let mut w = PeerCounter::new();
        assert!(w.admit(7).is_ok());
        // A jump of exactly the window width drops every seen value out of
        // range; no stale bit may survive the slide.
        assert!(w.admit(39).is_ok());
        // Offset 31 from the new max, never received before.
        assert!(w.admit(8).is_ok());
        assert_eq!(w.admit(8), Err(RejectReason::Duplicate));
        assert_eq!(w.admit(39), Err(RejectReason::Duplicate));
    }

    #[test]
    fn too_old_at_window_edge() {
        let mut w = PeerCounter::new();
        assert!(w.admit(100).is_ok());
        // offset 32 -> too old
        assert_eq!(w.admit(68), Err(RejectReason::TooOld));
        // offset 31 -> allowed once
        assert!(w.admit(69).is_ok());
        assert_eq!(w.admit(69), Err(RejectReason::Duplicate));
    }

    #[test]
    fn reset_is_one_shot_correction() {
        let mut w = PeerCounter::new();
        assert!(w.admit(1000).is_ok());
        assert_eq!(w.admit(3), Err(RejectReason::TooOld));

        w.reset_to(2);
        assert!(w.admit(3).is_ok());
        assert_eq!(w.admit(2), Err(RejectReason::Duplicate));
    }

    #[test]
    fn local_counter_is_monotonic() {
        let e = epoch();
        let mut c = LocalCounter::new(e, 10);
        let a = c.next().unwrap();
        let b = c.next().unwrap();
        assert!(b > a);
        assert_eq!(c.current(), b);
    }

    #[test]
    fn counter_never_regresses_across_restart() {
        let store = MemoryEpochStore::new();

        let e = Rc::new(RefCell::new(CounterEpoch::new(Box::new(store.clone()))));
        let mut c = LocalCounter::new(Rc::clone(&e), 100);
        let mut highest = 0;
        for _ in 0..250 {
            highest = c.next().unwrap();
        }
        drop(c);
        drop(e);

        // "Reboot" with the same backing store.
        let e2 = Rc::new(RefCell::new(CounterEpoch::new(Box::new(store))));
        let mut c2 = LocalCounter::new(e2, 100);
        assert!(c2.current() > highest);
        assert!(c2.next().unwrap() > highest);
    }

    #[test]
    fn counters_share_one_epoch() {
        let e = epoch();
        let a = LocalCounter::new(Rc::clone(&e), 50);
        let b = LocalCounter::new(e, 50);
        // Two sessions never hand out overlapping ranges.
        assert!(b.current() >= a.current() + 50);
    }

    #[test]
    fn exhausted_counter_errors() {
        struct MaxStore;
        impl EpochStore for MaxStore {
            fn load(&mut self) -> Option<u32> {
                Some(u32::MAX)
            }
            fn store(&mut self, _: u32) {}
        }

        let e = Rc::new(RefCell::new(CounterEpoch::new(Box::new(MaxStore))));
        let mut c = LocalCounter::new(e, 10);
        assert_eq!(c.next().unwrap_err(), Error::CounterExhausted);
    }
}
