//! Deadline queue for the core event loop.
//!
//! Every piece of deferred work is a [`Timer`] with one pending deadline.
//! A binary heap gives the next deadline; stale heap entries are discarded by
//! checking against the pending map.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use crate::daemon::database::DatabaseSignature;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timer {
    /// Write back a database's sources.
    Sync(DatabaseSignature),
    /// Periodic sweep, hibernation and compaction.
    Cleanup,
    /// Close the saved-state append handle after a quiet period.
    CloseLog,
}

#[derive(Default)]
pub struct Scheduler {
    pending: HashMap<Timer, Instant>,
    heap: BinaryHeap<Reverse<(Instant, Timer)>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `timer` for `at` unless it is already pending. An armed timer is
    /// never moved by this call.
    pub fn arm(&mut self, timer: Timer, at: Instant) -> bool {
        if self.pending.contains_key(&timer) {
            return false;
        }
        self.insert(timer, at);
        true
    }

    /// Arm `timer` for `at`, replacing any pending deadline.
    pub fn set(&mut self, timer: Timer, at: Instant) {
        if self.pending.get(&timer) == Some(&at) {
            return;
        }
        self.insert(timer, at);
    }

    fn insert(&mut self, timer: Timer, at: Instant) {
        self.pending.insert(timer.clone(), at);
        self.heap.push(Reverse((at, timer)));
    }

    pub fn cancel(&mut self, timer: &Timer) {
        self.pending.remove(timer);
    }

    /// Drop every pending timer.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.heap.clear();
    }

    pub fn is_pending(&self, timer: &Timer) -> bool {
        self.pending.contains_key(timer)
    }

    pub fn deadline_for(&self, timer: &Timer) -> Option<Instant> {
        self.pending.get(timer).copied()
    }

    /// The earliest pending deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.pop_stale();
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Remove and return the earliest timer due at `now`, if any.
    pub fn pop_due(&mut self, now: Instant) -> Option<Timer> {
        self.pop_stale();
        let Reverse((at, _)) = self.heap.peek()?;
        if *at > now {
            return None;
        }
        let Reverse((_, timer)) = self.heap.pop()?;
        self.pending.remove(&timer);
        Some(timer)
    }

    fn pop_stale(&mut self) {
        while let Some(Reverse((at, timer))) = self.heap.peek() {
            match self.pending.get(timer).copied() {
                Some(current) if current == *at => break,
                _ => {
                    let _ = self.heap.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sync_timer() -> Timer {
        Timer::Sync(DatabaseSignature::default_database())
    }

    fn due(scheduler: &mut Scheduler, now: Instant) -> Vec<Timer> {
        std::iter::from_fn(|| scheduler.pop_due(now)).collect()
    }

    #[test]
    fn arm_and_pop_due() {
        let mut scheduler = Scheduler::new();
        let base = Instant::now();
        assert!(scheduler.arm(sync_timer(), base + Duration::from_secs(5)));

        assert_eq!(scheduler.next_deadline(), Some(base + Duration::from_secs(5)));
        assert!(due(&mut scheduler, base + Duration::from_secs(4)).is_empty());
        assert_eq!(
            due(&mut scheduler, base + Duration::from_secs(5)),
            vec![sync_timer()]
        );
        assert!(!scheduler.is_pending(&sync_timer()));
        assert_eq!(scheduler.next_deadline(), None);
    }

    #[test]
    fn arm_does_not_move_pending_timer() {
        let mut scheduler = Scheduler::new();
        let base = Instant::now();
        scheduler.arm(sync_timer(), base + Duration::from_secs(5));
        assert!(!scheduler.arm(sync_timer(), base + Duration::from_secs(9)));
        assert!(!scheduler.arm(sync_timer(), base + Duration::from_secs(1)));
        assert_eq!(
            scheduler.deadline_for(&sync_timer()),
            Some(base + Duration::from_secs(5))
        );
    }

    #[test]
    fn set_moves_and_discards_stale_entries() {
        let mut scheduler = Scheduler::new();
        let base = Instant::now();
        scheduler.arm(sync_timer(), base + Duration::from_secs(5));
        scheduler.set(sync_timer(), base);

        assert_eq!(due(&mut scheduler, base), vec![sync_timer()]);
        // The superseded entry at +5s must not fire again.
        assert!(due(&mut scheduler, base + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut scheduler = Scheduler::new();
        let base = Instant::now();
        scheduler.set(Timer::Cleanup, base + Duration::from_secs(3));
        scheduler.set(Timer::CloseLog, base + Duration::from_secs(1));
        scheduler.arm(sync_timer(), base + Duration::from_secs(2));

        assert_eq!(
            due(&mut scheduler, base + Duration::from_secs(3)),
            vec![Timer::CloseLog, sync_timer(), Timer::Cleanup]
        );
    }

    #[test]
    fn cancel_and_clear() {
        let mut scheduler = Scheduler::new();
        let base = Instant::now();
        scheduler.set(Timer::Cleanup, base);
        scheduler.cancel(&Timer::Cleanup);
        assert_eq!(scheduler.next_deadline(), None);

        scheduler.set(Timer::CloseLog, base);
        scheduler.clear();
        assert!(scheduler.pop_due(base).is_none());
    }
}
