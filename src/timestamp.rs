//! A process-wide monotonic logical clock used to order transactions,
//! page writes, and checkpoints relative to one another.

use std::sync::atomic::{AtomicI64, Ordering};

/// A process-wide monotonic logical clock. Never goes backwards.
pub struct TimestampAllocator {
    counter: AtomicI64,
}

impl TimestampAllocator {
    pub fn new(initial: i64) -> Self {
        TimestampAllocator {
            counter: AtomicI64::new(initial),
        }
    }

    /// Returns the next value, advancing the counter by one.
    pub fn allocate(&self) -> i64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Mints a fresh, never-reused value. Distinct from `allocate`
    /// only in name, kept as a separate entry point for callers that
    /// want to say "refresh the clock" rather than "mint a timestamp".
    pub fn update_timestamp(&self) -> i64 {
        self.allocate()
    }

    /// Mints a timestamp for a new checkpoint. The journal manager
    /// must observe this value before writing to the volume any page
    /// whose timestamp is later than it.
    pub fn allocate_checkpoint_timestamp(&self) -> i64 {
        self.allocate()
    }

    /// Current value without advancing. Used by read-only snapshot
    /// callers (Exchange fetch paths) that need "now" but must not
    /// mint a timestamp other transactions could observe as theirs.
    pub fn peek(&self) -> i64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Advances the counter so that the next `allocate()` is strictly
    /// greater than `floor`. Used by recovery to reinstall the clock
    /// above the highest timestamp observed on disk plus a safety
    /// margin.
    pub fn bump_to_at_least(&self, floor: i64) {
        let mut current = self.counter.load(Ordering::SeqCst);
        while current < floor {
            match self.counter.compare_exchange_weak(
                current,
                floor,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for TimestampAllocator {
    fn default() -> Self {
        TimestampAllocator::new(0)
    }
}

/// Safety margin applied by recovery when reinstalling the clock
/// above the highest timestamp observed on disk, so a transaction
/// started immediately after a restart cannot collide with one that
/// was in flight before the crash.
pub const RECOVERY_SAFETY_MARGIN: i64 = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_monotonic_and_never_repeats() {
        let clock = TimestampAllocator::default();
        let mut last = clock.allocate();
        for _ in 0..1000 {
            let next = clock.allocate();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn bump_to_at_least_never_goes_backwards() {
        let clock = TimestampAllocator::new(100);
        clock.bump_to_at_least(50);
        assert_eq!(clock.peek(), 100);
        clock.bump_to_at_least(500);
        assert_eq!(clock.peek(), 500);
        assert!(clock.allocate() > 500);
    }

    #[test]
    fn checkpoint_timestamp_advances_clock() {
        let clock = TimestampAllocator::default();
        let before = clock.peek();
        let cp = clock.allocate_checkpoint_timestamp();
        assert!(cp > before);
        assert!(clock.allocate() > cp);
    }
}
