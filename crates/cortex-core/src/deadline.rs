//! An optional wall-clock cutoff a long-running operation can be asked to
//! respect. Inserts and searches finish in milliseconds and never check it;
//! consolidation is the one pass long enough, on a large store, for a caller
//! to want to bound it.

use std::time::{Duration, Instant};

/// A point in time after which a caller-supplied operation should stop
/// starting new work and return whatever has already committed cleanly.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Instant);

impl Deadline {
    /// A deadline `duration` from now.
    pub fn after(duration: Duration) -> Self {
        Deadline(Instant::now() + duration)
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_deadline_is_not_expired() {
        let d = Deadline::after(Duration::from_secs(60));
        assert!(!d.is_expired());
    }

    #[test]
    fn zero_duration_deadline_is_immediately_expired() {
        let d = Deadline::after(Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(1));
        assert!(d.is_expired());
    }
}
