//! Wait deadlines.
//!
//! A [`Deadline`] is the absolute point in time up to which a blocking call
//! may wait. Every suspending operation in the crate takes one; the
//! unreachable deadline means "wait forever" and the already-passed deadline
//! turns a blocking call into a single non-blocking attempt.

use std::time::{Duration, Instant};

/// An absolute point in time a blocking operation may wait until.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline {
    when: Option<Instant>,
}

impl Deadline {
    /// A deadline that never expires.
    #[must_use]
    pub const fn unreachable() -> Self {
        Self { when: None }
    }

    /// A deadline that has already expired.
    ///
    /// Blocking calls given this deadline make exactly one non-blocking
    /// attempt.
    #[must_use]
    pub fn passed() -> Self {
        Self {
            when: Some(Instant::now()),
        }
    }

    /// A deadline at the given instant.
    #[must_use]
    pub const fn at(instant: Instant) -> Self {
        Self {
            when: Some(instant),
        }
    }

    /// A deadline the given duration from now.
    #[must_use]
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            when: Instant::now().checked_add(duration),
        }
    }

    /// Returns true if this deadline can expire at all.
    #[must_use]
    pub const fn is_reachable(&self) -> bool {
        self.when.is_some()
    }

    /// Returns true if the deadline has already expired.
    #[must_use]
    pub fn is_passed(&self) -> bool {
        matches!(self.when, Some(when) if when <= Instant::now())
    }

    /// Time remaining until expiry.
    ///
    /// Returns `Duration::MAX` for an unreachable deadline and zero for an
    /// expired one.
    #[must_use]
    pub fn time_left(&self) -> Duration {
        match self.when {
            Some(when) => when.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    /// Time remaining, or `None` when the deadline is unreachable or has
    /// already expired.
    pub(crate) fn time_left_nonzero(&self) -> Option<Duration> {
        let when = self.when?;
        let left = when.saturating_duration_since(Instant::now());
        (left > Duration::ZERO).then_some(left)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_never_passes() {
        let deadline = Deadline::unreachable();
        assert!(!deadline.is_reachable());
        assert!(!deadline.is_passed());
        assert_eq!(deadline.time_left(), Duration::MAX);
    }

    #[test]
    fn passed_is_passed() {
        let deadline = Deadline::passed();
        assert!(deadline.is_reachable());
        assert!(deadline.is_passed());
        assert_eq!(deadline.time_left(), Duration::ZERO);
        assert!(deadline.time_left_nonzero().is_none());
    }

    #[test]
    fn from_duration_is_in_the_future() {
        let deadline = Deadline::from_duration(Duration::from_secs(60));
        assert!(deadline.is_reachable());
        assert!(!deadline.is_passed());
        let left = deadline.time_left();
        assert!(left > Duration::from_secs(59));
        assert!(left <= Duration::from_secs(60));
        assert!(deadline.time_left_nonzero().is_some());
    }

    #[test]
    fn at_instant_round_trips() {
        let instant = Instant::now() + Duration::from_millis(5);
        let deadline = Deadline::at(instant);
        assert!(deadline.is_reachable());
        std::thread::sleep(Duration::from_millis(10));
        assert!(deadline.is_passed());
    }
}
