//! Session time budget and cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Return the time left until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return None;
    }
    Some(remaining)
}

/// Clamp a per-call timeout to what is left of an optional session deadline.
pub fn bounded_timeout(limit: Duration, deadline: Option<Instant>) -> Duration {
    match deadline.and_then(remaining_budget) {
        Some(remaining) => limit.min(remaining),
        None if deadline.is_some() => Duration::from_millis(1),
        None => limit,
    }
}

/// Shared flag checked at the top of every loop iteration.
///
/// Cancelling never interrupts a running sandbox call; the loop stops before
/// the next step starts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn past_deadline_has_no_budget() {
        let deadline = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(remaining_budget(deadline), None);
    }

    #[test]
    fn timeout_is_clamped_to_deadline() {
        let limit = Duration::from_secs(60);
        assert_eq!(bounded_timeout(limit, None), limit);

        let deadline = Instant::now() + Duration::from_secs(5);
        assert!(bounded_timeout(limit, Some(deadline)) <= Duration::from_secs(5));
    }

    #[test]
    fn cancel_is_visible_through_clones() {
        let flag = CancelFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_cancelled());
        flag.cancel();
        assert!(observer.is_cancelled());
    }
}
