//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Flags {
    stop: AtomicBool,
    force: AtomicBool,
    /// Set by a force stop until someone has told the equipment.
    force_pending: AtomicBool,
}

/// Shared stop / force-stop flags for one scan.
///
/// Cloning is cheap and every clone observes the same flags. The engine polls
/// the graceful stop flag once per step, before the step's writes; a step that
/// has begun always completes. A force stop also sets the graceful flag, and
/// additionally tells equipment to abort what it is doing: whoever first
/// claims it with [`CancelToken::take_pending_force`] calls
/// [`crate::channel::EquipmentHooks::force_stop`], so equipment is aborted
/// once per request.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flags: Arc<Flags>,
}

impl CancelToken {
    /// Create a token with both flags cleared.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the engine to stop at the next step boundary.
    pub fn request_stop(&self) {
        self.flags.stop.store(true, Ordering::SeqCst);
    }

    /// Stop at the next step boundary and mark the stop as forced.
    pub fn request_force_stop(&self) {
        self.flags.force.store(true, Ordering::SeqCst);
        self.flags.force_pending.store(true, Ordering::SeqCst);
        self.flags.stop.store(true, Ordering::SeqCst);
    }

    /// Claim an undelivered force stop. Returns true at most once per request.
    pub fn take_pending_force(&self) -> bool {
        self.flags.force_pending.swap(false, Ordering::SeqCst)
    }

    /// Whether a graceful or forced stop is pending.
    pub fn is_stop_requested(&self) -> bool {
        self.flags.stop.load(Ordering::SeqCst)
    }

    /// Whether the pending stop was forced.
    pub fn is_force_requested(&self) -> bool {
        self.flags.force.load(Ordering::SeqCst)
    }

    /// Clear both flags.
    pub fn reset(&self) {
        self.flags.stop.store(false, Ordering::SeqCst);
        self.flags.force.store(false, Ordering::SeqCst);
        self.flags.force_pending.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flags() {
        let token = CancelToken::new();
        let remote = token.clone();
        assert!(!token.is_stop_requested());

        remote.request_stop();
        assert!(token.is_stop_requested());
        assert!(!token.is_force_requested());

        token.reset();
        assert!(!remote.is_stop_requested());
    }

    #[test]
    fn test_force_stop_implies_stop() {
        let token = CancelToken::new();
        token.request_force_stop();
        assert!(token.is_stop_requested());
        assert!(token.is_force_requested());
    }

    #[test]
    fn test_pending_force_is_claimed_once() {
        let token = CancelToken::new();
        assert!(!token.take_pending_force());

        token.request_force_stop();
        let remote = token.clone();
        assert!(remote.take_pending_force());
        assert!(!token.take_pending_force());
        assert!(token.is_force_requested(), "claiming keeps the stop forced");

        token.request_force_stop();
        token.reset();
        assert!(!token.take_pending_force());
    }
}
