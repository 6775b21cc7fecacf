//! Per-session cooperative cancellation flag.
//!
//! The flag is passed explicitly to every suspension point of a turn (input
//! steps, fragment consumption, output dispatch), which poll it at loop
//! boundaries. Nothing is preempted.
//!
//! A turn settles its outcome by closing the flag. Once closed, `raise` is
//! refused until the flag is cleared for the next turn, so an interrupt is
//! either observed by the turn or rejected, never silently dropped.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const ARMED: u8 = 0;
const RAISED: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicU8>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns `false` if it was already raised or the turn
    /// has closed, so at most one interrupt is pending at a time.
    pub fn raise(&self) -> bool {
        self.0
            .compare_exchange(ARMED, RAISED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst) == RAISED
    }

    /// Commit the turn's outcome. Returns `false` if an interrupt got in
    /// first; the caller must then treat the turn as interrupted.
    /// Closing twice is fine.
    pub fn close(&self) -> bool {
        match self
            .0
            .compare_exchange(ARMED, CLOSED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(current) => current == CLOSED,
        }
    }

    /// Re-arm for the next turn. Returns whether an interrupt was pending.
    pub fn clear(&self) -> bool {
        self.0.swap(ARMED, Ordering::SeqCst) == RAISED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_raise_is_a_no_op() {
        let flag = InterruptFlag::new();
        assert!(flag.raise());
        assert!(!flag.clone().raise());
        assert!(flag.is_raised());
        assert!(flag.clear());
        assert!(!flag.clear());
        assert!(!flag.is_raised());
    }

    #[test]
    fn closed_flag_refuses_raise_until_cleared() {
        let flag = InterruptFlag::new();
        assert!(flag.close());
        assert!(flag.close());
        assert!(!flag.raise());
        assert!(!flag.is_raised());
        assert!(!flag.clear());
        assert!(flag.raise());
    }

    #[test]
    fn raised_flag_cannot_close() {
        let flag = InterruptFlag::new();
        assert!(flag.raise());
        assert!(!flag.close());
        assert!(flag.is_raised());
    }
}
