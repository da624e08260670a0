// lattice/src/deadline.rs
//
// Cooperative time limit for one lattice. Long-running passes call
// `check` at loop boundaries and give up with `Timeout` once the wall
// clock passes the limit, or with `Cancelled` when another thread pulled
// the flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{LatticeError, Result};

#[derive(Debug, Clone, Default)]
pub struct Deadline {
    expires: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Deadline {
    /// No time limit.
    pub fn none() -> Self {
        Self::default()
    }

    /// Expires `limit` from now; `None` never expires.
    pub fn after(limit: Option<Duration>) -> Self {
        Self {
            expires: limit.map(|d| Instant::now() + d),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag that cancels this deadline when set.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.expires.map(|e| e.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        self.expires.is_some_and(|e| Instant::now() >= e)
    }

    pub fn check(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(LatticeError::Cancelled);
        }
        if self.expired() {
            return Err(LatticeError::Timeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_expires() {
        let d = Deadline::none();
        assert!(d.check().is_ok());
        assert!(d.remaining().is_none());
    }

    #[test]
    fn zero_limit_expires_at_once() {
        let d = Deadline::after(Some(Duration::ZERO));
        assert!(matches!(d.check(), Err(LatticeError::Timeout)));
    }

    #[test]
    fn cancellation_is_shared() {
        let d = Deadline::after(Some(Duration::from_secs(3600)));
        let copy = d.clone();
        copy.cancel();
        assert!(matches!(d.check(), Err(LatticeError::Cancelled)));
    }
}
