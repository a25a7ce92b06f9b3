//! Cancellation and deadlines for blocking image work

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{CatalogError, Result};

/// Cloneable cancel signal with an optional deadline
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    /// A token that never fires on its own
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail with `Cancelled` once the token has fired
    pub fn check(&self, step: &str) -> Result<()> {
        if self.flag.load(Ordering::SeqCst) {
            return Err(CatalogError::Cancelled(format!("{} cancelled", step)));
        }
        if self.is_cancelled() {
            return Err(CatalogError::Cancelled(format!("{} exceeded its deadline", step)));
        }
        Ok(())
    }
}
