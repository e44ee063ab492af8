//! Config reload signal between the config receiver and the sending worker.
//!
//! A flag, not a queue: any number of `set()` calls before the next `take()`
//! result in a single reload, which reads whatever config is on disk by then.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ReloadSignal {
    pending: Arc<AtomicBool>,
}

impl ReloadSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Returns true if a reload is pending, and clears it.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}
