//! Cooperative cancellation.
//!
//! A [`CancelToken`] is handed to long-running owners (tilesets, glue
//! generation) at construction; internal loops check it between tiles and
//! abort with [`TileStoreError::Interrupted`]. Cancellation never corrupts
//! state: nothing partial becomes visible until the owning flush runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, TileStoreError};

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Request cancellation; checked at the next loop boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Fail with `Interrupted` when cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(TileStoreError::Interrupted);
        }
        Ok(())
    }
}
