//! Storage locking.
//!
//! A [`StorageLocker`] guards cross-process mutations: the empty sublock
//! covers the whole storage (`storage.conf` read-modify-write), a
//! non-empty sublock covers one glue build. The discipline is
//! coarse-grained: storage first, glue second, released in reverse.
//! Failing to release a held lock aborts the process rather than risk
//! releasing another holder's lock.

use std::sync::Arc;

use crate::error::Result;

/// User-supplied lock implementation.
pub trait StorageLocker: Send + Sync {
    /// Lock the whole storage (empty sublock) or one entity inside it.
    fn lock(&self, sublock: &str) -> Result<()>;

    /// Release a previously acquired lock.
    fn unlock(&self, sublock: &str) -> Result<()>;
}

/// RAII guard over one (sub)lock.
pub struct ScopedLock {
    locker: Option<Arc<dyn StorageLocker>>,
    sublock: String,
    locked: bool,
}

impl ScopedLock {
    /// Acquire; a missing locker degrades to a no-op guard.
    pub fn new(locker: Option<&Arc<dyn StorageLocker>>, sublock: &str) -> Result<ScopedLock> {
        let mut guard = ScopedLock {
            locker: locker.cloned(),
            sublock: sublock.to_string(),
            locked: false,
        };
        guard.lock()?;
        Ok(guard)
    }

    pub fn lock(&mut self) -> Result<()> {
        if let Some(locker) = &self.locker {
            if !self.locked {
                locker.lock(&self.sublock)?;
                self.locked = true;
            }
        }
        Ok(())
    }

    pub fn unlock(&mut self) -> Result<()> {
        if let Some(locker) = &self.locker {
            if self.locked {
                locker.unlock(&self.sublock)?;
                self.locked = false;
            }
        }
        Ok(())
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        if self.unlock().is_err() {
            // releasing another holder's lock must never happen; a failed
            // unlock leaves the lock state unknown
            tracing::error!(sublock = %self.sublock, "unable to release storage lock");
            std::process::abort();
        }
    }
}
