//! Process-wide session ownership

use crate::{Error, Result};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static GLOBAL: Lazy<Arc<SessionLock>> = Lazy::new(SessionLock::new);

/// Ownership of the host's proxy, route and DNS state
#[derive(Debug, Default)]
pub struct SessionLock {
    held: AtomicBool,
}

impl SessionLock {
    pub fn new() -> Arc<Self> {
        Arc::new(SessionLock::default())
    }

    /// The lock shared by every session of this process
    pub fn global() -> Arc<Self> {
        GLOBAL.clone()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    pub fn try_acquire(self: &Arc<Self>) -> Result<SessionGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::SessionAlreadyActive)?;
        Ok(SessionGuard { lock: self.clone() })
    }
}

/// Releases the lock on drop
#[derive(Debug)]
pub struct SessionGuard {
    lock: Arc<SessionLock>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive() {
        let lock = SessionLock::new();
        let guard = lock.try_acquire().unwrap();
        assert!(lock.is_held());
        assert!(matches!(lock.try_acquire(), Err(Error::SessionAlreadyActive)));
        drop(guard);
        assert!(!lock.is_held());
        assert!(lock.try_acquire().is_ok());
    }
}
