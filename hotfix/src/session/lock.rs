//! Process-wide single-flight guard

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Admits one session at a time; a second attempt fails instead of waiting
#[derive(Debug, Default)]
pub struct SessionLock {
    held: AtomicBool,
}

/// Releases the lock on drop, including while unwinding
#[derive(Debug)]
pub struct SessionGuard<'a> {
    lock: &'a SessionLock,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}

impl SessionLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock shared by every [`crate::Hotfixer::native`] session
    pub fn global() -> Arc<SessionLock> {
        static GLOBAL: OnceLock<Arc<SessionLock>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(SessionLock::new())))
    }

    /// `None` if another session holds the lock
    #[must_use]
    pub fn try_acquire(&self) -> Option<SessionGuard<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SessionGuard { lock: self })
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}
