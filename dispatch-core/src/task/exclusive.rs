//! Registry of task kinds that may only run one instance at a time.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Set of currently claimed exclusive keys.
///
/// Owned by the surrounding service and handed to tasks explicitly, so that
/// independent registries can coexist (e.g. in parallel tests).
#[derive(Debug, Default)]
pub struct ExclusiveRegistry {
    claimed: Mutex<HashSet<String>>,
}

impl ExclusiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_claimed(&self, key: &str) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    fn try_claim(&self, key: &str) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string())
    }

    fn release(&self, key: &str) {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// One task's membership in an exclusive key.
pub(crate) struct ExclusiveClaim {
    registry: Arc<ExclusiveRegistry>,
    key: String,
    held: AtomicBool,
}

impl ExclusiveClaim {
    pub(crate) fn new(registry: Arc<ExclusiveRegistry>, key: impl Into<String>) -> Self {
        Self {
            registry,
            key: key.into(),
            held: AtomicBool::new(false),
        }
    }

    /// Claim the key. Only one claim across all instances can succeed.
    pub(crate) fn lock(&self) -> bool {
        let claimed = self.registry.try_claim(&self.key);
        if claimed {
            self.held.store(true, Ordering::SeqCst);
        }
        debug!(key = %self.key, claimed, "Exclusive lock requested");
        claimed
    }

    /// Release the key, but only if this instance holds it.
    pub(crate) fn unlock(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            self.registry.release(&self.key);
            debug!(key = %self.key, "Exclusive lock released");
        }
    }
}
