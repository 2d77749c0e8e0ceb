//! Per-target rollout locks.
//!
//! At most one attempt may be in flight for a `namespace/deployment`.
//! Acquiring returns a guard; dropping the guard releases the target.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct RolloutLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl RolloutLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `key`, or `None` if another attempt holds it.
    pub fn try_acquire(&self, key: &str) -> Option<RolloutGuard> {
        if !self.lock().insert(key.to_string()) {
            debug!(%key, "rollout lock busy");
            return None;
        }
        debug!(%key, "rollout lock acquired");
        Some(RolloutGuard {
            key: key.to_string(),
            locks: self.clone(),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.lock().contains(key)
    }
}

/// Releases its target when dropped.
#[derive(Debug)]
pub struct RolloutGuard {
    key: String,
    locks: RolloutLocks,
}

impl RolloutGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RolloutGuard {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.key);
        debug!(key = %self.key, "rollout lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_until_release() {
        let locks = RolloutLocks::new();
        let guard = locks.try_acquire("prod/backend").unwrap();
        assert!(locks.try_acquire("prod/backend").is_none());
        assert!(locks.is_held("prod/backend"));

        drop(guard);
        assert!(!locks.is_held("prod/backend"));
        assert!(locks.try_acquire("prod/backend").is_some());
    }

    #[test]
    fn distinct_targets_are_independent() {
        let locks = RolloutLocks::new();
        let _a = locks.try_acquire("prod/backend").unwrap();
        let b = locks.try_acquire("prod/frontend");
        assert_eq!(b.map(|g| g.key().to_string()), Some("prod/frontend".into()));
    }

    #[test]
    fn clones_share_state() {
        let locks = RolloutLocks::new();
        let other = locks.clone();
        let _guard = locks.try_acquire("prod/backend").unwrap();
        assert!(other.try_acquire("prod/backend").is_none());
    }
}
