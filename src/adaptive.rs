//! Live-updatable configuration handle.
//!
//! The limiter keeps its [`PolicyTable`](crate::PolicyTable) in a [`DynamicConfig`] so
//! quotas can be swapped at runtime without rebuilding the limiter. Reads are lock-free
//! through `ArcSwap`; feature `adaptive-rwlock` switches to an `RwLock` backend.

use std::sync::Arc;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::{PoisonError, RwLock};

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Shared handle to a value that can be replaced while readers hold old snapshots.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(Arc::new(value))) }
        }
    }

    /// Snapshot of the current value. A decision in progress keeps using its snapshot
    /// even if the value is replaced mid-way.
    pub fn get(&self) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.load_full()
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Arc::clone(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
        }
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.store(Arc::new(value));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(value);
        }
    }

    /// Derive a new value from the current one.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.rcu(|current| f(current.as_ref()));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let next = f(&guard);
            *guard = Arc::new(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;
    use crate::rate_limit::{PolicyTable, RateLimitConfig};
    use crate::tier::Tier;

    #[test]
    fn swaps_policy_table() {
        let policies = DynamicConfig::new(PolicyTable::builtin());
        let before = policies.get();
        assert_eq!(before.resolve("ai-resume", Tier::Free).unwrap().max_requests(), 3);

        policies.update(|table| {
            let mut table = table.clone();
            table.set("ai-resume", Tier::Free, RateLimitConfig::per_minute(5));
            table
        });

        assert_eq!(policies.get().resolve("ai-resume", Tier::Free).unwrap().max_requests(), 5);
        // Old snapshots are unaffected.
        assert_eq!(before.resolve("ai-resume", Tier::Free).unwrap().max_requests(), 3);

        policies.set(PolicyTable::empty());
        assert!(policies.get().resolve("ai-resume", Tier::Free).is_err());
    }

    #[test]
    fn clones_share_updates() {
        let a = DynamicConfig::new(1);
        let b = a.clone();
        b.set(2);
        assert_eq!(*a.get(), 2);
    }
}
