//! Copy-on-write handle over a [`GraphStore`]
//!
//! Propagation batches take an immutable snapshot; writers (re-parse,
//! recalibration, learned weight updates) mutate through `update`, which
//! clones the store only while snapshots are still alive. A reader therefore
//! never observes a half-applied batch.

use super::GraphStore;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Default)]
pub struct SharedGraph {
    inner: Arc<RwLock<Arc<GraphStore>>>,
}

impl SharedGraph {
    pub fn new(graph: GraphStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(graph))),
        }
    }

    /// Immutable view for one propagation batch.
    pub fn snapshot(&self) -> Arc<GraphStore> {
        Arc::clone(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Apply a mutation atomically with respect to `snapshot`.
    pub fn update<T>(&self, f: impl FnOnce(&mut GraphStore) -> T) -> T {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(Arc::make_mut(&mut guard))
    }
}
