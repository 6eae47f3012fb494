//! Arena (memory pool) hierarchy.
//!
//! Pools form a tree of nested lifetimes: engine at the root, then
//! configuration, per-connection, and per-transaction subtrees. Releasing
//! a pool releases every descendant first. The values themselves are
//! owned by normal Rust ownership; the pool tracks the lifetime structure
//! so teardown order is explicit, observable, and loggable.
//!
//! Constructors that allocate a subtree follow a strict pattern: build
//! into locals, publish only on full success, and release the subtree on
//! any failure so nothing partially built escapes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// A handle to one node in the pool tree.
///
/// Handles are cheap to clone and share; the node is released when
/// [`Pool::release`] is called or when the last handle is dropped.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: Mutex<String>,
    parent: Weak<PoolInner>,
    children: Mutex<Vec<Weak<PoolInner>>>,
    released: AtomicBool,
    depth: usize,
    allocations: AtomicUsize,
}

impl Pool {
    /// Creates a new root pool.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: Mutex::new(name.into()),
                parent: Weak::new(),
                children: Mutex::new(Vec::new()),
                released: AtomicBool::new(false),
                depth: 0,
                allocations: AtomicUsize::new(0),
            }),
        }
    }

    /// Creates a child pool nested inside this one.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Alloc`] if this pool has already been
    /// released; a released pool cannot host new lifetimes.
    pub fn subpool(&self, name: impl Into<String>) -> EngineResult<Pool> {
        if self.is_released() {
            return Err(EngineError::Alloc(format!(
                "cannot create subpool of released pool '{}'",
                self.name()
            )));
        }

        let child = Pool {
            inner: Arc::new(PoolInner {
                name: Mutex::new(name.into()),
                parent: Arc::downgrade(&self.inner),
                children: Mutex::new(Vec::new()),
                released: AtomicBool::new(false),
                depth: self.inner.depth + 1,
                allocations: AtomicUsize::new(0),
            }),
        };

        self.inner
            .children
            .lock()
            .expect("pool child list poisoned")
            .push(Arc::downgrade(&child.inner));

        Ok(child)
    }

    /// Releases this pool and every descendant, children first.
    ///
    /// Safe to call mid-tree without involving the parent, and safe to
    /// call more than once (subsequent calls are no-ops).
    pub fn release(&self) {
        self.inner.release();
    }

    /// Renames the pool for diagnostics.
    pub fn rename(&self, name: impl Into<String>) {
        *self.inner.name.lock().expect("pool name poisoned") = name.into();
    }

    /// Returns the pool's diagnostic name.
    #[must_use]
    pub fn name(&self) -> String {
        self.inner.name.lock().expect("pool name poisoned").clone()
    }

    /// Returns `true` if this pool (or an ancestor) has been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Depth of this pool in the tree; the root is depth 0.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    /// Number of child pools that are still live (not released and
    /// still referenced).
    #[must_use]
    pub fn live_children(&self) -> usize {
        self.inner
            .children
            .lock()
            .expect("pool child list poisoned")
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.released.load(Ordering::Acquire))
            .count()
    }

    /// Records one logical allocation against this pool.
    ///
    /// Allocations are never individually freed; they are accounted so
    /// teardown logging can report how much a subtree carried.
    pub fn record_allocation(&self) {
        self.inner.allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of logical allocations recorded against this pool.
    #[must_use]
    pub fn allocations(&self) -> usize {
        self.inner.allocations.load(Ordering::Relaxed)
    }
}

impl PoolInner {
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        // Children go first.
        let children = self
            .children
            .lock()
            .expect("pool child list poisoned")
            .clone();
        for child in children.iter().filter_map(Weak::upgrade) {
            child.release();
        }

        debug!(
            pool = %self.name.lock().expect("pool name poisoned"),
            depth = self.depth,
            allocations = self.allocations.load(Ordering::Relaxed),
            "released pool"
        );
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name())
            .field("depth", &self.depth())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_pool() {
        let pool = Pool::new("engine");
        assert_eq!(pool.name(), "engine");
        assert_eq!(pool.depth(), 0);
        assert!(!pool.is_released());
    }

    #[test]
    fn test_subpool_nesting() {
        let root = Pool::new("engine");
        let conn = root.subpool("connection").unwrap();
        let tx = conn.subpool("transaction").unwrap();

        assert_eq!(conn.depth(), 1);
        assert_eq!(tx.depth(), 2);
        assert_eq!(root.live_children(), 1);
        assert_eq!(conn.live_children(), 1);
    }

    #[test]
    fn test_release_cascades_to_children() {
        let root = Pool::new("engine");
        let conn = root.subpool("connection").unwrap();
        let tx = conn.subpool("transaction").unwrap();

        root.release();
        assert!(root.is_released());
        assert!(conn.is_released());
        assert!(tx.is_released());
    }

    #[test]
    fn test_release_mid_tree() {
        let root = Pool::new("engine");
        let conn = root.subpool("connection").unwrap();
        let tx = conn.subpool("transaction").unwrap();

        conn.release();
        assert!(!root.is_released());
        assert!(conn.is_released());
        assert!(tx.is_released());
        assert_eq!(root.live_children(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = Pool::new("engine");
        pool.release();
        pool.release();
        assert!(pool.is_released());
    }

    #[test]
    fn test_subpool_of_released_pool_fails() {
        let pool = Pool::new("engine");
        pool.release();
        assert!(matches!(
            pool.subpool("late"),
            Err(EngineError::Alloc(_))
        ));
    }

    #[test]
    fn test_rename() {
        let pool = Pool::new("connection");
        pool.rename("connection/7f2a");
        assert_eq!(pool.name(), "connection/7f2a");
    }

    #[test]
    fn test_allocation_accounting() {
        let pool = Pool::new("tx");
        pool.record_allocation();
        pool.record_allocation();
        assert_eq!(pool.allocations(), 2);
    }
}
