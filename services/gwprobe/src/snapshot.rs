//! Atomically swapped wire images
//!
//! Mock endpoints keep what they serve in a [`SnapshotCell`]. Readers always
//! see one complete image; writers publish a whole new image or derive one
//! from the current image with [`SnapshotCell::rcu`].

use arc_swap::ArcSwap;
use std::sync::Arc;

#[derive(Debug)]
pub struct SnapshotCell<T> {
    inner: ArcSwap<T>,
}

impl<T> SnapshotCell<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: ArcSwap::from_pointee(initial),
        }
    }

    /// Current image
    pub fn load(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the whole image
    pub fn publish(&self, image: T) {
        self.inner.store(Arc::new(image));
    }

    /// Derive a new image from the current one
    ///
    /// `update` may run more than once under contention, so it must not have
    /// side effects.
    pub fn rcu<F>(&self, mut update: F)
    where
        F: FnMut(&T) -> T,
    {
        self.inner.rcu(|current| Arc::new(update(current)));
    }
}

impl<T: Default> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
