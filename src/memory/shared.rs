//! Shared, counted ownership of one fragment.
//!
//! When one source fragment feeds several independent consumers (one per
//! output partition), each consumer gets a share. The fragment is readable
//! until the last share is disposed, and the last disposal releases it.

use super::BufferFragment;
use crate::error::{Result, ShardError};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

#[derive(Clone)]
pub struct SharedFragment {
    inner: Arc<SharedInner>,
}

struct SharedInner {
    fragment: RwLock<Option<BufferFragment>>,
    owners: AtomicUsize,
}

impl SharedFragment {
    /// Wrap `fragment` for `owners` consumers. With zero owners the fragment
    /// is released immediately.
    ///
    /// # Errors
    /// Any error from releasing the fragment when `owners` is zero.
    pub fn new(fragment: BufferFragment, owners: usize) -> Result<Self> {
        let shared = Self {
            inner: Arc::new(SharedInner {
                fragment: RwLock::new(Some(fragment)),
                owners: AtomicUsize::new(owners),
            }),
        };
        if owners == 0 {
            shared.take_and_release()?;
        }
        Ok(shared)
    }

    /// Shares not yet disposed.
    #[must_use]
    pub fn owners(&self) -> usize {
        self.inner.owners.load(Ordering::Acquire)
    }

    /// Run `f` over the fragment bytes, or return `None` once released.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let guard = self.inner.fragment.read();
        guard.as_ref().map(|fragment| f(fragment.as_slice()))
    }

    /// Give up one share. Returns `true` if this call released the fragment.
    ///
    /// # Errors
    /// `NotReserved` when every share has already been disposed.
    pub fn dispose(&self) -> Result<bool> {
        let previous = self
            .inner
            .owners
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| ShardError::NotReserved {
                interval: Default::default(),
            })?;
        if previous > 1 {
            return Ok(false);
        }
        self.take_and_release()?;
        Ok(true)
    }

    fn take_and_release(&self) -> Result<()> {
        let fragment = self.inner.fragment.write().take();
        if let Some(fragment) = fragment {
            trace!(interval = %fragment.interval(), "last share released");
            fragment.release()?;
        }
        Ok(())
    }
}
