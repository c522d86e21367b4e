//! Where the blobs of a run come from.
//!
//! A [`Source`] hands out [`SourceData`] items one at a time. Each item may
//! carry a disposal hook (acknowledge a queue message, mark a file done)
//! that the pipeline runs only after the item was fully processed.

use crate::config::SourceSpec;
use crate::error::{Result, ShardError};
use crate::io::blob::{BlobHandle, BlobStore};
use crate::io::cloud::CloudIOError;
use crate::queue::{QueueResult, WaitingQueue};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

pub type DisposeHook = Box<dyn FnOnce() + Send>;

/// One unit of work plus what to do once it is done.
pub struct SourceData<T> {
    item: T,
    on_dispose: Option<DisposeHook>,
}

impl<T> SourceData<T> {
    pub fn new(item: T) -> Self {
        Self {
            item,
            on_dispose: None,
        }
    }

    pub fn with_dispose(item: T, on_dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            item,
            on_dispose: Some(Box::new(on_dispose)),
        }
    }

    pub fn item(&self) -> &T {
        &self.item
    }

    /// Run the disposal hook and hand back the item. Dropping an item
    /// without disposing it skips the hook.
    pub fn dispose(self) -> T {
        if let Some(hook) = self.on_dispose {
            hook();
        }
        self.item
    }
}

impl<T: fmt::Debug> fmt::Debug for SourceData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceData")
            .field("item", &self.item)
            .field("has_dispose_hook", &self.on_dispose.is_some())
            .finish()
    }
}

pub trait Source<T>: Send {
    /// Next item, or `None` once the source is exhausted.
    fn next(&mut self) -> impl Future<Output = Result<Option<SourceData<T>>>> + Send;
}

/// Items pushed by an external trigger through a queue; exhausted when the
/// queue completes.
pub struct QueueSource<T> {
    queue: WaitingQueue<SourceData<T>>,
}

impl<T> QueueSource<T> {
    #[must_use]
    pub fn new(queue: WaitingQueue<SourceData<T>>) -> Self {
        Self { queue }
    }
}

impl<T: Send> Source<T> for QueueSource<T> {
    fn next(&mut self) -> impl Future<Output = Result<Option<SourceData<T>>>> + Send {
        async move {
            Ok(match self.queue.dequeue_async().await {
                QueueResult::Item(item) => Some(item),
                QueueResult::Completed => None,
            })
        }
    }
}

/// Blobs matching a [`SourceSpec`], listed once on first use.
pub struct BlobListing {
    store: Arc<dyn BlobStore>,
    spec: SourceSpec,
    pending: Option<VecDeque<BlobHandle>>,
}

impl BlobListing {
    pub fn new(store: Arc<dyn BlobStore>, spec: SourceSpec) -> Self {
        Self {
            store,
            spec,
            pending: None,
        }
    }
}

fn list_blobs(store: &dyn BlobStore, spec: &SourceSpec) -> Result<VecDeque<BlobHandle>> {
    let blobs = match spec {
        SourceSpec::Blob { name } => {
            let found = store
                .list(name, "")?
                .into_iter()
                .find(|b| b.name == *name)
                .ok_or_else(|| CloudIOError::not_found(format!("blob {name}")))?;
            VecDeque::from([found])
        }
        SourceSpec::Prefix { prefix, suffix } => store.list(prefix, suffix)?.into(),
    };
    debug!(blobs = blobs.len(), ?spec, "source listed");
    Ok(blobs)
}

impl Source<BlobHandle> for BlobListing {
    fn next(&mut self) -> impl Future<Output = Result<Option<SourceData<BlobHandle>>>> + Send {
        async move {
            if self.pending.is_none() {
                let store = Arc::clone(&self.store);
                let spec = self.spec.clone();
                let listed = tokio::task::spawn_blocking(move || list_blobs(store.as_ref(), &spec))
                    .await
                    .map_err(|err| ShardError::TaskFailed(err.to_string()))??;
                self.pending = Some(listed);
            }
            Ok(self
                .pending
                .as_mut()
                .and_then(VecDeque::pop_front)
                .map(SourceData::new))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn dispose_runs_hook_once_and_returns_item() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let data = SourceData::with_dispose(7, move || flag.store(true, Ordering::SeqCst));
        assert_eq!(*data.item(), 7);
        assert_eq!(data.dispose(), 7);
        assert!(fired.load(Ordering::SeqCst));
    }
}
