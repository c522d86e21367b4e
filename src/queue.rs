//! Completion-aware async FIFO used between pipeline stages.
//!
//! A [`WaitingQueue`] moves through three states:
//!
//! - `Open` - items may be enqueued and dequeued
//! - `Completing` - [`complete`](WaitingQueue::complete) was called; buffered items are still delivered
//! - `Drained` - completed and empty; every dequeue returns [`QueueResult::Completed`]
//!
//! Items enqueued before completion are always delivered before any consumer
//! observes `Completed`. Enqueueing after completion is a wiring error and
//! faults with `QueueClosed`.
//!
//! [`PrefixedQueue`] decorates a queue with a private list of items that are
//! served first, so a consumer can put back items it pulled but could not use
//! without a second real queue.

use crate::error::{Result, ShardError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use tokio::sync::Notify;

/// Outcome of a dequeue.
#[derive(Debug, PartialEq, Eq)]
pub enum QueueResult<T> {
    /// No item will ever arrive again.
    Completed,
    Item(T),
}

impl<T> QueueResult<T> {
    pub fn into_item(self) -> Option<T> {
        match self {
            QueueResult::Item(item) => Some(item),
            QueueResult::Completed => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, QueueResult::Completed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueStatus {
    Open,
    Completing,
    Drained,
}

/// Consumer side shared by [`WaitingQueue`] and its decorators.
pub trait Dequeue<T>: Send + Sync {
    /// Oldest item, waiting for one if none is buffered and the queue is open.
    fn dequeue(&self) -> impl Future<Output = QueueResult<T>> + Send;

    /// Oldest item or completion if available right now, `None` otherwise.
    fn try_dequeue(&self) -> Option<QueueResult<T>>;

    /// True when a dequeue would return an item without waiting.
    fn has_data(&self) -> bool;

    /// True when completed and empty.
    fn is_drained(&self) -> bool;
}

pub struct WaitingQueue<T> {
    inner: Arc<QueueInner<T>>,
}

struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

struct QueueState<T> {
    items: VecDeque<T>,
    completed: bool,
    enqueued: u64,
}

impl<T> Clone for WaitingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for WaitingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WaitingQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    completed: false,
                    enqueued: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Append `item` and wake one waiting consumer.
    ///
    /// # Errors
    /// `QueueClosed` after [`complete`](Self::complete); the item is dropped.
    pub fn enqueue(&self, item: T) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.completed {
                return Err(ShardError::QueueClosed);
            }
            state.items.push_back(item);
            state.enqueued += 1;
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Signal that nothing more will be enqueued. Buffered items stay.
    ///
    /// # Errors
    /// `QueueClosed` when called a second time.
    pub fn complete(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.completed {
                return Err(ShardError::QueueClosed);
            }
            state.completed = true;
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Complete the queue if it is still open and drop everything buffered.
    /// Used to unwind a failed run: producers see `QueueClosed` on their next
    /// enqueue and consumers see `Completed`. Returns the number of items dropped.
    pub fn abandon(&self) -> usize {
        let dropped = {
            let mut state = self.inner.state.lock();
            state.completed = true;
            std::mem::take(&mut state.items)
        };
        self.inner.notify.notify_waiters();
        dropped.len()
    }

    pub fn try_dequeue(&self) -> Option<QueueResult<T>> {
        let mut state = self.inner.state.lock();
        match state.items.pop_front() {
            Some(item) => Some(QueueResult::Item(item)),
            None if state.completed => Some(QueueResult::Completed),
            None => None,
        }
    }

    pub async fn dequeue_async(&self) -> QueueResult<T> {
        loop {
            // Register interest before looking, so a wake-up between the look
            // and the await is not lost.
            let mut notified = pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if let Some(result) = self.try_dequeue() {
                return result;
            }
            notified.await;
        }
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        !self.inner.state.lock().items.is_empty()
    }

    /// True once completion was signalled, even if items are still buffered.
    #[must_use]
    pub fn has_completed(&self) -> bool {
        self.inner.state.lock().completed
    }

    #[must_use]
    pub fn is_drained(&self) -> bool {
        let state = self.inner.state.lock();
        state.completed && state.items.is_empty()
    }

    #[must_use]
    pub fn status(&self) -> QueueStatus {
        let state = self.inner.state.lock();
        match (state.completed, state.items.is_empty()) {
            (false, _) => QueueStatus::Open,
            (true, false) => QueueStatus::Completing,
            (true, true) => QueueStatus::Drained,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items ever accepted by this queue.
    #[must_use]
    pub fn total_enqueued(&self) -> u64 {
        self.inner.state.lock().enqueued
    }
}

impl<T: Send> Dequeue<T> for WaitingQueue<T> {
    fn dequeue(&self) -> impl Future<Output = QueueResult<T>> + Send {
        self.dequeue_async()
    }

    fn try_dequeue(&self) -> Option<QueueResult<T>> {
        WaitingQueue::try_dequeue(self)
    }

    fn has_data(&self) -> bool {
        WaitingQueue::has_data(self)
    }

    fn is_drained(&self) -> bool {
        WaitingQueue::is_drained(self)
    }
}

/// A queue view that serves a private prefix before the underlying queue.
pub struct PrefixedQueue<T> {
    prefix: Mutex<VecDeque<T>>,
    inner: WaitingQueue<T>,
}

impl<T> PrefixedQueue<T> {
    #[must_use]
    pub fn new(inner: WaitingQueue<T>) -> Self {
        Self::with_prefix(Vec::new(), inner)
    }

    pub fn with_prefix(prefix: impl IntoIterator<Item = T>, inner: WaitingQueue<T>) -> Self {
        Self {
            prefix: Mutex::new(prefix.into_iter().collect()),
            inner,
        }
    }

    /// Put `items` in front of everything else, keeping their order.
    pub fn requeue_front(&self, items: Vec<T>) {
        let mut prefix = self.prefix.lock();
        for item in items.into_iter().rev() {
            prefix.push_front(item);
        }
    }

    #[must_use]
    pub fn prefix_len(&self) -> usize {
        self.prefix.lock().len()
    }

    #[must_use]
    pub fn inner(&self) -> &WaitingQueue<T> {
        &self.inner
    }

    fn pop_prefix(&self) -> Option<T> {
        self.prefix.lock().pop_front()
    }
}

impl<T: Send> Dequeue<T> for PrefixedQueue<T> {
    fn dequeue(&self) -> impl Future<Output = QueueResult<T>> + Send {
        async move {
            let front = self.pop_prefix();
            match front {
                Some(item) => QueueResult::Item(item),
                None => self.inner.dequeue_async().await,
            }
        }
    }

    fn try_dequeue(&self) -> Option<QueueResult<T>> {
        let front = self.pop_prefix();
        match front {
            Some(item) => Some(QueueResult::Item(item)),
            None => self.inner.try_dequeue(),
        }
    }

    fn has_data(&self) -> bool {
        self.prefix_len() > 0 || self.inner.has_data()
    }

    fn is_drained(&self) -> bool {
        self.prefix_len() == 0 && self.inner.is_drained()
    }
}
