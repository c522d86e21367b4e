//! Writing bounded-size shards out of a stream of line-aligned fragments.
//!
//! A [`ShardWriter`] pulls fragments into one shard until the shard reaches
//! its byte threshold or the input completes. Fragments that sit next to
//! each other in the arena and arrive in order are merged first, so they go
//! out in a single write. Every fragment is released as soon as its bytes
//! are written.
//!
//! Where the bytes go is decided by a [`ShardOutput`]: it opens a
//! [`ShardSink`] per shard and the sink's `seal` commits it (upload
//! finalize, ingestion command). A shard that fails mid-way is dropped
//! without being sealed.

use crate::error::{Result, ShardError};
use crate::memory::BufferFragment;
use crate::metrics::PerfJournal;
use crate::queue::{Dequeue, PrefixedQueue, QueueResult};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Header bytes, filled in once the first line of the input has been seen.
pub type SharedHeader = Arc<OnceLock<Box<[u8]>>>;

/// Thread-safe source of zero-padded shard identifiers.
#[derive(Debug, Default)]
pub struct ShardCounter {
    next: AtomicU64,
}

impl ShardCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next identifier: `00000`, `00001`, ...
    pub fn next_id(&self) -> String {
        format!("{:05}", self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Identifiers handed out so far.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

/// Identity of one output stream: the blob it came from and, when
/// partitioning, the partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStream {
    pub source: String,
    pub stem: String,
    pub partition: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub source: String,
    pub stem: String,
    pub partition: Option<usize>,
    pub shard_id: String,
    pub is_last: bool,
    /// Bytes written, header included.
    pub bytes: u64,
}

/// Opens one sink per shard.
pub trait ShardOutput: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the destination cannot be opened
    fn open(&self, shard: &ShardInfo) -> Result<Box<dyn ShardSink>>;
}

/// Destination of one shard's bytes.
pub trait ShardSink: Write + Send {
    /// Commit the shard and return its URI. Called once, after every byte
    /// was written and `shard.is_last` is final.
    ///
    /// # Errors
    ///
    /// Returns an error if finalizing or the follow-up command fails
    fn seal(self: Box<Self>, shard: &ShardInfo) -> Result<String>;
}

/// A fully written shard waiting to be sealed.
pub struct CompletedShard {
    pub info: ShardInfo,
    sink: Box<dyn ShardSink>,
}

/// A committed shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedShard {
    pub info: ShardInfo,
    pub uri: String,
}

impl CompletedShard {
    /// Seal on a blocking thread, marking the shard last when `is_last`.
    ///
    /// # Errors
    /// Errors from the sink, or `TaskFailed` if the sealing thread panicked.
    pub async fn seal(self, is_last: bool, journal: &PerfJournal) -> Result<SealedShard> {
        let Self { mut info, sink } = self;
        info.is_last = is_last;
        let (info, uri) = tokio::task::spawn_blocking(move || {
            let uri = sink.seal(&info)?;
            Ok::<_, ShardError>((info, uri))
        })
        .await
        .map_err(|err| ShardError::TaskFailed(err.to_string()))??;
        journal.add_reading("shard.sealed", 1.0);
        journal.add_reading("shard.bytes", info.bytes as f64);
        info!(
            source = %info.source,
            partition = ?info.partition,
            shard = %info.shard_id,
            bytes = info.bytes,
            last = info.is_last,
            uri = %uri,
            "shard sealed"
        );
        Ok(SealedShard { info, uri })
    }
}

/// Writes shards of one output stream.
#[derive(Clone)]
pub struct ShardWriter {
    stream: Arc<ShardStream>,
    output: Arc<dyn ShardOutput>,
    counter: Arc<ShardCounter>,
    max_bytes: u64,
    header: Option<SharedHeader>,
}

impl ShardWriter {
    pub fn new(
        stream: Arc<ShardStream>,
        output: Arc<dyn ShardOutput>,
        counter: Arc<ShardCounter>,
        max_bytes: u64,
    ) -> Self {
        Self {
            stream,
            output,
            counter,
            max_bytes: max_bytes.max(1),
            header: None,
        }
    }

    /// Write `header`, once set, at the top of every shard.
    #[must_use]
    pub fn with_header(mut self, header: Option<SharedHeader>) -> Self {
        self.header = header;
        self
    }

    /// Fill one shard from `input`.
    ///
    /// Returns `None` without opening anything when `input` is already
    /// drained.
    ///
    /// # Errors
    /// Errors opening or writing the sink, and fragment release faults.
    pub async fn write_one(
        &self,
        input: &PrefixedQueue<BufferFragment>,
    ) -> Result<Option<CompletedShard>> {
        let QueueResult::Item(mut next) = input.dequeue().await else {
            return Ok(None);
        };

        let mut info = ShardInfo {
            source: self.stream.source.clone(),
            stem: self.stream.stem.clone(),
            partition: self.stream.partition,
            shard_id: self.counter.next_id(),
            is_last: false,
            bytes: 0,
        };
        let mut sink = self.output.open(&info)?;
        if let Some(header) = self.header.as_ref().and_then(|slot| slot.get()) {
            sink.write_all(header)?;
            info.bytes += header.len() as u64;
        }

        loop {
            let block = self.coalesce(next, input, info.bytes);
            sink.write_all(block.as_slice())?;
            info.bytes += block.len() as u64;
            block.release()?;
            if info.bytes >= self.max_bytes {
                break;
            }
            match input.dequeue().await {
                QueueResult::Item(fragment) => next = fragment,
                QueueResult::Completed => break,
            }
        }
        debug!(shard = %info.shard_id, bytes = info.bytes, "shard written");
        Ok(Some(CompletedShard { info, sink }))
    }

    /// Merge `first` with fragments already waiting in `input` that continue
    /// it in the arena, in arrival order, without passing the threshold.
    fn coalesce(
        &self,
        first: BufferFragment,
        input: &PrefixedQueue<BufferFragment>,
        written: u64,
    ) -> BufferFragment {
        let mut pending = written + first.len() as u64;
        let mut run: Vec<BufferFragment> = Vec::new();
        while pending < self.max_bytes {
            let Some(QueueResult::Item(candidate)) = input.try_dequeue() else {
                break;
            };
            let continues = run.last().unwrap_or(&first).is_followed_by(&candidate);
            if !continues {
                input.requeue_front(vec![candidate]);
                break;
            }
            pending += candidate.len() as u64;
            run.push(candidate);
        }
        if run.is_empty() {
            return first;
        }
        let (merged, leftovers) = first.try_merge_all(run);
        input.requeue_front(leftovers);
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_pads_to_five_digits() {
        let counter = ShardCounter::new();
        assert_eq!(counter.next_id(), "00000");
        assert_eq!(counter.next_id(), "00001");
        assert_eq!(counter.issued(), 2);
    }
}
