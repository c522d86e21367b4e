//! Worker pool that turns one fragment queue into a sequence of shards.
//!
//! Every worker loops: build a shard writer, fill one shard, repeat, until
//! the queue is drained. Idle workers simply pick up the next shard, so
//! the pool balances itself.
//!
//! Which shard is last is only known once every worker has stopped. The
//! sink therefore keeps the most recently completed shard aside: a worker
//! finishing a shard swaps it in and seals the one it displaced. When all
//! workers are done the held shard is sealed with the last-shard marker, so
//! exactly one shard per stream carries it and it is sealed after all others.

use super::shard::{
    CompletedShard, SealedShard, SharedHeader, ShardCounter, ShardOutput, ShardStream, ShardWriter,
};
use crate::error::{Result, ShardError};
use crate::memory::BufferFragment;
use crate::metrics::PerfJournal;
use crate::queue::{PrefixedQueue, WaitingQueue};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info_span};

/// `2 x cores + 1`.
#[must_use]
pub fn default_workers() -> usize {
    2 * num_cpus::get() + 1
}

pub struct FanOutSink {
    workers: usize,
    max_shard_bytes: u64,
    header: Option<SharedHeader>,
    journal: PerfJournal,
}

impl FanOutSink {
    #[must_use]
    pub fn new(max_shard_bytes: u64) -> Self {
        Self {
            workers: default_workers(),
            max_shard_bytes,
            header: None,
            journal: PerfJournal::new(),
        }
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Header written at the top of every shard once it is known.
    #[must_use]
    pub fn with_header(mut self, header: Option<SharedHeader>) -> Self {
        self.header = header;
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: PerfJournal) -> Self {
        self.journal = journal;
        self
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Drain `input` into shards of `stream`, returning the sealed shards in
    /// shard id order. The last one carries `is_last`; an empty input seals
    /// nothing.
    ///
    /// # Errors
    /// The first error of any worker; the remaining workers are cancelled
    /// and the held shard is dropped unsealed.
    pub async fn run(
        &self,
        input: WaitingQueue<BufferFragment>,
        stream: ShardStream,
        output: Arc<dyn ShardOutput>,
    ) -> Result<Vec<SealedShard>> {
        let span = info_span!("shards", source = %stream.source, partition = ?stream.partition);
        let writer = ShardWriter::new(
            Arc::new(stream),
            output,
            Arc::new(ShardCounter::new()),
            self.max_shard_bytes,
        )
        .with_header(self.header.clone());
        let held: Arc<Mutex<Option<CompletedShard>>> = Arc::new(Mutex::new(None));

        let mut pool = JoinSet::new();
        for worker in 0..self.workers {
            let writer = writer.clone();
            let input = PrefixedQueue::new(input.clone());
            let held = Arc::clone(&held);
            let journal = self.journal.clone();
            pool.spawn(
                async move {
                    let mut sealed = Vec::new();
                    while let Some(done) = writer.write_one(&input).await? {
                        let displaced = held.lock().replace(done);
                        if let Some(previous) = displaced {
                            sealed.push(previous.seal(false, &journal).await?);
                        }
                    }
                    debug!(worker, shards = sealed.len(), "worker idle, input drained");
                    Ok::<_, ShardError>(sealed)
                }
                .instrument(span.clone()),
            );
        }

        let mut sealed = Vec::new();
        while let Some(joined) = pool.join_next().await {
            let outcome = joined
                .map_err(|err| ShardError::TaskFailed(err.to_string()))
                .and_then(|r| r);
            match outcome {
                Ok(mut shards) => sealed.append(&mut shards),
                Err(err) => {
                    pool.abort_all();
                    return Err(err);
                }
            }
        }

        let last = held.lock().take();
        if let Some(last) = last {
            sealed.push(last.seal(true, &self.journal).instrument(span).await?);
        }
        sealed.sort_by(|a, b| a.info.shard_id.cmp(&b.info.shard_id));
        Ok(sealed)
    }
}
