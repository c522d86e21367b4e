//! Wiring one run: source listing, then per blob reader, line splitter,
//! optional partitioner, and one shard fan-out per output stream.
//!
//! ```text
//! blob ─► StorageReader ─► raw ─► LineSplitter ─► lines ─┬─► FanOutSink            (unpartitioned)
//!                                                         └─► CsvPartitioner ─► p0..pN ─► FanOutSink each
//! ```
//!
//! Every stage of a blob runs as its own task. The first stage to fail
//! fails the blob: all queues are abandoned so nothing keeps producing, the
//! other stages are cancelled, and the error is returned. Blobs are
//! processed one at a time, each with a fresh arena.

use super::source::{BlobListing, Source};
use crate::config::RunConfig;
use crate::error::{Result as ShardResult, ShardError};
use crate::io::blob::{BlobHandle, BlobStore};
use crate::io::compression::{Compression, open_decompressed};
use crate::io::ingest::IngestClient;
use crate::io::reader::StorageReader;
use crate::memory::{Arena, BufferFragment};
use crate::metrics::PerfJournal;
use crate::queue::WaitingQueue;
use crate::sink::{
    BlobShardOutput, FanOutSink, IngestShardOutput, SealedShard, SharedHeader, ShardOutput,
    ShardStream,
};
use crate::transform::{CsvPartitioner, LineSplitter};
use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tracing::{Instrument, Span, debug, error, info, info_span};

/// What one blob produced.
#[derive(Debug, Clone)]
pub struct BlobSummary {
    pub blob: BlobHandle,
    pub bytes_read: u64,
    pub shards: Vec<SealedShard>,
}

/// What a whole run produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub blobs: usize,
    pub bytes_read: u64,
    pub shards_sealed: usize,
    #[serde(skip)]
    pub details: Vec<BlobSummary>,
}

impl RunSummary {
    fn record(&mut self, blob: BlobSummary) {
        self.blobs += 1;
        self.bytes_read += blob.bytes_read;
        self.shards_sealed += blob.shards.len();
        self.details.push(blob);
    }
}

enum StageOutput {
    Read(u64),
    Done,
    Shards(Vec<SealedShard>),
}

/// Runs re-sharding jobs against one blob store.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn BlobStore>,
    ingest: Option<Arc<dyn IngestClient>>,
    journal: PerfJournal,
    report_every: Option<Duration>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            ingest: None,
            journal: PerfJournal::new(),
            report_every: None,
        }
    }

    /// Client used when the destination asks for ingestion.
    #[must_use]
    pub fn with_ingest_client(mut self, client: Arc<dyn IngestClient>) -> Self {
        self.ingest = Some(client);
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: PerfJournal) -> Self {
        self.journal = journal;
        self
    }

    /// Log the perf journal every `every` while a run is in progress.
    #[must_use]
    pub fn with_report_interval(mut self, every: Duration) -> Self {
        self.report_every = Some(every);
        self
    }

    #[must_use]
    pub fn journal(&self) -> &PerfJournal {
        &self.journal
    }

    /// Re-shard every blob the config's source names.
    ///
    /// # Errors
    /// Returns an error if the config is invalid, the listing fails, or any
    /// blob fails; blobs after the failing one are not processed.
    pub async fn run(&self, config: &RunConfig) -> Result<RunSummary> {
        let mut source = BlobListing::new(Arc::clone(&self.store), config.source.clone());
        self.run_source(&mut source, config).await
    }

    /// Re-shard every blob `source` yields, disposing each one after it
    /// was fully processed.
    ///
    /// # Errors
    /// As for [`run`](Self::run).
    pub async fn run_source(
        &self,
        source: &mut impl Source<BlobHandle>,
        config: &RunConfig,
    ) -> Result<RunSummary> {
        config.validate()?;
        let output = self.output(config)?;
        let reporter = self.report_every.map(|every| self.journal.spawn_reporter(every));

        let mut summary = RunSummary::default();
        let outcome = async {
            while let Some(data) = source.next().await.context("list source blobs")? {
                let blob = data.item().clone();
                let done = self
                    .process_blob(&blob, config, Arc::clone(&output))
                    .await
                    .with_context(|| format!("re-shard blob {}", blob.name))?;
                data.dispose();
                summary.record(done);
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;

        if let Some(reporter) = reporter {
            reporter.abort();
        }
        match outcome {
            Ok(()) => {
                info!(
                    blobs = summary.blobs,
                    bytes = summary.bytes_read,
                    shards = summary.shards_sealed,
                    "run complete"
                );
                Ok(summary)
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "run failed");
                Err(err)
            }
        }
    }

    fn output(&self, config: &RunConfig) -> Result<Arc<dyn ShardOutput>> {
        let destination = &config.destination;
        let blobs = BlobShardOutput::new(
            Arc::clone(&self.store),
            destination.prefix.clone(),
            destination.compression,
        );
        let Some(ingest) = &destination.ingest else {
            return Ok(Arc::new(blobs));
        };
        let Some(client) = &self.ingest else {
            bail!(
                "destination asks for ingestion into {} but no ingest client was configured",
                ingest.table
            );
        };
        Ok(Arc::new(IngestShardOutput::new(
            blobs,
            Arc::clone(client),
            ingest.extra_tags.clone(),
        )))
    }

    /// Run every stage for one blob.
    ///
    /// # Errors
    /// The first error raised by any stage.
    pub async fn process_blob(
        &self,
        blob: &BlobHandle,
        config: &RunConfig,
        output: Arc<dyn ShardOutput>,
    ) -> ShardResult<BlobSummary> {
        let span = info_span!("blob", name = %blob.name);
        async {
            info!(size = blob.size, "blob started");
            let memory = &config.memory;
            let arena = Arena::with_regions(memory.arena_bytes, memory.read_region_bytes())?;
            let raw: WaitingQueue<BufferFragment> = WaitingQueue::new();
            let lines: WaitingQueue<BufferFragment> = WaitingQueue::new();
            let mut queues = vec![raw.clone(), lines.clone()];
            let mut stages: JoinSet<ShardResult<StageOutput>> = JoinSet::new();

            let reader = StorageReader::new(arena.read_region(), memory.read_chunk_bytes)
                .with_journal(self.journal.clone());
            stages.spawn(
                read_stage(
                    reader,
                    Arc::clone(&self.store),
                    blob.clone(),
                    config.format.input_compression,
                    raw.clone(),
                )
                .instrument(info_span!("reader")),
            );

            // Carries and partition copies get separate scratch so neither can
            // fill the space the other needs to make progress.
            let (carry_region, copy_region) =
                arena.scratch_region().split_at(config.carry_region_bytes())?;

            let header: Option<SharedHeader> = config.format.has_header.then(SharedHeader::default);
            let mut splitter = LineSplitter::new(carry_region)
                .with_scratch_timeout(memory.scratch_timeout())
                .with_journal(self.journal.clone());
            if let Some(slot) = &header {
                let slot = Arc::clone(slot);
                splitter = splitter.extract_header(move |line| {
                    let _ = slot.set(line.into());
                });
            }
            let (split_in, split_out) = (raw.clone(), lines.clone());
            stages.spawn(
                async move {
                    splitter.run(&split_in, &split_out).await?;
                    Ok(StageOutput::Done)
                }
                .instrument(info_span!("lines")),
            );

            let sink = FanOutSink::new(config.sharding.max_shard_bytes)
                .with_workers(config.workers())
                .with_header(header.filter(|_| config.format.header_per_shard))
                .with_journal(self.journal.clone());
            let sink = Arc::new(sink);
            let stem = blob.stem().to_string();
            let stream = |partition| ShardStream {
                source: blob.name.clone(),
                stem: stem.clone(),
                partition,
            };

            match config.format.partition {
                None => {
                    stages.spawn(
                        fan_out(Arc::clone(&sink), lines.clone(), stream(None), Arc::clone(&output))
                            .instrument(Span::current()),
                    );
                }
                Some(partition) => {
                    let partitions: Vec<WaitingQueue<BufferFragment>> =
                        (0..partition.count).map(|_| WaitingQueue::new()).collect();
                    for (p, queue) in partitions.iter().enumerate() {
                        stages.spawn(
                            fan_out(Arc::clone(&sink), queue.clone(), stream(Some(p)), Arc::clone(&output))
                                .instrument(Span::current()),
                        );
                    }
                    queues.extend(partitions.iter().cloned());

                    let partitioner = CsvPartitioner::new(partition.column, partition.count)
                        .with_seed(partition.seed)
                        .with_scratch_timeout(memory.scratch_timeout())
                        .with_journal(self.journal.clone());
                    let input = lines.clone();
                    stages.spawn(
                        async move {
                            partitioner.run(&input, &copy_region, &partitions).await?;
                            Ok(StageOutput::Done)
                        }
                        .instrument(info_span!("partition")),
                    );
                }
            }

            let mut summary = BlobSummary {
                blob: blob.clone(),
                bytes_read: 0,
                shards: Vec::new(),
            };
            while let Some(joined) = stages.join_next().await {
                let outcome = joined
                    .map_err(|err| ShardError::TaskFailed(err.to_string()))
                    .and_then(|r| r);
                match outcome {
                    Ok(StageOutput::Read(bytes)) => summary.bytes_read = bytes,
                    Ok(StageOutput::Done) => {}
                    Ok(StageOutput::Shards(mut shards)) => summary.shards.append(&mut shards),
                    Err(err) => {
                        error!(error = %err, "stage failed, abandoning blob");
                        for queue in &queues {
                            queue.abandon();
                        }
                        stages.abort_all();
                        while stages.join_next().await.is_some() {}
                        return Err(err);
                    }
                }
            }

            summary.shards.sort_by(|a, b| {
                (a.info.partition, &a.info.shard_id).cmp(&(b.info.partition, &b.info.shard_id))
            });
            self.journal.add_reading("blob.completed", 1.0);
            info!(
                bytes = summary.bytes_read,
                shards = summary.shards.len(),
                reserved_after = arena.reserved_bytes(),
                "blob finished"
            );
            Ok::<_, ShardError>(summary)
        }
        .instrument(span)
        .await
    }
}

async fn read_stage(
    reader: StorageReader,
    store: Arc<dyn BlobStore>,
    blob: BlobHandle,
    declared: Option<Compression>,
    output: WaitingQueue<BufferFragment>,
) -> ShardResult<StageOutput> {
    let handle = Handle::current();
    let span = Span::current();
    let bytes = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        let raw = store.open_read(&blob)?;
        let (codec, mut source) =
            open_decompressed(raw, &blob.name, declared).map_err(ShardError::from_read)?;
        debug!(?codec, "input codec");
        reader.read_blocking(&mut source, &output, &handle)
    })
    .await
    .map_err(|err| ShardError::TaskFailed(err.to_string()))??;
    Ok(StageOutput::Read(bytes))
}

async fn fan_out(
    sink: Arc<FanOutSink>,
    input: WaitingQueue<BufferFragment>,
    stream: ShardStream,
    output: Arc<dyn ShardOutput>,
) -> ShardResult<StageOutput> {
    Ok(StageOutput::Shards(sink.run(input, stream, output).await?))
}
