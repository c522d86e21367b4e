//! # Reshard
//!
//! **Streaming re-sharding** of large delimited blobs into bounded-size,
//! record-aligned shards ready for bulk loading.
//!
//! A run reads each source blob in fixed-size chunks into a pre-allocated
//! arena, cuts the chunks on line boundaries, optionally routes CSV records
//! to partitions by a hashed key column, and writes the result as shards of
//! roughly `max_shard_bytes` each. Memory use is bounded by the arena: when
//! it is full, readers wait for writers to release space.
//!
//! ## Key Features
//!
//! - **Bounded memory** - one arena per blob, reservations with async waiters
//! - **Record-aligned shards** - no line ever spans two shards
//! - **Partitioning** - hash a CSV key column into N independent shard streams
//! - **Header handling** - strip the header line and repeat it on every shard
//! - **Last-shard marking** - exactly one shard per stream is tagged last, and it is sealed last
//! - **Codecs** - gzip and single-entry zip in and out (optional via feature flags)
//! - **Ingestion** - hand sealed shards to a bulk-load client with idempotency tags
//!
//! ## Quick Start
//!
//! ```no_run
//! use reshard::{LocalBlobStore, Pipeline, RunConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! reshard::logging::init_tracing("reshard=info")?;
//! let config = RunConfig::from_json_file("reshard.json")?;
//! let pipeline = Pipeline::new(Arc::new(LocalBlobStore::new("/data")));
//! let summary = pipeline.run(&config).await?;
//! println!("{} shards from {} blobs", summary.shards_sealed, summary.blobs);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`memory`] - arena, interval tracker, and buffer fragments
//! - [`queue`] - completion-aware queues between stages
//! - [`io`] - blob stores, codecs, the storage reader, and ingestion
//! - [`transform`] - line splitting and CSV partitioning
//! - [`sink`] - shard writers and the fan-out worker pool
//! - [`pipeline`] - sources and the per-blob stage wiring
//! - [`config`] - serde run configuration
//! - [`metrics`] - the perf journal
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod error;
pub mod io;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod sink;
pub mod transform;

// General re-exports
pub use config::{
    DestinationConfig, FormatConfig, IngestConfig, MemoryConfig, PartitionConfig, RunConfig,
    ShardingConfig, SourceSpec,
};
pub use error::{Result, ShardError};
pub use io::{
    BlobHandle, BlobStore, CloudIOError, Compression, IngestClient, LocalBlobStore,
    MemoryBlobStore, RecordingIngestClient,
};
pub use memory::{Arena, ArenaRegion, BufferFragment, Interval, IntervalTracker, SharedFragment};
pub use metrics::PerfJournal;
pub use pipeline::{BlobSummary, Pipeline, RunSummary, Source, SourceData};
pub use queue::{Dequeue, PrefixedQueue, QueueResult, WaitingQueue};
pub use sink::{FanOutSink, SealedShard, ShardInfo};
pub use transform::{CsvPartitioner, LineSplitter};
