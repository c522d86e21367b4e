//! The writing end of a run.
//!
//! - [`shard`] - fill one bounded shard from a fragment queue
//! - [`fanout`] - worker pool over one queue, with last-shard marking
//! - [`outputs`] - blob and ingest destinations, naming and tags

pub mod fanout;
pub mod outputs;
pub mod shard;

pub use fanout::{FanOutSink, default_workers};
pub use outputs::{BlobShardOutput, IngestShardOutput, LAST_SHARD_TAG, ingest_tags, shard_name};
pub use shard::{
    CompletedShard, SealedShard, SharedHeader, ShardCounter, ShardInfo, ShardOutput, ShardSink, ShardStream,
    ShardWriter,
};
