//! Byte-stream transforms between the storage reader and the shard writers.
//!
//! - [`lines`] - cut raw chunks on line boundaries, optionally stripping a header
//! - [`csv`] - route CSV records to partitions by a hashed key column

pub mod csv;
pub mod lines;

pub use csv::{CsvPartitioner, PartitionFragment, PartitionedBatch, partition_of};
pub use lines::{HeaderCallback, LineSplitter};
