//! Collaborators at the edges of a run: storage, codecs, and ingestion.
//!
//! - [`blob`] - list, read, and write blobs ([`MemoryBlobStore`], [`LocalBlobStore`])
//! - [`compression`] - gzip and single-entry zip streams
//! - [`ingest`] - bulk-load commands for sealed shards
//! - [`reader`] - stream a blob into arena fragments
//! - [`cloud`] - the error type collaborators report

pub mod blob;
pub mod cloud;
pub mod compression;
pub mod ingest;
pub mod reader;

pub use blob::{BlobHandle, BlobStore, BlobWriter, LocalBlobStore, MemoryBlobStore};
pub use cloud::{CloudIOError, CloudResult, ErrorKind};
pub use compression::{
    CompressedWriter, Compression, open_decompressed, wrap_compress, wrap_decompress,
};
pub use ingest::{IngestClient, IngestRequest, RecordingIngestClient};
pub use reader::StorageReader;
