//! Running a whole job.
//!
//! - [`source`] - where blobs come from, with disposal hooks
//! - [`run`] - per-blob stage wiring and the [`Pipeline`] entry point

pub mod run;
pub mod source;

pub use run::{BlobSummary, Pipeline, RunSummary};
pub use source::{BlobListing, DisposeHook, QueueSource, Source, SourceData};
