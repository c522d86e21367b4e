//! Database ingestion commands issued once a shard is sealed in storage.

use super::cloud::{CloudIOError, CloudResult, ErrorKind};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Trait for bulk-load commands against an analytics database
pub trait IngestClient: Send + Sync {
    /// Ask the database to load the blob at `uri`.
    ///
    /// `tags` travel with the ingested extent; a repeated command with the
    /// same `idempotency_tags` must not load the data twice.
    ///
    /// # Errors
    ///
    /// Returns an error if the command is rejected or cannot be delivered
    fn ingest_from_storage(
        &self,
        uri: &str,
        tags: &BTreeSet<String>,
        idempotency_tags: &BTreeSet<String>,
    ) -> CloudResult<()>;
}

/// One ingestion command as a client received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRequest {
    pub uri: String,
    pub tags: BTreeSet<String>,
    pub idempotency_tags: BTreeSet<String>,
}

impl IngestRequest {
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// Client that records every command, optionally rejecting them all.
#[derive(Clone, Default)]
pub struct RecordingIngestClient {
    requests: Arc<Mutex<Vec<IngestRequest>>>,
    fail_with: Option<ErrorKind>,
}

impl RecordingIngestClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Client that rejects every command with `kind`.
    #[must_use]
    pub fn failing(kind: ErrorKind) -> Self {
        Self {
            fail_with: Some(kind),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn requests(&self) -> Vec<IngestRequest> {
        self.requests.lock().clone()
    }
}

impl IngestClient for RecordingIngestClient {
    fn ingest_from_storage(
        &self,
        uri: &str,
        tags: &BTreeSet<String>,
        idempotency_tags: &BTreeSet<String>,
    ) -> CloudResult<()> {
        if let Some(kind) = self.fail_with {
            return Err(CloudIOError::new(kind, format!("ingest of {uri} rejected")));
        }
        let mut requests = self.requests.lock();
        let duplicate = !idempotency_tags.is_empty()
            && requests
                .iter()
                .any(|r| r.idempotency_tags == *idempotency_tags);
        if !duplicate {
            requests.push(IngestRequest {
                uri: uri.to_string(),
                tags: tags.clone(),
                idempotency_tags: idempotency_tags.clone(),
            });
        }
        Ok(())
    }
}
