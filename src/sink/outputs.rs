//! Shard destinations: plain blob uploads, and uploads followed by an
//! ingestion command.

use super::shard::{ShardInfo, ShardOutput, ShardSink};
use crate::error::Result;
use crate::io::blob::{BlobStore, BlobWriter};
use crate::io::compression::{CompressedWriter, Compression, wrap_compress};
use crate::io::ingest::IngestClient;
use std::collections::BTreeSet;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::debug;

pub const LAST_SHARD_TAG: &str = "last-shard";

/// `{prefix}/{stem}[_p{partition:03}]_{shard}.csv[.gz|.zip]`
#[must_use]
pub fn shard_name(prefix: &str, shard: &ShardInfo, compression: Compression) -> String {
    let file = shard_file_name(shard, compression);
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        file
    } else {
        format!("{prefix}/{file}")
    }
}

fn shard_file_name(shard: &ShardInfo, compression: Compression) -> String {
    let partition = shard
        .partition
        .map(|p| format!("_p{p:03}"))
        .unwrap_or_default();
    format!(
        "{}{partition}_{}.csv{}",
        shard.stem,
        shard.shard_id,
        compression.extension()
    )
}

/// Tags and idempotency tags attached to a shard's ingestion command.
#[must_use]
pub fn ingest_tags(shard: &ShardInfo, extra: &[String]) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut tags = BTreeSet::new();
    tags.insert(format!("source:{}", shard.source));
    tags.insert(format!("shard:{}", shard.shard_id));
    if let Some(p) = shard.partition {
        tags.insert(format!("partition:{p}"));
    }
    tags.extend(extra.iter().cloned());
    if shard.is_last {
        tags.insert(LAST_SHARD_TAG.to_string());
    }

    let partition = shard.partition.map(|p| p.to_string()).unwrap_or_default();
    let idempotency = BTreeSet::from([format!("{}/{partition}/{}", shard.source, shard.shard_id)]);
    (tags, idempotency)
}

/// Uploads every shard as a blob under a destination prefix.
#[derive(Clone)]
pub struct BlobShardOutput {
    store: Arc<dyn BlobStore>,
    prefix: String,
    compression: Compression,
}

impl BlobShardOutput {
    pub fn new(store: Arc<dyn BlobStore>, prefix: impl Into<String>, compression: Compression) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            compression,
        }
    }

    fn open_blob(&self, shard: &ShardInfo) -> Result<BlobShardSink> {
        let name = shard_name(&self.prefix, shard, self.compression);
        let entry = shard_file_name(shard, Compression::None);
        let writer = self.store.open_write(&name)?;
        debug!(blob = %name, "shard opened");
        Ok(BlobShardSink {
            out: wrap_compress(writer, self.compression, &entry)?,
        })
    }
}

impl ShardOutput for BlobShardOutput {
    fn open(&self, shard: &ShardInfo) -> Result<Box<dyn ShardSink>> {
        Ok(Box::new(self.open_blob(shard)?))
    }
}

struct BlobShardSink {
    out: CompressedWriter<Box<dyn BlobWriter>>,
}

impl Write for BlobShardSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl ShardSink for BlobShardSink {
    fn seal(self: Box<Self>, _shard: &ShardInfo) -> Result<String> {
        let blob = self.out.finish()?;
        Ok(blob.finish()?)
    }
}

/// Uploads every shard, then asks the database to ingest it.
#[derive(Clone)]
pub struct IngestShardOutput {
    blobs: BlobShardOutput,
    client: Arc<dyn IngestClient>,
    extra_tags: Vec<String>,
}

impl IngestShardOutput {
    pub fn new(blobs: BlobShardOutput, client: Arc<dyn IngestClient>, extra_tags: Vec<String>) -> Self {
        Self {
            blobs,
            client,
            extra_tags,
        }
    }
}

impl ShardOutput for IngestShardOutput {
    fn open(&self, shard: &ShardInfo) -> Result<Box<dyn ShardSink>> {
        Ok(Box::new(IngestShardSink {
            blob: self.blobs.open_blob(shard)?,
            client: Arc::clone(&self.client),
            extra_tags: self.extra_tags.clone(),
        }))
    }
}

struct IngestShardSink {
    blob: BlobShardSink,
    client: Arc<dyn IngestClient>,
    extra_tags: Vec<String>,
}

impl Write for IngestShardSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.blob.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.blob.flush()
    }
}

impl ShardSink for IngestShardSink {
    fn seal(self: Box<Self>, shard: &ShardInfo) -> Result<String> {
        let Self {
            blob,
            client,
            extra_tags,
        } = *self;
        let uri = Box::new(blob).seal(shard)?;
        let (tags, idempotency) = ingest_tags(shard, &extra_tags);
        client.ingest_from_storage(&uri, &tags, &idempotency)?;
        debug!(uri = %uri, tags = tags.len(), "ingestion requested");
        Ok(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(partition: Option<usize>, is_last: bool) -> ShardInfo {
        ShardInfo {
            source: "in/sales.csv.gz".into(),
            stem: "sales".into(),
            partition,
            shard_id: "00007".into(),
            is_last,
            bytes: 0,
        }
    }

    #[test]
    fn names_follow_the_layout() {
        assert_eq!(
            shard_name("out/", &shard(Some(3), false), Compression::Gzip),
            "out/sales_p003_00007.csv.gz"
        );
        assert_eq!(shard_name("", &shard(None, false), Compression::None), "sales_00007.csv");
    }

    #[test]
    fn last_shard_is_tagged() {
        let extra = vec!["team:data".to_string()];
        let (tags, idem) = ingest_tags(&shard(Some(1), true), &extra);
        assert!(tags.contains("source:in/sales.csv.gz"));
        assert!(tags.contains("shard:00007"));
        assert!(tags.contains("partition:1"));
        assert!(tags.contains("team:data"));
        assert!(tags.contains(LAST_SHARD_TAG));
        assert_eq!(idem, BTreeSet::from(["in/sales.csv.gz/1/00007".to_string()]));

        let (tags, _) = ingest_tags(&shard(None, false), &[]);
        assert!(!tags.contains(LAST_SHARD_TAG));
        assert!(!tags.iter().any(|t| t.starts_with("partition:")));
    }
}
