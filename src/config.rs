//! Run configuration: what to read, where shards go, and the memory budget.
//!
//! Configs are plain serde structs so they can be loaded from JSON:
//!
//! ```
//! use reshard::config::{RunConfig, SourceSpec};
//!
//! let config = RunConfig::from_json_str(r#"{
//!     "source": { "kind": "prefix", "prefix": "incoming/", "suffix": ".csv.gz" },
//!     "destination": { "prefix": "shards" },
//!     "format": { "has_header": true, "partition": { "column": 0, "count": 8 } }
//! }"#)?;
//! assert!(matches!(config.source, SourceSpec::Prefix { .. }));
//! assert_eq!(config.format.partition.map(|p| p.count), Some(8));
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::io::compression::Compression;
use crate::sink::default_workers;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceSpec {
    /// One named blob.
    Blob { name: String },
    /// Every blob whose name starts with `prefix` and ends with `suffix`.
    Prefix {
        prefix: String,
        #[serde(default)]
        suffix: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    pub prefix: String,
    pub compression: Compression,
    /// When set, every sealed shard is also handed to the ingest client.
    pub ingest: Option<IngestConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    pub table: String,
    #[serde(default)]
    pub extra_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatConfig {
    /// The first line of every blob is a header.
    pub has_header: bool,
    /// Repeat the header at the top of every shard.
    pub header_per_shard: bool,
    pub partition: Option<PartitionConfig>,
    /// `None` detects from the blob name, then from the first bytes.
    pub input_compression: Option<Compression>,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            has_header: false,
            header_per_shard: true,
            partition: None,
            input_compression: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Zero-based key column.
    pub column: usize,
    pub count: usize,
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    pub max_shard_bytes: u64,
    /// Writer tasks per output stream; `None` means `2 x cores + 1`.
    pub workers: Option<usize>,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            max_shard_bytes: 256 * MIB as u64,
            workers: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub arena_bytes: usize,
    /// Bytes per storage read. Must exceed the longest line in the data.
    pub read_chunk_bytes: usize,
    /// Share of the arena given to storage reads; the rest is scratch.
    pub read_region_percent: u8,
    pub scratch_timeout_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            arena_bytes: 64 * MIB,
            read_chunk_bytes: 4 * MIB,
            read_region_percent: 50,
            scratch_timeout_ms: 60_000,
        }
    }
}

impl MemoryConfig {
    #[must_use]
    pub fn read_region_bytes(&self) -> usize {
        self.arena_bytes / 100 * usize::from(self.read_region_percent)
            + self.arena_bytes % 100 * usize::from(self.read_region_percent) / 100
    }

    #[must_use]
    pub fn scratch_region_bytes(&self) -> usize {
        self.arena_bytes - self.read_region_bytes()
    }

    #[must_use]
    pub fn scratch_timeout(&self) -> Duration {
        Duration::from_millis(self.scratch_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub source: SourceSpec,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub format: FormatConfig,
    #[serde(default)]
    pub sharding: ShardingConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

impl RunConfig {
    /// Config for `source` with every other section defaulted.
    #[must_use]
    pub fn new(source: SourceSpec) -> Self {
        Self {
            source,
            destination: DestinationConfig::default(),
            format: FormatConfig::default(),
            sharding: ShardingConfig::default(),
            memory: MemoryConfig::default(),
        }
    }

    /// Load and validate a JSON config file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("load config {}", path.display()))
    }

    /// Parse and validate a JSON config.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or the config is invalid.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).context("parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Writer tasks per output stream.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.sharding.workers.unwrap_or_else(default_workers)
    }

    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.format.partition.map_or(1, |p| p.count)
    }

    /// Scratch bytes set aside for line-splitter carries. When partitioning,
    /// the rest of the scratch region holds partition copies.
    #[must_use]
    pub fn carry_region_bytes(&self) -> usize {
        if self.format.partition.is_some() {
            2 * self.memory.read_chunk_bytes
        } else {
            self.memory.scratch_region_bytes()
        }
    }

    /// Check the sizes against each other.
    ///
    /// The read region must hold three chunks. The unterminated tail of one
    /// chunk stays reserved until the next chunk arrives, and with three
    /// chunks of room the tail can never leave two gaps that are each too
    /// small for a chunk. A line-splitter carry copy is at most a tail plus
    /// one chunk, so the carry part of the scratch region needs two chunks.
    /// When partitioning, the copies of one block (a block plus one
    /// separator per partition) get a region of their own with the same
    /// two chunks plus the partition count.
    ///
    /// # Errors
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        match &self.source {
            SourceSpec::Blob { name } if name.is_empty() => bail!("source blob name is empty"),
            _ => {}
        }
        if self.sharding.max_shard_bytes == 0 {
            bail!("sharding.max_shard_bytes must be positive");
        }
        if self.sharding.workers == Some(0) {
            bail!("sharding.workers must be positive");
        }
        if let Some(partition) = &self.format.partition
            && partition.count == 0
        {
            bail!("format.partition.count must be at least 1");
        }

        let memory = &self.memory;
        if memory.arena_bytes == 0 || memory.read_chunk_bytes == 0 {
            bail!("memory.arena_bytes and memory.read_chunk_bytes must be positive");
        }
        if memory.read_region_percent == 0 || memory.read_region_percent >= 100 {
            bail!(
                "memory.read_region_percent must be between 1 and 99, got {}",
                memory.read_region_percent
            );
        }
        let read = memory.read_region_bytes();
        if read < 3 * memory.read_chunk_bytes {
            bail!(
                "read region of {read} bytes cannot hold three read chunks of {} bytes",
                memory.read_chunk_bytes
            );
        }
        let scratch = memory.scratch_region_bytes();
        let needed = match self.format.partition {
            Some(partition) => 4 * memory.read_chunk_bytes + partition.count,
            None => 2 * memory.read_chunk_bytes,
        };
        if scratch < needed {
            bail!(
                "scratch region of {scratch} bytes is smaller than the {needed} bytes carries and partition copies may need"
            );
        }
        if memory.scratch_timeout_ms == 0 {
            bail!("memory.scratch_timeout_ms must be positive");
        }
        Ok(())
    }
}
