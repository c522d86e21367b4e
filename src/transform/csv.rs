//! Routing CSV records to partitions by a key column.
//!
//! [`CsvPartitioner::parse`] walks one record-aligned fragment once, tracking
//! quote state so separators inside quoted fields are ignored (`""` inside a
//! quoted field is an escaped quote). It records every record's length and
//! hashes the key column of each record to a partition id.
//!
//! [`CsvPartitioner::partition`] then copies each partition's records, in
//! their original order, into its own slice of one scratch reservation. The
//! copies run concurrently; the source fragment is shared between them and
//! released by whichever copy finishes last.

use crate::error::{Result, ShardError};
use crate::memory::{ArenaRegion, BufferFragment, SharedFragment};
use crate::metrics::PerfJournal;
use crate::queue::{Dequeue, QueueResult, WaitingQueue};
use std::collections::BTreeMap;
use std::ops::Range;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, trace};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const SAMPLE_MAX_CHARS: usize = 64;

/// Seeded FNV-1a fold of `value`, reduced to `[0, partitions)`.
#[must_use]
pub fn partition_of(value: &[u8], seed: u64, partitions: usize) -> usize {
    let hash = value.iter().fold(FNV_OFFSET ^ seed, |h, &b| {
        (h ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    });
    (hash % partitions.max(1) as u64) as usize
}

/// Strip a trailing `\r` and one pair of enclosing quotes.
fn key_bytes(field: &[u8]) -> &[u8] {
    let field = field.strip_suffix(b"\r").unwrap_or(field);
    match field {
        [b'"', inner @ .., b'"'] => inner,
        _ => field,
    }
}

/// One parsed, record-aligned fragment.
#[derive(Debug)]
pub struct PartitionedBatch {
    pub content: BufferFragment,
    /// Byte length of every record, in source order.
    pub record_lengths: Vec<usize>,
    /// Partition of every record, parallel to `record_lengths`.
    pub partition_ids: Vec<usize>,
    /// First key seen for each partition, for logs.
    pub partition_samples: BTreeMap<usize, String>,
}

impl PartitionedBatch {
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.record_lengths.len()
    }

    /// Byte ranges of each partition's records, in source order.
    #[must_use]
    pub fn ranges_by_partition(&self) -> BTreeMap<usize, Vec<Range<usize>>> {
        let mut groups: BTreeMap<usize, Vec<Range<usize>>> = BTreeMap::new();
        let mut offset = 0;
        for (&length, &pid) in self.record_lengths.iter().zip(&self.partition_ids) {
            groups.entry(pid).or_default().push(offset..offset + length);
            offset += length;
        }
        groups
    }
}

/// Copy of one partition's records from one batch.
#[derive(Debug)]
pub struct PartitionFragment {
    pub partition: usize,
    pub fragment: BufferFragment,
}

#[derive(Clone)]
pub struct CsvPartitioner {
    column: usize,
    partitions: usize,
    seed: u64,
    scratch_timeout: Duration,
    journal: PerfJournal,
}

struct ScanState {
    column: usize,
    field_start: usize,
    record_start: usize,
    key: Range<usize>,
}

impl CsvPartitioner {
    /// Route on zero-based `column` into `partitions` buckets.
    #[must_use]
    pub fn new(column: usize, partitions: usize) -> Self {
        Self {
            column,
            partitions: partitions.max(1),
            seed: 0,
            scratch_timeout: Duration::from_secs(60),
            journal: PerfJournal::new(),
        }
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_scratch_timeout(mut self, timeout: Duration) -> Self {
        self.scratch_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: PerfJournal) -> Self {
        self.journal = journal;
        self
    }

    #[must_use]
    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Locate records and key columns in `content`.
    #[must_use]
    pub fn parse(&self, content: BufferFragment) -> PartitionedBatch {
        let mut batch = PartitionedBatch {
            content,
            record_lengths: Vec::new(),
            partition_ids: Vec::new(),
            partition_samples: BTreeMap::new(),
        };
        let bytes = batch.content.as_slice();
        let mut records = Vec::new();
        let mut scan = ScanState {
            column: 0,
            field_start: 0,
            record_start: 0,
            key: 0..0,
        };
        let mut in_quotes = false;
        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];
            if in_quotes {
                if b == b'"' {
                    if bytes.get(i + 1) == Some(&b'"') {
                        i += 2;
                        continue;
                    }
                    in_quotes = false;
                }
            } else {
                match b {
                    b'"' => in_quotes = true,
                    b',' => self.end_field(&mut scan, i),
                    b'\n' => {
                        self.end_field(&mut scan, i);
                        records.push((scan.record_start..i + 1, scan.key.clone()));
                        scan.column = 0;
                        scan.record_start = i + 1;
                        scan.key = i + 1..i + 1;
                    }
                    _ => {}
                }
            }
            i += 1;
        }
        if scan.record_start < bytes.len() {
            self.end_field(&mut scan, bytes.len());
            records.push((scan.record_start..bytes.len(), scan.key.clone()));
        }

        for (record, key) in records {
            let key = key_bytes(&bytes[key]);
            let pid = partition_of(key, self.seed, self.partitions);
            batch
                .partition_samples
                .entry(pid)
                .or_insert_with(|| String::from_utf8_lossy(key).chars().take(SAMPLE_MAX_CHARS).collect());
            batch.record_lengths.push(record.len());
            batch.partition_ids.push(pid);
        }
        batch
    }

    fn end_field(&self, scan: &mut ScanState, at: usize) {
        if scan.column == self.column {
            scan.key = scan.field_start..at;
        }
        scan.column += 1;
        scan.field_start = at + 1;
    }

    /// Copy each partition's records out of `batch` into `scratch`.
    ///
    /// Each returned fragment holds one partition's records in source order
    /// followed by one extra `\n`. All copies of a batch come out of a single
    /// scratch reservation of `content + partitions` bytes, so a batch never
    /// holds part of its copies while waiting for the rest. The batch content
    /// is released once every copy is done, including when a copy fails.
    ///
    /// # Errors
    /// Scratch reservation failures (`ReservationTimeout`, `CapacityExceeded`)
    /// or a failed copy task.
    pub async fn partition(
        &self,
        batch: PartitionedBatch,
        scratch: &ArenaRegion,
    ) -> Result<Vec<PartitionFragment>> {
        let groups = batch.ranges_by_partition();
        for (pid, sample) in &batch.partition_samples {
            trace!(partition = pid, sample = %sample, "partition sample");
        }
        if groups.is_empty() {
            return Ok(Vec::new());
        }
        let shared = SharedFragment::new(batch.content, groups.len())?;
        let needed = shared.read(<[u8]>::len).unwrap_or_default() + groups.len();
        let mut rest = scratch
            .reserve_sub_fragment_timeout(needed, self.scratch_timeout)
            .await?;

        let mut copies = JoinSet::new();
        for (partition, ranges) in groups {
            let size = ranges.iter().map(ExactSizeIterator::len).sum::<usize>() + 1;
            let tail = rest.split_off(size)?;
            let target = std::mem::replace(&mut rest, tail);
            let shared = shared.clone();
            copies.spawn(async move {
                let copied = copy_records(&shared, &ranges, target);
                let disposed = shared.dispose();
                let fragment = copied?;
                disposed?;
                Ok::<_, ShardError>(PartitionFragment { partition, fragment })
            });
        }

        let mut out = Vec::with_capacity(copies.len());
        while let Some(joined) = copies.join_next().await {
            out.push(joined.map_err(|err| ShardError::TaskFailed(err.to_string()))??);
        }
        out.sort_by_key(|p| p.partition);
        Ok(out)
    }

    /// Partition every block from `input` into `outputs[partition]`, then
    /// complete all outputs.
    ///
    /// # Errors
    /// `OutOfRange` if `outputs` does not have one queue per partition, plus
    /// the errors of [`partition`](Self::partition).
    pub async fn run(
        &self,
        input: &impl Dequeue<BufferFragment>,
        scratch: &ArenaRegion,
        outputs: &[WaitingQueue<BufferFragment>],
    ) -> Result<()> {
        if outputs.len() != self.partitions {
            return Err(ShardError::OutOfRange {
                index: self.partitions,
                length: outputs.len(),
            });
        }
        while let QueueResult::Item(block) = input.dequeue().await {
            let batch = self.parse(block);
            let records = batch.record_count();
            self.journal.add_reading("partition.records", records as f64);
            let parts = self.partition(batch, scratch).await?;
            debug!(records, partitions = parts.len(), "block partitioned");
            for part in parts {
                outputs[part.partition].enqueue(part.fragment)?;
            }
        }
        for output in outputs {
            output.complete()?;
        }
        Ok(())
    }
}

/// Copy `ranges` of `source` into `target`, which has room for one byte more
/// than the records; that byte becomes the trailing `\n`.
fn copy_records(
    source: &SharedFragment,
    ranges: &[Range<usize>],
    mut target: BufferFragment,
) -> Result<BufferFragment> {
    let not_reserved = ShardError::NotReserved {
        interval: target.interval(),
    };
    let dst = target.as_mut_slice();
    let at = source
        .read(|src| {
            let mut at = 0;
            for range in ranges {
                dst[at..at + range.len()].copy_from_slice(&src[range.clone()]);
                at += range.len();
            }
            at
        })
        .ok_or(not_reserved)?;
    dst[at] = b'\n';
    Ok(target)
}
