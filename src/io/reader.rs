//! Streaming a blob into arena fragments.
//!
//! The reader reserves one chunk at a time from the arena's read region,
//! fills it from the (already decompressed) byte stream, gives back whatever
//! part of the chunk the stream could not fill, and enqueues the rest. When
//! the region is full the reservation waits, so a fast source is paced by the
//! slowest consumer rather than growing memory.
//!
//! Reads block, so [`StorageReader::read_blocking`] is meant for a
//! `spawn_blocking` thread; it waits for reservations through a runtime
//! [`Handle`].

use crate::error::{Result, ShardError};
use crate::memory::{ArenaRegion, BufferFragment};
use crate::metrics::PerfJournal;
use crate::queue::WaitingQueue;
use std::io::{ErrorKind, Read};
use tokio::runtime::Handle;
use tracing::{debug, trace};

pub struct StorageReader {
    region: ArenaRegion,
    chunk_bytes: usize,
    journal: PerfJournal,
}

impl StorageReader {
    /// Reader that carves `chunk_bytes` chunks out of `region`.
    #[must_use]
    pub fn new(region: ArenaRegion, chunk_bytes: usize) -> Self {
        Self {
            region,
            chunk_bytes: chunk_bytes.max(1),
            journal: PerfJournal::new(),
        }
    }

    #[must_use]
    pub fn with_journal(mut self, journal: PerfJournal) -> Self {
        self.journal = journal;
        self
    }

    /// Read `source` to its end, enqueueing chunks into `output`, then
    /// complete `output`. Returns the number of bytes read.
    ///
    /// # Errors
    /// `MalformedInput` for corrupt compressed input, `Io` for other read
    /// failures, `CapacityExceeded` when a chunk is larger than the read
    /// region, and `QueueClosed` when the run was abandoned downstream.
    pub fn read_blocking(
        &self,
        source: &mut dyn Read,
        output: &WaitingQueue<BufferFragment>,
        handle: &Handle,
    ) -> Result<u64> {
        let mut total = 0u64;
        loop {
            let mut chunk = handle.block_on(self.region.reserve_sub_fragment(self.chunk_bytes))?;
            let (filled, eof) = fill(source, chunk.as_mut_slice())?;
            if filled == 0 {
                chunk.release()?;
                break;
            }
            if filled < chunk.len() {
                chunk.split_off(filled)?.release()?;
            }
            trace!(bytes = filled, interval = %chunk.interval(), "chunk read");
            total += filled as u64;
            self.journal.add_reading("reader.bytes", filled as f64);
            self.journal.add_reading("reader.chunks", 1.0);
            output.enqueue(chunk)?;
            if eof {
                break;
            }
        }
        debug!(bytes = total, "source exhausted");
        output.complete()?;
        Ok(total)
    }

    /// [`read_blocking`](Self::read_blocking) on a blocking thread.
    ///
    /// # Errors
    /// As for `read_blocking`, plus `TaskFailed` if the thread panicked.
    pub async fn run(
        self,
        mut source: Box<dyn Read + Send>,
        output: WaitingQueue<BufferFragment>,
    ) -> Result<u64> {
        let handle = Handle::current();
        tokio::task::spawn_blocking(move || self.read_blocking(&mut source, &output, &handle))
            .await
            .map_err(|err| ShardError::TaskFailed(err.to_string()))?
    }
}

/// Fill `buf` as far as the source allows. Returns the byte count and
/// whether the source reached its end.
fn fill(source: &mut dyn Read, buf: &mut [u8]) -> Result<(usize, bool)> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => return Ok((filled, true)),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(ShardError::from_read(err)),
        }
    }
    Ok((filled, false))
}
