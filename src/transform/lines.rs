//! Re-chunking raw storage reads onto line boundaries.
//!
//! Every fragment emitted by [`LineSplitter`] ends with `\n`, except possibly
//! the very last one when the input does not end with a line break. Bytes are
//! neither reordered nor dropped: concatenating the output (plus the header,
//! if one was extracted) reproduces the input.
//!
//! Each raw chunk must contain at least one line break. A chunk without one
//! faults with `MalformedInput`; the read chunk size must therefore exceed the
//! longest line in the data.

use crate::error::{Result, ShardError};
use crate::memory::{ArenaRegion, BufferFragment};
use crate::metrics::PerfJournal;
use crate::queue::{Dequeue, QueueResult, WaitingQueue};
use std::time::Duration;
use tracing::{debug, trace};

/// Receives the header line (including its line break) once per stream.
pub type HeaderCallback = Box<dyn FnOnce(&[u8]) + Send + Sync>;

pub struct LineSplitter {
    scratch: ArenaRegion,
    scratch_timeout: Duration,
    on_header: Option<HeaderCallback>,
    journal: PerfJournal,
}

impl LineSplitter {
    /// Splitter that copies non-adjacent carries into `scratch`.
    #[must_use]
    pub fn new(scratch: ArenaRegion) -> Self {
        Self {
            scratch,
            scratch_timeout: Duration::from_secs(60),
            on_header: None,
            journal: PerfJournal::new(),
        }
    }

    #[must_use]
    pub fn with_scratch_timeout(mut self, timeout: Duration) -> Self {
        self.scratch_timeout = timeout;
        self
    }

    /// Strip the first line of the stream and hand it to `on_header`.
    #[must_use]
    pub fn extract_header(mut self, on_header: impl FnOnce(&[u8]) + Send + Sync + 'static) -> Self {
        self.on_header = Some(Box::new(on_header));
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: PerfJournal) -> Self {
        self.journal = journal;
        self
    }

    /// Drain `input`, emit line-aligned fragments into `output`, then
    /// complete `output`.
    ///
    /// # Errors
    /// `MalformedInput` for a chunk without a line break, scratch reservation
    /// failures, and `QueueClosed` if `output` was completed by someone else.
    pub async fn run(
        mut self,
        input: &impl Dequeue<BufferFragment>,
        output: &WaitingQueue<BufferFragment>,
    ) -> Result<()> {
        let mut remaining = BufferFragment::empty();
        while let QueueResult::Item(chunk) = input.dequeue().await {
            remaining = self.push(chunk, remaining, output).await?;
        }
        if !remaining.is_empty() {
            debug!(bytes = remaining.len(), "flushing unterminated tail");
            self.emit(remaining, output)?;
        }
        output.complete()
    }

    async fn push(
        &mut self,
        chunk: BufferFragment,
        remaining: BufferFragment,
        output: &WaitingQueue<BufferFragment>,
    ) -> Result<BufferFragment> {
        let Some(last) = chunk.as_slice().iter().rposition(|&b| b == b'\n') else {
            return Err(ShardError::MalformedInput(format!(
                "chunk of {} bytes contains no line break; read chunks must be longer than the longest line",
                chunk.len()
            )));
        };

        let mut chunk = chunk;
        let mut cut = last + 1;
        // The header is taken from the first chunk, before anything is carried.
        if let Some(on_header) = self.on_header.take() {
            let first = chunk
                .as_slice()
                .iter()
                .position(|&b| b == b'\n')
                .unwrap_or(last);
            let (header, rest) = chunk.split(first + 1)?;
            on_header(header.as_slice());
            debug!(bytes = header.len(), "header extracted");
            header.release()?;
            chunk = rest;
            cut -= first + 1;
        }

        let (head, tail) = chunk.split(cut)?;
        let block = self.concat(remaining, head).await?;
        if !block.is_empty() {
            self.emit(block, output)?;
        }
        Ok(tail)
    }

    fn emit(&self, block: BufferFragment, output: &WaitingQueue<BufferFragment>) -> Result<()> {
        trace!(bytes = block.len(), interval = %block.interval(), "line block");
        self.journal.add_reading("lines.fragments", 1.0);
        output.enqueue(block)
    }

    /// `left` followed by `right`, merged in place when adjacent, copied into
    /// scratch otherwise.
    async fn concat(&self, left: BufferFragment, right: BufferFragment) -> Result<BufferFragment> {
        if left.is_followed_by(&right) {
            return left.merge(right);
        }
        let mut joined = self
            .scratch
            .reserve_sub_fragment_timeout(left.len() + right.len(), self.scratch_timeout)
            .await?;
        let bytes = joined.as_mut_slice();
        bytes[..left.len()].copy_from_slice(left.as_slice());
        bytes[left.len()..].copy_from_slice(right.as_slice());
        trace!(carried = left.len(), appended = right.len(), "carry copied to scratch");
        left.release()?;
        right.release()?;
        Ok(joined)
    }
}
