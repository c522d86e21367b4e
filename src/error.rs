//! Error taxonomy for the re-sharding core.
//!
//! Allocator faults (`RangeUnavailable`, `NotReserved`, `CapacityExceeded`) are
//! programming or configuration errors and abort the current run. Input faults
//! (`MalformedInput`) abort the current blob. `QueueClosed` means a pipeline was
//! wired so that a stage kept producing after it signalled completion.

use crate::io::cloud::CloudIOError;
use crate::memory::Interval;
use std::time::Duration;
use thiserror::Error;

/// The main error type for core operations.
#[derive(Error, Debug)]
pub enum ShardError {
    /// Part of the requested interval is already reserved.
    #[error("range {interval} overlaps an existing reservation")]
    RangeUnavailable {
        /// The interval that could not be reserved.
        interval: Interval,
    },

    /// The interval is not fully covered by existing reservations.
    #[error("range {interval} is not reserved")]
    NotReserved {
        /// The interval that was released.
        interval: Interval,
    },

    /// The request can never be satisfied by the parent range or arena.
    #[error("requested {requested} bytes but only {available} bytes can ever be available")]
    CapacityExceeded {
        /// Number of bytes requested.
        requested: usize,
        /// Size of the range the request was made against.
        available: usize,
    },

    /// Two fragments were merged that are not byte-contiguous in one arena.
    #[error("fragments {left} and {right} are not contiguous")]
    NotContiguous { left: Interval, right: Interval },

    /// A split index past the end of a fragment.
    #[error("index {index} out of range for fragment of {length} bytes")]
    OutOfRange { index: usize, length: usize },

    /// A scratch reservation was not granted in time.
    #[error("reservation of {length} bytes not granted within {waited:?}")]
    ReservationTimeout {
        /// Number of bytes requested.
        length: usize,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The tracker went away before the reservation was granted.
    #[error("reservation abandoned before it was granted")]
    ReservationAbandoned,

    /// Input bytes violate a framing assumption.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// An item was enqueued, or completion signalled, after completion.
    #[error("queue already completed")]
    QueueClosed,

    /// A spawned pipeline task panicked or was cancelled.
    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Cloud(#[from] CloudIOError),
}

impl ShardError {
    /// Classify a read error coming out of a decompressing stream.
    ///
    /// Corrupt or truncated compressed data is reported as `MalformedInput`;
    /// anything else stays an I/O error.
    pub fn from_read(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::InvalidData
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::UnexpectedEof => Self::MalformedInput(err.to_string()),
            _ => Self::Io(err),
        }
    }
}

/// Result alias used throughout the core.
pub type Result<T, E = ShardError> = std::result::Result<T, E>;
