//! Performance readings collected while a run is in flight.
//!
//! Pipeline stages call [`PerfJournal::add_reading`] with a reading name and a
//! value; the journal folds them into count/sum/min/max per name. Recording
//! only takes a short lock, so producers are never held up by reporting.
//! Something outside the hot path drains the journal and prints or logs it.
//!
//! # Example
//!
//! ```
//! use reshard::metrics::PerfJournal;
//!
//! let journal = PerfJournal::new();
//! journal.add_reading("reader.bytes", 4096.0);
//! journal.add_reading("reader.bytes", 1024.0);
//!
//! let snapshot = journal.drain();
//! let bytes = &snapshot.readings["reader.bytes"];
//! assert_eq!(bytes.count, 2);
//! assert_eq!(bytes.sum, 5120.0);
//! assert!(journal.snapshot().readings.is_empty());
//! ```

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::info;

/// Aggregate of every value recorded under one name.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReadingStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl ReadingStats {
    fn first(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Readings gathered over one interval.
#[derive(Debug, Clone, Serialize)]
pub struct JournalSnapshot {
    pub elapsed_ms: u64,
    pub readings: BTreeMap<String, ReadingStats>,
}

/// Thread-safe, cheaply clonable reading journal.
#[derive(Clone)]
pub struct PerfJournal {
    inner: Arc<Mutex<JournalInner>>,
}

struct JournalInner {
    readings: BTreeMap<String, ReadingStats>,
    since: Instant,
}

impl PerfJournal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(JournalInner {
                readings: BTreeMap::new(),
                since: Instant::now(),
            })),
        }
    }

    /// Record `value` under `name`.
    pub fn add_reading(&self, name: &str, value: f64) {
        let mut inner = self.inner.lock();
        match inner.readings.get_mut(name) {
            Some(stats) => stats.record(value),
            None => {
                inner.readings.insert(name.to_string(), ReadingStats::first(value));
            }
        }
    }

    /// Current readings, left in place.
    #[must_use]
    pub fn snapshot(&self) -> JournalSnapshot {
        let inner = self.inner.lock();
        JournalSnapshot {
            elapsed_ms: millis_since(inner.since),
            readings: inner.readings.clone(),
        }
    }

    /// Current readings; the journal starts over empty.
    #[must_use]
    pub fn drain(&self) -> JournalSnapshot {
        let mut inner = self.inner.lock();
        let snapshot = JournalSnapshot {
            elapsed_ms: millis_since(inner.since),
            readings: std::mem::take(&mut inner.readings),
        };
        inner.since = Instant::now();
        snapshot
    }

    /// Current readings as a JSON object keyed by reading name.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let snapshot = self.snapshot();
        json!({
            "elapsed_ms": snapshot.elapsed_ms,
            "readings": snapshot.readings,
        })
    }

    /// Print current readings to stdout in a human-readable table.
    pub fn print(&self) {
        let snapshot = self.snapshot();
        println!("\n========== Perf Journal ==========");
        println!("Elapsed: {} ms", snapshot.elapsed_ms);
        println!("----------------------------------");
        for (name, stats) in &snapshot.readings {
            println!(
                "{name}: count={} sum={} min={} max={} mean={:.2}",
                stats.count,
                stats.sum,
                stats.min,
                stats.max,
                stats.mean()
            );
        }
        println!("==================================\n");
    }

    /// Save current readings to a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or written.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        file.write_all(formatted.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Drain the journal every `every` and log what was gathered. The task
    /// runs until aborted.
    pub fn spawn_reporter(&self, every: Duration) -> JoinHandle<()> {
        let journal = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = journal.drain();
                for (name, stats) in &snapshot.readings {
                    info!(
                        reading = %name,
                        count = stats.count,
                        sum = stats.sum,
                        mean = stats.mean(),
                        interval_ms = snapshot.elapsed_ms,
                        "perf"
                    );
                }
            }
        })
    }
}

fn millis_since(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl Default for PerfJournal {
    fn default() -> Self {
        Self::new()
    }
}
