//! Tests for the perf journal.

use reshard::PerfJournal;
use serde_json::json;
use std::time::Duration;

#[test]
fn test_readings_fold_into_stats() {
    let journal = PerfJournal::new();
    for value in [4.0, 1.0, 7.0] {
        journal.add_reading("shard.bytes", value);
    }
    journal.add_reading("shard.sealed", 1.0);

    let snapshot = journal.snapshot();
    let bytes = snapshot.readings["shard.bytes"];
    assert_eq!(bytes.count, 3);
    assert_eq!(bytes.sum, 12.0);
    assert_eq!(bytes.min, 1.0);
    assert_eq!(bytes.max, 7.0);
    assert_eq!(bytes.mean(), 4.0);
    assert_eq!(snapshot.readings.len(), 2);

    // Printing reads without draining.
    journal.print();
    assert_eq!(journal.snapshot().readings["shard.bytes"].count, 3);
}

#[test]
fn test_clones_share_one_journal() {
    let journal = PerfJournal::new();
    let handle = journal.clone();
    handle.add_reading("reader.chunks", 1.0);
    assert_eq!(journal.snapshot().readings["reader.chunks"].count, 1);
}

#[test]
fn test_drain_starts_over() {
    let journal = PerfJournal::new();
    journal.add_reading("lines.fragments", 2.0);
    let drained = journal.drain();
    assert_eq!(drained.readings["lines.fragments"].sum, 2.0);
    assert!(journal.snapshot().readings.is_empty());
}

#[test]
fn test_json_export() -> anyhow::Result<()> {
    let journal = PerfJournal::new();
    journal.add_reading("blob.completed", 1.0);
    let value = journal.to_json();
    assert_eq!(value["readings"]["blob.completed"]["count"], json!(1));
    assert!(value["elapsed_ms"].is_u64());

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("journal.json");
    journal.save_to_file(&path)?;
    let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(saved["readings"]["blob.completed"]["sum"], json!(1.0));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_reporter_drains_on_every_tick() {
    let journal = PerfJournal::new();
    journal.add_reading("reader.bytes", 10.0);
    let reporter = journal.spawn_reporter(Duration::from_secs(1));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(journal.snapshot().readings.is_empty());

    reporter.abort();
    assert!(reporter.await.is_err_and(|err| err.is_cancelled()));
}
