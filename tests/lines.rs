//! Tests for cutting raw chunks on line boundaries.

use anyhow::Result;
use parking_lot::Mutex;
use reshard::{Arena, BufferFragment, Interval, LineSplitter, QueueResult, ShardError, WaitingQueue};
use std::sync::Arc;

const INPUT: &[u8] = b"id,name\n1,alpha\n2,beta\n3,gamma\n4,delta";

/// Lay `input` out in the read region as `chunk`-byte fragments, leaving
/// `gap` bytes between consecutive chunks.
fn feed(arena: &Arc<Arena>, input: &[u8], chunk: usize, gap: usize) -> Result<WaitingQueue<BufferFragment>> {
    let queue = WaitingQueue::new();
    for (i, piece) in input.chunks(chunk).enumerate() {
        let offset = i * (chunk + gap);
        let mut fragment = BufferFragment::reserve(arena, Interval::new(offset, piece.len()))?;
        fragment.as_mut_slice().copy_from_slice(piece);
        queue.enqueue(fragment)?;
    }
    queue.complete()?;
    Ok(queue)
}

/// Drain `output`, checking line alignment, and return the concatenation.
fn drain(output: &WaitingQueue<BufferFragment>) -> Result<Vec<u8>> {
    let mut blocks = Vec::new();
    while let Some(QueueResult::Item(block)) = output.try_dequeue() {
        blocks.push(block.as_slice().to_vec());
        block.release()?;
    }
    assert!(output.is_drained());
    if let Some((_, init)) = blocks.split_last() {
        for block in init {
            assert_eq!(block.last(), Some(&b'\n'), "block {:?}", String::from_utf8_lossy(block));
        }
    }
    Ok(blocks.concat())
}

#[tokio::test]
async fn test_adjacent_chunks_round_trip() -> Result<()> {
    let arena = Arena::with_regions(256, 128)?;
    let input = feed(&arena, INPUT, 10, 0)?;
    let output = WaitingQueue::new();

    LineSplitter::new(arena.scratch_region()).run(&input, &output).await?;

    assert_eq!(drain(&output)?, INPUT);
    assert_eq!(arena.reserved_bytes(), 0);
    Ok(())
}

#[tokio::test]
async fn test_non_adjacent_carry_is_copied_to_scratch() -> Result<()> {
    let arena = Arena::with_regions(256, 128)?;
    let input = feed(&arena, INPUT, 10, 3)?;
    let output = WaitingQueue::new();

    LineSplitter::new(arena.scratch_region()).run(&input, &output).await?;

    let mut blocks = Vec::new();
    while let Some(QueueResult::Item(block)) = output.try_dequeue() {
        blocks.push(block);
    }
    // "1," was carried out of the first chunk and joined with "alpha\n".
    assert_eq!(blocks[1].as_slice(), b"1,alpha\n");
    assert!(arena.scratch_region().interval().contains(&blocks[1].interval()));

    let joined: Vec<u8> = blocks.iter().flat_map(|b| b.iter()).collect();
    assert_eq!(joined, INPUT);
    drop(blocks);
    assert_eq!(arena.reserved_bytes(), 0);
    Ok(())
}

#[tokio::test]
async fn test_header_is_extracted_once() -> Result<()> {
    let arena = Arena::with_regions(256, 128)?;
    let input = feed(&arena, INPUT, 10, 0)?;
    let output = WaitingQueue::new();
    let header = Arc::new(Mutex::new(Vec::new()));

    let slot = Arc::clone(&header);
    LineSplitter::new(arena.scratch_region())
        .extract_header(move |line| slot.lock().extend_from_slice(line))
        .run(&input, &output)
        .await?;

    assert_eq!(header.lock().as_slice(), b"id,name\n");
    assert_eq!(drain(&output)?, &INPUT[8..]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_splitter_with_header_runs_on_a_spawned_task() -> Result<()> {
    let arena = Arena::with_regions(256, 128)?;
    let input = feed(&arena, INPUT, 10, 0)?;
    let output = WaitingQueue::new();
    let header = Arc::new(Mutex::new(Vec::new()));

    let slot = Arc::clone(&header);
    let splitter = LineSplitter::new(arena.scratch_region())
        .extract_header(move |line| slot.lock().extend_from_slice(line));
    let split_out = output.clone();
    tokio::spawn(async move { splitter.run(&input, &split_out).await }).await??;

    assert_eq!(header.lock().as_slice(), b"id,name\n");
    assert_eq!(drain(&output)?, &INPUT[8..]);
    Ok(())
}

#[tokio::test]
async fn test_trailing_newline_leaves_no_tail() -> Result<()> {
    let arena = Arena::with_regions(256, 128)?;
    let input = feed(&arena, b"a\nbb\nccc\n", 4, 0)?;
    let output = WaitingQueue::new();

    LineSplitter::new(arena.scratch_region()).run(&input, &output).await?;

    assert_eq!(drain(&output)?, b"a\nbb\nccc\n");
    Ok(())
}

#[tokio::test]
async fn test_chunk_without_line_break_is_malformed() -> Result<()> {
    let arena = Arena::with_regions(256, 128)?;
    let input = feed(&arena, b"abc\nthis-line-is-longer-than-a-chunk\n", 8, 0)?;
    let output = WaitingQueue::new();

    let outcome = LineSplitter::new(arena.scratch_region()).run(&input, &output).await;
    assert!(matches!(outcome, Err(ShardError::MalformedInput(_))));
    Ok(())
}

#[tokio::test]
async fn test_empty_input_completes_output() -> Result<()> {
    let arena = Arena::with_regions(64, 32)?;
    let input = feed(&arena, b"", 8, 0)?;
    let output = WaitingQueue::new();

    LineSplitter::new(arena.scratch_region()).run(&input, &output).await?;

    assert!(output.is_drained());
    Ok(())
}
