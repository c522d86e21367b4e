//! Tests for routing CSV records to partitions.

use anyhow::Result;
use reshard::transform::partition_of;
use reshard::{Arena, BufferFragment, CsvPartitioner, Interval, QueueResult, WaitingQueue};
use std::sync::Arc;

fn fragment_at(arena: &Arc<Arena>, offset: usize, bytes: &[u8]) -> Result<BufferFragment> {
    let mut fragment = BufferFragment::reserve(arena, Interval::new(offset, bytes.len()))?;
    fragment.as_mut_slice().copy_from_slice(bytes);
    Ok(fragment)
}

fn drain(queue: &WaitingQueue<BufferFragment>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(QueueResult::Item(fragment)) = queue.try_dequeue() {
        assert_eq!(fragment.as_slice().last(), Some(&b'\n'));
        out.extend_from_slice(fragment.as_slice());
        fragment.release()?;
    }
    assert!(queue.is_drained());
    Ok(out)
}

fn records(bytes: &[u8]) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut out = Vec::new();
    for record in reader.records() {
        out.push(record?.iter().map(str::to_string).collect());
    }
    Ok(out)
}

#[tokio::test]
async fn test_records_follow_their_key() -> Result<()> {
    let arena = Arena::with_regions(1024, 512)?;
    let input = WaitingQueue::new();
    input.enqueue(fragment_at(&arena, 0, b"1,a\n2,b\n1,c\n")?)?;
    input.complete()?;
    let outputs: Vec<WaitingQueue<BufferFragment>> = (0..2).map(|_| WaitingQueue::new()).collect();

    CsvPartitioner::new(0, 2)
        .run(&input, &arena.scratch_region(), &outputs)
        .await?;

    let ones = partition_of(b"1", 0, 2);
    let twos = partition_of(b"2", 0, 2);
    assert_ne!(ones, twos);
    // Each batch gets a line break appended so batches concatenate safely.
    assert_eq!(drain(&outputs[ones])?, b"1,a\n1,c\n\n");
    assert_eq!(drain(&outputs[twos])?, b"2,b\n\n");
    assert_eq!(arena.reserved_bytes(), 0);
    Ok(())
}

#[tokio::test]
async fn test_every_record_lands_once_in_source_order() -> Result<()> {
    let arena = Arena::with_regions(64 * 1024, 32 * 1024)?;
    let mut text = Vec::new();
    for i in 0..300 {
        text.extend_from_slice(format!("cust-{},\"{} Main St, Apt {}\",{}\n", i % 37, i, i % 5, i).as_bytes());
    }
    let (first, second) = text.split_at(text.len() / 2);
    let cut = first.iter().rposition(|&b| b == b'\n').map_or(0, |p| p + 1);
    let blocks = [&text[..cut], &text[cut..]];
    assert_eq!(blocks[0].len() + blocks[1].len(), first.len() + second.len());

    let input = WaitingQueue::new();
    input.enqueue(fragment_at(&arena, 0, blocks[0])?)?;
    input.enqueue(fragment_at(&arena, blocks[0].len(), blocks[1])?)?;
    input.complete()?;
    let outputs: Vec<WaitingQueue<BufferFragment>> = (0..5).map(|_| WaitingQueue::new()).collect();

    let partitioner = CsvPartitioner::new(0, 5).with_seed(11);
    partitioner.run(&input, &arena.scratch_region(), &outputs).await?;

    let source = records(&text)?;
    let mut total = 0;
    for (partition, output) in outputs.iter().enumerate() {
        let got = records(&drain(output)?)?;
        let expected: Vec<Vec<String>> = source
            .iter()
            .filter(|r| partition_of(r[0].as_bytes(), 11, 5) == partition)
            .cloned()
            .collect();
        assert_eq!(got, expected, "partition {partition}");
        total += got.len();
    }
    assert_eq!(total, 300);
    assert_eq!(arena.reserved_bytes(), 0);
    Ok(())
}

#[tokio::test]
async fn test_unterminated_last_record_gets_a_line_break() -> Result<()> {
    let arena = Arena::with_regions(256, 128)?;
    let input = WaitingQueue::new();
    input.enqueue(fragment_at(&arena, 0, b"x,1\ny,2")?)?;
    input.complete()?;
    let outputs = vec![WaitingQueue::new()];

    CsvPartitioner::new(0, 1)
        .run(&input, &arena.scratch_region(), &outputs)
        .await?;

    assert_eq!(drain(&outputs[0])?, b"x,1\ny,2\n");
    Ok(())
}

#[tokio::test]
async fn test_copies_of_one_batch_share_one_reservation() -> Result<()> {
    let arena = Arena::with_regions(128, 64)?;
    let partitioner = CsvPartitioner::new(0, 2);
    let batch = partitioner.parse(fragment_at(&arena, 0, b"1,a\n2,b\n1,c\n")?);

    let parts = partitioner.partition(batch, &arena.scratch_region()).await?;
    assert_eq!(parts.len(), 2);
    assert!(parts[0].fragment.is_followed_by(&parts[1].fragment));
    assert_eq!(parts[0].fragment.interval().offset, 64);
    let copied: usize = parts.iter().map(|p| p.fragment.len()).sum();
    assert_eq!(copied, 12 + 2);
    // The source block is gone; only the copies remain.
    assert_eq!(arena.reserved_bytes(), copied);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_copies_wait_for_room_for_the_whole_batch() -> Result<()> {
    let arena = Arena::with_regions(32, 16)?;
    let scratch = arena.scratch_region();
    let partitioner = CsvPartitioner::new(0, 2).with_scratch_timeout(std::time::Duration::from_secs(1));
    // Ten free bytes would fit either copy alone, but not both.
    let blocker = scratch.reserve_sub_fragment(6).await?;
    let batch = partitioner.parse(fragment_at(&arena, 0, b"1,a\n2,b\n1,c\n")?);

    let outcome = partitioner.partition(batch, &scratch).await;
    assert!(outcome.is_err());
    assert_eq!(arena.reserved_bytes(), 6);

    blocker.release()?;
    let batch = partitioner.parse(fragment_at(&arena, 0, b"1,a\n2,b\n1,c\n")?);
    let parts = partitioner.partition(batch, &scratch).await?;
    assert_eq!(parts.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_output_count_must_match_partitions() -> Result<()> {
    let arena = Arena::with_regions(256, 128)?;
    let input: WaitingQueue<BufferFragment> = WaitingQueue::new();
    input.complete()?;
    let outputs = vec![WaitingQueue::new()];

    let outcome = CsvPartitioner::new(0, 3)
        .run(&input, &arena.scratch_region(), &outputs)
        .await;
    assert!(outcome.is_err());
    Ok(())
}
