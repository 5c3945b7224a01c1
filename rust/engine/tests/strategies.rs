//! Strategy schedules and candidate construction.

use std::os::unix::fs::FileExt;
use std::sync::Arc;

use halfempty_engine::strategies::{Bisect, Zero};
use halfempty_engine::strategy::{SpawnContext, Strategy, next_params};
use halfempty_engine::task::{ChunkParams, Task, TaskStatus};

fn params(offset: u64, chunksize: u64) -> ChunkParams {
    ChunkParams { offset, chunksize }
}

fn source_task(content: &[u8]) -> Arc<Task> {
    let blob = tempfile::tempfile().expect("tempfile");
    blob.write_all_at(content, 0).expect("write");
    Arc::new(Task::root(blob, content.len() as u64))
}

fn ctx(source: &Arc<Task>, p: ChunkParams, size: u64, succeeded: bool) -> SpawnContext {
    SpawnContext {
        params: p,
        size,
        succeeded,
        source: Arc::clone(source),
        success_params: Vec::new(),
    }
}

async fn candidate_bytes(task: &Task) -> Vec<u8> {
    let guard = task.lock().await;
    let blob = guard.blob().expect("candidate blob");
    let mut buf = vec![0u8; usize::try_from(task.size()).expect("size")];
    blob.read_exact_at(&mut buf, 0).expect("read");
    buf
}

// ---------------------------------------------------------------------------
// The successor rule
// ---------------------------------------------------------------------------

#[test]
fn success_keeps_the_offset_when_data_was_removed() {
    assert_eq!(next_params(params(4, 4), 16, true, false), Some(params(4, 4)));
}

#[test]
fn failure_advances_one_chunk() {
    assert_eq!(next_params(params(4, 4), 16, false, false), Some(params(8, 4)));
}

#[test]
fn overwriting_strategies_advance_even_on_success() {
    assert_eq!(next_params(params(4, 4), 16, true, true), Some(params(8, 4)));
}

#[test]
fn running_off_the_end_starts_a_halved_cycle() {
    assert_eq!(next_params(params(14, 4), 16, false, false), Some(params(0, 2)));
}

#[test]
fn the_schedule_ends_at_chunk_zero() {
    assert_eq!(next_params(params(2, 1), 2, false, false), None);
}

// ---------------------------------------------------------------------------
// Bisect construction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bisect_first_candidate_removes_everything() {
    let source = source_task(b"ABCDEFGH");
    let produced = Bisect
        .next(&ctx(&source, params(0, 8), 8, true))
        .await
        .expect("io")
        .expect("candidate");
    assert_eq!(produced.size(), 0);
    assert_eq!(produced.params(), params(0, 8));
    assert_eq!(produced.status(), TaskStatus::Pending);
}

#[tokio::test]
async fn bisect_removes_the_scheduled_chunk() {
    let source = source_task(b"ABCDEFGH");
    // A failed parent at (0, 4) advances to (4, 4): delete the second half.
    let produced = Bisect
        .next(&ctx(&source, params(0, 4), 8, false))
        .await
        .expect("io")
        .expect("candidate");
    assert_eq!(produced.params(), params(4, 4));
    assert_eq!(candidate_bytes(&produced).await, b"ABCD");
}

#[tokio::test]
async fn bisect_clips_the_final_partial_chunk() {
    let source = source_task(b"ABCDEF");
    // (4, 4) overlaps the end: only two bytes can go.
    let produced = Bisect
        .next(&ctx(&source, params(0, 4), 6, false))
        .await
        .expect("io")
        .expect("candidate");
    assert_eq!(candidate_bytes(&produced).await, b"ABCD");
    assert_eq!(produced.size(), 4);
}

#[tokio::test]
async fn bisect_gives_up_on_an_empty_source() {
    let source = source_task(b"");
    let produced = Bisect
        .next(&ctx(&source, params(0, 0), 0, true))
        .await
        .expect("io");
    assert!(produced.is_none());
}

// ---------------------------------------------------------------------------
// Zero construction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn zero_overwrites_without_shrinking() {
    let source = source_task(b"ABCDEFGH");
    // Root context: the schedule advances off the end and rolls over to
    // the first half.
    let produced = Zero::new(0)
        .next(&ctx(&source, params(0, 8), 8, true))
        .await
        .expect("io")
        .expect("candidate");
    assert_eq!(produced.size(), 8);
    assert_eq!(produced.params(), params(0, 4));
    assert_eq!(candidate_bytes(&produced).await, b"\0\0\0\0EFGH");
}

#[tokio::test]
async fn zero_skips_regions_an_ancestor_already_zeroed() {
    let source = source_task(b"\0\0\0\0EFGH");
    let mut context = ctx(&source, params(0, 2), 8, false);
    context.success_params = vec![params(0, 4)];
    // (2, 2) is inside the zeroed region; the next untouched block is
    // (4, 2).
    let produced = Zero::new(0)
        .next(&context)
        .await
        .expect("io")
        .expect("candidate");
    assert_eq!(produced.params(), params(4, 2));
    assert_eq!(candidate_bytes(&produced).await, b"\0\0\0\0\0\0GH");
}

#[tokio::test]
async fn zero_exhausts_a_fully_zeroed_source() {
    let source = source_task(b"\0\0\0\0");
    let produced = Zero::new(0)
        .next(&ctx(&source, params(0, 4), 4, false))
        .await
        .expect("io");
    assert!(produced.is_none());
}

#[tokio::test]
async fn zero_uses_the_configured_byte() {
    let source = source_task(b"ABCD");
    let produced = Zero::new(b' ')
        .next(&ctx(&source, params(2, 2), 4, false))
        .await
        .expect("io")
        .expect("candidate");
    // (2, 2) advances off the end and rolls over to chunk 1 at offset 0.
    assert_eq!(produced.params(), params(0, 1));
    assert_eq!(candidate_bytes(&produced).await, b" BCD");
}
