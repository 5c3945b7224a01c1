//! End-to-end minimization scenarios.

mod common;

use std::sync::Arc;
use std::time::Duration;

use halfempty_engine::{EngineError, EventEmitter, Minimizer};

use common::{RecordingEmitter, config, input, make_tempdir, script};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn an_always_happy_predicate_minimizes_to_nothing() {
    let dir = make_tempdir();
    let predicate = script(&dir, "exec cat >/dev/null");
    let target = input(&dir, b"XYZ");

    let outcome = Minimizer::new(config(&predicate))
        .expect("engine")
        .minimize(&target)
        .await
        .expect("minimize");

    assert_eq!(outcome.final_size, 0);
    assert!(outcome.data.is_empty());
    assert_eq!(outcome.initial_size, 3);
    assert!(outcome.runs >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_single_byte_sentinel_survives() {
    let dir = make_tempdir();
    let predicate = script(&dir, "exec grep -q A");
    let target = input(&dir, b"AAAA");

    let outcome = Minimizer::new(config(&predicate))
        .expect("engine")
        .minimize(&target)
        .await
        .expect("minimize");

    assert_eq!(outcome.data, b"A");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_fixed_prefix_is_preserved_exactly() {
    let dir = make_tempdir();
    let predicate = script(&dir, "[ \"$(head -c 5)\" = \"MAGIC\" ]");
    let mut content = b"MAGIC".to_vec();
    content.extend(std::iter::repeat_n(b"junk", 40).flatten());
    let target = input(&dir, &content);

    let outcome = Minimizer::new(config(&predicate))
        .expect("engine")
        .minimize(&target)
        .await
        .expect("minimize");

    assert_eq!(outcome.data, b"MAGIC");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stable_reruns_settle_on_a_fixed_point() {
    let dir = make_tempdir();
    let predicate = script(&dir, "[ \"$(head -c 5)\" = \"MAGIC\" ]");
    let mut content = b"MAGIC".to_vec();
    content.extend(std::iter::repeat_n(b"junk", 10).flatten());
    let target = input(&dir, &content);

    let mut config = config(&predicate);
    config.stable = true;
    config.zero_char = 0x20;

    let outcome = Minimizer::new(config)
        .expect("engine")
        .minimize(&target)
        .await
        .expect("minimize");

    // Zeroing with spaces cannot beat plain deletion here; the fixed
    // point is the bare prefix either way.
    assert_eq!(outcome.data, b"MAGIC");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_ordered_markers_survive() {
    let dir = make_tempdir();
    let predicate = script(&dir, "exec grep -q 'P.*Q'");
    let target = input(&dir, b"AAAPBBBQCCC");

    let outcome = Minimizer::new(config(&predicate))
        .expect("engine")
        .minimize(&target)
        .await
        .expect("minimize");

    assert_eq!(outcome.data, b"PQ");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeouts_classify_every_candidate_as_failure() {
    let dir = make_tempdir();
    let predicate = script(&dir, "sleep 60");
    let target = input(&dir, b"hello");

    let mut config = config(&predicate);
    config.timeout = Some(Duration::from_secs(1));
    config.verify = false;

    let outcome = Minimizer::new(config)
        .expect("engine")
        .minimize(&target)
        .await
        .expect("minimize");

    // Nothing is interesting, so nothing can be removed.
    assert_eq!(outcome.data, b"hello");
    assert!(outcome.runs >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_mispredicted_success_discards_the_speculated_subtree() {
    let dir = make_tempdir();
    // A little latency so speculation runs ahead of results.
    let predicate = script(&dir, "sleep 0.1\n[ \"$(cat)\" = \"halfempty\" ]");
    let mut content = b"halfempty".to_vec();
    content.extend(std::iter::repeat_n(b'x', 48));
    let target = input(&dir, &content);

    let emitter = Arc::new(RecordingEmitter::default());
    let outcome = Minimizer::new(config(&predicate))
        .expect("engine")
        .with_emitter(Arc::clone(&emitter) as Arc<dyn EventEmitter>)
        .minimize(&target)
        .await
        .expect("minimize");

    assert_eq!(outcome.data, b"halfempty");
    // At least one speculative candidate was invalidated by a success it
    // assumed would fail.
    assert!(emitter.discards() > 0);
    assert!(outcome.discards > 0);
}

// ---------------------------------------------------------------------------
// Boundaries
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn an_empty_input_is_already_minimal() {
    let dir = make_tempdir();
    let predicate = script(&dir, "exit 0");
    let target = input(&dir, b"");

    let outcome = Minimizer::new(config(&predicate))
        .expect("engine")
        .minimize(&target)
        .await
        .expect("minimize");

    assert_eq!(outcome.initial_size, 0);
    assert!(outcome.data.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn verification_rejects_an_uninteresting_input() {
    let dir = make_tempdir();
    let predicate = script(&dir, "exit 1");
    let target = input(&dir, b"data");

    let error = Minimizer::new(config(&predicate))
        .expect("engine")
        .minimize(&target)
        .await
        .expect_err("verification must fail");

    assert!(matches!(error, EngineError::VerificationFailed { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn noverify_runs_even_when_nothing_is_interesting() {
    let dir = make_tempdir();
    let predicate = script(&dir, "exit 1");
    let target = input(&dir, b"data");

    let mut config = config(&predicate);
    config.verify = false;

    let outcome = Minimizer::new(config)
        .expect("engine")
        .minimize(&target)
        .await
        .expect("minimize");

    assert_eq!(outcome.data, b"data");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_zero_queue_bound_is_rejected_up_front() {
    let dir = make_tempdir();
    let predicate = script(&dir, "exit 0");

    let mut config = config(&predicate);
    config.max_unprocessed = 0;

    assert!(matches!(
        Minimizer::new(config),
        Err(EngineError::InvalidConfig { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn output_never_grows() {
    let dir = make_tempdir();
    // Interesting only while it still contains a digit.
    let predicate = script(&dir, "exec grep -q '[0-9]'");
    let target = input(&dir, b"abc1def2ghi3");

    let outcome = Minimizer::new(config(&predicate))
        .expect("engine")
        .minimize(&target)
        .await
        .expect("minimize");

    assert!(outcome.final_size <= outcome.initial_size);
    assert!(outcome.data.iter().any(u8::is_ascii_digit));
    assert_eq!(outcome.final_size, 1);
}
