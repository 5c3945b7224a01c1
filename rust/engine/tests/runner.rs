//! Subprocess runner: classification, stdin delivery, timeouts.

mod common;

use std::os::unix::fs::FileExt;
use std::time::Duration;

use halfempty_engine::runner::{Disposition, PredicateRun};

use common::{config, make_tempdir, script};

fn blob_with(content: &[u8]) -> (std::fs::File, u64) {
    let file = tempfile::tempfile().expect("tempfile");
    file.write_all_at(content, 0).expect("write");
    (file, content.len() as u64)
}

async fn run_once(
    body: &str,
    content: &[u8],
    timeout: Option<Duration>,
) -> (Disposition, Duration) {
    let dir = make_tempdir();
    let config = config(&script(&dir, body));
    let (blob, len) = blob_with(content);
    let mut run = PredicateRun::spawn(&config, blob, len)
        .await
        .expect("spawn");
    let outcome = run.wait(timeout).await.expect("wait");
    run.reap();
    outcome
}

#[tokio::test(flavor = "multi_thread")]
async fn a_clean_exit_zero_is_interesting() {
    let (disposition, _) = run_once("exec cat >/dev/null", b"data", None).await;
    assert_eq!(disposition, Disposition::Exited(0));
    assert!(disposition.is_interesting());
}

#[tokio::test(flavor = "multi_thread")]
async fn nonzero_exits_are_not_interesting() {
    let (disposition, _) = run_once("exit 3", b"", None).await;
    assert_eq!(disposition, Disposition::Exited(3));
    assert!(!disposition.is_interesting());
}

#[tokio::test(flavor = "multi_thread")]
async fn a_signalled_child_is_not_interesting() {
    let (disposition, _) = run_once("kill -9 $$", b"", None).await;
    assert_eq!(disposition, Disposition::Signaled(9));
    assert!(!disposition.is_interesting());
}

#[tokio::test(flavor = "multi_thread")]
async fn the_candidate_arrives_on_stdin() {
    let (disposition, _) =
        run_once("[ \"$(cat)\" = \"hello\" ]", b"hello", None).await;
    assert_eq!(disposition, Disposition::Exited(0));

    let (disposition, _) =
        run_once("[ \"$(cat)\" = \"hello\" ]", b"other", None).await;
    assert!(!disposition.is_interesting());
}

#[tokio::test(flavor = "multi_thread")]
async fn a_predicate_that_ignores_stdin_still_runs() {
    // The feeder hits a broken pipe and gives up without disturbing the
    // classification.
    let (disposition, _) = run_once("exit 0", &[0x41; 256 * 1024], None).await;
    assert_eq!(disposition, Disposition::Exited(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn a_zero_pre_exec_sleep_does_not_sleep() {
    let dir = make_tempdir();
    let mut config = config(&script(&dir, "exit 0"));
    config.pre_exec_sleep = Some(Duration::ZERO);
    let (blob, len) = blob_with(b"");

    let started = std::time::Instant::now();
    let mut run = PredicateRun::spawn(&config, blob, len)
        .await
        .expect("spawn");
    let (disposition, _) = run.wait(None).await.expect("wait");
    run.reap();

    assert_eq!(disposition, Disposition::Exited(0));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn the_watchdog_alarms_the_whole_group() {
    let started = std::time::Instant::now();
    let (disposition, elapsed) =
        run_once("sleep 30", b"", Some(Duration::from_secs(1))).await;
    assert_eq!(disposition, Disposition::Signaled(libc::SIGALRM));
    assert!(elapsed >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(20));
}

#[tokio::test(flavor = "multi_thread")]
async fn a_trapped_alarm_lets_the_script_choose_its_exit() {
    let (disposition, _) = run_once(
        "trap 'exit 7' ALRM\nsleep 30\nexit 1",
        b"",
        Some(Duration::from_secs(1)),
    )
    .await;
    assert_eq!(disposition, Disposition::Exited(7));
}
