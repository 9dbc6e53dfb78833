//! # Build Loop Tests
//!
//! Drives `sitewatch::rebuild::BuildLoop` with in-memory builders and reloaders
//! to check coalescing, failure isolation, and the failure policy.

use async_trait::async_trait;
use sitewatch::builder::{BuildError, Builder};
use sitewatch::event::{ChangeEvent, ChangeKind};
use sitewatch::lock::LockState;
use sitewatch::rebuild::{BuildLoop, FailurePolicy, Trigger};
use sitewatch::reload::{ReloadError, Reloader};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::time::{timeout, Duration};

const SHORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder whose runs block until the test hands out a permit.
struct GatedBuilder {
    runs: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    started: Notify,
    gate: Semaphore,
    /// Runs (1-based) that fail instead of succeeding.
    failing_runs: Mutex<Vec<usize>>,
    /// Runs (1-based) that panic instead of returning.
    panicking_runs: Mutex<Vec<usize>>,
}

impl Default for GatedBuilder {
    fn default() -> Self {
        Self {
            runs: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            started: Notify::new(),
            gate: Semaphore::new(0),
            failing_runs: Mutex::new(Vec::new()),
            panicking_runs: Mutex::new(Vec::new()),
        }
    }
}

impl GatedBuilder {
    fn failing_on(runs: &[usize]) -> Self {
        let builder = Self::default();
        *builder.failing_runs.lock().unwrap() = runs.to_vec();
        builder
    }

    fn panicking_on(runs: &[usize]) -> Self {
        let builder = Self::default();
        *builder.panicking_runs.lock().unwrap() = runs.to_vec();
        builder
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Waits until a build has started and is parked on the gate.
    async fn wait_started(&self) {
        timeout(SHORT_TIMEOUT, self.started.notified())
            .await
            .expect("build did not start in time");
    }

    fn open(&self, permits: usize) {
        self.gate.add_permits(permits);
    }
}

#[async_trait]
impl Builder for GatedBuilder {
    async fn build(&self) -> Result<(), BuildError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.started.notify_one();

        let permit = self.gate.acquire().await.expect("gate closed");
        permit.forget();

        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.panicking_runs.lock().unwrap().contains(&run) {
            panic!("build #{} crashed", run);
        }
        if self.failing_runs.lock().unwrap().contains(&run) {
            return Err(anyhow::anyhow!("build #{} failed on purpose", run).into());
        }
        Ok(())
    }
}

/// Builder that finishes immediately after a short sleep.
#[derive(Default)]
struct QuickBuilder {
    runs: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

#[async_trait]
impl Builder for QuickBuilder {
    async fn build(&self) -> Result<(), BuildError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Builder that panics mid-build.
struct PanickingBuilder;

#[async_trait]
impl Builder for PanickingBuilder {
    async fn build(&self) -> Result<(), BuildError> {
        panic!("generator crashed");
    }
}

/// Reloader that counts notifications and optionally fails them.
#[derive(Default)]
struct CountingReloader {
    reloads: AtomicUsize,
    fail: bool,
}

impl Reloader for CountingReloader {
    fn reload(&self, _path: &str) -> Result<usize, ReloadError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(anyhow::anyhow!("transport down").into())
        } else {
            Ok(1)
        }
    }
}

fn build_loop(builder: Arc<dyn Builder>, reloader: Arc<CountingReloader>) -> Arc<BuildLoop> {
    Arc::new(BuildLoop::new(builder, reloader))
}

fn change(path: &str) -> ChangeEvent {
    ChangeEvent {
        path: path.to_string(),
        op: ChangeKind::Write,
    }
}

/// Test: a single trigger with no concurrent arrivals builds once and frees the lock.
#[tokio::test]
async fn test_single_trigger_builds_once() {
    let builder = Arc::new(GatedBuilder::default());
    let reloader = Arc::new(CountingReloader::default());
    let bl = build_loop(builder.clone(), reloader.clone());

    builder.open(1);
    let outcome = bl.trigger().await.expect("continue policy never errors");

    assert_eq!(outcome, Trigger::Built { runs: 1 });
    assert_eq!(builder.runs(), 1);
    assert_eq!(reloader.reloads.load(Ordering::SeqCst), 1);
    assert_eq!(bl.lock().state(), LockState::Free);
}

/// Test: two triggers during a build produce exactly one follow-up build.
#[tokio::test]
async fn test_triggers_during_build_coalesce_into_one_rerun() {
    let builder = Arc::new(GatedBuilder::default());
    let reloader = Arc::new(CountingReloader::default());
    let bl = build_loop(builder.clone(), reloader.clone());

    let first = {
        let bl = Arc::clone(&bl);
        tokio::spawn(async move { bl.trigger().await })
    };
    builder.wait_started().await;

    assert_eq!(bl.trigger().await.unwrap(), Trigger::Queued);
    assert_eq!(bl.trigger().await.unwrap(), Trigger::Queued);
    assert_eq!(bl.lock().state(), LockState::HeldPending);

    builder.open(1);
    builder.wait_started().await;
    assert_eq!(bl.lock().state(), LockState::Held);
    builder.open(1);

    let outcome = timeout(SHORT_TIMEOUT, first)
        .await
        .expect("first trigger did not finish")
        .expect("first trigger panicked")
        .unwrap();
    assert_eq!(outcome, Trigger::Built { runs: 2 });
    assert_eq!(builder.runs(), 2);
    assert_eq!(reloader.reloads.load(Ordering::SeqCst), 2);
    assert_eq!(bl.lock().state(), LockState::Free);
}

/// Test: a burst of 100 triggers during one build yields one follow-up, not 100.
#[tokio::test]
async fn test_burst_of_triggers_yields_single_follow_up() {
    let builder = Arc::new(GatedBuilder::default());
    let reloader = Arc::new(CountingReloader::default());
    let bl = build_loop(builder.clone(), reloader);

    let first = {
        let bl = Arc::clone(&bl);
        tokio::spawn(async move { bl.trigger().await })
    };
    builder.wait_started().await;

    let mut queued = 0;
    for _ in 0..100 {
        if bl.trigger().await.unwrap() == Trigger::Queued {
            queued += 1;
        }
    }
    assert_eq!(queued, 100);

    builder.open(2);
    let outcome = timeout(SHORT_TIMEOUT, first).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, Trigger::Built { runs: 2 });
    assert_eq!(builder.runs(), 2);
    assert_eq!(builder.max_active.load(Ordering::SeqCst), 1);
}

/// Test: a failed build is swallowed, skips the reload, and frees the lock.
#[tokio::test]
async fn test_failed_build_is_isolated() {
    let builder = Arc::new(GatedBuilder::failing_on(&[1]));
    let reloader = Arc::new(CountingReloader::default());
    let bl = build_loop(builder.clone(), reloader.clone());

    builder.open(1);
    let outcome = bl.trigger().await.expect("continue policy swallows build errors");
    assert_eq!(outcome, Trigger::Built { runs: 1 });
    assert_eq!(bl.builds_failed(), 1);
    assert_eq!(reloader.reloads.load(Ordering::SeqCst), 0);
    assert_eq!(bl.lock().state(), LockState::Free);

    // A following change builds normally.
    builder.open(1);
    let outcome = bl.trigger().await.unwrap();
    assert_eq!(outcome, Trigger::Built { runs: 1 });
    assert_eq!(bl.builds_started(), 2);
    assert_eq!(bl.builds_failed(), 1);
    assert_eq!(reloader.reloads.load(Ordering::SeqCst), 1);
}

/// Test: a failure in the first run still lets the owed rerun happen.
#[tokio::test]
async fn test_failed_build_still_runs_queued_rebuild() {
    let builder = Arc::new(GatedBuilder::failing_on(&[1]));
    let reloader = Arc::new(CountingReloader::default());
    let bl = build_loop(builder.clone(), reloader.clone());

    let first = {
        let bl = Arc::clone(&bl);
        tokio::spawn(async move { bl.trigger().await })
    };
    builder.wait_started().await;
    assert_eq!(bl.trigger().await.unwrap(), Trigger::Queued);

    builder.open(2);
    let outcome = timeout(SHORT_TIMEOUT, first).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, Trigger::Built { runs: 2 });
    assert_eq!(reloader.reloads.load(Ordering::SeqCst), 1);
}

/// Test: under the exit policy the error is returned and the lock is freed.
#[tokio::test]
async fn test_exit_policy_returns_error_and_frees_lock() {
    let builder = Arc::new(GatedBuilder::failing_on(&[1]));
    let reloader = Arc::new(CountingReloader::default());
    let bl = Arc::new(
        BuildLoop::new(builder.clone(), reloader.clone()).with_failure_policy(FailurePolicy::Exit),
    );

    let first = {
        let bl = Arc::clone(&bl);
        tokio::spawn(async move { bl.trigger().await })
    };
    builder.wait_started().await;
    assert_eq!(bl.trigger().await.unwrap(), Trigger::Queued);

    builder.open(1);
    let result = timeout(SHORT_TIMEOUT, first).await.unwrap().unwrap();
    let err = result.expect_err("exit policy should surface the build error");
    assert!(err.to_string().contains("failed on purpose"));
    assert_eq!(builder.runs(), 1, "queued rebuild is discarded on exit");
    assert_eq!(bl.lock().state(), LockState::Free);
}

/// Test: a failing reload notification does not fail the build.
#[tokio::test]
async fn test_reload_failure_is_not_fatal() {
    let builder = Arc::new(GatedBuilder::default());
    let reloader = Arc::new(CountingReloader {
        fail: true,
        ..Default::default()
    });
    let bl = Arc::new(
        BuildLoop::new(builder.clone(), reloader.clone()).with_failure_policy(FailurePolicy::Exit),
    );

    builder.open(1);
    let outcome = bl.trigger().await.expect("reload failure must not fail the build");
    assert_eq!(outcome, Trigger::Built { runs: 1 });
    assert_eq!(reloader.reloads.load(Ordering::SeqCst), 1);
    assert_eq!(bl.builds_failed(), 0);
    assert_eq!(bl.lock().state(), LockState::Free);
}

/// Test: a panicking build counts as a failure and frees the lock.
#[tokio::test]
async fn test_panicking_build_frees_lock() {
    let reloader = Arc::new(CountingReloader::default());
    let bl = build_loop(Arc::new(PanickingBuilder), reloader.clone());

    let outcome = bl.trigger().await.expect("continue policy swallows panics");
    assert_eq!(outcome, Trigger::Built { runs: 1 });
    assert_eq!(bl.builds_failed(), 1);
    assert_eq!(reloader.reloads.load(Ordering::SeqCst), 0);
    assert_eq!(bl.lock().state(), LockState::Free);
}

/// Test: a change queued behind a panicking build is still built.
#[tokio::test]
async fn test_panicking_build_still_runs_queued_rebuild() {
    let builder = Arc::new(GatedBuilder::panicking_on(&[1]));
    let reloader = Arc::new(CountingReloader::default());
    let bl = build_loop(builder.clone(), reloader.clone());

    let first = {
        let bl = Arc::clone(&bl);
        tokio::spawn(async move { bl.trigger().await })
    };
    builder.wait_started().await;
    assert_eq!(bl.trigger().await.unwrap(), Trigger::Queued);

    builder.open(2);
    let outcome = timeout(SHORT_TIMEOUT, first)
        .await
        .expect("first trigger did not finish")
        .expect("panic escaped the build loop")
        .unwrap();
    assert_eq!(outcome, Trigger::Built { runs: 2 });
    assert_eq!(builder.runs(), 2);
    assert_eq!(bl.builds_failed(), 1);
    assert_eq!(reloader.reloads.load(Ordering::SeqCst), 1);
    assert_eq!(bl.lock().state(), LockState::Free);
}

/// Test: under the exit policy a panic is reported as a build error.
#[tokio::test]
async fn test_panicking_build_with_exit_policy_returns_error() {
    let reloader = Arc::new(CountingReloader::default());
    let bl = BuildLoop::new(Arc::new(PanickingBuilder), reloader)
        .with_failure_policy(FailurePolicy::Exit);

    let err = bl.trigger().await.expect_err("panic should surface as an error");
    assert!(matches!(err, BuildError::Panicked(ref msg) if msg.contains("generator crashed")));
    assert_eq!(bl.lock().state(), LockState::Free);
}

/// Test: cancelling a trigger mid-build frees the lock.
#[tokio::test]
async fn test_cancelled_trigger_frees_lock() {
    let builder = Arc::new(GatedBuilder::default());
    let reloader = Arc::new(CountingReloader::default());
    let bl = build_loop(builder.clone(), reloader);

    let handle = {
        let bl = Arc::clone(&bl);
        tokio::spawn(async move { bl.trigger().await })
    };
    builder.wait_started().await;
    handle.abort();
    let joined = handle.await;
    assert!(joined.unwrap_err().is_cancelled());
    assert_eq!(bl.lock().state(), LockState::Free);

    builder.open(1);
    assert_eq!(bl.trigger().await.unwrap(), Trigger::Built { runs: 1 });
}

/// Test: many concurrent triggers on a multi-threaded runtime never overlap builds.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_never_overlap() {
    let builder = Arc::new(QuickBuilder::default());
    let reloader = Arc::new(CountingReloader::default());
    let bl = build_loop(builder.clone(), reloader);

    let mut handles = Vec::new();
    for _ in 0..200 {
        let bl = Arc::clone(&bl);
        handles.push(tokio::spawn(async move { bl.trigger().await }));
    }
    let mut total_runs = 0;
    for handle in handles {
        if let Trigger::Built { runs } = handle.await.unwrap().unwrap() {
            total_runs += runs as usize;
        }
    }

    assert_eq!(builder.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(builder.runs.load(Ordering::SeqCst), total_runs);
    assert!(total_runs >= 1 && total_runs <= 200);
    assert_eq!(bl.lock().state(), LockState::Free);
}

/// Test: `run` builds once at startup and once more per burst of changes.
#[tokio::test]
async fn test_run_builds_at_startup_and_on_changes() {
    let builder = Arc::new(GatedBuilder::default());
    let reloader = Arc::new(CountingReloader::default());
    let bl = build_loop(builder.clone(), reloader);

    let (change_tx, change_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run_handle = tokio::spawn(Arc::clone(&bl).run(change_rx, shutdown_rx));

    // Initial build happens without any change event.
    builder.wait_started().await;
    assert_eq!(builder.runs(), 1);

    // Changes while the initial build runs coalesce into one rerun.
    for i in 0..5 {
        change_tx.send(change(&format!("page-{}.adoc", i))).await.unwrap();
    }
    timeout(SHORT_TIMEOUT, async {
        while bl.changes_queued() < 5 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("changes were not queued");
    assert_eq!(bl.lock().state(), LockState::HeldPending);

    builder.open(1);
    builder.wait_started().await;
    builder.open(1);

    timeout(SHORT_TIMEOUT, async {
        while bl.lock().state() != LockState::Free {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("build loop did not go idle");
    assert_eq!(builder.runs(), 2);

    shutdown_tx.send(true).unwrap();
    let result = timeout(SHORT_TIMEOUT, run_handle).await.unwrap().unwrap();
    assert!(result.is_ok());
}

/// Test: `run` stops with an error under the exit policy.
#[tokio::test]
async fn test_run_stops_on_failure_with_exit_policy() {
    let builder = Arc::new(GatedBuilder::failing_on(&[1]));
    let reloader = Arc::new(CountingReloader::default());
    let bl = Arc::new(
        BuildLoop::new(builder.clone(), reloader).with_failure_policy(FailurePolicy::Exit),
    );

    let (_change_tx, change_rx) = mpsc::channel::<ChangeEvent>(16);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    builder.open(1);

    let result = timeout(SHORT_TIMEOUT, Arc::clone(&bl).run(change_rx, shutdown_rx))
        .await
        .expect("build loop did not stop");
    let err = result.expect_err("exit policy should stop the loop");
    assert!(format!("{:#}", err).contains("failed on purpose"));
    assert_eq!(bl.lock().state(), LockState::Free);
}

/// Test: `run` returns once the change channel closes and nothing is in flight.
#[tokio::test]
async fn test_run_exits_when_changes_end() {
    let builder = Arc::new(GatedBuilder::default());
    let reloader = Arc::new(CountingReloader::default());
    let bl = build_loop(builder.clone(), reloader);

    let (change_tx, change_rx) = mpsc::channel::<ChangeEvent>(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    drop(change_tx);
    drop(shutdown_tx);
    builder.open(1);

    let result = timeout(SHORT_TIMEOUT, Arc::clone(&bl).run(change_rx, shutdown_rx))
        .await
        .expect("build loop did not exit");
    assert!(result.is_ok());
    assert_eq!(builder.runs(), 1);
}

/// Test: `run` returns once the change channel closes, even while the
/// shutdown sender is still alive.
#[tokio::test]
async fn test_run_exits_when_changes_end_without_shutdown() {
    let builder = Arc::new(GatedBuilder::default());
    let reloader = Arc::new(CountingReloader::default());
    let bl = build_loop(builder.clone(), reloader);

    let (change_tx, change_rx) = mpsc::channel::<ChangeEvent>(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run_handle = tokio::spawn(Arc::clone(&bl).run(change_rx, shutdown_rx));

    builder.wait_started().await;
    change_tx.send(change("index.adoc")).await.unwrap();
    drop(change_tx);
    builder.open(2);

    let result = timeout(SHORT_TIMEOUT, run_handle)
        .await
        .expect("build loop did not exit after the change channel closed")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(builder.runs(), 2);
    assert_eq!(bl.lock().state(), LockState::Free);
    assert!(!*shutdown_tx.borrow());
}
