//! Change-triggered build loop.
//!
//! Every change notification attempts to acquire the [`CoalescingLock`]. The
//! winner runs the build followed by a browser reload and keeps rerunning
//! while changes keep arriving; everyone else returns straight away.

use crate::builder::{BuildError, Builder};
use crate::event::ChangeEvent;
use crate::lock::CoalescingLock;
use crate::reload::{ReloadError, Reloader};
use anyhow::Result;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::Receiver;
use tokio::sync::watch::Receiver as WatchReceiver;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// What the build loop does when a build fails.
#[derive(Serialize, Deserialize, clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log the failure and keep watching.
    #[default]
    Continue,
    /// Stop the build loop and report the error.
    Exit,
}

/// Result of a single trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// This trigger held the lock and ran the build `runs` times.
    Built { runs: u32 },
    /// A build was already in progress; it will run once more.
    Queued,
}

/// Owns the lock and the protected sequence (rebuild, then reload).
pub struct BuildLoop {
    lock: CoalescingLock,
    builder: Arc<dyn Builder>,
    reloader: Arc<dyn Reloader>,
    policy: FailurePolicy,
    builds_started: AtomicU64,
    builds_failed: AtomicU64,
    changes_queued: AtomicU64,
}

impl BuildLoop {
    pub fn new(builder: Arc<dyn Builder>, reloader: Arc<dyn Reloader>) -> Self {
        Self {
            lock: CoalescingLock::new(),
            builder,
            reloader,
            policy: FailurePolicy::default(),
            builds_started: AtomicU64::new(0),
            builds_failed: AtomicU64::new(0),
            changes_queued: AtomicU64::new(0),
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn lock(&self) -> &CoalescingLock {
        &self.lock
    }

    /// Number of builds started since creation.
    pub fn builds_started(&self) -> u64 {
        self.builds_started.load(Ordering::SeqCst)
    }

    /// Number of builds that returned an error.
    pub fn builds_failed(&self) -> u64 {
        self.builds_failed.load(Ordering::SeqCst)
    }

    /// Number of triggers that found a build running and were folded into it.
    pub fn changes_queued(&self) -> u64 {
        self.changes_queued.load(Ordering::SeqCst)
    }

    /// Handles one change notification.
    ///
    /// Returns [`Trigger::Queued`] immediately if a build is already running.
    /// Otherwise builds until no change arrived during the last run.
    ///
    /// # Errors
    /// Only under [`FailurePolicy::Exit`]: the first build error is returned
    /// after the lock has been freed.
    pub async fn trigger(&self) -> Result<Trigger, BuildError> {
        let Some(mut turn) = self.lock.try_enter() else {
            self.changes_queued.fetch_add(1, Ordering::SeqCst);
            debug!("Build already running, change queued for one more run");
            return Ok(Trigger::Queued);
        };

        let mut runs = 0;
        loop {
            runs += 1;
            let result = self.run_once().await;
            if let Err(e) = result {
                if self.policy == FailurePolicy::Exit {
                    if turn.discard() {
                        debug!("Discarding queued rebuild, build loop is stopping");
                    }
                    return Err(e);
                }
            }
            match turn.release() {
                Some(next) => {
                    debug!("Changes arrived during the build, rebuilding");
                    turn = next;
                }
                None => break,
            }
        }
        Ok(Trigger::Built { runs })
    }

    /// The protected sequence: build, then reload on success.
    ///
    /// A panicking builder counts as a failed build, so the turn is still
    /// released and any owed rerun still happens.
    async fn run_once(&self) -> Result<(), BuildError> {
        let build_no = self.builds_started.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Build #{} started", build_no);
        let started = Instant::now();

        let result = AssertUnwindSafe(self.builder.build())
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(BuildError::Panicked(panic_message(payload))));
        if let Err(e) = result {
            self.builds_failed.fetch_add(1, Ordering::SeqCst);
            error!("Build #{} failed after {:.2?}: {}", build_no, started.elapsed(), e);
            return Err(e);
        }
        info!("Build #{} finished in {:.2?}", build_no, started.elapsed());

        match self.reloader.reload("*") {
            Ok(clients) => debug!("Reload sent to {} client(s)", clients),
            Err(ReloadError::NoClients) => debug!("Reload skipped: no browser connected"),
            Err(e) => warn!("Failed to send reload notification: {}", e),
        }
        Ok(())
    }

    /// Drives the loop from a change channel until shutdown.
    ///
    /// One build is triggered unconditionally at startup. Each received event
    /// becomes its own trigger task, so events never wait behind a build.
    ///
    /// # Errors
    /// Returns the build error that stopped the loop under [`FailurePolicy::Exit`].
    pub async fn run(
        self: Arc<Self>,
        mut event_rx: Receiver<ChangeEvent>,
        shutdown_signal: WatchReceiver<bool>,
    ) -> Result<()> {
        let mut triggers = JoinSet::new();
        let initial = Arc::clone(&self);
        triggers.spawn(async move { initial.trigger().await });

        let mut shutdown = shutdown_signal.clone();
        let mut events_open = true;

        let outcome = loop {
            if !events_open && triggers.is_empty() {
                info!("No more changes and no builds in flight. Build loop exiting.");
                break Ok(());
            }
            tokio::select! {
                maybe_event = event_rx.recv(), if events_open => {
                    match maybe_event {
                        Some(event) => {
                            debug!("Change detected: {} {}", event.op, event.path);
                            let this = Arc::clone(&self);
                            triggers.spawn(async move { this.trigger().await });
                        }
                        None => {
                            info!("Change channel closed, finishing queued builds.");
                            events_open = false;
                        }
                    }
                }
                Some(joined) = triggers.join_next() => {
                    match joined {
                        Ok(Ok(Trigger::Built { runs })) => debug!("Trigger finished after {} build(s)", runs),
                        Ok(Ok(Trigger::Queued)) => {}
                        Ok(Err(e)) => break Err(anyhow::Error::new(e).context("build failed")),
                        Err(e) => error!("Build task panicked or was cancelled: {}", e),
                    }
                }
                Ok(()) = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Build loop shutting down due to signal.");
                        break Ok(());
                    }
                }
                else => {
                    info!("Build loop has nothing left to wait on. Exiting.");
                    break Ok(());
                }
            }
        };

        triggers.shutdown().await;
        outcome
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
