//! Fleet-wide check scheduling.
//!
//! One run at a time, process-wide: a scheduled tick and a manual trigger go
//! through the same entry point and the same guard, so two runs can never
//! overlap and double-hit the dedup ledger or the proxy pool. Users are
//! checked strictly sequentially; a shutdown request aborts between users,
//! never mid-user. The guard is released on every exit path.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::config::SchedulerConfig;
use crate::store::{StoreError, UserStore};

use super::{CheckOrchestrator, CycleReport};

/// A fleet-wide check is already in progress.
#[derive(Debug, Clone, thiserror::Error)]
#[error("a check run is already in progress")]
pub struct AlreadyRunning;

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Scheduled,
    Manual,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerReason::Scheduled => write!(f, "scheduled"),
            TriggerReason::Manual => write!(f, "manual"),
        }
    }
}

/// Outcome of one fleet-wide run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub reason: TriggerReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub users_checked: usize,
    pub users_failed: usize,
    pub deliverable: usize,
    /// Users whose cycle ended in a needs-re-login condition
    pub needs_relogin: Vec<String>,
    /// The run was cut short by a shutdown request
    pub aborted: bool,
}

impl RunSummary {
    fn new(reason: TriggerReason, started_at: DateTime<Utc>) -> Self {
        Self {
            reason,
            started_at,
            finished_at: None,
            users_checked: 0,
            users_failed: 0,
            deliverable: 0,
            needs_relogin: Vec::new(),
            aborted: false,
        }
    }
}

/// Clears the run-in-progress flag on every exit path, including unwinds.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            .then_some(Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Runs the orchestrator over every authorized user under a global guard.
pub struct Scheduler {
    store: Arc<UserStore>,
    orchestrator: CheckOrchestrator,
    authorized: Vec<String>,
    interval: Duration,
    first_delay: Duration,
    running: AtomicBool,
    last_completed: Mutex<Option<DateTime<Utc>>>,
    next_run: Mutex<Option<DateTime<Utc>>>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        store: Arc<UserStore>,
        orchestrator: CheckOrchestrator,
        config: &SchedulerConfig,
        authorized: Vec<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            authorized,
            interval: Duration::from_secs(config.interval_minutes * 60),
            first_delay: Duration::from_secs(config.first_delay_seconds),
            running: AtomicBool::new(false),
            last_completed: Mutex::new(None),
            next_run: Mutex::new(None),
            shutdown,
        }
    }

    /// Run a fleet-wide check now. Fails fast when one is already running.
    pub async fn trigger(&self, reason: TriggerReason) -> Result<RunSummary, AlreadyRunning> {
        let _guard = RunGuard::acquire(&self.running).ok_or(AlreadyRunning)?;

        let started_at = Utc::now();
        tracing::info!(%reason, users = self.authorized.len(), "Fleet check starting");
        let mut summary = RunSummary::new(reason, started_at);

        for user_id in &self.authorized {
            if *self.shutdown.borrow() {
                tracing::info!("Shutdown requested, aborting run between users");
                summary.aborted = true;
                break;
            }
            match self.check_user(user_id).await {
                Ok(report) => {
                    summary.users_checked += 1;
                    summary.deliverable += report.deliverable;
                    if report.needs_relogin {
                        summary.needs_relogin.push(user_id.clone());
                    }
                }
                Err(error) => {
                    // One user's fault never aborts the fleet
                    summary.users_failed += 1;
                    tracing::error!(user = %user_id, %error, "User check failed, continuing");
                }
            }
        }

        let finished_at = Utc::now();
        summary.finished_at = Some(finished_at);
        *lock(&self.last_completed) = Some(finished_at);
        tracing::info!(
            checked = summary.users_checked,
            failed = summary.users_failed,
            deliverable = summary.deliverable,
            aborted = summary.aborted,
            "Fleet check finished"
        );
        Ok(summary)
    }

    /// Load, run and write back one user. The cycle works on its own copy;
    /// the write-back merges only cycle-owned fields under the user's store
    /// lock, so configuration edits made meanwhile survive.
    async fn check_user(&self, user_id: &str) -> Result<CycleReport, StoreError> {
        let mut ctx = self.store.load(user_id).await?;
        let pending_before = ctx.pending_notifications.len();

        let report = self.orchestrator.run_user(&mut ctx).await;

        let new_pending = ctx.pending_notifications.split_off(pending_before);
        let seen = ctx.seen;
        let auth = ctx.auth;
        let last_check = ctx.last_check;
        self.store
            .update(user_id, move |doc| {
                doc.seen = seen;
                doc.auth = auth;
                doc.last_check = last_check;
                doc.pending_notifications.extend(new_pending);
            })
            .await?;
        Ok(report)
    }

    /// Periodic loop: first check after a startup delay, then on the fixed
    /// interval, until shutdown is signalled.
    pub async fn run_periodic(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut next = tokio::time::Instant::now() + self.first_delay;
        self.note_next_run(self.first_delay);
        tracing::info!(
            first_in_secs = self.first_delay.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next) => {
                    if let Err(AlreadyRunning) = self.trigger(TriggerReason::Scheduled).await {
                        tracing::debug!("Skipping scheduled check, a run is already in progress");
                    }
                    next = tokio::time::Instant::now() + self.interval;
                    self.note_next_run(self.interval);
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        tracing::info!("Scheduler stopping");
                        break;
                    }
                }
            }
        }
    }

    fn note_next_run(&self, delay: Duration) {
        *lock(&self.next_run) = Some(Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64));
    }

    /// Estimated time of the next scheduled run, for status output.
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        *lock(&self.next_run)
    }

    pub fn last_completed(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_completed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
