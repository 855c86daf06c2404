//! Run coordination
//!
//! A run moves through `Idle -> Locked -> Running -> {Committed, Failed,
//! Skipped}`. The lock guard lives for the whole of [`RunCoordinator::run_at`],
//! so every exit path releases it. The cooldown marker is read and written
//! without compare-and-set; only the lock serializes that window.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::cache::{MarkerCache, FIRST_RUN_KEY, LAST_SYNC_KEY};
use crate::error::{Disposition, Result, SyncError};
use crate::lock::RunLock;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    /// Fired by the scheduler at its regular cadence
    Scheduled,
    /// One-time startup trigger; bypasses the cooldown until the first
    /// forced run has been dispatched
    FirstRun,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Another worker holds the run lock
    LockHeld,
    /// The last committed run is more recent than the cooldown
    Cooldown {
        last_run: DateTime<Utc>,
        remaining: Duration,
    },
}

#[derive(Debug)]
pub enum RunOutcome<T> {
    Committed(T),
    Skipped(SkipReason),
    /// Terminal failure after the retry budget, or an abort
    Failed(SyncError),
}

/// One failed attempt and what the coordinator did next
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    /// 1-based
    pub attempt: u32,
    pub error: String,
    /// Backoff before the next attempt; `None` when none followed
    pub retry_in: Option<Duration>,
}

#[derive(Debug)]
pub struct RunReport<T> {
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub outcome: RunOutcome<T>,
    pub failures: Vec<AttemptFailure>,
}

impl<T> RunReport<T> {
    pub fn is_committed(&self) -> bool {
        matches!(self.outcome, RunOutcome::Committed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, RunOutcome::Skipped(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, RunOutcome::Failed(_))
    }
}

/// Gates pipeline runs behind the run lock, the cooldown marker and the
/// retry policy.
pub struct RunCoordinator<L, C> {
    lock: L,
    cache: C,
    cooldown: Duration,
    retry: RetryPolicy,
}

impl<L: RunLock, C: MarkerCache> RunCoordinator<L, C> {
    pub fn new(lock: L, cache: C, cooldown: Duration, retry: RetryPolicy) -> Self {
        Self {
            lock,
            cache,
            cooldown,
            retry,
        }
    }

    pub fn lock(&self) -> &L {
        &self.lock
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Run `job` now. See [`run_at`](Self::run_at).
    pub async fn run<T, F, Fut>(&self, trigger: RunTrigger, job: F) -> RunReport<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_at(trigger, Utc::now(), job).await
    }

    /// Run `job` as if the clock read `now`.
    ///
    /// `job` receives the 1-based attempt number and is called again after
    /// each retryable failure, sleeping for the policy's backoff in between.
    pub async fn run_at<T, F, Fut>(&self, trigger: RunTrigger, now: DateTime<Utc>, mut job: F) -> RunReport<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let report = |outcome, failures| RunReport {
            trigger,
            started_at: now,
            outcome,
            failures,
        };

        let _guard = match self.lock.try_acquire() {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!(?trigger, "run lock held elsewhere, skipping");
                return report(RunOutcome::Skipped(SkipReason::LockHeld), Vec::new());
            }
            Err(e) => {
                error!(error = %e, "cannot acquire run lock");
                return report(RunOutcome::Failed(e), Vec::new());
            }
        };

        match self.check_cooldown(trigger, now) {
            Ok(None) => {}
            Ok(Some(reason)) => {
                info!(?trigger, ?reason, "within cooldown, skipping");
                return report(RunOutcome::Skipped(reason), Vec::new());
            }
            Err(e) => {
                error!(error = %e, "cannot read cooldown marker");
                return report(RunOutcome::Failed(e), Vec::new());
            }
        }

        info!(?trigger, %now, "sync run started");
        let mut failures = Vec::new();
        let mut attempt = 1;
        loop {
            match job(attempt).await {
                Ok(value) => {
                    if let Err(e) = self.cache.set(LAST_SYNC_KEY, now) {
                        warn!(error = %e, "run committed but cooldown marker not updated");
                    }
                    info!(attempt, "sync run committed");
                    return report(RunOutcome::Committed(value), failures);
                }
                Err(e) => {
                    let retry = e.disposition() == Disposition::Retry && self.retry.allows_retry(attempt);
                    let retry_in = retry.then(|| self.retry.delay_for(attempt));
                    failures.push(AttemptFailure {
                        attempt,
                        error: e.to_string(),
                        retry_in,
                    });

                    match retry_in {
                        Some(delay) => {
                            warn!(attempt, delay_secs = delay.as_secs(), error = %e, "sync attempt failed, retrying");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => {
                            error!(attempt, error = %e, "sync run failed");
                            return report(RunOutcome::Failed(e), failures);
                        }
                    }
                }
            }
        }
    }

    /// `Some(reason)` when the run must be skipped.
    fn check_cooldown(&self, trigger: RunTrigger, now: DateTime<Utc>) -> Result<Option<SkipReason>> {
        if trigger == RunTrigger::FirstRun && self.cache.get(FIRST_RUN_KEY)?.is_none() {
            self.cache.set(FIRST_RUN_KEY, now)?;
            info!("first run forced past cooldown");
            return Ok(None);
        }

        let Some(last_run) = self.cache.get(LAST_SYNC_KEY)? else {
            return Ok(None);
        };
        let elapsed = (now - last_run).to_std().unwrap_or(Duration::ZERO);
        if elapsed < self.cooldown {
            return Ok(Some(SkipReason::Cooldown {
                last_run,
                remaining: self.cooldown - elapsed,
            }));
        }
        Ok(None)
    }
}
