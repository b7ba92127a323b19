//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the monitor service."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Simple async rate limiter that ensures deterministic loop intervals.
///
/// The first tick completes immediately.
#[derive(Debug)]
pub struct RateLimiter {
    interval: tokio::time::Interval,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}

/// Outcome of joining a [`TaskGroup`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskReport {
    pub completed: usize,
    pub failed: Vec<String>,
    pub aborted: Vec<String>,
}

impl TaskReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.aborted.is_empty()
    }
}

/// Named background tasks sharing one cancellation token.
///
/// Joining never fails: task errors and panics are logged and counted.
#[derive(Debug, Default)]
pub struct TaskGroup {
    token: CancellationToken,
    tasks: Vec<(String, JoinHandle<Result<()>>)>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group whose tasks observe an existing token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            tasks: Vec::new(),
        }
    }

    /// Token cancelled by [`TaskGroup::shutdown`].
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, fut: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        debug!(task = %name, "spawning task");
        let handle = tokio::spawn(fut);
        self.tasks.push((name, handle));
    }

    /// Track an already spawned task.
    pub fn adopt(&mut self, name: impl Into<String>, handle: JoinHandle<Result<()>>) {
        self.tasks.push((name.into(), handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task, in spawn order.
    pub async fn join(self) -> TaskReport {
        let mut report = TaskReport::default();
        for (name, handle) in self.tasks {
            collect(&mut report, name, handle.await);
        }
        report
    }

    /// Cancel the token, then join, aborting tasks still running after `grace`.
    pub async fn shutdown(self, grace: Duration) -> TaskReport {
        self.token.cancel();
        let deadline = Instant::now() + grace;
        let mut report = TaskReport::default();
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(joined) => collect(&mut report, name, joined),
                Err(_) => {
                    warn!(task = %name, "task ignored cancellation; aborting");
                    handle.abort();
                    let _ = handle.await;
                    report.aborted.push(name);
                }
            }
        }
        report
    }
}

fn collect(
    report: &mut TaskReport,
    name: String,
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Ok(())) => {
            debug!(task = %name, "task finished");
            report.completed += 1;
        }
        Ok(Err(err)) => {
            error!(task = %name, error = %err, "task failed");
            report.failed.push(name);
        }
        Err(err) if err.is_cancelled() => {
            debug!(task = %name, "task was already aborted");
            report.aborted.push(name);
        }
        Err(err) => {
            error!(task = %name, error = %err, "task panicked");
            report.failed.push(name);
        }
    }
}
