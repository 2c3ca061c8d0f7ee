//! Due-time scheduler loop.
//!
//! Ticks on a short fixed interval, fires every enabled job whose next
//! due time has passed, and hands each new run to the supervisor without
//! blocking the tick. Rescheduling is anchored to the firing tick, so a
//! lagging scheduler never produces a catch-up burst.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

use crate::database::Database;
use crate::supervisor::RunLauncher;

pub struct SchedulerLoop {
    database: Database,
    launcher: Arc<dyn RunLauncher>,
    tick: Duration,
}

impl SchedulerLoop {
    pub fn new(database: Database, launcher: Arc<dyn RunLauncher>, tick_seconds: u64) -> Self {
        Self {
            database,
            launcher,
            tick: Duration::from_secs(tick_seconds.max(1)),
        }
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "Starting scheduler loop (tick every {}s)",
            self.tick.as_secs()
        );
        let mut tick = interval(self.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            if let Err(e) = self.fire_due_jobs(Utc::now()).await {
                error!("Scheduler tick failed: {}", e);
            }
        }
    }

    /// Fire every job due at `now`. Each due job atomically gets a queued
    /// run with a frozen copy of its targets and an advanced schedule,
    /// then the run is launched asynchronously. All jobs due in the same
    /// tick fire within that tick, each as an independent run.
    pub async fn fire_due_jobs(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.database.due_jobs(now).await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!("{} job(s) due at {}", due.len(), now.to_rfc3339());

        let mut fired = 0;
        for job in due {
            match self.database.fire_job(&job, now).await {
                Ok(run) => {
                    info!(
                        "Job '{}' ({}) fired: run {} with {} target(s)",
                        job.name,
                        job.id,
                        run.id,
                        run.request.len()
                    );
                    self.launcher.launch(run).await;
                    fired += 1;
                }
                Err(e) => {
                    error!("Failed to fire job '{}' ({}): {}", job.name, job.id, e);
                }
            }
        }
        Ok(fired)
    }
}
