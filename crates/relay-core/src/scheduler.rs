//! Daily scripture scheduler.
//!
//! One job loop sleeps until the next configured local time, runs the
//! sweep, and repeats. A repeat that lands while a sweep is still running is
//! skipped by the dispatcher's own running flag.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Days, Local, NaiveTime, TimeZone};
use tokio::{sync::Mutex, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{config::Config, triggers::TriggerDispatcher};

/// Next local instant at `hour:minute` strictly after `now`.
pub fn next_daily_run(now: DateTime<Local>, hour: u32, minute: u32) -> Option<DateTime<Local>> {
    let at = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let mut day = now.date_naive();
    // A DST gap can swallow the target time; look a few days ahead.
    for _ in 0..4 {
        if let Some(candidate) = Local
            .from_local_datetime(&day.and_time(at))
            .earliest()
        {
            if candidate > now {
                return Some(candidate);
            }
        }
        day = day.checked_add_days(Days::new(1))?;
    }
    None
}

struct Job {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ScriptureScheduler {
    cfg: Arc<Config>,
    triggers: Arc<TriggerDispatcher>,
    job: Arc<Mutex<Option<Job>>>,
}

impl ScriptureScheduler {
    pub fn new(cfg: Arc<Config>, triggers: Arc<TriggerDispatcher>) -> Self {
        Self {
            cfg,
            triggers,
            job: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the job loop (restarting it if already running).
    pub async fn start(&self) {
        self.stop().await;

        let cancel = CancellationToken::new();
        let scheduler = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            scheduler.job_loop(token).await;
        });

        *self.job.lock().await = Some(Job { cancel, handle });
        tracing::info!(
            hour = self.cfg.scripture_hour,
            minute = self.cfg.scripture_minute,
            "scripture scheduler started"
        );
    }

    pub async fn stop(&self) {
        let job = self.job.lock().await.take();
        if let Some(job) = job {
            job.cancel.cancel();
            if let Err(e) = job.handle.await {
                tracing::warn!(error = %e, "scheduler task did not stop cleanly");
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.job.lock().await.is_some()
    }

    async fn job_loop(&self, cancel: CancellationToken) {
        loop {
            let now = Local::now();
            let Some(next) =
                next_daily_run(now, self.cfg.scripture_hour, self.cfg.scripture_minute)
            else {
                tracing::error!("no next scripture run could be computed; scheduler stopping");
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tracing::info!(next = %next.format("%Y-%m-%d %H:%M"), "next scripture sweep scheduled");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(wait) => {
                    let report = self.triggers.run_scripture_sweep(false).await;
                    if report.already_running {
                        tracing::warn!("scheduled sweep skipped: previous sweep still running");
                    }
                }
            }
        }
    }
}
