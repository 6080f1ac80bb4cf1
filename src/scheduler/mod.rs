use chrono::{DateTime, Local, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::database::{DbSession, VirusDbManager, VirusUpdateStatus};
use crate::error::{Error, Result};
use crate::journal::Journal;
use crate::metrics::MetricsCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceOutcome {
    /// Database valid, backed up and reloaded.
    Healthy,
    /// Database was invalid and has been replaced by the backup.
    Restored,
    RestoreFailed,
    BackupFailed,
    ReloadFailed,
    Aborted,
    /// Another run held the database.
    Skipped,
}

impl MaintenanceOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceOutcome::Healthy => "healthy",
            MaintenanceOutcome::Restored => "restored",
            MaintenanceOutcome::RestoreFailed => "restore_failed",
            MaintenanceOutcome::BackupFailed => "backup_failed",
            MaintenanceOutcome::ReloadFailed => "reload_failed",
            MaintenanceOutcome::Aborted => "aborted",
            MaintenanceOutcome::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for MaintenanceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: MaintenanceOutcome,
    /// Database state as found at the start of the run.
    pub status: VirusUpdateStatus,
    pub reloaded: bool,
    pub reason: Option<String>,
}

struct Sequence {
    outcome: MaintenanceOutcome,
    status: VirusUpdateStatus,
    reloaded: bool,
    reason: Option<String>,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs database maintenance on a cron schedule.
pub struct MaintenanceScheduler {
    schedule: Schedule,
    database: VirusDbManager,
    update_log: Journal,
    metrics: Arc<MetricsCollector>,
    running: Mutex<Option<Running>>,
}

impl MaintenanceScheduler {
    pub fn new(
        config: &Config,
        database: VirusDbManager,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let schedule = Schedule::from_str(&config.maintenance.schedule)
            .map_err(|e| Error::Scheduler(format!("Invalid cron expression: {}", e)))?;

        Ok(Self {
            schedule,
            database,
            update_log: Journal::new(config.quarantine_paths().update_log()),
            metrics,
            running: Mutex::new(None),
        })
    }

    pub fn database(&self) -> &VirusDbManager {
        &self.database
    }

    pub fn update_log(&self) -> &Journal {
        &self.update_log
    }

    pub fn next_run(&self) -> Option<DateTime<Local>> {
        self.schedule.upcoming(Local).next()
    }

    /// Registers the recurring trigger and returns when it will first fire.
    pub async fn schedule_daily_maintenance(self: &Arc<Self>) -> Result<DateTime<Local>> {
        let next = self
            .next_run()
            .ok_or_else(|| Error::Scheduler("Schedule has no upcoming runs".to_string()))?;
        self.start().await?;
        info!(next_run = %next, "Daily virus database maintenance scheduled");
        Ok(next)
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                debug!("Maintenance scheduler already running");
                return Ok(());
            }
        }

        let token = CancellationToken::new();
        let scheduler = Arc::clone(self);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            scheduler.run_schedule(loop_token).await;
        });

        *running = Some(Running { token, handle });
        info!("Maintenance scheduler started");
        Ok(())
    }

    /// Stops the timer. A run already in progress is allowed to finish.
    pub async fn stop(&self) {
        let current = self.running.lock().await.take();
        if let Some(Running { token, handle }) = current {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Maintenance scheduler task ended abnormally: {}", e);
            }
            info!("Maintenance scheduler stopped");
        }
    }

    pub async fn is_active(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }

    async fn run_schedule(self: Arc<Self>, token: CancellationToken) {
        let mut last_fired = Local::now();

        loop {
            let from = last_fired.max(Local::now());
            let Some(next) = self.schedule.after(&from).next() else {
                warn!("Maintenance schedule has no upcoming runs, stopping");
                break;
            };
            let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
            debug!(next_run = %next, "Waiting for next maintenance run");

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            last_fired = next;
            self.run_daily_maintenance().await;
        }
    }

    /// One maintenance pass. Always appends exactly one update-log line.
    pub async fn run_daily_maintenance(&self) -> MaintenanceReport {
        let started_at = Utc::now();
        let started = Instant::now();

        let sequence = match self.database.try_exclusive() {
            Some(session) => {
                info!("Virus database maintenance started");
                match tokio::spawn(maintain(session)).await {
                    Ok(sequence) => sequence,
                    Err(e) => {
                        error!("Virus database maintenance aborted: {}", e);
                        Sequence {
                            outcome: MaintenanceOutcome::Aborted,
                            status: self.database.validate().await.status,
                            reloaded: false,
                            reason: Some(e.to_string()),
                        }
                    }
                }
            }
            None => {
                warn!("Virus database maintenance already in progress, skipping");
                Sequence {
                    outcome: MaintenanceOutcome::Skipped,
                    status: self.database.validate().await.status,
                    reloaded: false,
                    reason: Some("another maintenance run is in progress".to_string()),
                }
            }
        };

        let report = MaintenanceReport {
            started_at,
            finished_at: Utc::now(),
            outcome: sequence.outcome,
            status: sequence.status,
            reloaded: sequence.reloaded,
            reason: sequence.reason,
        };

        if report.outcome != MaintenanceOutcome::Skipped {
            info!(
                outcome = %report.outcome,
                checksum_valid = report.status.checksum_valid,
                version = %report.status.version,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Virus database maintenance finished"
            );
        }

        self.metrics.record_maintenance(report.outcome).await;
        if let Err(e) = self.update_log.append(&update_line(&report)).await {
            error!("Failed to write maintenance log: {}", e);
        }

        report
    }
}

async fn maintain(session: DbSession) -> Sequence {
    let validation = session.validate().await;
    let status = validation.status.clone();

    if validation.is_valid() {
        let backup = session.backup().await;
        let reloaded = session.reload_engine().await;
        let (outcome, reason) = if !backup.success {
            (MaintenanceOutcome::BackupFailed, backup.reason)
        } else if !reloaded {
            (
                MaintenanceOutcome::ReloadFailed,
                Some("engine reload failed".to_string()),
            )
        } else {
            (MaintenanceOutcome::Healthy, None)
        };
        return Sequence {
            outcome,
            status,
            reloaded,
            reason,
        };
    }

    let failure = validation
        .failure
        .as_ref()
        .map(|f| f.to_string())
        .unwrap_or_else(|| "checksum invalid".to_string());

    if !validation.is_corrupted() {
        warn!("Virus database could not be validated, leaving it untouched: {}", failure);
        return Sequence {
            outcome: MaintenanceOutcome::Aborted,
            status,
            reloaded: false,
            reason: Some(failure),
        };
    }

    warn!(reason = %failure, "Virus database invalid, restoring from backup");
    let restore = session.restore_from_backup().await;
    if !restore.success {
        let reason = restore.reason.unwrap_or_else(|| "restore failed".to_string());
        error!(
            alert = true,
            reason = %reason,
            "Virus database restore failed, live and backup signatures are untrusted; operator intervention required"
        );
        return Sequence {
            outcome: MaintenanceOutcome::RestoreFailed,
            status,
            reloaded: false,
            reason: Some(reason),
        };
    }

    let reloaded = session.reload_engine().await;
    Sequence {
        outcome: if reloaded {
            MaintenanceOutcome::Restored
        } else {
            MaintenanceOutcome::ReloadFailed
        },
        status,
        reloaded,
        reason: Some(failure),
    }
}

fn update_line(report: &MaintenanceReport) -> String {
    let mut line = format!(
        "{} checksum_valid={} version={} outcome={}",
        report.finished_at.to_rfc3339(),
        report.status.checksum_valid,
        report.status.version,
        report.outcome
    );
    if let Some(reason) = &report.reason {
        line.push_str(&format!(" reason={:?}", reason));
    }
    line
}
