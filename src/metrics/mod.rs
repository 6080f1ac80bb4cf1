use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::scanner::ScanStatus;
use crate::scheduler::MaintenanceOutcome;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Metrics {
    pub scans_total: u64,
    pub scans_safe_total: u64,
    pub scans_infected_total: u64,
    pub scans_error_total: u64,
    pub scans_rejected_total: u64,
    pub last_threat_timestamp: Option<i64>,
    pub last_scan_duration_ms: u64,
    pub avg_scan_duration_ms: u64,
    pub max_scan_duration_ms: u64,
    pub maintenance_runs_total: u64,
    pub maintenance_skipped_total: u64,
    pub database_restores_total: u64,
    pub database_restore_failures_total: u64,
    pub maintenance_failures_total: u64,
    pub last_maintenance_outcome: Option<MaintenanceOutcome>,
    pub last_maintenance_timestamp: Option<i64>,
    pub agent_uptime_seconds: u64,
}

pub struct MetricsCollector {
    metrics: Arc<RwLock<Metrics>>,
    start_time: std::time::Instant,
    scan_durations: Arc<RwLock<Vec<u64>>>, // last 100 engine scans, for the average
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(Metrics::default())),
            start_time: std::time::Instant::now(),
            scan_durations: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn record_scan(&self, status: ScanStatus, duration: Duration) {
        let duration_ms = duration.as_millis() as u64;

        let mut metrics = self.metrics.write().await;
        metrics.scans_total += 1;
        match status {
            ScanStatus::Safe => metrics.scans_safe_total += 1,
            ScanStatus::Infected => {
                metrics.scans_infected_total += 1;
                metrics.last_threat_timestamp = Some(Utc::now().timestamp());
            }
            ScanStatus::Error => metrics.scans_error_total += 1,
            ScanStatus::RejectedSizeLimit => {
                // Rejections never reach the engine; they do not count towards timings.
                metrics.scans_rejected_total += 1;
                return;
            }
        }

        metrics.last_scan_duration_ms = duration_ms;
        if duration_ms > metrics.max_scan_duration_ms {
            metrics.max_scan_duration_ms = duration_ms;
        }
        drop(metrics);

        let mut durations = self.scan_durations.write().await;
        durations.push(duration_ms);
        if durations.len() > 100 {
            durations.remove(0);
        }
        let avg = durations.iter().sum::<u64>() / durations.len() as u64;
        drop(durations);

        self.metrics.write().await.avg_scan_duration_ms = avg;
    }

    pub async fn record_maintenance(&self, outcome: MaintenanceOutcome) {
        let mut metrics = self.metrics.write().await;

        if outcome == MaintenanceOutcome::Skipped {
            metrics.maintenance_skipped_total += 1;
            return;
        }

        metrics.maintenance_runs_total += 1;
        match outcome {
            MaintenanceOutcome::Restored => metrics.database_restores_total += 1,
            MaintenanceOutcome::RestoreFailed => {
                metrics.database_restore_failures_total += 1;
                metrics.maintenance_failures_total += 1;
            }
            MaintenanceOutcome::BackupFailed
            | MaintenanceOutcome::ReloadFailed
            | MaintenanceOutcome::Aborted => metrics.maintenance_failures_total += 1,
            MaintenanceOutcome::Healthy | MaintenanceOutcome::Skipped => {}
        }
        metrics.last_maintenance_outcome = Some(outcome);
        metrics.last_maintenance_timestamp = Some(Utc::now().timestamp());
    }

    pub async fn get_metrics(&self) -> Metrics {
        let mut metrics = self.metrics.read().await.clone();
        metrics.agent_uptime_seconds = self.start_time.elapsed().as_secs();
        metrics
    }

    pub async fn get_uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        let metrics = collector.get_metrics().await;

        assert_eq!(metrics.scans_total, 0);
        assert_eq!(metrics.maintenance_runs_total, 0);
        assert!(metrics.last_maintenance_outcome.is_none());
        assert!(metrics.last_threat_timestamp.is_none());
    }

    #[tokio::test]
    async fn test_record_scan_by_status() {
        let collector = MetricsCollector::new();

        collector.record_scan(ScanStatus::Safe, Duration::from_millis(40)).await;
        collector.record_scan(ScanStatus::Infected, Duration::from_millis(80)).await;
        collector.record_scan(ScanStatus::Error, Duration::from_millis(10)).await;
        collector
            .record_scan(ScanStatus::RejectedSizeLimit, Duration::from_millis(999))
            .await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.scans_total, 4);
        assert_eq!(metrics.scans_safe_total, 1);
        assert_eq!(metrics.scans_infected_total, 1);
        assert_eq!(metrics.scans_error_total, 1);
        assert_eq!(metrics.scans_rejected_total, 1);
        assert!(metrics.last_threat_timestamp.is_some());
        assert_eq!(metrics.last_scan_duration_ms, 10);
        assert_eq!(metrics.max_scan_duration_ms, 80);
        assert_eq!(metrics.avg_scan_duration_ms, (40 + 80 + 10) / 3);
    }

    #[tokio::test]
    async fn test_scan_duration_window() {
        let collector = MetricsCollector::new();
        for _ in 0..150 {
            collector.record_scan(ScanStatus::Safe, Duration::from_millis(20)).await;
        }
        assert_eq!(collector.scan_durations.read().await.len(), 100);
        assert_eq!(collector.get_metrics().await.avg_scan_duration_ms, 20);
    }

    #[tokio::test]
    async fn test_record_maintenance() {
        let collector = MetricsCollector::new();

        collector.record_maintenance(MaintenanceOutcome::Healthy).await;
        collector.record_maintenance(MaintenanceOutcome::Restored).await;
        collector.record_maintenance(MaintenanceOutcome::RestoreFailed).await;
        collector.record_maintenance(MaintenanceOutcome::Skipped).await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.maintenance_runs_total, 3);
        assert_eq!(metrics.maintenance_skipped_total, 1);
        assert_eq!(metrics.database_restores_total, 1);
        assert_eq!(metrics.database_restore_failures_total, 1);
        assert_eq!(metrics.maintenance_failures_total, 1);
        assert_eq!(
            metrics.last_maintenance_outcome,
            Some(MaintenanceOutcome::RestoreFailed)
        );
        assert!(metrics.last_maintenance_timestamp.is_some());
    }

    #[tokio::test]
    async fn test_uptime() {
        let collector = MetricsCollector::new();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(collector.get_uptime().await >= Duration::from_millis(10));
    }
}
