use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::clamav::{ClamAVClient, Version};
use crate::config::Config;
use crate::database::{DbOperation, VirusDbManager};
use crate::error::{Error, Result};
use crate::metrics::{Metrics, MetricsCollector};
use crate::quarantine::{FolderCounts, QuarantineManager};
use crate::scanner::{mime_from_filename, ScanResult, ScanService, ScanStatus};
use crate::scheduler::{MaintenanceReport, MaintenanceScheduler};

/// Read-only snapshot backing health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub machine_name: String,
    pub folder_counts: FolderCounts,
    pub db_checksum_valid: bool,
    pub db_version: String,
    pub last_db_update: DateTime<Utc>,
    pub scheduler_active: bool,
    pub next_maintenance: Option<DateTime<Local>>,
    pub metrics: Metrics,
}

/// Single entry point for callers: owns the quarantine folders, the scan
/// pipeline, the signature database and its maintenance timer.
pub struct QuarantineService {
    config: Config,
    client: Arc<dyn ClamAVClient>,
    quarantine: QuarantineManager,
    scanner: ScanService,
    database: VirusDbManager,
    scheduler: Arc<MaintenanceScheduler>,
    metrics: Arc<MetricsCollector>,
    scan_slots: Semaphore,
}

impl QuarantineService {
    pub fn new(config: Config, client: Arc<dyn ClamAVClient>) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(MetricsCollector::new());
        let quarantine = QuarantineManager::new(config.quarantine_paths());
        let scanner = ScanService::new(&config, Arc::clone(&client), Arc::clone(&metrics))?;
        let database = VirusDbManager::from_config(&config, Arc::clone(&client));
        let scheduler = Arc::new(MaintenanceScheduler::new(
            &config,
            database.clone(),
            Arc::clone(&metrics),
        )?);
        let scan_slots = Semaphore::new(config.limits.max_concurrent_scans);

        Ok(Self {
            config,
            client,
            quarantine,
            scanner,
            database,
            scheduler,
            metrics,
            scan_slots,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn quarantine(&self) -> &QuarantineManager {
        &self.quarantine
    }

    pub fn scanner(&self) -> &ScanService {
        &self.scanner
    }

    pub fn database(&self) -> &VirusDbManager {
        &self.database
    }

    pub fn scheduler(&self) -> &Arc<MaintenanceScheduler> {
        &self.scheduler
    }

    pub async fn ensure_folder_structure(&self) -> Result<()> {
        self.quarantine.ensure_folder_structure().await
    }

    /// Scans an upload, taking its MIME type from the file extension.
    pub async fn scan(&self, bytes: &[u8], filename: &str) -> Result<(ScanStatus, Option<PathBuf>)> {
        self.scan_with_mime(bytes, filename, mime_from_filename(filename))
            .await
    }

    pub async fn scan_with_mime(
        &self,
        bytes: &[u8],
        filename: &str,
        mime_type: &str,
    ) -> Result<(ScanStatus, Option<PathBuf>)> {
        let result = self.scan_detailed(bytes, filename, mime_type).await?;
        Ok((result.status(), result.final_path().map(PathBuf::from)))
    }

    pub async fn scan_detailed(
        &self,
        bytes: &[u8],
        filename: &str,
        mime_type: &str,
    ) -> Result<ScanResult> {
        let _permit = self
            .scan_slots
            .acquire()
            .await
            .map_err(|_| Error::InvalidState("Scan pool is closed".to_string()))?;

        self.scanner
            .scan_upload(bytes, filename, mime_type, &self.quarantine)
            .await
    }

    pub async fn status(&self) -> Result<SystemStatus> {
        let validation = self.database.validate().await;

        Ok(SystemStatus {
            machine_name: self.config.get_machine_name(),
            folder_counts: self.quarantine.folder_counts().await?,
            db_checksum_valid: validation.status.checksum_valid,
            db_version: validation.status.version,
            last_db_update: validation.status.last_update,
            scheduler_active: self.scheduler.is_active().await,
            next_maintenance: self.scheduler.next_run(),
            metrics: self.metrics.get_metrics().await,
        })
    }

    /// Healthy means a verified signature database and a complete folder tree.
    pub async fn validate_system_health(&self) -> bool {
        let db_valid = self.database.validate().await.is_valid();
        let folders = self.quarantine.paths().folder_structure_exists();
        if !db_valid || !folders {
            warn!(db_valid, folders, "System health check failed");
        }
        db_valid && folders
    }

    pub async fn start_maintenance_scheduler(&self) -> Result<DateTime<Local>> {
        if !self.config.maintenance.enabled {
            return Err(Error::Scheduler(
                "Scheduled maintenance is disabled in configuration".to_string(),
            ));
        }
        self.scheduler.schedule_daily_maintenance().await
    }

    pub async fn stop_maintenance_scheduler(&self) {
        self.scheduler.stop().await;
    }

    pub async fn run_maintenance_now(&self) -> MaintenanceReport {
        self.scheduler.run_daily_maintenance().await
    }

    pub async fn seal_database(&self) -> DbOperation {
        self.database.seal().await
    }

    /// Pings the engine and reads its version. An unreachable engine is not
    /// fatal; scans simply come back as `ERROR` until it returns.
    pub async fn probe_engine(&self) -> Option<Version> {
        match self.client.ping().await {
            Ok(true) => {}
            Ok(false) => {
                warn!("ClamAV did not answer PONG");
                return None;
            }
            Err(e) => {
                warn!("ClamAV is unreachable: {}", e);
                return None;
            }
        }

        match self.client.version().await {
            Ok(version) => {
                info!(
                    clamav = %version.clamav,
                    database = version.database,
                    "Connected to ClamAV"
                );
                Some(version)
            }
            Err(e) => {
                warn!("Failed to read ClamAV version: {}", e);
                None
            }
        }
    }
}
