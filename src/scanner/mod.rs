use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clamav::{ClamAVClient, EngineVerdict};
use crate::config::{Config, SizeLimits};
use crate::error::{Error, Result};
use crate::journal::Journal;
use crate::metrics::MetricsCollector;
use crate::quarantine::QuarantineManager;

pub const ENGINE_NAME: &str = "clamav";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    Safe,
    Infected,
    Error,
    RejectedSizeLimit,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Safe => "SAFE",
            ScanStatus::Infected => "INFECTED",
            ScanStatus::Error => "ERROR",
            ScanStatus::RejectedSizeLimit => "REJECTED_SIZE_LIMIT",
        }
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scan attempt against a file sitting in the scanning folder.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    id: String,
    path: PathBuf,
    mime_type: String,
}

impl ScanRequest {
    pub fn new<P: Into<PathBuf>>(path: P, mime_type: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            path: path.into(),
            mime_type: mime_type.trim().to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    request_id: String,
    status: ScanStatus,
    details: BTreeMap<String, String>,
    size: u64,
    final_path: Option<PathBuf>,
    created_at: DateTime<Utc>,
}

impl ScanResult {
    fn new(
        request: &ScanRequest,
        status: ScanStatus,
        details: BTreeMap<String, String>,
        size: u64,
    ) -> Self {
        Self {
            request_id: request.id.clone(),
            status,
            details,
            size,
            final_path: None,
            created_at: Utc::now(),
        }
    }

    /// Copy of this result that records where the file ended up. Only
    /// meaningful for `SAFE` and `INFECTED`.
    fn with_final_path(self, path: PathBuf) -> Self {
        Self {
            final_path: Some(path),
            ..self
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn status(&self) -> ScanStatus {
        self.status
    }

    pub fn details(&self) -> &BTreeMap<String, String> {
        &self.details
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn final_path(&self) -> Option<&Path> {
        self.final_path.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Admission decision for an upload of a given size and declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    TooLarge { tier: &'static str, message: String },
    MimeRejected { message: String },
}

pub struct ScanService {
    client: Arc<dyn ClamAVClient>,
    limits: SizeLimits,
    allowed_mime_types: Vec<String>,
    engine_timeout: Duration,
    activity_log: Journal,
    metrics: Arc<MetricsCollector>,
}

impl ScanService {
    pub fn new(
        config: &Config,
        client: Arc<dyn ClamAVClient>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        Ok(Self {
            client,
            limits: config.limits.resolve()?,
            allowed_mime_types: config.limits.allowed_mime_types.clone(),
            engine_timeout: Duration::from_secs(config.clamav.scan_timeout_seconds),
            activity_log: Journal::new(config.quarantine_paths().scan_activity_log()),
            metrics,
        })
    }

    pub fn with_engine_timeout(mut self, engine_timeout: Duration) -> Self {
        self.engine_timeout = engine_timeout;
        self
    }

    pub fn limits(&self) -> SizeLimits {
        self.limits
    }

    pub fn activity_log(&self) -> &Journal {
        &self.activity_log
    }

    pub fn admission(&self, size: u64, mime_type: &str) -> Admission {
        if let Some((tier, message)) = self.size_rejection(size) {
            return Admission::TooLarge { tier, message };
        }
        let mime_type = mime_type.trim();
        if !self
            .allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(mime_type))
        {
            return Admission::MimeRejected {
                message: format!("MIME type '{}' is not allowed", mime_type),
            };
        }
        Admission::Accepted
    }

    /// Same as [`ScanService::admission`] but as an error, for callers that
    /// want to bail out with `?`.
    pub fn check_admission(&self, size: u64, mime_type: &str) -> Result<()> {
        match self.admission(size, mime_type) {
            Admission::Accepted => Ok(()),
            Admission::TooLarge { message, .. } | Admission::MimeRejected { message } => {
                Err(Error::AdmissionRejected(message))
            }
        }
    }

    fn size_rejection(&self, size: u64) -> Option<(&'static str, String)> {
        let SizeLimits {
            soft,
            extended,
            hard,
        } = self.limits;

        if size > hard {
            return Some((
                "hard",
                format!(
                    "File is {} bytes, above the hard limit of {} bytes",
                    size, hard
                ),
            ));
        }
        if size > soft {
            let (tier, limit) = if extended > soft && extended <= hard && size > extended {
                ("extended", extended)
            } else {
                ("soft", soft)
            };
            return Some((
                tier,
                format!(
                    "File is {} bytes, above the {} limit of {} bytes; compress it and retry",
                    size, tier, limit
                ),
            ));
        }
        None
    }

    /// Classifies one file. Every failure is folded into the returned status;
    /// this never errors and never waits on the engine longer than the
    /// configured timeout.
    pub async fn scan(&self, request: &ScanRequest) -> ScanResult {
        let started = Instant::now();
        let mut result = self.evaluate(request).await;
        result.details.insert(
            "scan_time".to_string(),
            format!("{:.3}s", started.elapsed().as_secs_f64()),
        );

        self.metrics
            .record_scan(result.status, started.elapsed())
            .await;
        self.log_activity(request, &result).await;

        match result.status {
            ScanStatus::Infected => warn!(
                request_id = %result.request_id(),
                virus = result.detail("virus_name").unwrap_or_default(),
                path = %request.path.display(),
                "Threat detected"
            ),
            status => info!(
                request_id = %result.request_id(),
                status = %status,
                size = result.size,
                "Scan completed"
            ),
        }

        result
    }

    async fn evaluate(&self, request: &ScanRequest) -> ScanResult {
        let mut details = BTreeMap::new();
        details.insert("engine".to_string(), ENGINE_NAME.to_string());

        let size = match fs::metadata(&request.path).await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                details.insert("error".to_string(), format!("Cannot read upload: {}", e));
                details.insert("error_kind".to_string(), "io".to_string());
                return ScanResult::new(request, ScanStatus::Error, details, 0);
            }
        };

        match self.admission(size, &request.mime_type) {
            Admission::Accepted => {}
            Admission::TooLarge { tier, message } => {
                details.insert("error".to_string(), message);
                details.insert("size_tier".to_string(), tier.to_string());
                details.insert("hard_limit".to_string(), self.limits.hard.to_string());
                return ScanResult::new(request, ScanStatus::RejectedSizeLimit, details, size);
            }
            Admission::MimeRejected { message } => {
                details.insert("error".to_string(), message);
                details.insert("error_kind".to_string(), "admission".to_string());
                return ScanResult::new(request, ScanStatus::Error, details, size);
            }
        }

        let verdict = match timeout(self.engine_timeout, self.client.scan(&request.path)).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                debug!(engine_unavailable = e.is_engine_unavailable(), "Engine call failed: {}", e);
                EngineVerdict::EngineError {
                    reason: e.to_string(),
                }
            }
            Err(_) => EngineVerdict::EngineError {
                reason: format!(
                    "Engine did not answer within {}s",
                    self.engine_timeout.as_secs_f64()
                ),
            },
        };

        let status = match verdict {
            EngineVerdict::Clean => ScanStatus::Safe,
            EngineVerdict::SignatureFound { name } => {
                details.insert("virus_name".to_string(), name);
                ScanStatus::Infected
            }
            EngineVerdict::EngineError { reason } => {
                details.insert("error".to_string(), reason);
                details.insert("error_kind".to_string(), "engine".to_string());
                ScanStatus::Error
            }
        };
        ScanResult::new(request, status, details, size)
    }

    async fn log_activity(&self, request: &ScanRequest, result: &ScanResult) {
        let record = serde_json::json!({
            "request_id": result.request_id(),
            "file": request.path.file_name().map(|n| n.to_string_lossy().to_string()),
            "mime_type": request.mime_type,
            "size": result.size,
            "details": result.details,
        });
        let line = format!(
            "{} {} {}",
            result.created_at().to_rfc3339(),
            result.status,
            record
        );
        if let Err(e) = self.activity_log.append(&line).await {
            warn!("Failed to write scan activity log: {}", e);
        }
    }

    /// Full lifecycle of one upload: incoming, admission, scanning, then
    /// clean or infected. An engine `ERROR` leaves the file in scanning for a
    /// retry. Admission rejections are deleted from incoming without reaching
    /// the engine.
    pub async fn scan_upload(
        &self,
        bytes: &[u8],
        filename: &str,
        mime_type: &str,
        quarantine: &QuarantineManager,
    ) -> Result<ScanResult> {
        let incoming = quarantine.move_to_incoming(bytes, filename).await?;
        let size = fs::metadata(&incoming)
            .await
            .map_err(|e| Error::filesystem("stat", &incoming, e))?
            .len();

        if self.admission(size, mime_type) != Admission::Accepted {
            let result = self.scan(&ScanRequest::new(&incoming, mime_type)).await;
            quarantine.discard(&incoming).await?;
            return Ok(result);
        }

        let scanning = quarantine.move_to_scanning(&incoming).await?;
        let result = self.scan(&ScanRequest::new(&scanning, mime_type)).await;

        match result.status {
            ScanStatus::Safe => {
                let path = quarantine.mark_safe(&scanning).await?;
                Ok(result.with_final_path(path))
            }
            ScanStatus::Infected => {
                let path = quarantine.mark_infected(&scanning).await?;
                Ok(result.with_final_path(path))
            }
            ScanStatus::Error | ScanStatus::RejectedSizeLimit => {
                warn!(
                    path = %scanning.display(),
                    error = result.detail("error").unwrap_or_default(),
                    "Scan did not complete, file left in scanning"
                );
                Ok(result)
            }
        }
    }

    pub async fn scan_and_return_paths(
        &self,
        bytes: &[u8],
        filename: &str,
        mime_type: &str,
        quarantine: &QuarantineManager,
    ) -> Result<(ScanStatus, Option<PathBuf>)> {
        let result = self
            .scan_upload(bytes, filename, mime_type, quarantine)
            .await?;
        Ok((result.status, result.final_path))
    }
}

/// Best-effort MIME type from a file extension.
pub fn mime_from_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "txt" | "text" | "log" | "md" => "text/plain",
        "csv" => "text/csv",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
