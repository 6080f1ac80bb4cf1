use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub clamav: ClamAVConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub machine_name: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    pub virus_db_dir: Option<String>,
    pub virus_db_backup_dir: Option<String>,
}

/// Upload admission thresholds.
///
/// Only `soft_limit` and `hard_limit` are enforced; both produce the same
/// rejection status. `extended_limit` sits between them and only changes the
/// wording of the rejection message.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_soft_limit")]
    pub soft_limit: String,
    #[serde(default = "default_extended_limit")]
    pub extended_limit: String,
    #[serde(default = "default_hard_limit")]
    pub hard_limit: String,
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
    #[serde(default = "default_max_concurrent_scans")]
    pub max_concurrent_scans: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClamAVConfig {
    pub socket_path: Option<String>,
    pub tcp_host: Option<String>,
    pub tcp_port: Option<u16>,
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_seconds: u64,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Resolved byte values of [`LimitsConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimits {
    pub soft: u64,
    pub extended: u64,
    pub hard: u64,
}

/// Folder layout of one agent instance. Derived once from [`Config`] and not
/// changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantinePaths {
    pub incoming: PathBuf,
    pub scanning: PathBuf,
    pub clean: PathBuf,
    pub infected: PathBuf,
    pub logs: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_dir() -> String {
    "./data".to_string()
}

fn default_soft_limit() -> String {
    "5MB".to_string()
}

fn default_extended_limit() -> String {
    "10MB".to_string()
}

fn default_hard_limit() -> String {
    "15MB".to_string()
}

fn default_allowed_mime_types() -> Vec<String> {
    [
        "application/pdf",
        "application/msword",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "text/plain",
        "image/jpeg",
        "image/png",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_concurrent_scans() -> usize {
    4
}

fn default_scan_timeout() -> u64 {
    60
}

fn default_stream() -> bool {
    true
}

fn default_schedule() -> String {
    "0 0 0 * * *".to_string()
}

fn default_enabled() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            machine_name: None,
            log_level: default_log_level(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            virus_db_dir: None,
            virus_db_backup_dir: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            soft_limit: default_soft_limit(),
            extended_limit: default_extended_limit(),
            hard_limit: default_hard_limit(),
            allowed_mime_types: default_allowed_mime_types(),
            max_concurrent_scans: default_max_concurrent_scans(),
        }
    }
}

impl Default for ClamAVConfig {
    fn default() -> Self {
        Self {
            socket_path: Some("/var/run/clamav/clamd.ctl".to_string()),
            tcp_host: None,
            tcp_port: None,
            scan_timeout_seconds: default_scan_timeout(),
            stream: default_stream(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            schedule: default_schedule(),
            enabled: default_enabled(),
        }
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    pub async fn load_from_default_locations() -> Result<Self> {
        let locations = vec![
            PathBuf::from("/etc/quarantine-agent/agent.toml"),
            dirs::config_dir()
                .map(|d| d.join("quarantine-agent/agent.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|d| d.join(".quarantine-agent/agent.toml"))
                .unwrap_or_default(),
            PathBuf::from("./agent.toml"),
        ];

        for path in locations {
            if path.is_file() {
                tracing::info!("Loading config from: {:?}", path);
                return Self::load(path).await;
            }
        }

        Err(Error::Config(
            "No configuration file found in default locations".to_string(),
        ))
    }

    /// Config rooted at `base_dir`, everything else defaulted.
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        let mut config = Config::default();
        config.storage.base_dir = base_dir.as_ref().to_string_lossy().to_string();
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.clamav.socket_path.is_none()
            && (self.clamav.tcp_host.is_none() || self.clamav.tcp_port.is_none())
        {
            return Err(Error::Config(
                "Either socket_path or tcp_host/tcp_port must be configured".to_string(),
            ));
        }

        if self.clamav.scan_timeout_seconds == 0 {
            return Err(Error::Config(
                "scan_timeout_seconds must be greater than zero".to_string(),
            ));
        }

        cron::Schedule::from_str(&self.maintenance.schedule).map_err(|e| {
            Error::Config(format!(
                "Invalid cron expression '{}': {}",
                self.maintenance.schedule, e
            ))
        })?;

        let limits = self.limits.resolve()?;
        if limits.soft > limits.hard {
            return Err(Error::Config(format!(
                "soft_limit ({}) must not exceed hard_limit ({})",
                self.limits.soft_limit, self.limits.hard_limit
            )));
        }
        if limits.extended < limits.soft || limits.extended > limits.hard {
            tracing::warn!(
                "extended_limit {} is outside soft/hard range; it only affects rejection wording",
                self.limits.extended_limit
            );
        }

        if self.limits.allowed_mime_types.is_empty() {
            return Err(Error::Config(
                "allowed_mime_types must list at least one type".to_string(),
            ));
        }

        if self.limits.max_concurrent_scans == 0 {
            return Err(Error::Config(
                "max_concurrent_scans must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn get_machine_name(&self) -> String {
        self.agent.machine_name.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|s| s.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string())
        })
    }

    pub fn base_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.storage.base_dir).as_ref())
    }

    pub fn quarantine_paths(&self) -> QuarantinePaths {
        QuarantinePaths::under(self.base_dir().join("quarantine"))
    }

    pub fn virus_db_dir(&self) -> PathBuf {
        match &self.storage.virus_db_dir {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).as_ref()),
            None => self.base_dir().join("virus_db"),
        }
    }

    pub fn virus_db_backup_dir(&self) -> PathBuf {
        match &self.storage.virus_db_backup_dir {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).as_ref()),
            None => self.base_dir().join("virus_db_backup"),
        }
    }

    pub fn is_mime_allowed(&self, mime: &str) -> bool {
        let mime = mime.trim();
        self.limits
            .allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(mime))
    }
}

impl LimitsConfig {
    pub fn resolve(&self) -> Result<SizeLimits> {
        let parse = |field: &str, value: &str| {
            parse_size(value)
                .map_err(|_| Error::Config(format!("Invalid {} '{}'", field, value)))
        };
        Ok(SizeLimits {
            soft: parse("soft_limit", &self.soft_limit)?,
            extended: parse("extended_limit", &self.extended_limit)?,
            hard: parse("hard_limit", &self.hard_limit)?,
        })
    }
}

impl QuarantinePaths {
    pub fn under<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            incoming: root.join("incoming"),
            scanning: root.join("scanning"),
            clean: root.join("clean"),
            infected: root.join("infected"),
            logs: root.join("logs"),
        }
    }

    pub fn all(&self) -> [&Path; 5] {
        [
            &self.incoming,
            &self.scanning,
            &self.clean,
            &self.infected,
            &self.logs,
        ]
    }

    pub fn scan_activity_log(&self) -> PathBuf {
        self.logs.join("scan_activity.log")
    }

    pub fn update_log(&self) -> PathBuf {
        self.logs.join("update.log")
    }

    /// Creates every folder. `create_dir_all` tolerates concurrent creators,
    /// so this can be called from anywhere at any time.
    pub async fn ensure_folder_structure(&self) -> Result<()> {
        for dir in self.all() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::filesystem("create_dir", dir, e))?;
        }
        Ok(())
    }

    pub fn folder_structure_exists(&self) -> bool {
        self.all().iter().all(|dir| dir.is_dir())
    }
}

pub fn parse_size(size: &str) -> Result<u64> {
    let size = size.trim().to_uppercase();
    let (num_str, unit) = if size.ends_with("GB") {
        (&size[..size.len() - 2], 1_073_741_824)
    } else if size.ends_with("MB") {
        (&size[..size.len() - 2], 1_048_576)
    } else if size.ends_with("KB") {
        (&size[..size.len() - 2], 1_024)
    } else if size.ends_with('B') {
        (&size[..size.len() - 1], 1)
    } else {
        return Err(Error::Config(format!("Invalid size format: {}", size)));
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("Invalid number in size: {}", size)))?;

    num.checked_mul(unit)
        .ok_or_else(|| Error::Config(format!("Size out of range: {}", size)))
}
