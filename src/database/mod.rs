//! Integrity checks, backup and restore for the signature database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::clamav::parser::Parser;
use crate::clamav::ClamAVClient;
use crate::config::Config;
use crate::error::{Error, Result};

/// `sha256sum`-format manifest kept at the root of the database tree.
pub const MANIFEST_FILE: &str = "checksums.sha256";

const VERSION_SOURCES: [&str; 4] = ["daily.cvd", "daily.cld", "main.cvd", "main.cld"];
const HEADER_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirusUpdateStatus {
    pub last_update: DateTime<Utc>,
    pub checksum_valid: bool,
    pub version: String,
}

impl VirusUpdateStatus {
    fn unusable(version: &str) -> Self {
        Self {
            last_update: DateTime::<Utc>::UNIX_EPOCH,
            checksum_valid: false,
            version: version.to_string(),
        }
    }
}

/// Why a validation did not come back clean.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationFailure {
    Missing,
    ManifestMissing,
    ManifestEmpty,
    ManifestInvalid { line: usize },
    FileMissing { file: String },
    ChecksumMismatch { file: String },
    UnlistedFile { file: String },
    Io { reason: String },
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationFailure::Missing => write!(f, "database directory missing"),
            ValidationFailure::ManifestMissing => write!(f, "checksum manifest missing"),
            ValidationFailure::ManifestEmpty => write!(f, "checksum manifest lists no files"),
            ValidationFailure::ManifestInvalid { line } => {
                write!(f, "checksum manifest line {} is malformed", line)
            }
            ValidationFailure::FileMissing { file } => write!(f, "{} is missing", file),
            ValidationFailure::ChecksumMismatch { file } => {
                write!(f, "{} does not match its checksum", file)
            }
            ValidationFailure::UnlistedFile { file } => {
                write!(f, "{} is not listed in the checksum manifest", file)
            }
            ValidationFailure::Io { reason } => write!(f, "I/O failure: {}", reason),
        }
    }
}

/// Outcome of [`VirusDbManager::validate`]: the point-in-time status plus the
/// reason it is not valid, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbValidation {
    pub status: VirusUpdateStatus,
    pub failure: Option<ValidationFailure>,
}

impl DbValidation {
    pub fn is_valid(&self) -> bool {
        self.status.checksum_valid
    }

    /// True when the tree was read but its contents are wrong, as opposed to
    /// a transient I/O problem while reading it.
    pub fn is_corrupted(&self) -> bool {
        matches!(
            self.failure,
            Some(
                ValidationFailure::Missing
                    | ValidationFailure::ManifestMissing
                    | ValidationFailure::ManifestEmpty
                    | ValidationFailure::ManifestInvalid { .. }
                    | ValidationFailure::FileMissing { .. }
                    | ValidationFailure::ChecksumMismatch { .. }
                    | ValidationFailure::UnlistedFile { .. }
            )
        )
    }

    fn errored(reason: String) -> Self {
        Self {
            status: VirusUpdateStatus::unusable("error"),
            failure: Some(ValidationFailure::Io { reason }),
        }
    }
}

/// Success flag plus reason for backup, restore and seal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbOperation {
    pub success: bool,
    pub reason: Option<String>,
}

impl DbOperation {
    pub fn ok() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Clone)]
pub struct VirusDbManager {
    live: PathBuf,
    backup: PathBuf,
    client: Arc<dyn ClamAVClient>,
    lock: Arc<Mutex<()>>,
}

/// Exclusive access to the database trees. Holding one is the single-flight
/// guarantee for maintenance; it is released on drop.
pub struct DbSession {
    db: VirusDbManager,
    _guard: OwnedMutexGuard<()>,
}

impl VirusDbManager {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(
        live: P,
        backup: Q,
        client: Arc<dyn ClamAVClient>,
    ) -> Self {
        Self {
            live: live.into(),
            backup: backup.into(),
            client,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_config(config: &Config, client: Arc<dyn ClamAVClient>) -> Self {
        Self::new(config.virus_db_dir(), config.virus_db_backup_dir(), client)
    }

    pub fn live_path(&self) -> &Path {
        &self.live
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    /// Whether a backup, restore or maintenance run currently holds the trees.
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Claims the trees without waiting; `None` if someone else holds them.
    pub fn try_exclusive(&self) -> Option<DbSession> {
        let guard = Arc::clone(&self.lock).try_lock_owned().ok()?;
        Some(DbSession {
            db: self.clone(),
            _guard: guard,
        })
    }

    pub async fn exclusive(&self) -> DbSession {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        DbSession {
            db: self.clone(),
            _guard: guard,
        }
    }

    /// Never fails: problems are reported inside the returned value.
    pub async fn validate(&self) -> DbValidation {
        inspect(self.live.clone()).await
    }

    pub async fn backup(&self) -> DbOperation {
        self.exclusive().await.backup().await
    }

    pub async fn restore_from_backup(&self) -> DbOperation {
        self.exclusive().await.restore_from_backup().await
    }

    /// Writes the checksum manifest for the current live tree. Run after a
    /// legitimate signature update so later validations accept it.
    pub async fn seal(&self) -> DbOperation {
        let _session = self.exclusive().await;
        let live = self.live.clone();

        if !live.is_dir() {
            return DbOperation::failed(format!("{} does not exist", live.display()));
        }

        match tokio::task::spawn_blocking(move || write_manifest(&live)).await {
            Ok(Ok(count)) => {
                info!(files = count, "Virus database manifest written");
                DbOperation::ok()
            }
            Ok(Err(e)) => {
                error!("Failed to write virus database manifest: {}", e);
                DbOperation::failed(e.to_string())
            }
            Err(e) => DbOperation::failed(format!("manifest task failed: {}", e)),
        }
    }

    /// Asks the engine to reload its signatures.
    pub async fn reload_engine(&self) -> bool {
        match self.client.reload().await {
            Ok(()) => {
                info!("ClamAV signature reload requested");
                true
            }
            Err(e) => {
                warn!("ClamAV signature reload failed: {}", e);
                false
            }
        }
    }
}

impl DbSession {
    pub async fn validate(&self) -> DbValidation {
        self.db.validate().await
    }

    pub async fn reload_engine(&self) -> bool {
        self.db.reload_engine().await
    }

    pub async fn backup(&self) -> DbOperation {
        let live = self.db.live.clone();
        let backup = self.db.backup.clone();

        if !live.is_dir() {
            warn!(path = %live.display(), "Backup skipped: live virus database does not exist");
            return DbOperation::failed("live database does not exist");
        }

        let validation = inspect(live.clone()).await;
        if !validation.is_valid() {
            let reason = validation
                .failure
                .map(|f| f.to_string())
                .unwrap_or_else(|| "checksum invalid".to_string());
            warn!("Backup refused, live database is not valid: {}", reason);
            return DbOperation::failed(format!("live database is not valid: {}", reason));
        }

        let result = tokio::task::spawn_blocking(move || replace_tree(&live, &backup)).await;
        match result {
            Ok(Ok(())) => {
                info!(path = %self.db.backup.display(), "Virus database backed up");
                DbOperation::ok()
            }
            Ok(Err(e)) => {
                error!("Virus database backup failed: {}", e);
                DbOperation::failed(e.to_string())
            }
            Err(e) => DbOperation::failed(format!("backup task failed: {}", e)),
        }
    }

    pub async fn restore_from_backup(&self) -> DbOperation {
        let live = self.db.live.clone();
        let backup = self.db.backup.clone();

        if !backup.is_dir() {
            error!(path = %backup.display(), "Restore impossible: no virus database backup");
            return DbOperation::failed("no backup available");
        }

        let backup_validation = inspect(backup.clone()).await;
        if !backup_validation.is_valid() {
            let reason = backup_validation
                .failure
                .map(|f| f.to_string())
                .unwrap_or_else(|| "checksum invalid".to_string());
            error!("Restore refused, backup is not valid: {}", reason);
            return DbOperation::failed(format!("backup is not valid: {}", reason));
        }

        let result = tokio::task::spawn_blocking(move || replace_tree(&backup, &live)).await;
        match result {
            Ok(Ok(())) => {
                info!(path = %self.db.live.display(), "Virus database restored from backup");
                DbOperation::ok()
            }
            Ok(Err(e)) => {
                error!("Virus database restore failed: {}", e);
                DbOperation::failed(e.to_string())
            }
            Err(e) => DbOperation::failed(format!("restore task failed: {}", e)),
        }
    }
}

async fn inspect(dir: PathBuf) -> DbValidation {
    match tokio::task::spawn_blocking(move || inspect_tree(&dir)).await {
        Ok(validation) => validation,
        Err(e) => DbValidation::errored(format!("validation task failed: {}", e)),
    }
}

fn inspect_tree(dir: &Path) -> DbValidation {
    if !dir.is_dir() {
        return DbValidation {
            status: VirusUpdateStatus::unusable("unknown"),
            failure: Some(ValidationFailure::Missing),
        };
    }

    match try_inspect_tree(dir) {
        Ok(validation) => validation,
        Err(e) => {
            warn!(path = %dir.display(), "Virus database validation error: {}", e);
            DbValidation::errored(e.to_string())
        }
    }
}

fn try_inspect_tree(dir: &Path) -> Result<DbValidation> {
    let version = read_version(dir);
    let last_update = newest_mtime(dir)?;
    let failure = verify_manifest(dir)?;

    if let Some(failure) = &failure {
        debug!(path = %dir.display(), "Virus database checksum invalid: {}", failure);
    }

    Ok(DbValidation {
        status: VirusUpdateStatus {
            last_update,
            checksum_valid: failure.is_none(),
            version,
        },
        failure,
    })
}

fn read_version(dir: &Path) -> String {
    for name in VERSION_SOURCES {
        let path = dir.join(name);
        let Ok(mut file) = fs::File::open(&path) else {
            continue;
        };
        let mut header = vec![0u8; HEADER_LEN];
        let Ok(read) = read_up_to(&mut file, &mut header) else {
            continue;
        };
        match Parser::parse_database_header(&String::from_utf8_lossy(&header[..read])) {
            Ok(parsed) => return parsed.version.to_string(),
            Err(e) => debug!(path = %path.display(), "Unreadable database header: {}", e),
        }
    }
    "unknown".to_string()
}

fn read_up_to(file: &mut fs::File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn newest_mtime(dir: &Path) -> Result<DateTime<Utc>> {
    let mut newest = DateTime::<Utc>::UNIX_EPOCH;
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(|e| Error::Io(io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let modified: DateTime<Utc> = entry
            .metadata()
            .map_err(|e| Error::Io(io::Error::other(e.to_string())))?
            .modified()?
            .into();
        if modified > newest {
            newest = modified;
        }
    }
    Ok(newest)
}

fn verify_manifest(dir: &Path) -> Result<Option<ValidationFailure>> {
    let manifest = match fs::read_to_string(dir.join(MANIFEST_FILE)) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Some(ValidationFailure::ManifestMissing))
        }
        Err(e) => return Err(e.into()),
    };

    let mut listed = HashSet::new();
    for (idx, line) in manifest.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let Some((expected, relative)) = parse_manifest_line(line) else {
            return Ok(Some(ValidationFailure::ManifestInvalid { line: idx + 1 }));
        };

        let path = dir.join(relative);
        let actual = match sha256_file(&path) {
            Ok(digest) => digest,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Some(ValidationFailure::FileMissing {
                    file: relative.to_string(),
                }))
            }
            Err(e) => return Err(e.into()),
        };

        if !actual.eq_ignore_ascii_case(expected) {
            return Ok(Some(ValidationFailure::ChecksumMismatch {
                file: relative.to_string(),
            }));
        }
        listed.insert(relative.to_string());
    }

    if listed.is_empty() {
        return Ok(Some(ValidationFailure::ManifestEmpty));
    }
    Ok(find_unlisted(dir, &listed)?.map(|file| ValidationFailure::UnlistedFile { file }))
}

/// First regular file in `dir` that the manifest does not cover.
fn find_unlisted(dir: &Path, listed: &HashSet<String>) -> Result<Option<String>> {
    let staging = format!("{}.tmp", MANIFEST_FILE);
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|_| Error::InvalidState(format!("{:?} escaped {:?}", entry.path(), dir)))?
            .to_string_lossy()
            .replace('\\', "/");
        if relative == MANIFEST_FILE || relative == staging {
            continue;
        }
        if !listed.contains(&relative) {
            return Ok(Some(relative));
        }
    }
    Ok(None)
}

/// `<64 hex>  <relative path>` or `<64 hex> *<relative path>`.
fn parse_manifest_line(line: &str) -> Option<(&str, &str)> {
    let (digest, rest) = line.split_once(' ')?;
    let relative = rest.strip_prefix(' ').or_else(|| rest.strip_prefix('*'))?;

    if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let escapes = Path::new(relative)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if relative.is_empty() || escapes {
        return None;
    }
    Some((digest, relative))
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn write_manifest(dir: &Path) -> Result<usize> {
    let mut lines = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|_| Error::InvalidState(format!("{:?} escaped {:?}", entry.path(), dir)))?;
        if relative == Path::new(MANIFEST_FILE) {
            continue;
        }
        let relative = relative.to_string_lossy().replace('\\', "/");
        lines.push(format!("{}  {}", sha256_file(entry.path())?, relative));
    }

    if lines.is_empty() {
        return Err(Error::DatabaseCorrupted(
            "database directory contains no files".to_string(),
        ));
    }

    let staging = dir.join(format!("{}.tmp", MANIFEST_FILE));
    fs::write(&staging, format!("{}\n", lines.join("\n")))?;
    fs::rename(&staging, dir.join(MANIFEST_FILE))?;
    Ok(lines.len())
}

/// Replaces `target` with a full copy of `source`.
fn replace_tree(source: &Path, target: &Path) -> Result<()> {
    let staging = sibling(target, "staging");
    if let Err(e) = copy_tree(source, &staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    let aside = sibling(target, "previous");
    let had_target = target.exists();
    if had_target {
        fs::rename(target, &aside).map_err(|e| Error::filesystem("rename", target, e))?;
    }

    if let Err(e) = fs::rename(&staging, target) {
        if had_target {
            if let Err(rollback) = fs::rename(&aside, target) {
                error!(
                    previous = %aside.display(),
                    target = %target.display(),
                    "Could not put the replaced tree back: {}",
                    rollback
                );
            }
        }
        let _ = fs::remove_dir_all(&staging);
        return Err(Error::filesystem("rename", &staging, e));
    }

    if had_target {
        if let Err(e) = fs::remove_dir_all(&aside) {
            warn!(path = %aside.display(), "Could not remove replaced tree: {}", e);
        }
    }
    Ok(())
}

fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    fs::create_dir_all(destination).map_err(|e| Error::filesystem("create_dir", destination, e))?;

    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| Error::Io(io::Error::other(e.to_string())))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| Error::InvalidState(format!("{:?} escaped {:?}", entry.path(), source)))?;
        let target_path = destination.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target_path)
                .map_err(|e| Error::filesystem("create_dir", &target_path, e))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target_path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::filesystem("create_dir", parent, e))?;
            }
            fs::copy(entry.path(), &target_path)
                .map_err(|e| Error::filesystem("copy", &target_path, e))?;
        } else {
            debug!(path = %entry.path().display(), "Skipping non-regular database entry");
        }
    }

    Ok(())
}

fn sibling(target: &Path, tag: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "virus_db".to_string());
    let stamp = Utc::now().format("%Y%m%d%H%M%S%f");
    target.with_file_name(format!(".{}.{}-{}-{}", name, tag, stamp, std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clamav::{EngineVerdict, Version};
    use async_trait::async_trait;
    use mockall::mock;
    use tempfile::TempDir;

    mock! {
        pub ClamAV {}

        #[async_trait]
        impl ClamAVClient for ClamAV {
            async fn ping(&self) -> Result<bool>;
            async fn version(&self) -> Result<Version>;
            async fn scan(&self, path: &Path) -> Result<EngineVerdict>;
            async fn reload(&self) -> Result<()>;
        }
    }

    fn cvd_header(version: u32) -> Vec<u8> {
        let mut header = format!(
            "ClamAV-VDB:18 Oct 2026 04-10 +0000:{}:2041000:90:d41d8cd98f00b204e9800998ecf8427e:x:builder:1792210200",
            version
        )
        .into_bytes();
        header.resize(HEADER_LEN, b' ');
        header
    }

    fn write_database(dir: &Path, version: u32) {
        fs::create_dir_all(dir.join("extra")).unwrap();
        let mut daily = cvd_header(version);
        daily.extend_from_slice(b"signature body bytes");
        fs::write(dir.join("daily.cvd"), daily).unwrap();
        fs::write(dir.join("main.cvd"), cvd_header(62)).unwrap();
        fs::write(dir.join("extra/local.ign2"), b"Eicar-Test-Signature\n").unwrap();
        write_manifest(dir).unwrap();
    }

    fn manager(temp_dir: &TempDir, client: MockClamAV) -> VirusDbManager {
        VirusDbManager::new(
            temp_dir.path().join("virus_db"),
            temp_dir.path().join("virus_db_backup"),
            Arc::new(client),
        )
    }

    #[test]
    fn test_parse_manifest_line() {
        let digest = "a".repeat(64);
        assert_eq!(
            parse_manifest_line(&format!("{}  daily.cvd", digest)),
            Some((digest.as_str(), "daily.cvd"))
        );
        assert_eq!(
            parse_manifest_line(&format!("{} *sub/main.cvd", digest)),
            Some((digest.as_str(), "sub/main.cvd"))
        );
        assert!(parse_manifest_line("abc  daily.cvd").is_none());
        assert!(parse_manifest_line(&format!("{}  ../etc/passwd", digest)).is_none());
        assert!(parse_manifest_line(&format!("{}  /etc/passwd", digest)).is_none());
        assert!(parse_manifest_line(&digest).is_none());
    }

    #[tokio::test]
    async fn test_validate_missing_database() {
        let temp_dir = TempDir::new().unwrap();
        let db = manager(&temp_dir, MockClamAV::new());

        let validation = db.validate().await;
        assert!(!validation.status.checksum_valid);
        assert_eq!(validation.status.version, "unknown");
        assert_eq!(validation.status.last_update, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(validation.failure, Some(ValidationFailure::Missing));
        assert!(validation.is_corrupted());
    }

    #[tokio::test]
    async fn test_validate_healthy_database() {
        let temp_dir = TempDir::new().unwrap();
        let db = manager(&temp_dir, MockClamAV::new());
        write_database(db.live_path(), 27412);

        let validation = db.validate().await;
        assert!(validation.is_valid());
        assert!(validation.failure.is_none());
        assert_eq!(validation.status.version, "27412");
        assert!(validation.status.last_update > DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_validate_detects_tampering() {
        let temp_dir = TempDir::new().unwrap();
        let db = manager(&temp_dir, MockClamAV::new());
        write_database(db.live_path(), 27412);

        fs::write(db.live_path().join("extra/local.ign2"), b"tampered").unwrap();

        let validation = db.validate().await;
        assert!(!validation.is_valid());
        assert_eq!(
            validation.failure,
            Some(ValidationFailure::ChecksumMismatch {
                file: "extra/local.ign2".to_string()
            })
        );
        assert_eq!(validation.status.version, "27412");
    }

    #[tokio::test]
    async fn test_validate_without_manifest_or_with_deleted_file() {
        let temp_dir = TempDir::new().unwrap();
        let db = manager(&temp_dir, MockClamAV::new());
        write_database(db.live_path(), 1);

        fs::remove_file(db.live_path().join("main.cvd")).unwrap();
        assert_eq!(
            db.validate().await.failure,
            Some(ValidationFailure::FileMissing {
                file: "main.cvd".to_string()
            })
        );

        fs::remove_file(db.live_path().join(MANIFEST_FILE)).unwrap();
        assert_eq!(
            db.validate().await.failure,
            Some(ValidationFailure::ManifestMissing)
        );
    }

    #[tokio::test]
    async fn test_unlisted_file_is_corruption() {
        let temp_dir = TempDir::new().unwrap();
        let db = manager(&temp_dir, MockClamAV::new());
        write_database(db.live_path(), 27412);
        fs::write(db.live_path().join("extra/rogue.ndb"), b"Rogue:0:*:41414141").unwrap();

        let validation = db.validate().await;
        assert!(!validation.is_valid());
        assert!(validation.is_corrupted());
        assert_eq!(
            validation.failure,
            Some(ValidationFailure::UnlistedFile {
                file: "extra/rogue.ndb".to_string()
            })
        );

        let op = db.backup().await;
        assert!(!op.success);
        assert!(!db.backup_path().join("extra/rogue.ndb").exists());

        // Sealing again adopts the file.
        assert!(db.seal().await.success);
        assert!(db.validate().await.is_valid());
    }

    #[test]
    fn test_failed_copy_leaves_target_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let live = temp_dir.path().join("virus_db");
        write_database(&live, 27412);
        let before = fs::read(live.join("daily.cvd")).unwrap();

        let result = replace_tree(&temp_dir.path().join("vanished_backup"), &live);

        assert!(result.is_err());
        assert_eq!(fs::read(live.join("daily.cvd")).unwrap(), before);
        assert!(inspect_tree(&live).is_valid());
        let leftovers: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "staging dirs left behind: {:?}", leftovers);
    }

    #[tokio::test]
    async fn test_version_unknown_without_container_header() {
        let temp_dir = TempDir::new().unwrap();
        let db = manager(&temp_dir, MockClamAV::new());
        fs::create_dir_all(db.live_path()).unwrap();
        fs::write(db.live_path().join("custom.ndb"), b"Sig:0:*:deadbeef").unwrap();
        assert!(db.seal().await.success);

        let validation = db.validate().await;
        assert!(validation.is_valid());
        assert_eq!(validation.status.version, "unknown");
    }

    #[tokio::test]
    async fn test_seal_requires_files() {
        let temp_dir = TempDir::new().unwrap();
        let db = manager(&temp_dir, MockClamAV::new());

        assert!(!db.seal().await.success);

        fs::create_dir_all(db.live_path()).unwrap();
        let op = db.seal().await;
        assert!(!op.success);
        assert!(op.reason.unwrap().contains("no files"));
    }

    #[tokio::test]
    async fn test_backup_requires_live_database() {
        let temp_dir = TempDir::new().unwrap();
        let db = manager(&temp_dir, MockClamAV::new());

        let op = db.backup().await;
        assert!(!op.success);
        assert_eq!(op.reason.as_deref(), Some("live database does not exist"));
        assert!(!db.backup_path().exists());
    }

    #[tokio::test]
    async fn test_backup_refuses_corrupted_database() {
        let temp_dir = TempDir::new().unwrap();
        let db = manager(&temp_dir, MockClamAV::new());
        write_database(db.live_path(), 5);
        fs::write(db.live_path().join("daily.cvd"), b"truncated").unwrap();

        let op = db.backup().await;
        assert!(!op.success);
        assert!(op.reason.unwrap().contains("not valid"));
        assert!(!db.backup_path().exists());
    }

    #[tokio::test]
    async fn test_backup_then_restore_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let db = manager(&temp_dir, MockClamAV::new());
        write_database(db.live_path(), 27000);
        let original_daily = fs::read(db.live_path().join("daily.cvd")).unwrap();

        assert!(db.backup().await.success);
        // A second backup replaces the first one wholesale.
        assert!(db.backup().await.success);
        assert!(db.backup_path().join("extra/local.ign2").exists());

        fs::remove_dir_all(db.live_path()).unwrap();
        assert!(db.restore_from_backup().await.success);

        assert_eq!(fs::read(db.live_path().join("daily.cvd")).unwrap(), original_daily);
        assert!(db.validate().await.is_valid());

        let leftovers: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "staging dirs left behind: {:?}", leftovers);
    }

    #[tokio::test]
    async fn test_restore_without_backup_fails() {
        let temp_dir = TempDir::new().unwrap();
        let db = manager(&temp_dir, MockClamAV::new());
        write_database(db.live_path(), 3);

        let op = db.restore_from_backup().await;
        assert!(!op.success);
        assert_eq!(op.reason.as_deref(), Some("no backup available"));
        assert!(db.validate().await.is_valid());
    }

    #[tokio::test]
    async fn test_restore_refuses_corrupted_backup() {
        let temp_dir = TempDir::new().unwrap();
        let db = manager(&temp_dir, MockClamAV::new());
        write_database(db.live_path(), 3);
        assert!(db.backup().await.success);
        fs::write(db.backup_path().join("main.cvd"), b"garbage").unwrap();

        let op = db.restore_from_backup().await;
        assert!(!op.success);
        assert!(op.reason.unwrap().contains("backup is not valid"));
    }

    #[tokio::test]
    async fn test_reload_engine() {
        let temp_dir = TempDir::new().unwrap();
        let mut client = MockClamAV::new();
        client.expect_reload().times(1).returning(|| Ok(()));
        assert!(manager(&temp_dir, client).reload_engine().await);

        let mut failing = MockClamAV::new();
        failing
            .expect_reload()
            .times(1)
            .returning(|| Err(Error::Connection("refused".to_string())));
        assert!(!manager(&temp_dir, failing).reload_engine().await);
    }

    #[tokio::test]
    async fn test_single_flight_session() {
        let temp_dir = TempDir::new().unwrap();
        let db = manager(&temp_dir, MockClamAV::new());

        let session = db.try_exclusive().unwrap();
        assert!(db.is_busy());
        assert!(db.try_exclusive().is_none());

        drop(session);
        assert!(!db.is_busy());
        assert!(db.try_exclusive().is_some());
    }
}
