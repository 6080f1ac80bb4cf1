use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::QuarantinePaths;
use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 128;
const MAX_NAME_ATTEMPTS: usize = 16;

static NAME_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Lifecycle folder a quarantined file can sit in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Incoming,
    Scanning,
    Clean,
    Infected,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Incoming, Stage::Scanning, Stage::Clean, Stage::Infected];

    pub fn prefix(self) -> &'static str {
        match self {
            Stage::Incoming => "incoming",
            Stage::Scanning => "scanning",
            Stage::Clean => "clean",
            Stage::Infected => "infected",
        }
    }

    pub fn dir(self, paths: &QuarantinePaths) -> &Path {
        match self {
            Stage::Incoming => &paths.incoming,
            Stage::Scanning => &paths.scanning,
            Stage::Clean => &paths.clean,
            Stage::Infected => &paths.infected,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderCounts {
    pub incoming: usize,
    pub scanning: usize,
    pub clean: usize,
    pub infected: usize,
}

/// Moves uploads between the quarantine folders, one `rename` per transition.
pub struct QuarantineManager {
    paths: QuarantinePaths,
}

impl QuarantineManager {
    pub fn new(paths: QuarantinePaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &QuarantinePaths {
        &self.paths
    }

    pub async fn ensure_folder_structure(&self) -> Result<()> {
        self.paths.ensure_folder_structure().await
    }

    /// Writes an upload into `incoming/` as `incoming_<timestamp>_<name>`.
    pub async fn move_to_incoming(&self, bytes: &[u8], original_filename: &str) -> Result<PathBuf> {
        let dir = Stage::Incoming.dir(&self.paths);
        fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::filesystem("create_dir", dir, e))?;

        let original = sanitize_filename(original_filename);

        for _ in 0..MAX_NAME_ATTEMPTS {
            let target = dir.join(unique_name(Stage::Incoming, &original));
            let mut file = match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&target)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(Error::filesystem("create", &target, e)),
            };

            file.write_all(bytes)
                .await
                .map_err(|e| Error::filesystem("write", &target, e))?;
            file.sync_all()
                .await
                .map_err(|e| Error::filesystem("sync", &target, e))?;

            debug!(path = %target.display(), size = bytes.len(), "Upload written to incoming");
            return Ok(target);
        }

        Err(Error::InvalidState(format!(
            "Could not allocate a unique incoming name for {}",
            original
        )))
    }

    pub async fn move_to_scanning(&self, path: &Path) -> Result<PathBuf> {
        self.transition(path, Stage::Scanning).await
    }

    pub async fn mark_safe(&self, path: &Path) -> Result<PathBuf> {
        self.require_stage(path, Stage::Scanning)?;
        let target = self.transition(path, Stage::Clean).await?;
        info!(path = %target.display(), "File marked clean");
        Ok(target)
    }

    pub async fn mark_infected(&self, path: &Path) -> Result<PathBuf> {
        self.require_stage(path, Stage::Scanning)?;
        let target = self.transition(path, Stage::Infected).await?;
        warn!(path = %target.display(), "File moved to infected quarantine");
        Ok(target)
    }

    /// Deletes an upload that was refused before it reached the engine.
    pub async fn discard(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)
            .await
            .map_err(|e| Error::filesystem("remove", path, e))?;
        debug!(path = %path.display(), "Rejected upload removed");
        Ok(())
    }

    pub async fn folder_counts(&self) -> Result<FolderCounts> {
        Ok(FolderCounts {
            incoming: count_files(Stage::Incoming.dir(&self.paths)).await?,
            scanning: count_files(Stage::Scanning.dir(&self.paths)).await?,
            clean: count_files(Stage::Clean.dir(&self.paths)).await?,
            infected: count_files(Stage::Infected.dir(&self.paths)).await?,
        })
    }

    async fn transition(&self, source: &Path, stage: Stage) -> Result<PathBuf> {
        let metadata = fs::metadata(source)
            .await
            .map_err(|e| Error::filesystem("stat", source, e))?;
        if !metadata.is_file() {
            return Err(Error::InvalidState(format!(
                "{} is not a regular file",
                source.display()
            )));
        }

        let dir = stage.dir(&self.paths);
        fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::filesystem("create_dir", dir, e))?;

        let original = source
            .file_name()
            .map(|name| original_name(&name.to_string_lossy()).to_string())
            .unwrap_or_else(|| "upload".to_string());

        for _ in 0..MAX_NAME_ATTEMPTS {
            let target = dir.join(unique_name(stage, &original));
            if fs::try_exists(&target)
                .await
                .map_err(|e| Error::filesystem("stat", &target, e))?
            {
                continue;
            }

            fs::rename(source, &target)
                .await
                .map_err(|e| Error::filesystem("rename", source, e))?;
            debug!(
                from = %source.display(),
                to = %target.display(),
                stage = stage.prefix(),
                "Quarantine transition"
            );
            return Ok(target);
        }

        Err(Error::InvalidState(format!(
            "Could not allocate a unique {} name for {}",
            stage.prefix(),
            original
        )))
    }

    fn require_stage(&self, path: &Path, stage: Stage) -> Result<()> {
        if is_inside(stage.dir(&self.paths), path) {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "{} is not in the {} folder",
                path.display(),
                stage.prefix()
            )))
        }
    }
}

fn is_inside(dir: &Path, path: &Path) -> bool {
    match path.parent() {
        Some(parent) if parent == dir => true,
        Some(parent) => match (parent.canonicalize(), dir.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        },
        None => false,
    }
}

async fn count_files(dir: &Path) -> Result<usize> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::filesystem("read_dir", dir, e)),
    };

    let mut count = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::filesystem("read_dir", dir, e))?
    {
        if entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false)
        {
            count += 1;
        }
    }
    Ok(count)
}

/// `<prefix>_<YYYYmmddTHHMMSS.ffffff>-<seq>_<original>`
pub fn unique_name(stage: Stage, original: &str) -> String {
    let stamp = Local::now().format("%Y%m%dT%H%M%S%.6f");
    let seq = NAME_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{}_{}-{:04}_{}", stage.prefix(), stamp, seq, original)
}

/// Recovers the caller's filename from a name produced by [`unique_name`].
/// Names that do not follow the pattern are returned unchanged.
pub fn original_name(file_name: &str) -> &str {
    for stage in Stage::ALL {
        let Some(rest) = file_name
            .strip_prefix(stage.prefix())
            .and_then(|r| r.strip_prefix('_'))
        else {
            continue;
        };
        let Some((stamp, original)) = rest.split_once('_') else {
            continue;
        };
        let looks_like_stamp = stamp.len() > 16
            && stamp.as_bytes()[8] == b'T'
            && stamp.as_bytes()[..8].iter().all(u8::is_ascii_digit);
        if looks_like_stamp && !original.is_empty() {
            return original;
        }
    }
    file_name
}

/// Reduces a caller-supplied filename to a safe single path component.
pub fn sanitize_filename(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();

    let cleaned: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        return "upload".to_string();
    }

    let chars: Vec<char> = cleaned.chars().collect();
    if chars.len() > MAX_NAME_LEN {
        chars[chars.len() - MAX_NAME_LEN..].iter().collect()
    } else {
        cleaned.to_string()
    }
}
