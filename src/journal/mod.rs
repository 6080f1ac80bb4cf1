use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Append-only text log, one record per line.
///
/// Each record is written with a single `write_all` on a file opened in
/// append mode while holding the in-process lock, so lines from concurrent
/// writers never interleave.
pub struct Journal {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Journal {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, line: &str) -> Result<()> {
        let mut record = line.replace(['\n', '\r'], " ");
        record.push('\n');

        let _guard = self.lock.lock().await;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::filesystem("create_dir", parent, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::filesystem("open_log", &self.path, e))?;
        file.write_all(record.as_bytes())
            .await
            .map_err(|e| Error::filesystem("append_log", &self.path, e))?;
        file.flush()
            .await
            .map_err(|e| Error::filesystem("append_log", &self.path, e))?;
        Ok(())
    }

    /// All lines written so far; empty when the log does not exist yet.
    pub async fn lines(&self) -> Result<Vec<String>> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::filesystem("read_log", &self.path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_creates_parent_and_file() {
        let temp_dir = TempDir::new().unwrap();
        let journal = Journal::new(temp_dir.path().join("logs/update.log"));

        assert!(journal.lines().await.unwrap().is_empty());

        journal.append("first").await.unwrap();
        journal.append("second").await.unwrap();

        assert_eq!(journal.lines().await.unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_embedded_newlines_stay_on_one_line() {
        let temp_dir = TempDir::new().unwrap();
        let journal = Journal::new(temp_dir.path().join("scan_activity.log"));

        journal.append("engine said:\nboom\r\n").await.unwrap();

        let lines = journal.lines().await.unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("engine said: boom"));
    }

    #[tokio::test]
    async fn test_concurrent_appends_do_not_interleave() {
        let temp_dir = TempDir::new().unwrap();
        let journal = Arc::new(Journal::new(temp_dir.path().join("scan_activity.log")));

        let mut handles = Vec::new();
        for i in 0..20 {
            let journal = Arc::clone(&journal);
            handles.push(tokio::spawn(async move {
                journal.append(&format!("record-{:02}", i)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut lines = journal.lines().await.unwrap();
        lines.sort();
        let expected: Vec<String> = (0..20).map(|i| format!("record-{:02}", i)).collect();
        assert_eq!(lines, expected);
    }
}
