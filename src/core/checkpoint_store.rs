//! Durable per-environment checkpoint files.
//!
//! Layout inside the deployments directory:
//!
//! ```text
//! <env>@partial.json        working copy, rewritten after every commit
//! <env>@<unix-millis>.json  archived record of a completed run
//! ```
//!
//! Writes go to a temp file in the same directory which is fsynced and then
//! renamed over the target, so a reader never sees a half-written document.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::NamedTempFile;
use tokio::fs;

use crate::domain::{Checkpoint, Environment};
use crate::error::CheckpointError;

const PARTIAL_SUFFIX: &str = "@partial.json";

/// Consecutive timestamps tried before giving up on archiving
const ARCHIVE_SLOTS: i64 = 16;

/// File-backed checkpoint storage
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding checkpoints, records and journals
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the working copy for an environment
    pub fn partial_path(&self, env: &Environment) -> PathBuf {
        self.dir.join(format!("{}{}", env, PARTIAL_SUFFIX))
    }

    fn record_path(&self, env: &Environment, millis: i64) -> PathBuf {
        self.dir.join(format!("{}@{}.json", env, millis))
    }

    /// Load the working copy, or an empty checkpoint if there is none
    pub async fn load(&self, env: &Environment) -> Result<Checkpoint, CheckpointError> {
        let path = self.partial_path(env);
        match fs::read_to_string(&path).await {
            Ok(content) => parse(&path, &content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Checkpoint::new()),
            Err(source) => Err(CheckpointError::Read { path, source }),
        }
    }

    /// Atomically replace the working copy
    pub async fn save(&self, env: &Environment, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let json = checkpoint.to_json_pretty()?;
        let dir = self.dir.clone();
        let path = self.partial_path(env);

        run_blocking(move || {
            let tmp = write_temp(&dir, &path, json.as_bytes())?;
            tmp.persist(&path).map_err(|e| CheckpointError::Write {
                path: path.clone(),
                source: e.error,
            })?;
            Ok(())
        })
        .await
    }

    /// Write the final checkpoint as a timestamped record and remove the
    /// working copy. Returns the record path.
    ///
    /// An existing record is never overwritten; if the timestamp is taken,
    /// the next free millisecond is used.
    pub async fn archive(
        &self,
        env: &Environment,
        checkpoint: &Checkpoint,
    ) -> Result<PathBuf, CheckpointError> {
        let json = checkpoint.to_json_pretty()?;
        let dir = self.dir.clone();
        let now = Utc::now().timestamp_millis();
        let candidates: Vec<PathBuf> = (0..ARCHIVE_SLOTS)
            .map(|offset| self.record_path(env, now + offset))
            .collect();

        let record = run_blocking(move || {
            let mut tmp = write_temp(&dir, &candidates[0], json.as_bytes())?;
            for candidate in &candidates {
                match tmp.persist_noclobber(candidate) {
                    Ok(_) => return Ok(candidate.clone()),
                    Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => tmp = e.file,
                    Err(e) => {
                        return Err(CheckpointError::Write {
                            path: candidate.clone(),
                            source: e.error,
                        })
                    }
                }
            }
            Err(CheckpointError::ArchiveExists(candidates[candidates.len() - 1].clone()))
        })
        .await?;

        let partial = self.partial_path(env);
        match fs::remove_file(&partial).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(CheckpointError::Write { path: partial, source }),
        }

        Ok(record)
    }

    /// Read an archived record (or any checkpoint-shaped document)
    pub async fn load_record(path: &Path) -> Result<Checkpoint, CheckpointError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| CheckpointError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        parse(path, &content)
    }

    /// Archived records for an environment, oldest first
    pub async fn list_records(&self, env: &Environment) -> Result<Vec<PathBuf>, CheckpointError> {
        let read_err = |source: std::io::Error| CheckpointError::Read {
            path: self.dir.clone(),
            source,
        };

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(read_err(source)),
        };

        let prefix = format!("{}@", env);
        let mut records: Vec<(i64, PathBuf)> = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            let millis = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|stamp| stamp.parse::<i64>().ok());

            if let Some(millis) = millis {
                records.push((millis, entry.path()));
            }
        }

        records.sort();
        Ok(records.into_iter().map(|(_, path)| path).collect())
    }
}

fn parse(path: &Path, content: &str) -> Result<Checkpoint, CheckpointError> {
    serde_json::from_str(content).map_err(|source| CheckpointError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Write `bytes` to a synced temp file next to `target`
fn write_temp(dir: &Path, target: &Path, bytes: &[u8]) -> Result<NamedTempFile, CheckpointError> {
    let write_err = |source: std::io::Error| CheckpointError::Write {
        path: target.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(dir).map_err(write_err)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    Ok(tmp)
}

async fn run_blocking<T, F>(f: F) -> Result<T, CheckpointError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CheckpointError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| CheckpointError::Write {
        path: PathBuf::new(),
        source: std::io::Error::new(std::io::ErrorKind::Other, e),
    })?
}
