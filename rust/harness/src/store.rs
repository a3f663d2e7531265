//! Durable output storage.
//!
//! Training outputs are written into a mounted volume. A commit flushes every file
//! changed since the previous commit to disk and records a snapshot of the volume in
//! a journal, so completed jobs stay durable even if a later job fails.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Seek, SeekFrom},
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// Directory inside the mount that holds the journal. Never part of a snapshot.
pub const JOURNAL_DIR: &str = ".volume";
const JOURNAL_FILE: &str = "journal.json";

/// Storage that training outputs are written into.
pub trait OutputStore {
    /// Location jobs write their outputs to.
    fn mount_dir(&self) -> &Path;

    /// Create the mount location if needed. Idempotent.
    fn ensure_mount(&self) -> Result<(), StoreError> {
        let dir = self.mount_dir();
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Io(dir.to_path_buf(), e))
    }

    /// Make all writes since the last commit durable.
    ///
    /// Committing twice with nothing written in between has no effect.
    fn commit(&self) -> Result<CommitOutcome, StoreError>;
}

/// Result of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing changed since the last commit.
    Unchanged,
    /// A new snapshot was recorded.
    Committed {
        sequence: u64,
        /// Files added or modified.
        changed: usize,
        /// Files removed.
        removed: usize,
    },
}

/// Size and modification time of a file, as recorded in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub len: u64,
    pub modified_ms: u64,
}

/// Committed state of a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Journal {
    /// Number of commits so far.
    pub sequence: u64,
    pub committed_at: Option<String>,
    /// Files in the last snapshot, keyed by path relative to the mount.
    #[serde(default)]
    pub entries: BTreeMap<String, FileEntry>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

/// A local directory used as the output volume.
#[derive(Debug, Clone)]
pub struct Volume {
    mount_dir: PathBuf,
}

impl Volume {
    #[must_use]
    pub fn new(mount_dir: impl AsRef<Path>) -> Self {
        Self {
            mount_dir: mount_dir.as_ref().to_path_buf(),
        }
    }

    fn journal_path(&self) -> PathBuf {
        self.mount_dir.join(JOURNAL_DIR).join(JOURNAL_FILE)
    }

    /// Load the journal, or an empty one if nothing has been committed yet.
    pub fn journal(&self) -> Result<Journal, StoreError> {
        let path = self.journal_path();
        if !path.exists() {
            return Ok(Journal::default());
        }

        let file = File::open(&path).map_err(|e| StoreError::Io(path.clone(), e))?;
        file.lock_shared()
            .map_err(|e| StoreError::Lock(path.clone(), e))?;

        let journal = serde_json::from_reader(BufReader::new(&file))
            .map_err(|e| StoreError::Parse(path.clone(), e.to_string()))?;

        file.unlock().map_err(|e| StoreError::Lock(path, e))?;

        Ok(journal)
    }

    /// Update the journal atomically with a closure (holds the lock throughout).
    fn update_journal<F>(&self, f: F) -> Result<Journal, StoreError>
    where
        F: FnOnce(&mut Journal),
    {
        let path = self.journal_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(parent.to_path_buf(), e))?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::Io(path.clone(), e))?;

        file.lock_exclusive()
            .map_err(|e| StoreError::Lock(path.clone(), e))?;

        let mut journal: Journal = if file.metadata().map(|m| m.len()).unwrap_or(0) > 0 {
            serde_json::from_reader(BufReader::new(&file))
                .map_err(|e| StoreError::Parse(path.clone(), e.to_string()))?
        } else {
            Journal::default()
        };

        f(&mut journal);

        file.set_len(0)
            .map_err(|e| StoreError::Io(path.clone(), e))?;
        (&file)
            .seek(SeekFrom::Start(0))
            .map_err(|e| StoreError::Io(path.clone(), e))?;

        serde_json::to_writer_pretty(BufWriter::new(&file), &journal)
            .map_err(|e| StoreError::Write(path.clone(), e.to_string()))?;
        file.sync_all()
            .map_err(|e| StoreError::Io(path.clone(), e))?;

        file.unlock().map_err(|e| StoreError::Lock(path, e))?;

        Ok(journal)
    }

    /// Walk the mount and record every regular file.
    pub fn snapshot(&self) -> Result<BTreeMap<String, FileEntry>, StoreError> {
        let mut entries = BTreeMap::new();

        let walker = WalkDir::new(&self.mount_dir)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !(e.depth() == 1 && e.file_name() == JOURNAL_DIR));

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map_or_else(|| self.mount_dir.clone(), Path::to_path_buf);
                StoreError::Io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let meta = entry
                .metadata()
                .map_err(|e| StoreError::Io(entry.path().to_path_buf(), e.into()))?;
            let modified_ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_millis() as u64);

            let rel = entry
                .path()
                .strip_prefix(&self.mount_dir)
                .unwrap_or(entry.path())
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            entries.insert(
                rel,
                FileEntry {
                    len: meta.len(),
                    modified_ms,
                },
            );
        }

        Ok(entries)
    }
}

/// Flush a file's data to disk. Files deleted since the snapshot are ignored.
fn sync_file(path: &Path) -> Result<(), StoreError> {
    match File::open(path).and_then(|f| f.sync_all()) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(StoreError::Io(path.to_path_buf(), e))
        }
        _ => Ok(()),
    }
}

impl OutputStore for Volume {
    fn mount_dir(&self) -> &Path {
        &self.mount_dir
    }

    fn commit(&self) -> Result<CommitOutcome, StoreError> {
        self.ensure_mount()?;

        let snapshot = self.snapshot()?;
        let previous = self.journal()?;
        if previous.entries == snapshot {
            tracing::debug!("Volume {} unchanged", self.mount_dir.display());
            return Ok(CommitOutcome::Unchanged);
        }

        let changed: Vec<&String> = snapshot
            .iter()
            .filter(|(path, entry)| previous.entries.get(*path) != Some(entry))
            .map(|(path, _)| path)
            .collect();
        let removed = previous
            .entries
            .keys()
            .filter(|path| !snapshot.contains_key(*path))
            .count();

        for rel in &changed {
            sync_file(&self.mount_dir.join(rel))?;
        }
        let changed = changed.len();

        let journal = self.update_journal(|journal| {
            journal.sequence += 1;
            journal.committed_at = Some(now_timestamp());
            journal.entries = snapshot;
        })?;

        tracing::info!(
            "Committed volume {} (#{}, {} changed, {} removed)",
            self.mount_dir.display(),
            journal.sequence,
            changed,
            removed
        );

        Ok(CommitOutcome::Committed {
            sequence: journal.sequence,
            changed,
            removed,
        })
    }
}

/// Get current local time as a string.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Errors that can occur with the output store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to lock journal {0}: {1}")]
    Lock(PathBuf, std::io::Error),
    #[error("failed to parse journal {0}: {1}")]
    Parse(PathBuf, String),
    #[error("failed to write journal {0}: {1}")]
    Write(PathBuf, String),
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_ensure_mount_idempotent() {
        let dir = tempdir().unwrap();
        let volume = Volume::new(dir.path().join("a/b/out"));
        volume.ensure_mount().unwrap();
        volume.ensure_mount().unwrap();
        assert!(volume.mount_dir().is_dir());
    }

    #[test]
    fn test_empty_volume_commit_is_noop() {
        let dir = tempdir().unwrap();
        let volume = Volume::new(dir.path());
        assert_eq!(volume.commit().unwrap(), CommitOutcome::Unchanged);
        assert!(!dir.path().join(JOURNAL_DIR).exists());
    }

    #[test]
    fn test_commit_records_snapshot() {
        let dir = tempdir().unwrap();
        let volume = Volume::new(dir.path());
        std::fs::create_dir_all(dir.path().join("lora/samples")).unwrap();
        std::fs::write(dir.path().join("lora/model.safetensors"), b"weights").unwrap();
        std::fs::write(dir.path().join("lora/samples/0.png"), b"png").unwrap();

        let outcome = volume.commit().unwrap();
        assert_eq!(
            outcome,
            CommitOutcome::Committed {
                sequence: 1,
                changed: 2,
                removed: 0
            }
        );

        let journal = volume.journal().unwrap();
        assert_eq!(journal.sequence, 1);
        assert!(journal.committed_at.is_some());
        assert_eq!(journal.entries["lora/model.safetensors"].len, 7);
        assert!(journal.entries.contains_key("lora/samples/0.png"));
    }

    #[test]
    fn test_second_commit_unchanged() {
        let dir = tempdir().unwrap();
        let volume = Volume::new(dir.path());
        std::fs::write(dir.path().join("model.safetensors"), b"weights").unwrap();

        assert!(matches!(
            volume.commit().unwrap(),
            CommitOutcome::Committed { sequence: 1, .. }
        ));
        let before = std::fs::read_to_string(volume.journal_path()).unwrap();

        assert_eq!(volume.commit().unwrap(), CommitOutcome::Unchanged);
        let after = std::fs::read_to_string(volume.journal_path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_detects_modification_and_removal() {
        let dir = tempdir().unwrap();
        let volume = Volume::new(dir.path());
        std::fs::write(dir.path().join("a.bin"), b"1").unwrap();
        std::fs::write(dir.path().join("b.bin"), b"2").unwrap();
        volume.commit().unwrap();

        std::fs::write(dir.path().join("a.bin"), b"longer").unwrap();
        std::fs::remove_file(dir.path().join("b.bin")).unwrap();

        assert_eq!(
            volume.commit().unwrap(),
            CommitOutcome::Committed {
                sequence: 2,
                changed: 1,
                removed: 1
            }
        );
        let journal = volume.journal().unwrap();
        assert_eq!(journal.entries.len(), 1);
    }

    #[test]
    fn test_journal_excluded_from_snapshot() {
        let dir = tempdir().unwrap();
        let volume = Volume::new(dir.path());
        std::fs::write(dir.path().join("a.bin"), b"1").unwrap();
        volume.commit().unwrap();

        let snapshot = volume.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.keys().all(|k| !k.starts_with(JOURNAL_DIR)));
    }
}
