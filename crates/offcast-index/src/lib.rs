//! Crash-durable task table backing the download engine.
#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

pub mod error;

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use offcast_events::{TaskSnapshot, TaskState};
use serde_json::Value;
use tracing::{info, warn};

pub use crate::error::{IndexError, IndexResult};

/// Newest row schema this build reads and writes.
pub const SCHEMA_VERSION: u32 = 1;

const VERSION_FILE: &str = "schema_version";
const ROW_SUFFIX: &str = ".json";
const CORRUPT_SUFFIX: &str = ".corrupt";

/// One JSON file per task under a dedicated directory, plus a schema version
/// marker. Every write lands through a temp file, fsync, and rename so a crash
/// leaves either the old row or the new one, never a torn file.
#[derive(Debug, Clone)]
pub struct TaskIndex {
    dir: PathBuf,
}

impl TaskIndex {
    /// Open (creating if needed) the index under `dir` and migrate rows
    /// written by older builds.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be prepared or the on-disk
    /// schema is newer than [`SCHEMA_VERSION`].
    pub fn open(dir: impl Into<PathBuf>) -> IndexResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| IndexError::io("open.create_dir", &dir, source))?;

        let index = Self { dir };
        let version_path = index.dir.join(VERSION_FILE);
        let found = if version_path.exists() {
            let raw = fs::read_to_string(&version_path)
                .map_err(|source| IndexError::io("open.read_version", &version_path, source))?;
            raw.trim().parse::<u32>().unwrap_or(0)
        } else {
            SCHEMA_VERSION
        };

        if found > SCHEMA_VERSION {
            return Err(IndexError::UnsupportedSchema {
                found,
                supported: SCHEMA_VERSION,
            });
        }
        if found < SCHEMA_VERSION {
            index.migrate_rows(found)?;
            info!(from = found, to = SCHEMA_VERSION, "task index migrated");
        }
        index.write_atomic(&version_path, SCHEMA_VERSION.to_string().as_bytes())?;

        Ok(index)
    }

    /// Durably persist one row, replacing any previous version.
    ///
    /// # Errors
    ///
    /// Returns an error when the row cannot be serialised or written.
    pub fn put(&self, snapshot: &TaskSnapshot) -> IndexResult<()> {
        let path = self.row_path(&snapshot.id);
        let serialised = serde_json::to_vec_pretty(snapshot)
            .map_err(|source| IndexError::json("put.serialize", &path, source))?;
        self.write_atomic(&path, &serialised)
    }

    /// Load one row, `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns an error when the row exists but cannot be read or parsed.
    pub fn get(&self, id: &str) -> IndexResult<Option<TaskSnapshot>> {
        let path = self.row_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .map_err(|source| IndexError::io("get.read", &path, source))?;
        let snapshot = serde_json::from_str(&raw)
            .map_err(|source| IndexError::json("get.parse", &path, source))?;
        Ok(Some(snapshot))
    }

    /// Delete one row. Deleting an absent row is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error when the row file exists and cannot be removed.
    pub fn remove(&self, id: &str) -> IndexResult<()> {
        let path = self.row_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(IndexError::io("remove.unlink", &path, source)),
        }
    }

    /// Load every row, quarantining unreadable ones and normalising states
    /// that cannot survive a restart: `queued` and `downloading` rows come
    /// back as `stopped`, since no fetch outlives the process. `removing`
    /// rows are returned as-is so interrupted cleanup can be re-entered.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be enumerated or a
    /// normalised row cannot be rewritten.
    pub fn load_all(&self) -> IndexResult<Vec<TaskSnapshot>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|source| IndexError::io("load_all.read_dir", &self.dir, source))?;

        let mut rows = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|source| IndexError::io("load_all.entry", &self.dir, source))?;
            let path = entry.path();
            if !Self::is_row_file(&path) {
                continue;
            }

            let parsed = fs::read_to_string(&path)
                .map_err(|source| IndexError::io("load_all.read", &path, source))
                .and_then(|raw| {
                    serde_json::from_str::<TaskSnapshot>(&raw)
                        .map_err(|source| IndexError::json("load_all.parse", &path, source))
                });

            match parsed {
                Ok(mut snapshot) => {
                    if matches!(snapshot.state, TaskState::Queued | TaskState::Downloading) {
                        snapshot.state = TaskState::Stopped;
                        self.put(&snapshot)?;
                    }
                    rows.push(snapshot);
                }
                Err(err) => {
                    self.quarantine(&path, &err);
                }
            }
        }

        rows.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    /// Directory holding the index files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn migrate_rows(&self, from: u32) -> IndexResult<()> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|source| IndexError::io("migrate.read_dir", &self.dir, source))?;
        for entry in entries {
            let entry =
                entry.map_err(|source| IndexError::io("migrate.entry", &self.dir, source))?;
            let path = entry.path();
            if !Self::is_row_file(&path) {
                continue;
            }
            let raw = fs::read_to_string(&path)
                .map_err(|source| IndexError::io("migrate.read", &path, source))?;
            let Ok(row) = serde_json::from_str::<Value>(&raw) else {
                self.quarantine(&path, &"not valid json");
                continue;
            };
            let migrated = Self::migrate_row(from, row);
            let serialised = serde_json::to_vec_pretty(&migrated)
                .map_err(|source| IndexError::json("migrate.serialize", &path, source))?;
            self.write_atomic(&path, &serialised)?;
        }
        Ok(())
    }

    // Upgrade one row written at schema `from` to SCHEMA_VERSION. Version 1
    // is the first published schema, so there is nothing to rewrite yet; new
    // version steps slot in here as the row format grows.
    fn migrate_row(from: u32, row: Value) -> Value {
        let _ = from;
        row
    }

    fn quarantine(&self, path: &Path, reason: &dyn std::fmt::Display) {
        let mut corrupt = path.as_os_str().to_owned();
        corrupt.push(CORRUPT_SUFFIX);
        warn!(
            path = %path.display(),
            reason = %reason,
            "quarantining unreadable task row"
        );
        if let Err(err) = fs::rename(path, &corrupt) {
            warn!(
                path = %path.display(),
                error = %err,
                "failed to quarantine task row; skipping it"
            );
        }
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> IndexResult<()> {
        use std::io::Write;

        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|source| IndexError::io("write.temp", &self.dir, source))?;
        temp.write_all(bytes)
            .map_err(|source| IndexError::io("write.fill", path, source))?;
        temp.as_file()
            .sync_all()
            .map_err(|source| IndexError::io("write.sync", path, source))?;
        temp.persist(path)
            .map_err(|err| IndexError::io("write.rename", path, err.error))?;
        if let Ok(dir_handle) = File::open(&self.dir) {
            let _ = dir_handle.sync_all();
        }
        Ok(())
    }

    fn is_row_file(path: &Path) -> bool {
        path.extension().and_then(|ext| ext.to_str()) == Some("json")
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| !name.ends_with(CORRUPT_SUFFIX))
    }

    fn row_path(&self, id: &str) -> PathBuf {
        use std::fmt::Write as _;

        let mut encoded = String::with_capacity(id.len() * 2);
        for byte in id.as_bytes() {
            let _ = write!(encoded, "{byte:02x}");
        }
        self.dir.join(format!("{encoded}{ROW_SUFFIX}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use offcast_events::FailureReason;
    use tempfile::TempDir;

    fn snapshot(id: &str, state: TaskState) -> TaskSnapshot {
        TaskSnapshot {
            id: id.into(),
            source: format!("https://cdn.example/{id}"),
            payload: id.as_bytes().to_vec(),
            state,
            percent_complete: 25.0,
            stop_reason: 0,
            enqueued_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn put_get_remove_round_trip() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let index = TaskIndex::open(temp.path())?;

        let row = snapshot("t/1:weird id", TaskState::Stopped);
        index.put(&row)?;
        assert_eq!(index.get("t/1:weird id")?, Some(row.clone()));

        index.remove("t/1:weird id")?;
        assert_eq!(index.get("t/1:weird id")?, None);
        index.remove("t/1:weird id")?;
        Ok(())
    }

    #[test]
    fn load_all_orders_by_enqueue_time_then_id() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let index = TaskIndex::open(temp.path())?;

        let mut early = snapshot("b", TaskState::Stopped);
        let mut late = snapshot("a", TaskState::Stopped);
        early.enqueued_at = Utc::now() - chrono::Duration::seconds(30);
        late.enqueued_at = Utc::now();
        let mut tie = snapshot("c", TaskState::Stopped);
        tie.enqueued_at = early.enqueued_at;

        index.put(&late)?;
        index.put(&tie)?;
        index.put(&early)?;

        let ids: Vec<_> = index.load_all()?.into_iter().map(|row| row.id).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        Ok(())
    }

    #[test]
    fn load_all_normalises_states_that_cannot_survive_restart() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let index = TaskIndex::open(temp.path())?;

        index.put(&snapshot("queued", TaskState::Queued))?;
        index.put(&snapshot("active", TaskState::Downloading))?;
        index.put(&snapshot("done", TaskState::Completed))?;
        index.put(&snapshot("gone", TaskState::Removing))?;
        index.put(&snapshot(
            "broken",
            TaskState::Failed {
                reason: FailureReason::Network,
            },
        ))?;

        let rows = index.load_all()?;
        let state_of = |id: &str| {
            rows.iter()
                .find(|row| row.id == id)
                .map(|row| row.state.clone())
                .expect("row present")
        };
        assert_eq!(state_of("queued"), TaskState::Stopped);
        assert_eq!(state_of("active"), TaskState::Stopped);
        assert_eq!(state_of("done"), TaskState::Completed);
        assert_eq!(state_of("gone"), TaskState::Removing);
        assert_eq!(
            state_of("broken"),
            TaskState::Failed {
                reason: FailureReason::Network
            }
        );

        // Normalisation is persisted, not just reported.
        assert_eq!(index.get("queued")?.expect("row").state, TaskState::Stopped);
        Ok(())
    }

    #[test]
    fn corrupt_rows_are_quarantined_not_fatal() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let index = TaskIndex::open(temp.path())?;

        index.put(&snapshot("good", TaskState::Stopped))?;
        let bad_path = temp.path().join("deadbeef.json");
        fs::write(&bad_path, b"{ this is not json")?;

        let rows = index.load_all()?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "good");
        assert!(!bad_path.exists());
        assert!(temp.path().join("deadbeef.json.corrupt").exists());

        // A second pass must not trip over the quarantined file.
        assert_eq!(index.load_all()?.len(), 1);
        Ok(())
    }

    #[test]
    fn open_rejects_schemas_from_the_future() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        drop(TaskIndex::open(temp.path())?);
        fs::write(temp.path().join(VERSION_FILE), "99")?;

        let err = TaskIndex::open(temp.path()).expect_err("future schema should fail");
        assert!(matches!(
            err,
            IndexError::UnsupportedSchema {
                found: 99,
                supported: SCHEMA_VERSION
            }
        ));
        Ok(())
    }

    #[test]
    fn reopen_preserves_rows() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        {
            let index = TaskIndex::open(temp.path())?;
            index.put(&snapshot("persisted", TaskState::Completed))?;
        }
        let reopened = TaskIndex::open(temp.path())?;
        assert_eq!(
            reopened.get("persisted")?.expect("row").state,
            TaskState::Completed
        );
        Ok(())
    }
}
