//! Persisted target-quantity snapshots, one per account.
//!
//! The snapshot is the only durable state of the engine: the quantities the
//! last completed cycle converged to. The next cycle diffs against it.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{debug, info};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::convert::TargetQuantities;
use crate::error::{Error, Result};

/// Target quantities recorded after a completed cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingsSnapshot {
    pub account_id: String,
    pub saved_at: DateTime<Utc>,
    pub quantities: TargetQuantities,
}

impl HoldingsSnapshot {
    pub fn new(account_id: impl Into<String>, quantities: TargetQuantities) -> Self {
        Self {
            account_id: account_id.into(),
            saved_at: Utc::now(),
            quantities,
        }
    }
}

impl std::fmt::Display for HoldingsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Snapshot for {} (saved {})",
            self.account_id,
            self.saved_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        if self.quantities.is_empty() {
            return writeln!(f, "  (empty)");
        }
        for (sym, qty) in self.quantities.iter() {
            writeln!(f, "  {sym:8} {qty:>8}")?;
        }
        Ok(())
    }
}

/// Storage for per-account snapshots.
pub trait SnapshotStore {
    /// The last saved snapshot, or `None` before the first completed cycle.
    fn load(&self, account_id: &str) -> Result<Option<HoldingsSnapshot>>;

    /// Replace the account's snapshot.
    fn save(&self, snapshot: &HoldingsSnapshot) -> Result<()>;
}

/// One JSON file per account under a directory.
///
/// Writes go to a temp file in the same directory, are fsynced, then renamed
/// over the live file. The file being replaced is kept as `<name>.backup`.
#[derive(Debug, Clone)]
pub struct JsonSnapshotStore {
    dir: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the snapshot file for `account_id`.
    pub fn path_for(&self, account_id: &str) -> PathBuf {
        let name: String = account_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::SnapshotIo {
        path: path.to_path_buf(),
        source,
    }
}

impl SnapshotStore for JsonSnapshotStore {
    fn load(&self, account_id: &str) -> Result<Option<HoldingsSnapshot>> {
        let path = self.path_for(account_id);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No snapshot at {}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(io_error(&path)(e)),
        };
        let snapshot: HoldingsSnapshot =
            serde_json::from_str(&contents).map_err(|source| Error::SnapshotCorrupt {
                path: path.clone(),
                source,
            })?;
        if snapshot.account_id != account_id {
            return Err(Error::Config(format!(
                "snapshot {} belongs to account {}, expected {account_id}",
                path.display(),
                snapshot.account_id
            )));
        }
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &HoldingsSnapshot) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;

        let path = self.path_for(&snapshot.account_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(snapshot).map_err(|source| {
            Error::SnapshotCorrupt {
                path: path.clone(),
                source,
            }
        })?;

        {
            let mut file = fs::File::create(&tmp).map_err(io_error(&tmp))?;
            file.write_all(json.as_bytes()).map_err(io_error(&tmp))?;
            file.sync_all().map_err(io_error(&tmp))?;
        }

        if path.exists() {
            let backup = path.with_extension("json.backup");
            fs::copy(&path, &backup).map_err(io_error(&backup))?;
        }
        fs::rename(&tmp, &path).map_err(io_error(&path))?;

        info!(
            "Saved snapshot for {} ({} symbols) to {}",
            snapshot.account_id,
            snapshot.quantities.len(),
            path.display()
        );
        Ok(())
    }
}

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<FxHashMap<String, HoldingsSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with one snapshot.
    pub fn with_snapshot(snapshot: HoldingsSnapshot) -> Self {
        let store = Self::default();
        store
            .snapshots
            .lock()
            .unwrap()
            .insert(snapshot.account_id.clone(), snapshot);
        store
    }

    /// The stored snapshot for `account_id`, if any.
    pub fn get(&self, account_id: &str) -> Option<HoldingsSnapshot> {
        self.snapshots.lock().unwrap().get(account_id).cloned()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, account_id: &str) -> Result<Option<HoldingsSnapshot>> {
        Ok(self.get(account_id))
    }

    fn save(&self, snapshot: &HoldingsSnapshot) -> Result<()> {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.account_id.clone(), snapshot.clone());
        Ok(())
    }
}
