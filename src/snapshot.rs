// =============================================================================
// Snapshots — checksummed point-in-time copies of the derived indices
// =============================================================================
//
// On-disk layout under the data directory:
//   snapshot.json                      latest snapshot
//   backups/snapshot-<seq>.json        rotated copies, newest N kept
//
// File format:
//   { "version": 1, "checksum": "<sha256 hex of body>", "body": "<json text>" }
//
// The body is stored as text so the checksum covers the exact bytes that were
// written. A snapshot that parses but fails its checksum or its invariants is
// rejected just like one that does not parse.
//
// Snapshots are captured while holding the ledger lock, so `last_seq` matches
// the indices exactly and replay can resume from `last_seq + 1`.
// =============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::lifecycle::{Lifecycle, Signal, SignalIndex};
use crate::persist;
use crate::position_store::{PositionIndex, PositionStore, Position};

pub const SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_FILE: &str = "snapshot.json";
const BACKUP_DIR: &str = "backups";
const BACKUP_PREFIX: &str = "snapshot-";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot does not parse: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("snapshot checksum mismatch (expected {expected}, computed {actual})")]
    Checksum { expected: String, actual: String },

    #[error("snapshot violates invariants: {0}")]
    Invariant(String),
}

/// Point-in-time copy of both derived indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Ledger sequence covered by this snapshot.
    pub last_seq: u64,
    pub taken_at: DateTime<Utc>,
    pub positions: Vec<Position>,
    pub signals: Vec<Signal>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    checksum: String,
    body: String,
}

impl Snapshot {
    /// Capture a consistent snapshot of `lifecycle` and `store`.
    ///
    /// Both share one ledger; holding its lock means no append can land
    /// between reading the two indices.
    pub fn capture(lifecycle: &Lifecycle, store: &PositionStore) -> anyhow::Result<Self> {
        store.ledger().transact(|tx| {
            let last_seq = tx.last_seq();
            let positions = store
                .index_snapshot()
                .context("position index unavailable for snapshot")?
                .all_positions();
            let signals = lifecycle
                .index_snapshot()
                .context("signal index unavailable for snapshot")?
                .sorted();
            Ok(Self {
                last_seq,
                taken_at: Utc::now(),
                positions,
                signals,
            })
        })
    }

    /// Rebuild the two indices. Fails if the position invariants do not hold.
    pub fn into_indices(self) -> Result<(PositionIndex, SignalIndex), SnapshotError> {
        let positions =
            PositionIndex::from_positions(self.positions, self.last_seq).map_err(SnapshotError::Invariant)?;
        let signals = SignalIndex::from_signals(self.signals, self.last_seq);
        Ok((positions, signals))
    }

    fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        let body = serde_json::to_string(self)?;
        let file = SnapshotFile {
            version: SNAPSHOT_VERSION,
            checksum: checksum(&body),
            body,
        };
        Ok(serde_json::to_vec_pretty(&file)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let file: SnapshotFile = serde_json::from_slice(bytes)?;
        if file.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(file.version));
        }
        let actual = checksum(&file.body);
        if actual != file.checksum {
            return Err(SnapshotError::Checksum {
                expected: file.checksum,
                actual,
            });
        }
        let snapshot: Snapshot = serde_json::from_str(&file.body)?;
        // Invariants are checked by building the index once.
        PositionIndex::from_positions(snapshot.positions.clone(), snapshot.last_seq)
            .map_err(SnapshotError::Invariant)?;
        Ok(snapshot)
    }
}

fn checksum(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

// ---------------------------------------------------------------------------
// Snapshot store
// ---------------------------------------------------------------------------

/// Reads and writes snapshots under one data directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    backup_keep: usize,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, backup_keep: usize) -> Self {
        Self {
            dir: dir.into(),
            backup_keep: backup_keep.max(1),
        }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.dir.join(BACKUP_DIR)
    }

    /// Write `snapshot` atomically, add a backup copy and prune old backups.
    pub fn write(&self, snapshot: &Snapshot) -> Result<PathBuf, SnapshotError> {
        let bytes = snapshot.encode()?;
        let path = self.snapshot_path();
        persist::atomic_write(&path, &bytes)?;

        let backup = self
            .backup_dir()
            .join(format!("{BACKUP_PREFIX}{:020}.json", snapshot.last_seq));
        persist::atomic_write(&backup, &bytes)?;
        self.prune_backups()?;

        info!(
            path = %path.display(),
            last_seq = snapshot.last_seq,
            positions = snapshot.positions.len(),
            signals = snapshot.signals.len(),
            "snapshot written"
        );
        Ok(path)
    }

    /// Load the primary snapshot. `Ok(None)` when it does not exist.
    pub fn load_primary(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }
        load_file(&path).map(Some)
    }

    /// Backup paths, newest first.
    pub fn backups(&self) -> Result<Vec<PathBuf>, SnapshotError> {
        let dir = self.backup_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(BACKUP_PREFIX) && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        // Zero-padded sequence numbers sort lexically.
        paths.sort();
        paths.reverse();
        Ok(paths)
    }

    /// The newest backup that passes validation, with its path.
    pub fn newest_valid_backup(&self) -> Result<Option<(PathBuf, Snapshot)>, SnapshotError> {
        for path in self.backups()? {
            match load_file(&path) {
                Ok(snapshot) => return Ok(Some((path, snapshot))),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid snapshot backup"),
            }
        }
        Ok(None)
    }

    fn prune_backups(&self) -> Result<(), SnapshotError> {
        for stale in self.backups()?.into_iter().skip(self.backup_keep) {
            debug!(path = %stale.display(), "pruning old snapshot backup");
            fs::remove_file(&stale)?;
        }
        Ok(())
    }
}

/// Read and validate one snapshot file.
pub fn load_file(path: &Path) -> Result<Snapshot, SnapshotError> {
    let bytes = fs::read(path)?;
    Snapshot::decode(&bytes)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn sample(last_seq: u64) -> Snapshot {
        Snapshot {
            last_seq,
            taken_at: Utc::now(),
            positions: vec![Position::new_open("BTCUSDT", Direction::Long, 100.0, 1.0, None)],
            signals: Vec::new(),
        }
    }

    #[test]
    fn write_then_load_primary() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), 3);
        let snap = sample(7);
        store.write(&snap).unwrap();
        assert_eq!(store.load_primary().unwrap(), Some(snap));
    }

    #[test]
    fn missing_primary_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), 3);
        assert!(store.load_primary().unwrap().is_none());
        assert!(store.backups().unwrap().is_empty());
    }

    #[test]
    fn tampered_body_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), 3);
        store.write(&sample(1)).unwrap();

        let path = store.snapshot_path();
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replace("100.0", "900.0")).unwrap();
        assert!(matches!(store.load_primary(), Err(SnapshotError::Checksum { .. })));
    }

    #[test]
    fn garbage_fails_parse() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), 3);
        fs::write(store.snapshot_path(), b"{\"version\":1,").unwrap();
        assert!(matches!(store.load_primary(), Err(SnapshotError::Parse(_))));
    }

    #[test]
    fn duplicate_live_keys_fail_invariants() {
        let mut snap = sample(1);
        snap.positions
            .push(Position::new_open("BTCUSDT", Direction::Long, 101.0, 1.0, None));
        let bytes = snap.encode().unwrap();
        assert!(matches!(Snapshot::decode(&bytes), Err(SnapshotError::Invariant(_))));
    }

    #[test]
    fn crash_before_rename_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), 3);
        let snap = sample(4);
        store.write(&snap).unwrap();

        // A half-written temp file left by a crash mid-write.
        fs::write(persist::tmp_path(&store.snapshot_path()), b"{\"version\":1,\"chec").unwrap();
        assert_eq!(store.load_primary().unwrap(), Some(snap));
    }

    #[test]
    fn backups_rotate_keeping_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), 2);
        for seq in [1, 5, 12, 30] {
            store.write(&sample(seq)).unwrap();
        }
        let backups = store.backups().unwrap();
        assert_eq!(backups.len(), 2);
        let (_, newest) = store.newest_valid_backup().unwrap().unwrap();
        assert_eq!(newest.last_seq, 30);
    }

    #[test]
    fn newest_valid_backup_skips_corrupt_ones() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), 5);
        store.write(&sample(3)).unwrap();
        store.write(&sample(9)).unwrap();
        let newest = store.backups().unwrap()[0].clone();
        fs::write(&newest, b"not json").unwrap();

        let (path, snap) = store.newest_valid_backup().unwrap().unwrap();
        assert_ne!(path, newest);
        assert_eq!(snap.last_seq, 3);
    }
}
