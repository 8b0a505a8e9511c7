//! Durable snapshots of a partition's state
//!
//! Layout under the store root:
//!
//! ```text
//! pending/<id>/            being written
//! snapshots/<id>/state.bin
//!               /metadata.json
//!               /CHECKSUM   blake3 of state.bin, hex
//! ```
//!
//! `<id>` is `<index>-<term>-<processed>-<written>`, so the latest snapshot is
//! found by listing `snapshots/` alone.

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const STATE_FILE: &str = "state.bin";
const METADATA_FILE: &str = "metadata.json";
const CHECKSUM_FILE: &str = "CHECKSUM";

/// Position of a snapshot in the replicated log and the record stream
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Log index the snapshot covers
    pub index: u64,
    /// Term of the entry at `index`
    pub term: u64,
    /// Last command whose results are contained in the state
    pub processed_position: u64,
    /// Last record position covered by `index`
    pub written_position: u64,
    /// Empty snapshot used before anything was taken
    #[serde(default)]
    pub bootstrap: bool,
}

impl SnapshotMetadata {
    pub fn bootstrap() -> Self {
        Self {
            index: 0,
            term: 0,
            processed_position: 0,
            written_position: 0,
            bootstrap: true,
        }
    }

    pub fn id(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.index, self.term, self.processed_position, self.written_position
        )
    }

    pub fn parse_id(id: &str) -> Option<Self> {
        let mut parts = id.split('-').map(|p| p.parse::<u64>());
        let metadata = Self {
            index: parts.next()?.ok()?,
            term: parts.next()?.ok()?,
            processed_position: parts.next()?.ok()?,
            written_position: parts.next()?.ok()?,
            bootstrap: false,
        };
        parts.next().is_none().then_some(metadata)
    }
}

/// A snapshot that has been moved into `snapshots/`
#[derive(Debug, Clone)]
pub struct PersistedSnapshot {
    pub metadata: SnapshotMetadata,
    pub path: PathBuf,
}

impl PersistedSnapshot {
    /// Read the state, verifying it against the stored checksum
    pub fn read_state(&self) -> Result<Vec<u8>> {
        let state = fs::read(self.path.join(STATE_FILE))?;
        let expected = fs::read_to_string(self.path.join(CHECKSUM_FILE))?;
        let actual = blake3::hash(&state).to_hex().to_string();
        if expected.trim() != actual {
            return Err(StorageError::ChecksumMismatch {
                path: self.path.clone(),
                expected: expected.trim().to_string(),
                actual,
            });
        }
        Ok(state)
    }

    pub fn size(&self) -> Result<u64> {
        Ok(fs::metadata(self.path.join(STATE_FILE))?.len())
    }
}

/// Snapshot directory of one partition replica
pub struct FileSnapshotStore {
    pending_dir: PathBuf,
    snapshots_dir: PathBuf,
}

impl FileSnapshotStore {
    /// Open the store, discarding snapshots left half-written by a crash
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let store = Self {
            pending_dir: root.join("pending"),
            snapshots_dir: root.join("snapshots"),
        };
        fs::create_dir_all(&store.pending_dir)?;
        fs::create_dir_all(&store.snapshots_dir)?;

        for entry in fs::read_dir(&store.pending_dir)? {
            let path = entry?.path();
            warn!("Removing stale pending snapshot {}", path.display());
            fs::remove_dir_all(&path)?;
        }
        Ok(store)
    }

    /// Write a snapshot and make it the current one
    ///
    /// Fails with [`StorageError::SnapshotAlreadyExists`] if a snapshot with
    /// the same id is pending or persisted.
    pub fn persist(&self, metadata: &SnapshotMetadata, state: &[u8]) -> Result<PersistedSnapshot> {
        let id = metadata.id();
        let pending = self.pending_dir.join(&id);
        let target = self.snapshots_dir.join(&id);
        if pending.exists() {
            return Err(StorageError::SnapshotAlreadyExists(pending));
        }
        if target.exists() {
            return Err(StorageError::SnapshotAlreadyExists(target));
        }

        fs::create_dir(&pending)?;
        write_synced(&pending.join(STATE_FILE), state)?;
        write_synced(
            &pending.join(METADATA_FILE),
            &serde_json::to_vec_pretty(metadata)?,
        )?;
        write_synced(
            &pending.join(CHECKSUM_FILE),
            blake3::hash(state).to_hex().as_bytes(),
        )?;

        fs::rename(&pending, &target)?;
        File::open(&self.snapshots_dir)?.sync_all()?;
        info!("Persisted snapshot {} ({} bytes)", id, state.len());

        self.purge_older_than(metadata)?;
        Ok(PersistedSnapshot {
            metadata: metadata.clone(),
            path: target,
        })
    }

    /// All persisted snapshots, oldest first
    pub fn list(&self) -> Result<Vec<PersistedSnapshot>> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.snapshots_dir)? {
            let path = entry?.path();
            let Some(id) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(from_id) = SnapshotMetadata::parse_id(id) else {
                warn!("Ignoring unexpected entry {} in snapshot directory", path.display());
                continue;
            };
            let metadata = match fs::read(path.join(METADATA_FILE)) {
                Ok(bytes) => serde_json::from_slice(&bytes)?,
                Err(_) => from_id,
            };
            snapshots.push(PersistedSnapshot { metadata, path });
        }
        snapshots.sort_by(|a, b| a.metadata.cmp(&b.metadata));
        Ok(snapshots)
    }

    pub fn latest(&self) -> Result<Option<PersistedSnapshot>> {
        Ok(self.list()?.pop())
    }

    /// The newest snapshot not beyond `commit_index` whose checksum verifies
    ///
    /// Returns the snapshot together with its state.
    pub fn latest_valid(&self, commit_index: u64) -> Result<Option<(PersistedSnapshot, Vec<u8>)>> {
        for snapshot in self.list()?.into_iter().rev() {
            if snapshot.metadata.index > commit_index {
                debug!(
                    "Skipping snapshot {} beyond commit index {}",
                    snapshot.metadata.id(),
                    commit_index
                );
                continue;
            }
            match snapshot.read_state() {
                Ok(state) => return Ok(Some((snapshot, state))),
                Err(err) => warn!("Skipping invalid snapshot: {}", err),
            }
        }
        Ok(None)
    }

    /// Remove every snapshot ordered before `keep`
    pub fn purge_older_than(&self, keep: &SnapshotMetadata) -> Result<()> {
        for snapshot in self.list()? {
            if snapshot.metadata < *keep {
                debug!("Purging snapshot {}", snapshot.metadata.id());
                fs::remove_dir_all(&snapshot.path)?;
            }
        }
        Ok(())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}
