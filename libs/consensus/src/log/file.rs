//! Durable, file-backed log storage
//!
//! Entries are appended to `entries.log` as frames of
//! `[len: u32 LE][crc32: u32 LE][bincode entry]` and fsynced before the
//! append returns. A torn frame at the end of the file (crash during append)
//! is dropped on open; a checksum mismatch anywhere else is an integrity
//! failure. All entries are also kept in memory for reads.

use super::memory::MemoryLogStorage;
use super::LogStorage;
use crate::meta::write_atomically;
use crate::types::{Entry, LogIndex, Snapshot, Term};
use crate::{RaftError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const ENTRIES_FILE: &str = "entries.log";
const BOUNDS_FILE: &str = "bounds.json";
const SNAPSHOT_FILE: &str = "snapshot.bin";
const FRAME_HEADER: usize = 8;

/// Where the retained part of the log starts
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct LogBounds {
    start: LogIndex,
    compacted_term: Term,
}

pub struct FileLogStorage {
    dir: PathBuf,
    file: File,
    /// Byte offset of each retained entry's frame
    offsets: Vec<u64>,
    end_offset: u64,
    cache: MemoryLogStorage,
}

impl FileLogStorage {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let bounds_path = dir.join(BOUNDS_FILE);
        let bounds = if bounds_path.exists() {
            serde_json::from_slice::<LogBounds>(&fs::read(&bounds_path)?)?
        } else {
            LogBounds {
                start: LogIndex(1),
                compacted_term: Term(0),
            }
        };

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let snapshot = if snapshot_path.exists() {
            Some(bincode::deserialize::<Snapshot>(&fs::read(&snapshot_path)?)?)
        } else {
            None
        };

        let entries_path = dir.join(ENTRIES_FILE);
        let bytes = if entries_path.exists() {
            fs::read(&entries_path)?
        } else {
            Vec::new()
        };
        let (entries, offsets, valid_len) = decode_frames(&bytes)?;

        let superseded = snapshot
            .as_ref()
            .is_some_and(|snapshot| superseded_by(&entries, bounds, snapshot));
        let bounds = match &snapshot {
            Some(snapshot) if superseded => {
                warn!(
                    "Entries in {} disagree with snapshot at {}, dropping them",
                    entries_path.display(),
                    snapshot.metadata.last_included_index
                );
                LogBounds {
                    start: snapshot.metadata.last_included_index.next(),
                    compacted_term: snapshot.metadata.last_included_term,
                }
            }
            _ => bounds,
        };

        let mut cache = MemoryLogStorage::with_start(bounds.start, bounds.compacted_term);
        if let Some(snapshot) = snapshot {
            cache.set_snapshot(snapshot)?;
        }
        let (entries, offsets): (Vec<Entry>, Vec<u64>) = if superseded {
            (Vec::new(), Vec::new())
        } else {
            entries
                .into_iter()
                .zip(offsets)
                .filter(|(entry, _)| entry.index >= bounds.start)
                .unzip()
        };
        cache.append(entries)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&entries_path)?;
        if (valid_len as usize) < bytes.len() {
            warn!(
                "Dropping {} bytes of torn log tail in {}",
                bytes.len() - valid_len as usize,
                entries_path.display()
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        info!(
            "Opened log at {} with entries {}..={}",
            dir.display(),
            cache.first_index(),
            cache.last_index()
        );

        let mut storage = Self {
            dir,
            file,
            offsets,
            end_offset: valid_len,
            cache,
        };
        if superseded {
            storage.rewrite()?;
            storage.write_bounds()?;
        }
        Ok(storage)
    }

    fn write_bounds(&self) -> Result<()> {
        let bounds = LogBounds {
            start: self.cache.first_index(),
            compacted_term: self.cache.compacted_term(),
        };
        write_atomically(&self.dir.join(BOUNDS_FILE), &serde_json::to_vec(&bounds)?)?;
        Ok(())
    }

    /// Rewrite the entries file with what the cache still holds
    fn rewrite(&mut self) -> Result<()> {
        let entries = self.cache.get_from(self.cache.first_index())?;
        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(entries.len());
        for entry in &entries {
            offsets.push(buf.len() as u64);
            encode_frame(entry, &mut buf)?;
        }

        let path = self.dir.join(ENTRIES_FILE);
        write_atomically(&path, &buf)?;
        self.file = OpenOptions::new().append(true).open(&path)?;
        self.offsets = offsets;
        self.end_offset = buf.len() as u64;
        Ok(())
    }
}

/// Whether the stored entries belong to a log the snapshot replaced
///
/// A reset persists the snapshot before anything else, so a crash midway
/// leaves entries that either stop short of the snapshot or hold a
/// different term at its index.
fn superseded_by(entries: &[Entry], bounds: LogBounds, snapshot: &Snapshot) -> bool {
    let index = snapshot.metadata.last_included_index;
    match entries.iter().find(|e| e.index == index) {
        Some(entry) => entry.term != snapshot.metadata.last_included_term,
        None => bounds.start <= index && entries.last().map_or(true, |last| last.index < index),
    }
}

fn encode_frame(entry: &Entry, buf: &mut Vec<u8>) -> Result<()> {
    let payload = bincode::serialize(entry)?;
    let crc = crc32fast::hash(&payload);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(())
}

/// Decode every complete frame; returns entries, frame offsets and the
/// length of the valid prefix.
fn decode_frames(bytes: &[u8]) -> Result<(Vec<Entry>, Vec<u64>, u64)> {
    let mut entries = Vec::new();
    let mut offsets = Vec::new();
    let mut pos = 0usize;

    while bytes.len() - pos >= FRAME_HEADER {
        let len = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
            as usize;
        let crc = u32::from_le_bytes([
            bytes[pos + 4],
            bytes[pos + 5],
            bytes[pos + 6],
            bytes[pos + 7],
        ]);
        let end = pos + FRAME_HEADER + len;
        if end > bytes.len() {
            break;
        }
        let payload = &bytes[pos + FRAME_HEADER..end];
        if crc32fast::hash(payload) != crc {
            if end == bytes.len() {
                // Last frame was only partially written
                break;
            }
            return Err(RaftError::LogIntegrity(format!(
                "checksum mismatch in frame at offset {}",
                pos
            )));
        }
        let entry: Entry = bincode::deserialize(payload)
            .map_err(|e| RaftError::LogIntegrity(format!("undecodable entry at {}: {}", pos, e)))?;
        offsets.push(pos as u64);
        entries.push(entry);
        pos = end;
    }

    Ok((entries, offsets, pos as u64))
}

impl LogStorage for FileLogStorage {
    fn append(&mut self, entries: Vec<Entry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.cache.check_contiguous(&entries)?;

        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(entries.len());
        for entry in &entries {
            offsets.push(self.end_offset + buf.len() as u64);
            encode_frame(entry, &mut buf)?;
        }
        self.file.write_all(&buf)?;
        self.file.sync_data()?;

        self.end_offset += buf.len() as u64;
        self.offsets.extend(offsets);
        self.cache.append(entries)
    }

    fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        self.cache.get(index)
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        self.cache.get_range(start, end)
    }

    fn get_from(&self, start: LogIndex) -> Result<Vec<Entry>> {
        self.cache.get_from(start)
    }

    fn delete_from(&mut self, index: LogIndex) -> Result<()> {
        if index > self.cache.last_index() {
            return Ok(());
        }
        self.cache.delete_from(index)?;
        let idx = (index.0 - self.cache.first_index().0) as usize;
        let offset = self.offsets[idx];
        self.file.set_len(offset)?;
        self.file.sync_all()?;
        self.offsets.truncate(idx);
        self.end_offset = offset;
        Ok(())
    }

    fn first_index(&self) -> LogIndex {
        self.cache.first_index()
    }

    fn last_index(&self) -> LogIndex {
        self.cache.last_index()
    }

    fn last_term(&self) -> Term {
        self.cache.last_term()
    }

    fn get_term(&self, index: LogIndex) -> Result<Option<Term>> {
        self.cache.get_term(index)
    }

    fn set_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        write_atomically(&self.dir.join(SNAPSHOT_FILE), &bincode::serialize(&snapshot)?)?;
        self.cache.set_snapshot(snapshot)
    }

    fn get_snapshot(&self) -> Option<Snapshot> {
        self.cache.get_snapshot()
    }

    fn compact(&mut self, through_index: LogIndex) -> Result<()> {
        if through_index < self.cache.first_index() {
            return Ok(());
        }
        self.cache.compact(through_index)?;
        // Bounds first: a crash between the two writes leaves extra entries
        // in the file, which are skipped as already compacted on open.
        self.write_bounds()?;
        self.rewrite()
    }

    fn reset(&mut self, snapshot: Snapshot) -> Result<()> {
        write_atomically(&self.dir.join(SNAPSHOT_FILE), &bincode::serialize(&snapshot)?)?;
        self.cache.reset(snapshot)?;
        self.rewrite()?;
        self.write_bounds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Configuration, Member};
    use crate::types::{NodeId, SnapshotMetadata};
    use tempfile::TempDir;

    fn entries(range: std::ops::RangeInclusive<u64>) -> Vec<Entry> {
        range
            .map(|i| Entry::application(Term(1), LogIndex(i), format!("cmd{}", i).into_bytes()))
            .collect()
    }

    #[test]
    fn test_reopen_preserves_entries() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = FileLogStorage::open(dir.path()).unwrap();
            log.append(entries(1..=5)).unwrap();
            log.delete_from(LogIndex(5)).unwrap();
        }

        let log = FileLogStorage::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), LogIndex(4));
        assert_eq!(log.get(LogIndex(3)).unwrap(), entries(3..=3).pop());
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = FileLogStorage::open(dir.path()).unwrap();
            log.append(entries(1..=3)).unwrap();
        }
        // Simulate a crash in the middle of writing a frame
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(ENTRIES_FILE))
            .unwrap();
        file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let mut log = FileLogStorage::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), LogIndex(3));
        log.append(entries(4..=4)).unwrap();
        drop(log);

        let log = FileLogStorage::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), LogIndex(4));
    }

    #[test]
    fn test_corrupted_frame_is_fatal() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = FileLogStorage::open(dir.path()).unwrap();
            log.append(entries(1..=3)).unwrap();
        }
        let path = dir.path().join(ENTRIES_FILE);
        let mut bytes = fs::read(&path).unwrap();
        bytes[FRAME_HEADER + 2] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            FileLogStorage::open(dir.path()),
            Err(RaftError::LogIntegrity(_))
        ));
    }

    fn snapshot_at(index: u64, term: u64) -> Snapshot {
        Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: LogIndex(index),
                last_included_term: Term(term),
                configuration: Configuration::bootstrap(vec![Member::active(NodeId(1))]),
            },
            data: b"state".to_vec().into(),
        }
    }

    /// Leave the files as a reset that crashed before rewriting the entries
    fn interrupted_reset(dir: &Path, snapshot: &Snapshot, bounds_written: bool) {
        write_atomically(&dir.join(SNAPSHOT_FILE), &bincode::serialize(snapshot).unwrap()).unwrap();
        if bounds_written {
            let bounds = LogBounds {
                start: snapshot.metadata.last_included_index.next(),
                compacted_term: snapshot.metadata.last_included_term,
            };
            write_atomically(&dir.join(BOUNDS_FILE), &serde_json::to_vec(&bounds).unwrap())
                .unwrap();
        }
    }

    #[test]
    fn test_interrupted_reset_drops_conflicting_entries() {
        for bounds_written in [false, true] {
            let dir = TempDir::new().unwrap();
            {
                let mut log = FileLogStorage::open(dir.path()).unwrap();
                log.append(entries(1..=10)).unwrap();
            }
            // The leader's snapshot has a different term at entry 6
            interrupted_reset(dir.path(), &snapshot_at(6, 2), bounds_written);

            let mut log = FileLogStorage::open(dir.path()).unwrap();
            assert_eq!(log.first_index(), LogIndex(7));
            assert_eq!(log.last_index(), LogIndex(6));
            assert_eq!(log.last_term(), Term(2));
            assert!(log.get(LogIndex(8)).unwrap().is_none());

            log.append(vec![Entry::application(Term(2), LogIndex(7), b"new".to_vec())])
                .unwrap();
            drop(log);

            let log = FileLogStorage::open(dir.path()).unwrap();
            assert_eq!(log.first_index(), LogIndex(7));
            assert_eq!(log.last_index(), LogIndex(7));
            assert_eq!(log.get_term(LogIndex(7)).unwrap(), Some(Term(2)));
        }
    }

    #[test]
    fn test_interrupted_reset_beyond_short_log() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = FileLogStorage::open(dir.path()).unwrap();
            log.append(entries(1..=3)).unwrap();
        }
        interrupted_reset(dir.path(), &snapshot_at(9, 1), false);

        let log = FileLogStorage::open(dir.path()).unwrap();
        assert_eq!(log.first_index(), LogIndex(10));
        assert_eq!(log.last_index(), LogIndex(9));
        assert_eq!(log.get_term(LogIndex(9)).unwrap(), Some(Term(1)));
    }

    #[test]
    fn test_matching_entries_survive_snapshot() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = FileLogStorage::open(dir.path()).unwrap();
            log.append(entries(1..=10)).unwrap();
            log.set_snapshot(snapshot_at(6, 1)).unwrap();
        }

        let log = FileLogStorage::open(dir.path()).unwrap();
        assert_eq!(log.first_index(), LogIndex(1));
        assert_eq!(log.last_index(), LogIndex(10));
    }

    #[test]
    fn test_compaction_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = FileLogStorage::open(dir.path()).unwrap();
            log.append(entries(1..=10)).unwrap();
            log.set_snapshot(snapshot_at(8, 1)).unwrap();
            log.compact(LogIndex(6)).unwrap();
        }

        let log = FileLogStorage::open(dir.path()).unwrap();
        assert_eq!(log.first_index(), LogIndex(7));
        assert_eq!(log.last_index(), LogIndex(10));
        assert_eq!(log.get_term(LogIndex(6)).unwrap(), Some(Term(1)));
        assert_eq!(
            log.get_snapshot().unwrap().metadata.last_included_index,
            LogIndex(8)
        );
    }
}
