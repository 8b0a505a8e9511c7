//! Persisted term, vote and configuration
//!
//! Raft requires the current term, the vote cast in that term and the
//! active configuration to hit stable storage before the node acts on them.

use crate::membership::Configuration;
use crate::types::{NodeId, Term};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Everything a node reloads on restart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedMeta {
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub configuration: Option<Configuration>,
}

/// Stable storage for [`PersistedMeta`]
pub trait MetaStore: Send {
    fn load(&self) -> Result<PersistedMeta>;

    fn store_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()>;

    fn store_configuration(&mut self, configuration: &Configuration) -> Result<()>;
}

/// Volatile meta store for tests and in-memory groups
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    meta: PersistedMeta,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaStore for MemoryMetaStore {
    fn load(&self) -> Result<PersistedMeta> {
        Ok(self.meta.clone())
    }

    fn store_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        self.meta.term = term;
        self.meta.voted_for = voted_for;
        Ok(())
    }

    fn store_configuration(&mut self, configuration: &Configuration) -> Result<()> {
        self.meta.configuration = Some(configuration.clone());
        Ok(())
    }
}

/// JSON files in a directory, replaced atomically on every write
pub struct FileMetaStore {
    dir: PathBuf,
    meta: PersistedMeta,
}

impl FileMetaStore {
    const META_FILE: &'static str = "meta.json";

    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(Self::META_FILE);
        let meta = if path.exists() {
            serde_json::from_slice(&fs::read(&path)?)?
        } else {
            PersistedMeta::default()
        };
        Ok(Self { dir, meta })
    }

    fn save(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.meta)?;
        write_atomically(&self.dir.join(Self::META_FILE), &bytes)?;
        Ok(())
    }
}

impl MetaStore for FileMetaStore {
    fn load(&self) -> Result<PersistedMeta> {
        Ok(self.meta.clone())
    }

    fn store_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        self.meta.term = term;
        self.meta.voted_for = voted_for;
        self.save()
    }

    fn store_configuration(&mut self, configuration: &Configuration) -> Result<()> {
        self.meta.configuration = Some(configuration.clone());
        self.save()
    }
}

/// Write `bytes` to `path` via a synced temporary file and a rename
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp_path = PathBuf::from(temp);

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    fs::rename(&temp_path, path)?;
    if let Some(parent) = path.parent() {
        // Persist the rename itself
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}
