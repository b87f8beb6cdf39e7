//! Durable bindings between local files and their remotes.
//!
//! A record is keyed by the inode of a system-owned hardlink alias kept
//! under the profile's `syncs/` directory. Paths are not a stable identity
//! (files get renamed and moved); the inode survives as long as the user
//! does not break the hardlink. The table is small and per-user, so lookups
//! are deliberate linear scans; what matters is that every mutation is a
//! whole-table read-modify-replace through an atomic rename.

use crate::config::Config;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One local-clone↔remote-file binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub sync_id: u64,
    pub file_id: String,
    /// Content hash as of the last successful push or pull.
    pub last_hash: String,
    pub inode: u64,
}

pub struct SyncStore {
    config: Config,
    table_path: PathBuf,
    links_dir: PathBuf,
}

impl SyncStore {
    pub fn open(config: &Config) -> Result<Self> {
        let links_dir = config.sync_links_dir();
        fs::create_dir_all(&links_dir)?;
        Ok(Self {
            config: config.clone(),
            table_path: config.sync_table_path(),
            links_dir,
        })
    }

    /// Bind `local_path` to a remote file. The local file is hardlinked into
    /// the private `syncs/` directory so the binding survives renames.
    pub fn create(&self, file_id: &str, hash: &str, local_path: &Path) -> Result<SyncRecord> {
        let inode = inode_of(local_path)?;
        let mut table = self.read_table()?;
        if table.iter().any(|r| r.inode == inode) {
            return Err(Error::SyncExists);
        }
        let record = SyncRecord {
            sync_id: next_sync_id(&table),
            file_id: file_id.to_string(),
            last_hash: hash.to_string(),
            inode,
        };
        fs::hard_link(local_path, self.link_path(&record))?;
        table.push(record.clone());
        self.write_table(&table)?;
        Ok(record)
    }

    /// Find the record bound to the file currently at `local_path`, by inode.
    pub fn lookup(&self, local_path: &Path) -> Result<Option<SyncRecord>> {
        let inode = inode_of(local_path)?;
        let table = self.read_table()?;
        Ok(table.into_iter().find(|r| r.inode == inode))
    }

    pub fn lookup_by_remote(&self, file_id: &str) -> Result<Option<SyncRecord>> {
        let table = self.read_table()?;
        Ok(table.into_iter().find(|r| r.file_id == file_id))
    }

    /// Record a successful push or pull. Idempotent: re-recording the same
    /// hash leaves the table byte-identical.
    pub fn update(&self, local_path: &Path, new_hash: &str) -> Result<()> {
        let inode = inode_of(local_path)?;
        let mut table = self.read_table()?;
        let record = table
            .iter_mut()
            .find(|r| r.inode == inode)
            .ok_or(Error::SyncNotFound)?;
        if record.last_hash == new_hash {
            return Ok(());
        }
        record.last_hash = new_hash.to_string();
        self.write_table(&table)
    }

    /// Remove every record bound to a remote that no longer exists, and
    /// unlink the internal aliases. Returns how many records were dropped.
    pub fn delete_by_remote(&self, file_id: &str) -> Result<usize> {
        let table = self.read_table()?;
        let (dead, keep): (Vec<_>, Vec<_>) =
            table.into_iter().partition(|r| r.file_id == file_id);
        for record in &dead {
            let link = self.link_path(record);
            if let Err(e) = fs::remove_file(&link) {
                // A missing link is already the state we want.
                tracing::warn!("could not unlink {}: {e}", link.display());
            }
        }
        self.write_table(&keep)?;
        Ok(dead.len())
    }

    /// Duplicate an existing binding for a second local clone, reusing the
    /// already-known content instead of downloading it again. The new local
    /// path is hardlinked to a fresh copy of the internal alias.
    pub fn copy(&self, sync_id: u64, new_local_path: &Path) -> Result<SyncRecord> {
        let mut table = self.read_table()?;
        let source = table
            .iter()
            .find(|r| r.sync_id == sync_id)
            .ok_or(Error::SyncNotFound)?
            .clone();

        let mut record = SyncRecord {
            sync_id: next_sync_id(&table),
            file_id: source.file_id.clone(),
            last_hash: source.last_hash.clone(),
            inode: 0,
        };
        let new_link = self.link_path(&record);
        fs::copy(self.link_path(&source), &new_link)?;
        record.inode = inode_of(&new_link)?;
        fs::hard_link(&new_link, new_local_path)?;

        table.push(record.clone());
        self.write_table(&table)?;
        Ok(record)
    }

    fn link_path(&self, record: &SyncRecord) -> PathBuf {
        self.links_dir
            .join(format!("{}_{}", record.file_id, record.sync_id))
    }

    fn read_table(&self) -> Result<Vec<SyncRecord>> {
        if !self.table_path.exists() {
            return Ok(Vec::new());
        }
        let json = fs::read_to_string(&self.table_path)?;
        serde_json::from_str(&json).map_err(|_| Error::ConfigParse("syncinfo.json".to_string()))
    }

    fn write_table(&self, table: &[SyncRecord]) -> Result<()> {
        let json = serde_json::to_string_pretty(table)
            .map_err(|_| Error::ConfigParse("syncinfo.json".to_string()))?;
        self.config.write_atomic(&self.table_path, json.as_bytes())
    }
}

fn next_sync_id(table: &[SyncRecord]) -> u64 {
    table.iter().map(|r| r.sync_id).max().unwrap_or(0) + 1
}

fn inode_of(path: &Path) -> Result<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(fs::metadata(path)?.ino())
}
