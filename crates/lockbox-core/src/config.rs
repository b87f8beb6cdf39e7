//! Profile configuration: where credentials, the session cookie, and the
//! sync state live on disk.
//!
//! Everything is written through a staging file followed by an atomic
//! rename, so an interrupted write can never leave a half-written table or
//! credential file behind.

use crate::api::Session;
use crate::error::{Error, Result};
use crate::keys::KeyInfo;
use directories::ProjectDirs;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const CONFIG_DIR_ENV: &str = "LOCKBOX_CONFIG_DIR";
const KEY_INFO_FILE: &str = "keyinfo.json";
const SESSION_FILE: &str = "session";
const SYNC_TABLE_FILE: &str = "syncinfo.json";
const SYNC_LINKS_DIR: &str = "syncs";

/// Handle on one profile directory. Cheap to clone; owns no open files.
#[derive(Debug, Clone)]
pub struct Config {
    root: PathBuf,
}

impl Config {
    /// Resolve the profile directory: `LOCKBOX_CONFIG_DIR` if set, otherwise
    /// the platform data dir. Creates it on first use.
    pub fn open() -> Result<Self> {
        let root = match std::env::var(CONFIG_DIR_ENV) {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => ProjectDirs::from("io", "lockbox", "lockbox")
                .ok_or_else(|| Error::ConfigParse("config directory".to_string()))?
                .data_dir()
                .to_path_buf(),
        };
        Self::at(root)
    }

    /// Open a profile rooted at an explicit directory.
    pub fn at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        restrict_dir_permissions(&root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key_info_path(&self) -> PathBuf {
        self.root.join(KEY_INFO_FILE)
    }

    pub fn sync_table_path(&self) -> PathBuf {
        self.root.join(SYNC_TABLE_FILE)
    }

    pub fn sync_links_dir(&self) -> PathBuf {
        self.root.join(SYNC_LINKS_DIR)
    }

    /// Load the stored credentials, or `None` when this machine has never
    /// been set up.
    pub fn key_info(&self) -> Result<Option<KeyInfo>> {
        let path = self.key_info_path();
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        let info = serde_json::from_str(&json)
            .map_err(|_| Error::ConfigParse(KEY_INFO_FILE.to_string()))?;
        Ok(Some(info))
    }

    pub fn set_key_info(&self, info: &KeyInfo) -> Result<()> {
        let json = serde_json::to_string_pretty(info)
            .map_err(|_| Error::ConfigParse(KEY_INFO_FILE.to_string()))?;
        self.write_atomic(&self.key_info_path(), json.as_bytes())
    }

    /// The saved session cookie, if any. An unreadable file is treated as no
    /// session: the caller will simply re-authenticate.
    pub fn session(&self) -> Option<Session> {
        let raw = fs::read_to_string(self.root.join(SESSION_FILE)).ok()?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn set_session(&self, session: &Session) -> Result<()> {
        self.write_atomic(&self.root.join(SESSION_FILE), session.as_bytes())
    }

    pub fn clear_session(&self) -> Result<()> {
        let path = self.root.join(SESSION_FILE);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Stage-then-rename write. The rename is the commit point.
    pub(crate) fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let staging = self.root.join(format!(".{}.staging", Uuid::new_v4()));
        {
            let mut file = File::create(&staging)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&staging, dest)?;
        Ok(())
    }
}

fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            tracing::warn!("could not restrict permissions on {}: {e}", path.display());
        }
    }
}
