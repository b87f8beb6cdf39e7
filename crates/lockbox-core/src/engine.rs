//! Reconciliation between local clones and their remotes.
//!
//! Each record is classified by comparing three hashes: the hash at the last
//! successful sync, the hash of the working file right now, and the hash the
//! server currently holds. Pulls only happen when the server differs; local
//! edits are never overwritten without an explicit confirmation from the
//! driver's prompt capability.

use crate::api::Remote;
use crate::crypto;
use crate::envelope;
use crate::error::{Error, ErrorCode, Result};
use crate::session::AuthInfo;
use crate::syncstore::{SyncRecord, SyncStore};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Driver-injected decision point for the one interactive policy question:
/// overwrite local edits with server content?
pub trait SyncPrompt {
    fn confirm_overwrite(&mut self, local: &Path, remote_name: &str) -> bool;
}

/// Never overwrites; for non-interactive callers.
pub struct KeepLocalEdits;

impl SyncPrompt for KeepLocalEdits {
    fn confirm_overwrite(&mut self, _local: &Path, _remote_name: &str) -> bool {
        false
    }
}

/// What happened to one record. Only `Pulled` modified the local file.
#[derive(Debug)]
pub enum SyncOutcome {
    /// Server content downloaded, verified, and written locally.
    Pulled,
    /// Local and server content already match; no network read performed.
    Unchanged,
    /// Local edits exist and the driver declined the overwrite.
    LocalEditsKept,
    /// The remote no longer exists; the record was removed.
    RemoteDeleted,
    /// The remote is being modified elsewhere; try again later.
    NotReady,
    /// This record failed; the batch continues.
    Failed(Error),
}

impl SyncOutcome {
    pub fn modified(&self) -> bool {
        matches!(self, SyncOutcome::Pulled)
    }
}

pub struct SyncReport {
    pub entries: Vec<(PathBuf, SyncOutcome)>,
}

impl SyncReport {
    pub fn modified_count(&self) -> usize {
        self.entries.iter().filter(|(_, o)| o.modified()).count()
    }
}

/// Reconcile one record against its remote.
pub fn sync_file(
    remote: &dyn Remote,
    auth: &mut AuthInfo,
    store: &SyncStore,
    local: &Path,
    record: &SyncRecord,
    prompt: &mut dyn SyncPrompt,
) -> Result<SyncOutcome> {
    let info = match auth.call(remote, |r, s| r.file_info_by_id(s, &record.file_id))? {
        Ok(info) => info,
        Err(e) if e.is(ErrorCode::FileNotFound) => {
            // Self-heal: drop the stale binding instead of failing every
            // subsequent command.
            store.delete_by_remote(&record.file_id)?;
            tracing::warn!(
                local = %local.display(),
                "remote deleted; removed its sync record"
            );
            return Ok(SyncOutcome::RemoteDeleted);
        }
        Err(e) => return Err(e.into_error(&record.file_id)),
    };
    let remote_name = format!("@{}/{}", info.owner, info.name);

    let content = fs::read(local)?;
    let current_hash = crypto::content_hash(&content);

    if info.hash == current_hash {
        return Ok(SyncOutcome::Unchanged);
    }

    if record.last_hash != current_hash && !prompt.confirm_overwrite(local, &remote_name) {
        return Ok(SyncOutcome::LocalEditsKept);
    }

    let save = match auth.call(remote, |r, s| r.save(s, &info.file_id))? {
        Ok(save) => save,
        Err(e) if e.is(ErrorCode::FileNotReady) => return Ok(SyncOutcome::NotReady),
        Err(e) => return Err(e.into_error(&remote_name)),
    };

    let pulled = match envelope::fetch_and_decrypt(
        remote,
        auth,
        &save.download_url,
        &save.encrypted_key,
        &save.hash,
    ) {
        Ok(content) => content,
        // Download and integrity failures skip this record, not the batch.
        Err(e @ Error::Download(_)) => return Ok(SyncOutcome::Failed(e)),
        Err(e) => return Err(e),
    };

    fs::write(local, &pulled)?;
    store.update(local, &save.hash)?;
    tracing::debug!(local = %local.display(), remote = %remote_name, "pulled");
    Ok(SyncOutcome::Pulled)
}

/// Reconcile a directory tree (every bound file under it) or a single bound
/// file. Directory mode keeps going past individual failures and reports
/// per-file outcomes.
pub fn sync_path(
    remote: &dyn Remote,
    auth: &mut AuthInfo,
    store: &SyncStore,
    path: &Path,
    prompt: &mut dyn SyncPrompt,
) -> Result<SyncReport> {
    if path.is_dir() {
        let mut targets = Vec::new();
        for entry in WalkDir::new(path) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("skipping unreadable entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(record) = store.lookup(entry.path())? {
                targets.push((entry.path().to_path_buf(), record));
            }
        }

        let mut entries = Vec::new();
        for (file, record) in targets {
            let outcome = sync_file(remote, auth, store, &file, &record, prompt)
                .unwrap_or_else(SyncOutcome::Failed);
            entries.push((file, outcome));
        }
        Ok(SyncReport { entries })
    } else {
        if !path.is_file() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("local path '{}' does not exist", path.display()),
            )));
        }
        let record = store.lookup(path)?.ok_or(Error::SyncNotFound)?;
        let outcome = sync_file(remote, auth, store, path, &record, prompt)?;
        Ok(SyncReport {
            entries: vec![(path.to_path_buf(), outcome)],
        })
    }
}
