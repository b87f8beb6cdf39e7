//! Envelope encryption: upload, download, share, update.
//!
//! Every upload gets a fresh content key; the key is wrapped under the
//! owner's public key, and sharing re-wraps the same key for each recipient.
//! Content is never re-encrypted to share it, and an update reuses the
//! file's existing key so recipients keep their access.

use crate::api::{FileInfo, Remote};
use crate::crypto;
use crate::error::{Error, ErrorCode, Result};
use crate::session::AuthInfo;
use std::collections::BTreeMap;
use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

#[derive(Debug)]
pub enum UpdateOutcome {
    /// Content hash matches the server's; nothing was written.
    Unchanged,
    /// New content pushed; `info` is the pre-update metadata.
    Updated { info: FileInfo },
}

/// Encrypt and upload `content` as remote file `name`.
///
/// On a name collision: fail with `FileExists` unless `overwrite`, in which
/// case the existing file is deleted and the store is prepared once more.
/// `FileTooLarge` is never retried. Returns the new file id.
pub fn upload(
    remote: &dyn Remote,
    auth: &mut AuthInfo,
    content: &[u8],
    name: &str,
    overwrite: bool,
) -> Result<String> {
    let hash = crypto::content_hash(content);
    let content_key = crypto::generate_content_key();
    let ciphertext = crypto::encrypt_content(content_key.as_slice(), content)?;
    let wrapped_key = hex::encode(crypto::wrap_key(&auth.public_key()?, content_key.as_slice())?);
    let bytes = ciphertext.len() as u64;

    let mut prepared =
        auth.call(remote, |r, s| r.prepare_store(s, name, bytes, &hash, &wrapped_key))?;

    if let Err(err) = &prepared {
        if err.is(ErrorCode::FileTooLarge) {
            return Err(Error::FileTooLarge);
        }
        if err.is(ErrorCode::FileExists) {
            if !overwrite {
                return Err(Error::FileExists(name.to_string()));
            }
            let owner = auth.username().to_string();
            let existing =
                auth.request(remote, name, |r, s| r.file_info(s, name, Some(&owner)))?;
            auth.request(remote, name, |r, s| r.delete(s, &existing.file_id))?;
            prepared =
                auth.call(remote, |r, s| r.prepare_store(s, name, bytes, &hash, &wrapped_key))?;
        }
    }
    let prepared = prepared.map_err(|e| e.into_error(name))?;

    remote
        .put_blob(&prepared.upload_url, &ciphertext)
        .map_err(|e| Error::Upload(e.to_string()))?;
    auth.request(remote, name, |r, s| r.store(s, &prepared.file_id))?;
    tracing::debug!(name, file_id = %prepared.file_id, bytes, "uploaded");
    Ok(prepared.file_id)
}

/// Download and decrypt a remote file, verifying the decrypted plaintext
/// against the server-declared hash before returning it. A mismatch is a
/// tamper/corruption failure and fails closed.
pub fn download(
    remote: &dyn Remote,
    auth: &mut AuthInfo,
    name: &str,
    owner: &str,
) -> Result<Vec<u8>> {
    let info = match auth.call(remote, |r, s| r.file_info(s, name, Some(owner)))? {
        Ok(info) => info,
        Err(e) if e.is(ErrorCode::UserNotFound) => {
            return Err(Error::UserNotFound(owner.to_string()))
        }
        Err(e) => return Err(e.into_error(name)),
    };
    let save = auth.request(remote, name, |r, s| r.save(s, &info.file_id))?;
    fetch_and_decrypt(remote, auth, &save.download_url, &save.encrypted_key, &save.hash)
}

/// Shared pull path for `download` and the sync engine: fetch ciphertext,
/// unwrap the caller's key, decrypt, verify.
pub(crate) fn fetch_and_decrypt(
    remote: &dyn Remote,
    auth: &mut AuthInfo,
    download_url: &str,
    wrapped_key_hex: &str,
    expected_hash: &str,
) -> Result<Vec<u8>> {
    let blob = remote
        .get_blob(download_url)
        .map_err(|e| Error::Download(e.to_string()))?;
    let wrapped = decode_wrapped_key(wrapped_key_hex)?;
    let content_key = {
        let private_key = auth.private_key()?;
        Zeroizing::new(
            crypto::unwrap_key(private_key, &wrapped)
                .map_err(|_| Error::Download("could not unwrap content key".to_string()))?,
        )
    };
    let content = crypto::decrypt_content(&content_key, &blob)
        .map_err(|_| Error::Download("could not decrypt content".to_string()))?;
    if crypto::content_hash(&content) != expected_hash {
        return Err(Error::Download(
            "content hash does not match the server's; the file may have been tampered with"
                .to_string(),
        ));
    }
    Ok(content)
}

/// Share a file we own with `recipients`.
///
/// All recipient keys are resolved up front: one unknown name aborts the
/// whole operation before anything is shared.
pub fn share(
    remote: &dyn Remote,
    auth: &mut AuthInfo,
    name: &str,
    recipients: &[String],
) -> Result<()> {
    let owner = auth.username().to_string();
    let info = auth.request(remote, name, |r, s| r.file_info(s, name, Some(&owner)))?;

    let mut public_keys: Vec<(String, PublicKey)> = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let user = remote.user_info(recipient).map_err(|e| {
            if e.is(ErrorCode::UserNotFound) {
                Error::UserNotFound(recipient.clone())
            } else {
                e.into_error(recipient)
            }
        })?;
        let key = crypto::import_public_key(&user.public_key)
            .map_err(|_| Error::Protocol(format!("malformed public key for '{recipient}'")))?;
        public_keys.push((recipient.clone(), key));
    }

    let wrapped = decode_wrapped_key(&info.encrypted_key)?;
    let content_key = {
        let private_key = auth.private_key()?;
        Zeroizing::new(crypto::unwrap_key(private_key, &wrapped)?)
    };

    let mut recipient_keys = BTreeMap::new();
    for (recipient, public_key) in public_keys {
        let rewrapped = crypto::wrap_key(&public_key, &content_key)?;
        recipient_keys.insert(recipient, hex::encode(rewrapped));
    }

    auth.request(remote, name, |r, s| r.share(s, &info.file_id, &recipient_keys))?;
    tracing::debug!(name, count = recipients.len(), "shared");
    Ok(())
}

/// Push new content for an existing file, preserving its content key.
/// Short-circuits without any network write when the content is unchanged.
pub fn update(
    remote: &dyn Remote,
    auth: &mut AuthInfo,
    file_id: &str,
    content: &[u8],
) -> Result<UpdateOutcome> {
    let info = auth.request(remote, file_id, |r, s| r.file_info_by_id(s, file_id))?;
    if info.owner != auth.username() {
        return Err(Error::AccessDenied);
    }

    let hash = crypto::content_hash(content);
    if info.hash == hash {
        return Ok(UpdateOutcome::Unchanged);
    }

    let wrapped = decode_wrapped_key(&info.encrypted_key)?;
    let content_key = {
        let private_key = auth.private_key()?;
        Zeroizing::new(crypto::unwrap_key(private_key, &wrapped)?)
    };
    let ciphertext = crypto::encrypt_content(&content_key, content)?;
    let bytes = ciphertext.len() as u64;

    let prepared = match auth.call(remote, |r, s| r.prepare_update(s, &info.file_id, bytes, &hash))?
    {
        Ok(prepared) => prepared,
        Err(e) if e.is(ErrorCode::FileTooLarge) => return Err(Error::FileTooLarge),
        Err(e) => return Err(e.into_error(&info.name)),
    };

    remote
        .put_blob(&prepared.upload_url, &ciphertext)
        .map_err(|e| Error::Upload(e.to_string()))?;
    let name = info.name.clone();
    auth.request(remote, &name, |r, s| r.store(s, &info.file_id))?;
    tracing::debug!(file_id, bytes, "updated");
    Ok(UpdateOutcome::Updated { info })
}

fn decode_wrapped_key(wrapped_hex: &str) -> Result<Vec<u8>> {
    hex::decode(wrapped_hex.trim())
        .map_err(|_| Error::Protocol("malformed wrapped content key".to_string()))
}
