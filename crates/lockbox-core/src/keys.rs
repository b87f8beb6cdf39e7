//! User credentials: the durable `KeyInfo` record and registration.

use crate::api::Remote;
use crate::crypto::{self, PersonalKey};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;

/// A user's identity and (possibly password-protected) private key, persisted
/// as `keyinfo.json`. Never mutated except by re-registration or recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyInfo {
    pub username: String,
    pub public_key: String,
    /// Armored private-key export when `encrypted` is false, otherwise
    /// base64(nonce ‖ ciphertext) of that export under the personal key.
    pub private_key_material: String,
    pub encrypted: bool,
}

impl KeyInfo {
    /// Import the private key, decrypting with `personal_key` when the stored
    /// material is password-protected. A wrong password surfaces as a
    /// recoverable decryption error, distinct from malformed material.
    pub fn private_key(&self, personal_key: Option<&PersonalKey>) -> Result<StaticSecret> {
        if self.encrypted {
            let personal_key = personal_key.ok_or(Error::Decryption)?;
            let plaintext =
                crypto::open_with_secret(personal_key.as_bytes(), &self.private_key_material)?;
            let armored = std::str::from_utf8(&plaintext).map_err(|_| Error::Decryption)?;
            crypto::import_private_key(armored)
        } else {
            crypto::import_private_key(&self.private_key_material)
        }
    }
}

/// Usernames are lowercase alphanumeric, checked before any network call.
pub fn valid_username(username: &str) -> bool {
    !username.is_empty()
        && username
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// Generate a keypair, optionally protect the export under a password, and
/// register the public key with the server.
pub fn register(
    remote: &dyn Remote,
    username: &str,
    password: Option<&str>,
) -> Result<(KeyInfo, StaticSecret)> {
    if !valid_username(username) {
        return Err(Error::InvalidUsername(username.to_string()));
    }

    let (private_key, public_key) = crypto::generate_keypair();
    let public_armored = crypto::export_public_key(&public_key);
    let private_armored = crypto::export_private_key(&private_key);

    let (material, encrypted) = match password {
        Some(password) => {
            let personal_key = crypto::derive_personal_key(password);
            let sealed =
                crypto::seal_with_secret(personal_key.as_bytes(), private_armored.as_bytes());
            (sealed, true)
        }
        None => (private_armored.to_string(), false),
    };

    let key_info = KeyInfo {
        username: username.to_string(),
        public_key: public_armored.clone(),
        private_key_material: material,
        encrypted,
    };

    remote
        .register_user(username, &public_armored)
        .map_err(|e| e.into_error(username))?;
    Ok((key_info, private_key))
}
