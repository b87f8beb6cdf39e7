//! Cryptographic primitives.
//!
//! Asymmetric operations are X25519 sealed boxes: an ephemeral keypair, ECDH
//! against the recipient's static key, HKDF-SHA256, then XChaCha20-Poly1305.
//! They are used only to wrap content keys and challenge values, never file
//! content. File content uses a fresh random symmetric key per upload.
//!
//! The personal key is sha256(password) with no salt: deriving it must be a
//! pure function of the password alone so every machine a user logs in from
//! reaches the same key without shared state.

use crate::error::{Error, Result};
use base64::{engine::general_purpose, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::EphemeralSecret;
use zeroize::Zeroizing;

pub use x25519_dalek::{PublicKey, StaticSecret};

pub const PUBLIC_KEY_HEADER: &str = "lockbox-public-key-v1:";
pub const PRIVATE_KEY_HEADER: &str = "lockbox-private-key-v1:";
pub const CONTENT_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const SEAL_INFO: &[u8] = b"lockbox-v1 sealed box";

/// A secret derived from the user's password, protecting the private key at
/// rest. Held only in memory, zeroized on drop.
pub struct PersonalKey(Zeroizing<[u8; 32]>);

impl PersonalKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Deterministic, salt-free derivation: the same password always yields the
/// same key on any machine.
pub fn derive_personal_key(password: &str) -> PersonalKey {
    let digest = Sha256::digest(password.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(digest.as_slice());
    PersonalKey(key)
}

pub fn generate_keypair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

pub fn export_public_key(key: &PublicKey) -> String {
    format!(
        "{PUBLIC_KEY_HEADER}{}",
        general_purpose::STANDARD.encode(key.as_bytes())
    )
}

pub fn import_public_key(armored: &str) -> Result<PublicKey> {
    let bytes = decode_armored(armored, PUBLIC_KEY_HEADER, "public key")?;
    Ok(PublicKey::from(bytes))
}

pub fn export_private_key(key: &StaticSecret) -> Zeroizing<String> {
    Zeroizing::new(format!(
        "{PRIVATE_KEY_HEADER}{}",
        general_purpose::STANDARD.encode(key.to_bytes())
    ))
}

pub fn import_private_key(armored: &str) -> Result<StaticSecret> {
    let bytes = decode_armored(armored, PRIVATE_KEY_HEADER, "private key")?;
    Ok(StaticSecret::from(bytes))
}

/// Whether `text` looks like an armored private-key export. Recovery uses
/// this to tell a fully decrypted key apart from a still-password-protected
/// blob.
pub fn is_private_key_export(text: &str) -> bool {
    text.starts_with(PRIVATE_KEY_HEADER)
}

fn decode_armored(armored: &str, header: &str, what: &str) -> Result<[u8; 32]> {
    let body = armored
        .strip_prefix(header)
        .ok_or_else(|| Error::ConfigParse(what.to_string()))?;
    let bytes = general_purpose::STANDARD
        .decode(body.trim())
        .map_err(|_| Error::ConfigParse(what.to_string()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::ConfigParse(what.to_string()))
}

pub fn generate_content_key() -> Zeroizing<[u8; CONTENT_KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; CONTENT_KEY_LEN]);
    OsRng.fill_bytes(key.as_mut_slice());
    key
}

fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Authenticated encryption of file content. Output is `nonce ‖ ciphertext`.
pub fn encrypt_content(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if key.len() != CONTENT_KEY_LEN {
        return Err(Error::Decryption);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = generate_nonce();
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Decryption)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt_content(key: &[u8], blob: &[u8]) -> Result<Vec<u8>> {
    if key.len() != CONTENT_KEY_LEN || blob.len() < NONCE_LEN {
        return Err(Error::Decryption);
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Decryption)
}

/// Wrap a small secret for a recipient's public key.
/// Output is `ephemeral_pub(32) ‖ nonce(24) ‖ ciphertext`.
pub fn wrap_key(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    let key = seal_key(shared.as_bytes(), ephemeral_pub.as_bytes(), recipient.as_bytes());
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    let nonce = generate_nonce();
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Decryption)?;
    let mut out = Vec::with_capacity(32 + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_pub.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Unwrap a secret wrapped for our public key. Fails with a recoverable
/// decryption error on a wrong key or a tampered blob.
pub fn unwrap_key(private: &StaticSecret, blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < 32 + NONCE_LEN {
        return Err(Error::Decryption);
    }
    let (eph_bytes, rest) = blob.split_at(32);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let eph_array: [u8; 32] = eph_bytes.try_into().map_err(|_| Error::Decryption)?;
    let ephemeral_pub = PublicKey::from(eph_array);
    let our_pub = PublicKey::from(private);
    let shared = private.diffie_hellman(&ephemeral_pub);
    let key = seal_key(shared.as_bytes(), ephemeral_pub.as_bytes(), our_pub.as_bytes());
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Decryption)
}

fn seal_key(shared: &[u8], ephemeral_pub: &[u8], recipient_pub: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(ephemeral_pub);
    salt.extend_from_slice(recipient_pub);
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = Zeroizing::new([0u8; 32]);
    // expand only fails for oversized output lengths
    hk.expand(SEAL_INFO, okm.as_mut_slice())
        .unwrap_or_else(|_| unreachable!("hkdf output length"));
    okm
}

/// Encrypt a small plaintext under a 32-byte secret (personal key or escrow
/// key), rendered base64 for storage or transport.
pub fn seal_with_secret(secret: &[u8; 32], plaintext: &[u8]) -> String {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(secret));
    let nonce = generate_nonce();
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .unwrap_or_else(|_| unreachable!("aead encrypt with fixed-size key"));
    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    general_purpose::STANDARD.encode(blob)
}

/// Inverse of [`seal_with_secret`]. A malformed blob is a parse error; an
/// authentication failure (wrong secret) is a recoverable decryption error.
pub fn open_with_secret(secret: &[u8; 32], blob_b64: &str) -> Result<Zeroizing<Vec<u8>>> {
    let blob = general_purpose::STANDARD
        .decode(blob_b64.trim())
        .map_err(|_| Error::ConfigParse("encrypted key material".to_string()))?;
    if blob.len() < NONCE_LEN {
        return Err(Error::ConfigParse("encrypted key material".to_string()));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(secret));
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Decryption)?;
    Ok(Zeroizing::new(plaintext))
}

/// Content hash used for change detection and download integrity: hex sha256.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
