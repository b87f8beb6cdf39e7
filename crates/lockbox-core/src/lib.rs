//! lockbox-core — client core for the Lockbox end-to-end-encrypted file
//! mailbox.
//!
//! Files are encrypted with per-file symmetric keys; each key is wrapped
//! under the public key of every reader. The core covers credential and
//! session management, envelope encryption, one-time-code key escrow, and
//! the inode-keyed sync engine. It performs no console I/O: interactive
//! decisions (passwords, overwrite confirmations) are capabilities the
//! driver injects.
//!
//! # Module layout
//! - `crypto`    — keypairs, sealed-box key wrapping, content AEAD, hashing
//! - `keys`      — `KeyInfo`, registration, at-rest private-key protection
//! - `config`    — profile directory, credential/session persistence
//! - `api`       — `Remote` service interface + blocking HTTP implementation
//! - `session`   — challenge/response login, `AuthInfo`, transparent reauth
//! - `envelope`  — upload/download/share/update
//! - `otc`       — one-time-code rendering and key backup/recovery
//! - `syncstore` — durable inode↔remote sync records with hardlink aliases
//! - `engine`    — three-way-hash reconciliation
//! - `error`     — closed error taxonomy

pub mod api;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod otc;
pub mod session;
pub mod syncstore;

pub use error::{Error, Result};

/// Client protocol version, sent with version-gated requests.
pub const CLIENT_VERSION: &str = "0.1.0";
