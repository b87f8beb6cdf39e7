//! One-time codes and private-key escrow.
//!
//! An OTC is a short random byte string rendered as speakable words, one word
//! per byte from a fixed 256-entry table (the PGP even word list, built for
//! exactly this byte↔word transcription job). The rendered phrase is the
//! passphrase under which the private-key material is escrowed server-side;
//! whoever holds the phrase — and the account password, if the key was
//! password-protected to begin with — can rebuild the credentials on a new
//! machine.

use crate::api::Remote;
use crate::crypto::{self, PersonalKey};
use crate::error::{Error, Result};
use crate::keys::KeyInfo;
use crate::session::{AuthInfo, PasswordPrompt};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

/// Generated codes are six words; parsing accepts any non-empty length.
pub const OTC_BYTES: usize = 6;

/// One dictionary word per byte value. Lookup is case-insensitive.
#[rustfmt::skip]
const WORDS: [&str; 256] = [
    "aardvark", "absurd", "accrue", "acme", "adrift", "adult", "afflict", "ahead",
    "aimless", "algol", "allow", "alone", "ammo", "ancient", "apple", "artist",
    "assume", "athens", "atlas", "aztec", "baboon", "backfield", "backward", "banjo",
    "beaming", "bedlamp", "beehive", "beeswax", "befriend", "belfast", "berserk", "billiard",
    "bison", "blackjack", "blockade", "blowtorch", "bluebird", "bombast", "bookshelf", "brackish",
    "breadline", "breakup", "brickyard", "briefcase", "burbank", "button", "buzzard", "cement",
    "chairlift", "chatter", "checkup", "chisel", "choking", "chopper", "christmas", "clamshell",
    "classic", "classroom", "cleanup", "clockwork", "cobra", "commence", "concert", "cowbell",
    "crackdown", "cranky", "crowfoot", "crucial", "crumpled", "crusade", "cubic", "dashboard",
    "deadbolt", "deckhand", "dogsled", "dragnet", "drainage", "dreadful", "drifter", "dropper",
    "drumbeat", "drunken", "dupont", "dwelling", "eating", "edict", "egghead", "eightball",
    "endorse", "endow", "enlist", "erase", "escape", "exceed", "eyeglass", "eyetooth",
    "facial", "fallout", "flagpole", "flatfoot", "flytrap", "fracture", "framework", "freedom",
    "frighten", "gazelle", "geiger", "glitter", "glucose", "goggles", "goldfish", "gremlin",
    "guidance", "hamlet", "highchair", "hockey", "indoors", "indulge", "inverse", "involve",
    "island", "jawbone", "keyboard", "kickoff", "kiwi", "klaxon", "locale", "lockup",
    "merit", "minnow", "miser", "mohawk", "mural", "music", "necklace", "neptune",
    "newborn", "nightbird", "oakland", "obtuse", "offload", "optic", "orca", "payday",
    "peachy", "pheasant", "physique", "playhouse", "pluto", "preclude", "prefer", "preshrunk",
    "printer", "prowler", "pupil", "puppy", "python", "quadrant", "quiver", "quota",
    "ragtime", "ratchet", "rebirth", "reform", "regain", "reindeer", "rematch", "repay",
    "retouch", "revenge", "reward", "rhythm", "ribcage", "ringbolt", "ringer", "roadshow",
    "rocker", "ruffled", "sailboat", "sawdust", "scallion", "scenic", "scorecard", "scotland",
    "seabird", "select", "sentence", "shadow", "shamrock", "showgirl", "skullcap", "skydive",
    "slingshot", "slowdown", "snapline", "snapshot", "snowcap", "snowslide", "solo", "southward",
    "soybean", "spaniel", "spearhead", "spellbind", "spheroid", "spigot", "spindle", "spyglass",
    "stagehand", "stagnate", "stairway", "standard", "stapler", "steamship", "sterling", "stockman",
    "stopwatch", "stormy", "sugar", "surmount", "suspense", "sweatband", "swelter", "tactics",
    "talon", "tapeworm", "tempest", "tiger", "tissue", "tonic", "topmost", "tracker",
    "transit", "trauma", "treadmill", "trojan", "trouble", "tumor", "tunnel", "tycoon",
    "uncut", "unearth", "unwind", "uproot", "upset", "upshot", "vapor", "village",
    "virus", "vulcan", "waffle", "wallet", "watchword", "wayside", "willow", "woodlark",
];

/// A one-time code: raw bytes with bijective word and hex renderings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Otc(Vec<u8>);

impl Otc {
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; OTC_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Otc(bytes)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| Error::InvalidOtc)?;
        if bytes.is_empty() {
            return Err(Error::InvalidOtc);
        }
        Ok(Otc(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Render as the speakable phrase: one lowercase word per byte.
    pub fn words(&self) -> String {
        let words: Vec<&str> = self.0.iter().map(|&b| WORDS[b as usize]).collect();
        words.join(" ")
    }

    /// Parse a transcribed phrase. Case-insensitive; one unrecognized word
    /// invalidates the whole code.
    pub fn parse_words(input: &str) -> Result<Self> {
        let mut bytes = Vec::new();
        for word in input.split_whitespace() {
            let lowered = word.to_ascii_lowercase();
            let index = WORDS
                .iter()
                .position(|&w| w == lowered)
                .ok_or(Error::InvalidOtc)?;
            bytes.push(index as u8);
        }
        if bytes.is_empty() {
            return Err(Error::InvalidOtc);
        }
        Ok(Otc(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Canonical form of an escrow passphrase: lowercase, single spaces.
fn canonical_phrase(input: &str) -> String {
    let words: Vec<String> = input
        .split_whitespace()
        .map(|w| w.to_ascii_lowercase())
        .collect();
    words.join(" ")
}

fn escrow_key(phrase: &str) -> PersonalKey {
    crypto::derive_personal_key(&canonical_phrase(phrase))
}

/// Escrow the stored private-key material (already password-encrypted if the
/// account has a password — the wrap stays double) under `phrase`.
pub fn backup(remote: &dyn Remote, auth: &mut AuthInfo, phrase: &str) -> Result<()> {
    let key = escrow_key(phrase);
    let blob = crypto::seal_with_secret(
        key.as_bytes(),
        auth.key_info().private_key_material.as_bytes(),
    );
    let username = auth.username().to_string();
    auth.request(remote, &username, |r, s| r.push_encrypted_key(s, &blob))?;
    tracing::debug!(user = %username, "escrow blob pushed");
    Ok(())
}

/// The server-held escrow blob for an account.
#[derive(Debug, Clone)]
pub struct RecoveryKeyInfo {
    pub username: String,
    pub encrypted_private_key: String,
}

/// Fetch the escrow blob. `otc_hex` is forwarded when already known so the
/// server can reject a wrong code early; the blob remains locally encrypted
/// under the code either way.
pub fn fetch_recovery(
    remote: &dyn Remote,
    username: &str,
    otc_hex: Option<&str>,
) -> Result<RecoveryKeyInfo> {
    let blob = remote
        .recover_keys(username, otc_hex)
        .map_err(|e| e.into_error(username))?;
    Ok(RecoveryKeyInfo {
        username: username.to_string(),
        encrypted_private_key: blob,
    })
}

impl RecoveryKeyInfo {
    /// Decrypt the escrow blob with the one-time phrase. A wrong phrase is
    /// `InvalidOtc`. If the plaintext is not an armored key export, the
    /// original key was password-protected: a second decryption with the
    /// personal key is required, and its failure is `Decryption` — a
    /// different mistake, reported differently.
    pub fn decrypt(
        &self,
        phrase: &str,
        password: Option<&str>,
        prompter: &mut dyn PasswordPrompt,
    ) -> Result<(KeyInfo, StaticSecret)> {
        let key = escrow_key(phrase);
        let plaintext = crypto::open_with_secret(key.as_bytes(), &self.encrypted_private_key)
            .map_err(|e| match e {
                Error::Decryption => Error::InvalidOtc,
                other => other,
            })?;
        let stored = std::str::from_utf8(&plaintext)
            .map_err(|_| Error::InvalidOtc)?
            .to_string();

        let (private_key, encrypted) = if crypto::is_private_key_export(&stored) {
            (crypto::import_private_key(&stored)?, false)
        } else {
            // Double-wrapped: the stored material still carries the at-rest
            // password encryption.
            let personal_key = match password {
                Some(password) => crypto::derive_personal_key(password),
                None => {
                    let prompted = prompter.read_password()?;
                    crypto::derive_personal_key(&prompted)
                }
            };
            let inner = crypto::open_with_secret(personal_key.as_bytes(), &stored)?;
            let armored = std::str::from_utf8(&inner).map_err(|_| Error::Decryption)?;
            (crypto::import_private_key(armored)?, true)
        };

        let public_key = PublicKey::from(&private_key);
        let key_info = KeyInfo {
            username: self.username.clone(),
            public_key: crypto::export_public_key(&public_key),
            private_key_material: stored,
            encrypted,
        };
        Ok((key_info, private_key))
    }
}
