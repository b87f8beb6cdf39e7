//! Protocol-level tests over an in-memory service.
//!
//! Scenarios:
//!  1. Register → login round trip; wrong password fails before any network
//!  2. Upload/download round trip; name collisions and overwrite
//!  3. Download tamper detection fails closed
//!  4. Sharing re-wraps the same content key; unknown recipients abort early
//!  5. Update short-circuits on unchanged content and preserves key identity
//!  6. Transparent session reauth: exactly one retry
//!  7. One-time-code backup → recover round trip, single and double wrapped
//!  8. Three-way sync decision table
//!  9. Stale sync records self-heal during batch sync

use lockbox_core::api::{
    ApiError, ApiResult, FileInfo, PrepareStoreResponse, PrepareUpdateResponse, Remote,
    SaveResponse, Session, UserInfoResponse,
};
use lockbox_core::config::Config;
use lockbox_core::engine::{self, SyncOutcome, SyncPrompt};
use lockbox_core::envelope::{self, UpdateOutcome};
use lockbox_core::error::{Error, ErrorCode};
use lockbox_core::keys::{self, KeyInfo};
use lockbox_core::otc::{self, Otc};
use lockbox_core::session::{self, AuthInfo, NoPrompt, PasswordPrompt};
use lockbox_core::syncstore::SyncStore;
use lockbox_core::{crypto, Result};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::tempdir;
use zeroize::Zeroizing;

// ── In-memory service ───────────────────────────────────────────────────────

#[derive(Default)]
struct ServerUser {
    public_key: String,
    escrow: Option<String>,
    pending_challenge: Option<String>,
}

#[derive(Clone)]
struct ServerFile {
    file_id: String,
    name: String,
    owner: String,
    hash: String,
    ciphertext: Vec<u8>,
    /// Per-reader wrapped content keys, hex.
    keys: BTreeMap<String, String>,
}

struct Staged {
    upload_url: String,
    name: String,
    owner: String,
    hash: String,
    wrapped_key: String,
    bytes: Option<Vec<u8>>,
    /// `Some` when this stages an update of an existing file.
    updates: Option<String>,
}

#[derive(Default)]
struct State {
    users: BTreeMap<String, ServerUser>,
    files: Vec<ServerFile>,
    staged: Vec<Staged>,
    sessions: Vec<Session>,
    next_id: u64,
    expected_otc: Option<String>,
    /// When set, every session-authenticated call is rejected.
    reject_authed: bool,
    challenges_served: u32,
    saves_served: u32,
    shares_served: u32,
}

#[derive(Default)]
struct FakeRemote {
    state: RefCell<State>,
}

impl FakeRemote {
    fn new() -> Self {
        Self::default()
    }

    fn expire_sessions(&self) {
        self.state.borrow_mut().sessions.clear();
    }

    fn reject_authed_calls(&self, reject: bool) {
        self.state.borrow_mut().reject_authed = reject;
    }

    fn expect_otc(&self, otc_hex: &str) {
        self.state.borrow_mut().expected_otc = Some(otc_hex.to_string());
    }

    fn challenges_served(&self) -> u32 {
        self.state.borrow().challenges_served
    }

    fn saves_served(&self) -> u32 {
        self.state.borrow().saves_served
    }

    fn shares_served(&self) -> u32 {
        self.state.borrow().shares_served
    }

    fn tamper(&self, file_id: &str) {
        let mut state = self.state.borrow_mut();
        let file = state
            .files
            .iter_mut()
            .find(|f| f.file_id == file_id)
            .expect("file to tamper with");
        let last = file.ciphertext.len() - 1;
        file.ciphertext[last] ^= 0x01;
    }

    fn drop_file(&self, file_id: &str) {
        self.state.borrow_mut().files.retain(|f| f.file_id != file_id);
    }

    fn server_hash(&self, file_id: &str) -> String {
        self.state
            .borrow()
            .files
            .iter()
            .find(|f| f.file_id == file_id)
            .expect("file")
            .hash
            .clone()
    }

    fn check_session(&self, session: &Session) -> ApiResult<String> {
        let state = self.state.borrow();
        if state.reject_authed {
            return Err(ApiError::Server(ErrorCode::AuthenticationFailed));
        }
        match state.sessions.iter().find(|s| *s == session) {
            Some(session) => {
                let username = session.split('/').nth(1).unwrap_or_default();
                Ok(username.to_string())
            }
            None => Err(ApiError::Server(ErrorCode::AuthenticationFailed)),
        }
    }

    fn fresh_id(&self, prefix: &str) -> String {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        format!("{prefix}-{}", state.next_id)
    }
}

impl Remote for FakeRemote {
    fn user_info(&self, username: &str) -> ApiResult<UserInfoResponse> {
        let state = self.state.borrow();
        state
            .users
            .get(username)
            .map(|u| UserInfoResponse {
                public_key: u.public_key.clone(),
            })
            .ok_or(ApiError::Server(ErrorCode::UserNotFound))
    }

    fn register_user(&self, username: &str, public_key: &str) -> ApiResult<()> {
        let mut state = self.state.borrow_mut();
        if state.users.contains_key(username) {
            return Err(ApiError::Server(ErrorCode::UserExists));
        }
        state.users.insert(
            username.to_string(),
            ServerUser {
                public_key: public_key.to_string(),
                ..Default::default()
            },
        );
        Ok(())
    }

    fn challenge(&self, username: &str) -> ApiResult<String> {
        let mut state = self.state.borrow_mut();
        state.challenges_served += 1;
        let public_key = {
            let user = state
                .users
                .get(username)
                .ok_or(ApiError::Server(ErrorCode::UserNotFound))?;
            crypto::import_public_key(&user.public_key)
                .map_err(|e| ApiError::Protocol(e.to_string()))?
        };
        let secret: Vec<u8> = (0..32).map(|i| (i * 7) as u8).collect();
        let wrapped =
            crypto::wrap_key(&public_key, &secret).map_err(|e| ApiError::Protocol(e.to_string()))?;
        if let Some(user) = state.users.get_mut(username) {
            user.pending_challenge = Some(hex::encode(&secret));
        }
        Ok(hex::encode(wrapped))
    }

    fn login(&self, username: &str, challenge_response: &str) -> ApiResult<Session> {
        let mut state = self.state.borrow_mut();
        let expected = state
            .users
            .get_mut(username)
            .ok_or(ApiError::Server(ErrorCode::UserNotFound))?
            .pending_challenge
            .take();
        if expected.as_deref() != Some(challenge_response) {
            return Err(ApiError::Server(ErrorCode::AuthenticationFailed));
        }
        state.next_id += 1;
        let session = format!("session-{}/{username}", state.next_id);
        state.sessions.push(session.clone());
        Ok(session)
    }

    fn prepare_store(
        &self,
        session: &Session,
        filename: &str,
        _bytes: u64,
        hash: &str,
        wrapped_key: &str,
    ) -> ApiResult<PrepareStoreResponse> {
        let owner = self.check_session(session)?;
        {
            let state = self.state.borrow();
            if state
                .files
                .iter()
                .any(|f| f.owner == owner && f.name == filename)
            {
                return Err(ApiError::Server(ErrorCode::FileExists));
            }
        }
        let file_id = self.fresh_id("file");
        let upload_url = format!("mem://upload/{file_id}");
        self.state.borrow_mut().staged.push(Staged {
            upload_url: upload_url.clone(),
            name: filename.to_string(),
            owner,
            hash: hash.to_string(),
            wrapped_key: wrapped_key.to_string(),
            bytes: None,
            updates: None,
        });
        Ok(PrepareStoreResponse { file_id, upload_url })
    }

    fn prepare_update(
        &self,
        session: &Session,
        file_id: &str,
        _bytes: u64,
        hash: &str,
    ) -> ApiResult<PrepareUpdateResponse> {
        let owner = self.check_session(session)?;
        {
            let state = self.state.borrow();
            if !state.files.iter().any(|f| f.file_id == file_id) {
                return Err(ApiError::Server(ErrorCode::FileNotFound));
            }
        }
        let upload_url = format!("mem://update/{file_id}");
        self.state.borrow_mut().staged.push(Staged {
            upload_url: upload_url.clone(),
            name: String::new(),
            owner,
            hash: hash.to_string(),
            wrapped_key: String::new(),
            bytes: None,
            updates: Some(file_id.to_string()),
        });
        Ok(PrepareUpdateResponse { upload_url })
    }

    fn store(&self, session: &Session, file_id: &str) -> ApiResult<()> {
        self.check_session(session)?;
        let mut state = self.state.borrow_mut();
        let suffix = format!("/{file_id}");
        let staged_index = state
            .staged
            .iter()
            .position(|s| s.upload_url.ends_with(&suffix) && s.bytes.is_some())
            .ok_or(ApiError::Server(ErrorCode::FileNotFound))?;
        let staged = state.staged.remove(staged_index);
        let bytes = staged.bytes.unwrap_or_default();
        match staged.updates {
            Some(existing_id) => {
                let file = state
                    .files
                    .iter_mut()
                    .find(|f| f.file_id == existing_id)
                    .ok_or(ApiError::Server(ErrorCode::FileNotFound))?;
                file.ciphertext = bytes;
                file.hash = staged.hash;
            }
            None => {
                let mut keys = BTreeMap::new();
                keys.insert(staged.owner.clone(), staged.wrapped_key.clone());
                state.files.push(ServerFile {
                    file_id: file_id.to_string(),
                    name: staged.name,
                    owner: staged.owner,
                    hash: staged.hash,
                    ciphertext: bytes,
                    keys,
                });
            }
        }
        Ok(())
    }

    fn save(&self, session: &Session, file_id: &str) -> ApiResult<SaveResponse> {
        let caller = self.check_session(session)?;
        let mut state = self.state.borrow_mut();
        state.saves_served += 1;
        let file = state
            .files
            .iter()
            .find(|f| f.file_id == file_id)
            .ok_or(ApiError::Server(ErrorCode::FileNotFound))?;
        let wrapped = file
            .keys
            .get(&caller)
            .ok_or(ApiError::Server(ErrorCode::AccessDenied))?;
        Ok(SaveResponse {
            download_url: format!("mem://download/{file_id}"),
            encrypted_key: wrapped.clone(),
            hash: file.hash.clone(),
        })
    }

    fn share(
        &self,
        session: &Session,
        file_id: &str,
        recipient_keys: &BTreeMap<String, String>,
    ) -> ApiResult<()> {
        self.check_session(session)?;
        let mut state = self.state.borrow_mut();
        state.shares_served += 1;
        for recipient in recipient_keys.keys() {
            if !state.users.contains_key(recipient) {
                return Err(ApiError::Server(ErrorCode::UserNotFound));
            }
        }
        let file = state
            .files
            .iter_mut()
            .find(|f| f.file_id == file_id)
            .ok_or(ApiError::Server(ErrorCode::FileNotFound))?;
        for (recipient, wrapped) in recipient_keys {
            file.keys.insert(recipient.clone(), wrapped.clone());
        }
        Ok(())
    }

    fn delete(&self, session: &Session, file_id: &str) -> ApiResult<()> {
        self.check_session(session)?;
        let mut state = self.state.borrow_mut();
        let before = state.files.len();
        state.files.retain(|f| f.file_id != file_id);
        if state.files.len() == before {
            return Err(ApiError::Server(ErrorCode::FileNotFound));
        }
        Ok(())
    }

    fn file_info(
        &self,
        session: &Session,
        filename: &str,
        owner: Option<&str>,
    ) -> ApiResult<FileInfo> {
        let caller = self.check_session(session)?;
        let state = self.state.borrow();
        let matches: Vec<&ServerFile> = state
            .files
            .iter()
            .filter(|f| f.name == filename)
            .filter(|f| owner.map_or(true, |o| f.owner == o))
            .collect();
        match matches.as_slice() {
            [] => Err(ApiError::Server(ErrorCode::FileNotFound)),
            [file] => Ok(file_info_for(file, &caller)),
            _ => Err(ApiError::Server(ErrorCode::FilenameNotSpecific)),
        }
    }

    fn file_info_by_id(&self, session: &Session, file_id: &str) -> ApiResult<FileInfo> {
        let caller = self.check_session(session)?;
        let state = self.state.borrow();
        state
            .files
            .iter()
            .find(|f| f.file_id == file_id)
            .map(|f| file_info_for(f, &caller))
            .ok_or(ApiError::Server(ErrorCode::FileNotFound))
    }

    fn files_info(&self, session: &Session) -> ApiResult<Vec<FileInfo>> {
        let caller = self.check_session(session)?;
        let state = self.state.borrow();
        Ok(state
            .files
            .iter()
            .filter(|f| f.owner == caller || f.keys.contains_key(&caller))
            .map(|f| file_info_for(f, &caller))
            .collect())
    }

    fn push_encrypted_key(&self, session: &Session, blob: &str) -> ApiResult<()> {
        let caller = self.check_session(session)?;
        let mut state = self.state.borrow_mut();
        match state.users.get_mut(&caller) {
            Some(user) => {
                user.escrow = Some(blob.to_string());
                Ok(())
            }
            None => Err(ApiError::Server(ErrorCode::UserNotFound)),
        }
    }

    fn recover_keys(&self, username: &str, otc: Option<&str>) -> ApiResult<String> {
        let state = self.state.borrow();
        let user = state
            .users
            .get(username)
            .ok_or(ApiError::Server(ErrorCode::UserNotFound))?;
        if let (Some(expected), Some(given)) = (state.expected_otc.as_deref(), otc) {
            if expected != given {
                return Err(ApiError::Server(ErrorCode::InvalidOtc));
            }
        }
        user.escrow
            .clone()
            .ok_or(ApiError::Server(ErrorCode::RecoveryNotReady))
    }

    fn put_blob(&self, upload_url: &str, bytes: &[u8]) -> ApiResult<()> {
        let mut state = self.state.borrow_mut();
        let staged = state
            .staged
            .iter_mut()
            .find(|s| s.upload_url == upload_url)
            .ok_or_else(|| ApiError::Protocol("unknown upload url".into()))?;
        staged.bytes = Some(bytes.to_vec());
        Ok(())
    }

    fn get_blob(&self, download_url: &str) -> ApiResult<Vec<u8>> {
        let state = self.state.borrow();
        let file_id = download_url
            .rsplit('/')
            .next()
            .unwrap_or_default();
        state
            .files
            .iter()
            .find(|f| f.file_id == file_id)
            .map(|f| f.ciphertext.clone())
            .ok_or_else(|| ApiError::Protocol("unknown download url".into()))
    }
}

fn file_info_for(file: &ServerFile, caller: &str) -> FileInfo {
    FileInfo {
        file_id: file.file_id.clone(),
        name: file.name.clone(),
        owner: file.owner.clone(),
        bytes: file.ciphertext.len() as u64,
        last_modified: 1_700_000_000_000,
        encrypted_key: file.keys.get(caller).cloned().unwrap_or_default(),
        hash: file.hash.clone(),
        shared_with: file.keys.keys().cloned().collect(),
    }
}

// ── Test fixtures ───────────────────────────────────────────────────────────

struct CannedPassword(&'static str);

impl PasswordPrompt for CannedPassword {
    fn read_password(&mut self) -> Result<Zeroizing<String>> {
        Ok(Zeroizing::new(self.0.to_string()))
    }
}

struct Answer(bool, u32);

impl SyncPrompt for Answer {
    fn confirm_overwrite(&mut self, _local: &Path, _remote_name: &str) -> bool {
        self.1 += 1;
        self.0
    }
}

fn profile(dir: &Path) -> Config {
    Config::at(dir.join("profile")).expect("profile dir")
}

fn registered_user(
    remote: &FakeRemote,
    config: &Config,
    username: &str,
    password: &'static str,
) -> (KeyInfo, AuthInfo) {
    let (key_info, _) = keys::register(remote, username, Some(password)).expect("register");
    config.set_key_info(&key_info).expect("persist key info");
    let auth = session::login(
        config,
        remote,
        key_info.clone(),
        Some(password),
        None,
        Box::new(NoPrompt),
    )
    .expect("login");
    (key_info, auth)
}

// ─── 1. Registration and login ──────────────────────────────────────────────

#[test]
fn register_then_login_round_trip() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let config = profile(dir.path());

    let (key_info, _) = keys::register(&remote, "alice", Some("longpassword1")).unwrap();
    assert!(key_info.encrypted);

    let auth = session::login(
        &config,
        &remote,
        key_info.clone(),
        Some("longpassword1"),
        None,
        Box::new(NoPrompt),
    )
    .unwrap();
    assert!(!auth.session().is_empty());
    // Establishing a session also persists it for the next invocation.
    assert_eq!(config.session().as_deref(), Some(auth.session().as_str()));
}

#[test]
fn wrong_password_fails_before_any_network_call() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let config = profile(dir.path());

    let (key_info, _) = keys::register(&remote, "alice", Some("longpassword1")).unwrap();
    let served_before = remote.challenges_served();

    let result = session::login(
        &config,
        &remote,
        key_info,
        Some("wrongpass"),
        None,
        Box::new(NoPrompt),
    );
    assert!(matches!(result, Err(Error::Decryption)));
    assert_eq!(remote.challenges_served(), served_before);
}

#[test]
fn duplicate_and_invalid_usernames_are_rejected() {
    let remote = FakeRemote::new();
    keys::register(&remote, "alice", None).unwrap();
    assert!(matches!(
        keys::register(&remote, "alice", None),
        Err(Error::UserExists(_))
    ));
    assert!(matches!(
        keys::register(&remote, "Not Valid", None),
        Err(Error::InvalidUsername(_))
    ));
}

// ─── 2. Upload and download ─────────────────────────────────────────────────

#[test]
fn upload_download_round_trip() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let config = profile(dir.path());
    let (_, mut auth) = registered_user(&remote, &config, "alice", "longpassword1");

    let content = b"the quick brown fox".to_vec();
    envelope::upload(&remote, &mut auth, &content, "notes.txt", false).unwrap();
    let fetched = envelope::download(&remote, &mut auth, "notes.txt", "alice").unwrap();
    assert_eq!(fetched, content);
}

#[test]
fn name_collision_respects_overwrite_flag() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let config = profile(dir.path());
    let (_, mut auth) = registered_user(&remote, &config, "alice", "longpassword1");

    let first = envelope::upload(&remote, &mut auth, b"v1", "notes.txt", false).unwrap();
    assert!(matches!(
        envelope::upload(&remote, &mut auth, b"v2", "notes.txt", false),
        Err(Error::FileExists(_))
    ));

    let second = envelope::upload(&remote, &mut auth, b"v2", "notes.txt", true).unwrap();
    assert_ne!(first, second);
    let fetched = envelope::download(&remote, &mut auth, "notes.txt", "alice").unwrap();
    assert_eq!(fetched, b"v2");
}

// ─── 3. Tamper detection ────────────────────────────────────────────────────

#[test]
fn tampered_download_fails_closed() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let config = profile(dir.path());
    let (_, mut auth) = registered_user(&remote, &config, "alice", "longpassword1");

    let file_id = envelope::upload(&remote, &mut auth, b"payload", "data.bin", false).unwrap();
    remote.tamper(&file_id);

    assert!(matches!(
        envelope::download(&remote, &mut auth, "data.bin", "alice"),
        Err(Error::Download(_))
    ));
}

// ─── 4. Sharing ─────────────────────────────────────────────────────────────

#[test]
fn share_rewraps_the_content_key_for_recipients() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let alice_config = profile(&dir.path().join("alice"));
    let bob_config = profile(&dir.path().join("bob"));
    let (_, mut alice) = registered_user(&remote, &alice_config, "alice", "longpassword1");
    let (_, mut bob) = registered_user(&remote, &bob_config, "bob", "bobpassword9");

    let content = b"shared secret document".to_vec();
    envelope::upload(&remote, &mut alice, &content, "doc.txt", false).unwrap();
    envelope::share(&remote, &mut alice, "doc.txt", &["bob".to_string()]).unwrap();

    let fetched = envelope::download(&remote, &mut bob, "doc.txt", "alice").unwrap();
    assert_eq!(fetched, content);
}

#[test]
fn unknown_recipient_aborts_before_any_share_call() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let config = profile(dir.path());
    let (_, mut auth) = registered_user(&remote, &config, "alice", "longpassword1");
    envelope::upload(&remote, &mut auth, b"x", "doc.txt", false).unwrap();

    let shares_before = remote.shares_served();
    let result = envelope::share(
        &remote,
        &mut auth,
        "doc.txt",
        &["nosuchuser".to_string()],
    );
    assert!(matches!(result, Err(Error::UserNotFound(u)) if u == "nosuchuser"));
    assert_eq!(remote.shares_served(), shares_before);
}

// ─── 5. Update ──────────────────────────────────────────────────────────────

#[test]
fn update_short_circuits_on_unchanged_content() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let config = profile(dir.path());
    let (_, mut auth) = registered_user(&remote, &config, "alice", "longpassword1");

    let content = b"original".to_vec();
    let file_id = envelope::upload(&remote, &mut auth, &content, "a.txt", false).unwrap();
    let hash_before = remote.server_hash(&file_id);

    let outcome = envelope::update(&remote, &mut auth, &file_id, &content).unwrap();
    assert!(matches!(outcome, UpdateOutcome::Unchanged));
    assert_eq!(remote.server_hash(&file_id), hash_before);
}

#[test]
fn update_preserves_key_identity_for_recipients() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let alice_config = profile(&dir.path().join("alice"));
    let bob_config = profile(&dir.path().join("bob"));
    let (_, mut alice) = registered_user(&remote, &alice_config, "alice", "longpassword1");
    let (_, mut bob) = registered_user(&remote, &bob_config, "bob", "bobpassword9");

    let file_id = envelope::upload(&remote, &mut alice, b"v1", "doc.txt", false).unwrap();
    envelope::share(&remote, &mut alice, "doc.txt", &["bob".to_string()]).unwrap();

    let outcome = envelope::update(&remote, &mut alice, &file_id, b"v2 content").unwrap();
    assert!(matches!(outcome, UpdateOutcome::Updated { .. }));

    // Bob's wrapped key from the original share still opens the new content.
    let fetched = envelope::download(&remote, &mut bob, "doc.txt", "alice").unwrap();
    assert_eq!(fetched, b"v2 content");
}

#[test]
fn only_the_owner_may_update() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let alice_config = profile(&dir.path().join("alice"));
    let bob_config = profile(&dir.path().join("bob"));
    let (_, mut alice) = registered_user(&remote, &alice_config, "alice", "longpassword1");
    let (_, mut bob) = registered_user(&remote, &bob_config, "bob", "bobpassword9");

    let file_id = envelope::upload(&remote, &mut alice, b"v1", "doc.txt", false).unwrap();
    envelope::share(&remote, &mut alice, "doc.txt", &["bob".to_string()]).unwrap();
    assert!(matches!(
        envelope::update(&remote, &mut bob, &file_id, b"hijack"),
        Err(Error::AccessDenied)
    ));
}

// ─── 6. Transparent reauth ──────────────────────────────────────────────────

#[test]
fn expired_session_is_renewed_exactly_once() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let config = profile(dir.path());
    let (key_info, _) = registered_user(&remote, &config, "alice", "longpassword1");

    // A fresh context trusting the saved session, password available.
    let saved = config.session().unwrap();
    let mut auth = session::login(
        &config,
        &remote,
        key_info,
        Some("longpassword1"),
        Some(saved.clone()),
        Box::new(NoPrompt),
    )
    .unwrap();

    remote.expire_sessions();
    let files = auth
        .request(&remote, "alice", |r, s| r.files_info(s))
        .unwrap();
    assert!(files.is_empty());

    // The renewed session replaced the stale one, in memory and on disk.
    assert_ne!(auth.session(), &saved);
    assert_eq!(config.session().as_deref(), Some(auth.session().as_str()));
}

#[test]
fn second_rejection_is_fatal() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let config = profile(dir.path());
    let (_, mut auth) = registered_user(&remote, &config, "alice", "longpassword1");

    remote.reject_authed_calls(true);
    let result = auth.request(&remote, "alice", |r, s| r.files_info(s));
    assert!(matches!(result, Err(Error::AuthenticationFailed)));
}

#[test]
fn reauth_prompts_for_the_password_when_not_provided() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let config = profile(dir.path());
    let (key_info, _) = registered_user(&remote, &config, "alice", "longpassword1");

    let saved = config.session().unwrap();
    let mut auth = session::login(
        &config,
        &remote,
        key_info,
        None,
        Some(saved),
        Box::new(CannedPassword("longpassword1")),
    )
    .unwrap();

    remote.expire_sessions();
    let files = auth
        .request(&remote, "alice", |r, s| r.files_info(s))
        .unwrap();
    assert!(files.is_empty());
}

// ─── 7. Backup and recovery ─────────────────────────────────────────────────

#[test]
fn backup_then_recover_returns_the_same_key_material() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let config = profile(dir.path());
    let (key_info, mut auth) = registered_user(&remote, &config, "alice", "longpassword1");

    let phrase = "correct horse battery staple";
    otc::backup(&remote, &mut auth, phrase).unwrap();

    let recovery = otc::fetch_recovery(&remote, "alice", None).unwrap();
    let (recovered, private_key) = recovery
        .decrypt(phrase, Some("longpassword1"), &mut NoPrompt)
        .unwrap();

    // Materially equal: the same stored bytes, still password-protected.
    assert_eq!(recovered.private_key_material, key_info.private_key_material);
    assert_eq!(recovered.public_key, key_info.public_key);
    assert!(recovered.encrypted);
    assert_eq!(
        crypto::export_public_key(&crypto::PublicKey::from(&private_key)),
        key_info.public_key
    );
}

#[test]
fn recovery_distinguishes_wrong_otc_from_wrong_password() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let config = profile(dir.path());
    let (_, mut auth) = registered_user(&remote, &config, "alice", "longpassword1");

    otc::backup(&remote, &mut auth, "aardvark absurd accrue acme adrift adult").unwrap();
    let recovery = otc::fetch_recovery(&remote, "alice", None).unwrap();

    assert!(matches!(
        recovery.decrypt("woodlark willow wayside watchword wallet waffle", None, &mut NoPrompt),
        Err(Error::InvalidOtc)
    ));
    assert!(matches!(
        recovery.decrypt(
            "aardvark absurd accrue acme adrift adult",
            Some("wrongpass"),
            &mut NoPrompt,
        ),
        Err(Error::Decryption)
    ));
}

#[test]
fn unprotected_keys_recover_in_one_step() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let config = profile(dir.path());

    let (key_info, _) = keys::register(&remote, "carol", None).unwrap();
    assert!(!key_info.encrypted);
    let mut auth =
        session::login(&config, &remote, key_info.clone(), None, None, Box::new(NoPrompt)).unwrap();

    let otc = Otc::generate();
    otc::backup(&remote, &mut auth, &otc.words()).unwrap();

    let recovery = otc::fetch_recovery(&remote, "carol", Some(&otc.to_hex())).unwrap();
    let (recovered, _) = recovery.decrypt(&otc.words(), None, &mut NoPrompt).unwrap();
    assert!(!recovered.encrypted);
    assert_eq!(recovered.private_key_material, key_info.private_key_material);
}

#[test]
fn recovery_reports_missing_backups() {
    let remote = FakeRemote::new();
    keys::register(&remote, "dave", None).unwrap();
    assert!(matches!(
        otc::fetch_recovery(&remote, "nosuchuser", None),
        Err(Error::UserNotFound(_))
    ));
    assert!(matches!(
        otc::fetch_recovery(&remote, "dave", None),
        Err(Error::RecoveryNotReady)
    ));
}

#[test]
fn server_validated_otc_is_surfaced() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let config = profile(dir.path());
    let (_, mut auth) = registered_user(&remote, &config, "alice", "longpassword1");

    let otc = Otc::generate();
    otc::backup(&remote, &mut auth, &otc.words()).unwrap();
    remote.expect_otc(&otc.to_hex());

    assert!(matches!(
        otc::fetch_recovery(&remote, "alice", Some("00ff00ff00ff")),
        Err(Error::InvalidOtc)
    ));
    assert!(otc::fetch_recovery(&remote, "alice", Some(&otc.to_hex())).is_ok());
}

// ─── 8. Three-way sync decision table ───────────────────────────────────────

struct SyncFixture {
    remote: FakeRemote,
    config: Config,
    auth: AuthInfo,
    store_file_id: String,
    local: std::path::PathBuf,
}

/// Upload `content` as alice's `name`, clone it locally, and bind a sync
/// record, leaving `last_hash = hash(content)`.
fn sync_fixture(dir: &Path, content: &[u8]) -> SyncFixture {
    let remote = FakeRemote::new();
    let config = profile(dir);
    let (_, mut auth) = registered_user(&remote, &config, "alice", "longpassword1");

    let file_id = envelope::upload(&remote, &mut auth, content, "notes.txt", false).unwrap();
    let local = dir.join("notes.txt");
    fs::write(&local, content).unwrap();
    let store = SyncStore::open(&config).unwrap();
    store
        .create(&file_id, &crypto::content_hash(content), &local)
        .unwrap();

    SyncFixture {
        remote,
        config,
        auth,
        store_file_id: file_id,
        local,
    }
}

#[test]
fn remote_change_with_clean_local_pulls() {
    let dir = tempdir().unwrap();
    let mut fx = sync_fixture(dir.path(), b"H1 content");
    let store = SyncStore::open(&fx.config).unwrap();

    // Server moves ahead to H2.
    envelope::update(&fx.remote, &mut fx.auth, &fx.store_file_id, b"H2 content").unwrap();

    let record = store.lookup(&fx.local).unwrap().unwrap();
    let mut prompt = Answer(false, 0);
    let outcome = engine::sync_file(
        &fx.remote,
        &mut fx.auth,
        &store,
        &fx.local,
        &record,
        &mut prompt,
    )
    .unwrap();

    assert!(matches!(outcome, SyncOutcome::Pulled));
    assert_eq!(prompt.1, 0, "clean local file must not prompt");
    assert_eq!(fs::read(&fx.local).unwrap(), b"H2 content");
    let updated = store.lookup(&fx.local).unwrap().unwrap();
    assert_eq!(updated.last_hash, crypto::content_hash(b"H2 content"));
}

#[test]
fn local_edits_require_confirmation() {
    let dir = tempdir().unwrap();
    let mut fx = sync_fixture(dir.path(), b"H1 content");
    let store = SyncStore::open(&fx.config).unwrap();

    envelope::update(&fx.remote, &mut fx.auth, &fx.store_file_id, b"H2 content").unwrap();
    fs::write(&fx.local, b"H3 local edits").unwrap();

    // Declined: file and record untouched.
    let record = store.lookup(&fx.local).unwrap().unwrap();
    let mut decline = Answer(false, 0);
    let outcome = engine::sync_file(
        &fx.remote,
        &mut fx.auth,
        &store,
        &fx.local,
        &record,
        &mut decline,
    )
    .unwrap();
    assert!(matches!(outcome, SyncOutcome::LocalEditsKept));
    assert_eq!(decline.1, 1);
    assert_eq!(fs::read(&fx.local).unwrap(), b"H3 local edits");
    assert_eq!(
        store.lookup(&fx.local).unwrap().unwrap().last_hash,
        record.last_hash
    );

    // Confirmed: pulled and recorded.
    let mut accept = Answer(true, 0);
    let outcome = engine::sync_file(
        &fx.remote,
        &mut fx.auth,
        &store,
        &fx.local,
        &record,
        &mut accept,
    )
    .unwrap();
    assert!(matches!(outcome, SyncOutcome::Pulled));
    assert_eq!(fs::read(&fx.local).unwrap(), b"H2 content");
    assert_eq!(
        store.lookup(&fx.local).unwrap().unwrap().last_hash,
        crypto::content_hash(b"H2 content")
    );
}

#[test]
fn identical_hashes_skip_without_a_network_read() {
    let dir = tempdir().unwrap();
    let mut fx = sync_fixture(dir.path(), b"H1 content");
    let store = SyncStore::open(&fx.config).unwrap();

    let record = store.lookup(&fx.local).unwrap().unwrap();
    let saves_before = fx.remote.saves_served();
    let mut prompt = Answer(true, 0);
    let outcome = engine::sync_file(
        &fx.remote,
        &mut fx.auth,
        &store,
        &fx.local,
        &record,
        &mut prompt,
    )
    .unwrap();

    assert!(matches!(outcome, SyncOutcome::Unchanged));
    assert_eq!(fx.remote.saves_served(), saves_before);
    assert_eq!(prompt.1, 0);
    assert_eq!(store.lookup(&fx.local).unwrap().unwrap(), record);
}

// ─── 9. Batch sync and self-healing ─────────────────────────────────────────

#[test]
fn batch_sync_heals_stale_records_and_continues() {
    let dir = tempdir().unwrap();
    let workdir = dir.path().join("work");
    fs::create_dir_all(&workdir).unwrap();

    let remote = FakeRemote::new();
    let config = profile(dir.path());
    let (_, mut auth) = registered_user(&remote, &config, "alice", "longpassword1");
    let store = SyncStore::open(&config).unwrap();

    // Two bound files; one remote disappears, the other moves ahead.
    let keep = workdir.join("keep.txt");
    fs::write(&keep, b"keep v1").unwrap();
    let keep_id = envelope::upload(&remote, &mut auth, b"keep v1", "keep.txt", false).unwrap();
    store
        .create(&keep_id, &crypto::content_hash(b"keep v1"), &keep)
        .unwrap();

    let stale = workdir.join("stale.txt");
    fs::write(&stale, b"stale v1").unwrap();
    let stale_id = envelope::upload(&remote, &mut auth, b"stale v1", "stale.txt", false).unwrap();
    store
        .create(&stale_id, &crypto::content_hash(b"stale v1"), &stale)
        .unwrap();

    envelope::update(&remote, &mut auth, &keep_id, b"keep v2").unwrap();
    remote.drop_file(&stale_id);

    let mut prompt = Answer(false, 0);
    let report = engine::sync_path(&remote, &mut auth, &store, &workdir, &mut prompt).unwrap();

    assert_eq!(report.entries.len(), 2);
    assert_eq!(report.modified_count(), 1);
    assert!(report
        .entries
        .iter()
        .any(|(_, o)| matches!(o, SyncOutcome::RemoteDeleted)));
    assert_eq!(fs::read(&keep).unwrap(), b"keep v2");
    // The stale binding healed itself away.
    assert!(store.lookup(&stale).unwrap().is_none());
    assert_eq!(fs::read(&stale).unwrap(), b"stale v1");
}

#[test]
fn single_file_sync_requires_a_binding() {
    let dir = tempdir().unwrap();
    let remote = FakeRemote::new();
    let config = profile(dir.path());
    let (_, mut auth) = registered_user(&remote, &config, "alice", "longpassword1");
    let store = SyncStore::open(&config).unwrap();

    let unbound = dir.path().join("loose.txt");
    fs::write(&unbound, b"x").unwrap();
    let result = engine::sync_path(&remote, &mut auth, &store, &unbound, &mut Answer(false, 0));
    assert!(matches!(result, Err(Error::SyncNotFound)));
}
