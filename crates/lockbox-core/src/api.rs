//! Interface to the remote storage/API service.
//!
//! Every endpoint returns a typed payload or one of the server's declared
//! error codes; the code stays a value ([`ApiError::Server`]) rather than a
//! hard failure so callers can branch on expected conditions (`file-exists`,
//! `file-not-ready`, ...) without exception control flow. Protocol and
//! version faults are fatal at a higher layer.

use crate::error::{Error, ErrorCode};
use crate::CLIENT_VERSION;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const HOST_ENV: &str = "LOCKBOX_HOST";
pub const DEFAULT_HOST: &str = "api.lockbox.io:8000";

/// Opaque bearer cookie proving a completed challenge/response exchange.
pub type Session = String;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The server answered with one of its declared error codes.
    #[error("server answered: {0}")]
    Server(ErrorCode),
    /// The server answered with something outside its contract.
    #[error("unexpected server response: {0}")]
    Protocol(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

impl ApiError {
    pub fn is(&self, code: ErrorCode) -> bool {
        matches!(self, ApiError::Server(c) if *c == code)
    }

    /// Fold into the core taxonomy; `subject` names what the call was about.
    pub fn into_error(self, subject: &str) -> Error {
        match self {
            ApiError::Server(code) => code.into_error(subject),
            ApiError::Protocol(text) => Error::Protocol(text),
            ApiError::Transport(err) => Error::Http(err),
        }
    }
}

// ── Wire payloads ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfoResponse {
    pub public_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareStoreResponse {
    pub file_id: String,
    pub upload_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareUpdateResponse {
    pub upload_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResponse {
    pub download_url: String,
    /// Content key wrapped under the caller's public key, hex-encoded.
    pub encrypted_key: String,
    pub hash: String,
}

/// Remote file metadata. `encrypted_key` is caller-relative: the same file
/// carries a differently wrapped key for every authorized reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_id: String,
    pub name: String,
    pub owner: String,
    pub bytes: u64,
    /// Millisecond epoch timestamp, as the server reports it.
    pub last_modified: i64,
    pub encrypted_key: String,
    pub hash: String,
    pub shared_with: Vec<String>,
}

// ── Service interface ───────────────────────────────────────────────────────

/// The remote service surface the core consumes. Implemented over HTTP by
/// [`HttpRemote`]; tests substitute an in-memory fake.
pub trait Remote {
    fn user_info(&self, username: &str) -> ApiResult<UserInfoResponse>;
    fn register_user(&self, username: &str, public_key: &str) -> ApiResult<()>;
    fn challenge(&self, username: &str) -> ApiResult<String>;
    fn login(&self, username: &str, challenge_response: &str) -> ApiResult<Session>;

    fn prepare_store(
        &self,
        session: &Session,
        filename: &str,
        bytes: u64,
        hash: &str,
        wrapped_key: &str,
    ) -> ApiResult<PrepareStoreResponse>;
    fn prepare_update(
        &self,
        session: &Session,
        file_id: &str,
        bytes: u64,
        hash: &str,
    ) -> ApiResult<PrepareUpdateResponse>;
    fn store(&self, session: &Session, file_id: &str) -> ApiResult<()>;
    fn save(&self, session: &Session, file_id: &str) -> ApiResult<SaveResponse>;
    fn share(
        &self,
        session: &Session,
        file_id: &str,
        recipient_keys: &BTreeMap<String, String>,
    ) -> ApiResult<()>;
    fn delete(&self, session: &Session, file_id: &str) -> ApiResult<()>;

    fn file_info(
        &self,
        session: &Session,
        filename: &str,
        owner: Option<&str>,
    ) -> ApiResult<FileInfo>;
    fn file_info_by_id(&self, session: &Session, file_id: &str) -> ApiResult<FileInfo>;
    fn files_info(&self, session: &Session) -> ApiResult<Vec<FileInfo>>;

    fn push_encrypted_key(&self, session: &Session, blob: &str) -> ApiResult<()>;
    /// Fetch the escrow blob. The OTC hex is included when the caller already
    /// holds one; the server may answer `invalid-otc`.
    fn recover_keys(&self, username: &str, otc: Option<&str>) -> ApiResult<String>;

    /// Two-phase resumable upload of ciphertext to a prepared slot.
    fn put_blob(&self, upload_url: &str, bytes: &[u8]) -> ApiResult<()>;
    /// Plain GET of ciphertext from a signed URL.
    fn get_blob(&self, download_url: &str) -> ApiResult<Vec<u8>>;
}

// ── HTTP implementation ─────────────────────────────────────────────────────

pub struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    /// Connect to `LOCKBOX_HOST`, or the default service host.
    pub fn from_env() -> ApiResult<Self> {
        let host = std::env::var(HOST_ENV).unwrap_or_else(|_| DEFAULT_HOST.to_string());
        Self::new(&host)
    }

    pub fn new(host: &str) -> ApiResult<Self> {
        let client = Client::builder()
            .user_agent(format!("lockbox/{CLIENT_VERSION}"))
            .build()?;
        Ok(Self {
            client,
            base_url: format!("http://{host}"),
        })
    }

    fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
        session: Option<&Session>,
    ) -> ApiResult<reqwest::blocking::Response> {
        let mut request = self.client.post(format!("{}{path}", self.base_url)).json(body);
        if let Some(session) = session {
            request = request.header(COOKIE, session.clone());
        }
        let response = request.send()?;
        Self::check(response)
    }

    fn get(&self, path: &str, session: &Session) -> ApiResult<reqwest::blocking::Response> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .header(COOKIE, session.clone())
            .send()?;
        Self::check(response)
    }

    /// A non-OK status carries one of the declared error codes as its body.
    fn check(response: reqwest::blocking::Response) -> ApiResult<reqwest::blocking::Response> {
        if response.status() == StatusCode::OK {
            return Ok(response);
        }
        let text = response.text().unwrap_or_default();
        match ErrorCode::parse(text.trim()) {
            Some(code) => Err(ApiError::Server(code)),
            None => Err(ApiError::Protocol(text)),
        }
    }

    fn json_body<T: DeserializeOwned>(response: reqwest::blocking::Response) -> ApiResult<T> {
        response.json().map_err(ApiError::Transport)
    }
}

impl Remote for HttpRemote {
    fn user_info(&self, username: &str) -> ApiResult<UserInfoResponse> {
        let body = serde_json::json!({ "username": username });
        Self::json_body(self.post_json("/api/info/user", &body, None)?)
    }

    fn register_user(&self, username: &str, public_key: &str) -> ApiResult<()> {
        let body = serde_json::json!({
            "username": username,
            "publicKey": public_key,
            "version": CLIENT_VERSION,
        });
        self.post_json("/api/auth/register/user", &body, None)?;
        Ok(())
    }

    fn challenge(&self, username: &str) -> ApiResult<String> {
        let body = serde_json::json!({ "username": username });
        let response = self.post_json("/api/auth/login/challenge", &body, None)?;
        response.text().map_err(ApiError::Transport)
    }

    fn login(&self, username: &str, challenge_response: &str) -> ApiResult<Session> {
        let body = serde_json::json!({
            "username": username,
            "challengeResponse": challenge_response,
            "version": CLIENT_VERSION,
        });
        let response = self.post_json("/api/auth/login/login", &body, None)?;
        let cookie = response
            .headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Protocol("login response missing session cookie".into()))?;
        Ok(cookie.to_string())
    }

    fn prepare_store(
        &self,
        session: &Session,
        filename: &str,
        bytes: u64,
        hash: &str,
        wrapped_key: &str,
    ) -> ApiResult<PrepareStoreResponse> {
        let body = serde_json::json!({
            "filename": filename,
            "bytes": bytes,
            "hash": hash,
            "personalEncryptedKey": wrapped_key,
        });
        Self::json_body(self.post_json("/api/storage/prepare-store", &body, Some(session))?)
    }

    fn prepare_update(
        &self,
        session: &Session,
        file_id: &str,
        bytes: u64,
        hash: &str,
    ) -> ApiResult<PrepareUpdateResponse> {
        let body = serde_json::json!({
            "fileId": file_id,
            "bytes": bytes,
            "hash": hash,
        });
        Self::json_body(self.post_json("/api/storage/prepare-update", &body, Some(session))?)
    }

    fn store(&self, session: &Session, file_id: &str) -> ApiResult<()> {
        let body = serde_json::json!({ "fileId": file_id });
        self.post_json("/api/storage/store", &body, Some(session))?;
        Ok(())
    }

    fn save(&self, session: &Session, file_id: &str) -> ApiResult<SaveResponse> {
        let body = serde_json::json!({ "fileId": file_id });
        Self::json_body(self.post_json("/api/storage/save", &body, Some(session))?)
    }

    fn share(
        &self,
        session: &Session,
        file_id: &str,
        recipient_keys: &BTreeMap<String, String>,
    ) -> ApiResult<()> {
        let body = serde_json::json!({
            "fileId": file_id,
            "recipientEncryptedKeys": recipient_keys,
        });
        self.post_json("/api/storage/share", &body, Some(session))?;
        Ok(())
    }

    fn delete(&self, session: &Session, file_id: &str) -> ApiResult<()> {
        let body = serde_json::json!({ "fileId": file_id });
        self.post_json("/api/storage/delete", &body, Some(session))?;
        Ok(())
    }

    fn file_info(
        &self,
        session: &Session,
        filename: &str,
        owner: Option<&str>,
    ) -> ApiResult<FileInfo> {
        let mut body = serde_json::json!({ "filename": filename });
        if let Some(owner) = owner {
            body["owner"] = serde_json::Value::String(owner.to_string());
        }
        Self::json_body(self.post_json("/api/info/file", &body, Some(session))?)
    }

    fn file_info_by_id(&self, session: &Session, file_id: &str) -> ApiResult<FileInfo> {
        let body = serde_json::json!({ "fileId": file_id });
        Self::json_body(self.post_json("/api/info/file", &body, Some(session))?)
    }

    fn files_info(&self, session: &Session) -> ApiResult<Vec<FileInfo>> {
        Self::json_body(self.get("/api/info/files", session)?)
    }

    fn push_encrypted_key(&self, session: &Session, blob: &str) -> ApiResult<()> {
        let body = serde_json::json!({ "encryptedPrivateKey": blob });
        self.post_json("/api/auth/recover/push-key", &body, Some(session))?;
        Ok(())
    }

    fn recover_keys(&self, username: &str, otc: Option<&str>) -> ApiResult<String> {
        let mut body = serde_json::json!({
            "username": username,
            "version": CLIENT_VERSION,
        });
        if let Some(otc) = otc {
            body["otc"] = serde_json::Value::String(otc.to_string());
        }
        let response = self.post_json("/api/auth/recover/recover-keys", &body, None)?;
        response.text().map_err(ApiError::Transport)
    }

    fn put_blob(&self, upload_url: &str, bytes: &[u8]) -> ApiResult<()> {
        // Open a resumable session against the storage backend.
        let opened = self
            .client
            .post(upload_url)
            .header("x-goog-resumable", "start")
            .header(CONTENT_TYPE, "text/plain")
            .header("x-goog-content-length-range", format!("0,{}", bytes.len()))
            .body("")
            .send()?;
        if opened.status() != StatusCode::CREATED {
            return Err(ApiError::Protocol(format!(
                "upload session rejected with status {}",
                opened.status()
            )));
        }
        let location = opened
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Protocol("upload session missing location".into()))?
            .to_string();

        let uploaded = self
            .client
            .put(&location)
            .header(CONTENT_TYPE, "text/plain")
            .header(CONTENT_LENGTH, bytes.len())
            .body(bytes.to_vec())
            .send()?;
        if uploaded.status() != StatusCode::OK {
            return Err(ApiError::Protocol(format!(
                "upload rejected with status {}",
                uploaded.status()
            )));
        }
        Ok(())
    }

    fn get_blob(&self, download_url: &str) -> ApiResult<Vec<u8>> {
        let response = self.client.get(download_url).send()?;
        if response.status() != StatusCode::OK {
            return Err(ApiError::Protocol(format!(
                "download rejected with status {}",
                response.status()
            )));
        }
        Ok(response.bytes()?.to_vec())
    }
}
