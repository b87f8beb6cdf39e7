//! Closed error taxonomy for the core.
//!
//! Server-declared conditions arrive as kebab-case code strings in the
//! response body ([`ErrorCode`]); the API layer keeps them as typed results
//! and the operation layers map them into [`Error`] with the subject (file
//! name, username) that gives the failure meaning.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Identity / credential
    #[error("user '{0}' does not exist")]
    UserNotFound(String),
    #[error("user '{0}' already exists")]
    UserExists(String),
    #[error("invalid username '{0}'")]
    InvalidUsername(String),
    #[error("could not decrypt private key")]
    Decryption,
    #[error("authentication failed")]
    AuthenticationFailed,

    // Recovery
    #[error("no key backup exists for this account")]
    RecoveryNotReady,
    #[error("invalid one-time-code")]
    InvalidOtc,

    // Storage
    #[error("remote file '{0}' does not exist")]
    FileNotFound(String),
    #[error("remote file '{0}' already exists")]
    FileExists(String),
    #[error("remote file '{0}' is being modified elsewhere")]
    FileNotReady(String),
    #[error("file is too large to upload")]
    FileTooLarge,
    #[error("access denied")]
    AccessDenied,
    #[error("multiple remote files are named '{0}'; specify the owner")]
    FilenameNotSpecific(String),

    // Transfer
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("download failed: {0}")]
    Download(String),

    // Local state
    #[error("could not parse {0}")]
    ConfigParse(String),
    #[error("file is already synchronized with a remote")]
    SyncExists,
    #[error("file is not synchronized with any remote")]
    SyncNotFound,

    // Server contract. Both are fatal and never retried.
    #[error("this client version is no longer supported by the server")]
    InvalidVersion,
    #[error("an error occurred on the server")]
    ServerSide,
    #[error("unexpected server response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}

/// The closed set of error codes the server may place in a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UserNotFound,
    UserExists,
    InvalidUsername,
    InvalidPublicKey,
    AuthenticationFailed,
    RecoveryNotReady,
    InvalidOtc,
    FileNotFound,
    FileExists,
    FileNotReady,
    FileTooLarge,
    AccessDenied,
    InvalidNumBytes,
    FilenameNotSpecific,
    InvalidVersion,
    ServerSideError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UserNotFound => "user-not-found",
            ErrorCode::UserExists => "user-exists",
            ErrorCode::InvalidUsername => "invalid-username",
            ErrorCode::InvalidPublicKey => "invalid-public-key",
            ErrorCode::AuthenticationFailed => "authentication-failed",
            ErrorCode::RecoveryNotReady => "recovery-not-ready",
            ErrorCode::InvalidOtc => "invalid-otc",
            ErrorCode::FileNotFound => "file-not-found",
            ErrorCode::FileExists => "file-exists",
            ErrorCode::FileNotReady => "file-not-ready",
            ErrorCode::FileTooLarge => "file-too-large",
            ErrorCode::AccessDenied => "access-denied",
            ErrorCode::InvalidNumBytes => "invalid-num-bytes",
            ErrorCode::FilenameNotSpecific => "filename-not-specific",
            ErrorCode::InvalidVersion => "invalid-version",
            ErrorCode::ServerSideError => "server-side-error",
        }
    }

    pub fn parse(text: &str) -> Option<ErrorCode> {
        let code = match text {
            "user-not-found" => ErrorCode::UserNotFound,
            "user-exists" => ErrorCode::UserExists,
            "invalid-username" => ErrorCode::InvalidUsername,
            "invalid-public-key" => ErrorCode::InvalidPublicKey,
            "authentication-failed" => ErrorCode::AuthenticationFailed,
            "recovery-not-ready" => ErrorCode::RecoveryNotReady,
            "invalid-otc" => ErrorCode::InvalidOtc,
            "file-not-found" => ErrorCode::FileNotFound,
            "file-exists" => ErrorCode::FileExists,
            "file-not-ready" => ErrorCode::FileNotReady,
            "file-too-large" => ErrorCode::FileTooLarge,
            "access-denied" => ErrorCode::AccessDenied,
            "invalid-num-bytes" => ErrorCode::InvalidNumBytes,
            "filename-not-specific" => ErrorCode::FilenameNotSpecific,
            "invalid-version" => ErrorCode::InvalidVersion,
            "server-side-error" => ErrorCode::ServerSideError,
            _ => return None,
        };
        Some(code)
    }

    /// Map a server code into the core taxonomy. `subject` is the file name
    /// or username the failing call was about.
    pub fn into_error(self, subject: &str) -> Error {
        match self {
            ErrorCode::UserNotFound => Error::UserNotFound(subject.to_string()),
            ErrorCode::UserExists => Error::UserExists(subject.to_string()),
            ErrorCode::InvalidUsername | ErrorCode::InvalidPublicKey => {
                Error::InvalidUsername(subject.to_string())
            }
            ErrorCode::AuthenticationFailed => Error::AuthenticationFailed,
            ErrorCode::RecoveryNotReady => Error::RecoveryNotReady,
            ErrorCode::InvalidOtc => Error::InvalidOtc,
            ErrorCode::FileNotFound => Error::FileNotFound(subject.to_string()),
            ErrorCode::FileExists => Error::FileExists(subject.to_string()),
            ErrorCode::FileNotReady => Error::FileNotReady(subject.to_string()),
            ErrorCode::FileTooLarge | ErrorCode::InvalidNumBytes => Error::FileTooLarge,
            ErrorCode::AccessDenied => Error::AccessDenied,
            ErrorCode::FilenameNotSpecific => Error::FilenameNotSpecific(subject.to_string()),
            ErrorCode::InvalidVersion => Error::InvalidVersion,
            ErrorCode::ServerSideError => Error::ServerSide,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
