//! Challenge/response session establishment and the authenticated call
//! wrapper.
//!
//! Possession of the private key is proven by unwrapping a server-issued
//! challenge; the key itself never crosses the wire. Expired sessions are
//! renewed transparently, exactly once per request: a second rejection is
//! surfaced as an authentication failure rather than retried.

use crate::api::{ApiResult, Remote, Session};
use crate::config::Config;
use crate::crypto::{self, PersonalKey};
use crate::error::{Error, ErrorCode, Result};
use crate::keys::KeyInfo;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// How the private key gets decrypted when it is first needed. Selected at
/// login time; inspectable, no captured state.
pub enum KeyUnlock {
    /// Key material is stored unencrypted; import directly.
    RawImport,
    /// Derive the personal key from this password.
    Password(Zeroizing<String>),
    /// Ask the driver's prompt capability when the key is first needed.
    PromptOnDemand,
}

/// Driver-injected capability for obtaining a password interactively. The
/// core itself never touches the console.
pub trait PasswordPrompt {
    fn read_password(&mut self) -> Result<Zeroizing<String>>;
}

/// For non-interactive contexts: any prompt attempt fails as a decryption
/// error, the same as a missing personal key.
pub struct NoPrompt;

impl PasswordPrompt for NoPrompt {
    fn read_password(&mut self) -> Result<Zeroizing<String>> {
        Err(Error::Decryption)
    }
}

/// Live authentication context for one command invocation: credentials, the
/// session cookie, and the lazily decrypted private key. The cached key is
/// the only long-lived copy of decrypted material and is zeroized on drop.
pub struct AuthInfo {
    key_info: KeyInfo,
    session: Session,
    unlock: KeyUnlock,
    prompter: Box<dyn PasswordPrompt>,
    config: Config,
    cached_private_key: Option<StaticSecret>,
}

/// Establish a session: fetch a challenge wrapped under our public key,
/// unwrap it, and submit the plaintext. An undecryptable challenge means the
/// key does not match the account, which is an authentication failure, not a
/// missing user.
pub fn establish_session(
    remote: &dyn Remote,
    username: &str,
    private_key: &StaticSecret,
) -> Result<Session> {
    let challenge_hex = remote
        .challenge(username)
        .map_err(|e| e.into_error(username))?;
    let challenge =
        hex::decode(challenge_hex.trim()).map_err(|_| Error::AuthenticationFailed)?;
    let answer =
        crypto::unwrap_key(private_key, &challenge).map_err(|_| Error::AuthenticationFailed)?;
    remote
        .login(username, &hex::encode(answer))
        .map_err(|e| e.into_error(username))
}

/// Build an [`AuthInfo`]. With a saved session the private key stays sealed
/// until something needs it; without one the key is decrypted eagerly to
/// establish a session, so a wrong password fails before any network call.
pub fn login(
    config: &Config,
    remote: &dyn Remote,
    key_info: KeyInfo,
    password: Option<&str>,
    session: Option<Session>,
    prompter: Box<dyn PasswordPrompt>,
) -> Result<AuthInfo> {
    let unlock = if !key_info.encrypted {
        KeyUnlock::RawImport
    } else if let Some(password) = password {
        KeyUnlock::Password(Zeroizing::new(password.to_owned()))
    } else {
        KeyUnlock::PromptOnDemand
    };

    let mut auth = AuthInfo {
        key_info,
        session: Session::new(),
        unlock,
        prompter,
        config: config.clone(),
        cached_private_key: None,
    };

    match session {
        Some(session) => auth.session = session,
        None => {
            let username = auth.key_info.username.clone();
            let session = {
                let private_key = auth.private_key()?;
                establish_session(remote, &username, private_key)?
            };
            auth.config.set_session(&session)?;
            auth.session = session;
        }
    }
    Ok(auth)
}

impl AuthInfo {
    pub fn key_info(&self) -> &KeyInfo {
        &self.key_info
    }

    pub fn username(&self) -> &str {
        &self.key_info.username
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn public_key(&self) -> Result<PublicKey> {
        crypto::import_public_key(&self.key_info.public_key)
    }

    /// The decrypted private key, produced at most once per run and cached.
    pub fn private_key(&mut self) -> Result<&StaticSecret> {
        if self.cached_private_key.is_none() {
            let personal_key = self.personal_key()?;
            let key = self.key_info.private_key(personal_key.as_ref())?;
            self.cached_private_key = Some(key);
        }
        Ok(self
            .cached_private_key
            .as_ref()
            .unwrap_or_else(|| unreachable!("cached above")))
    }

    /// Resolve the personal key per the unlock strategy. A prompted password
    /// is kept for the rest of the invocation so reauth never reprompts.
    fn personal_key(&mut self) -> Result<Option<PersonalKey>> {
        match &self.unlock {
            KeyUnlock::RawImport => Ok(None),
            KeyUnlock::Password(password) => Ok(Some(crypto::derive_personal_key(password))),
            KeyUnlock::PromptOnDemand => {
                let password = self.prompter.read_password()?;
                let personal_key = crypto::derive_personal_key(&password);
                self.unlock = KeyUnlock::Password(password);
                Ok(Some(personal_key))
            }
        }
    }

    /// Run an authenticated request with the single transparent-reauth retry.
    ///
    /// The outer error is a hard failure (could not re-authenticate, or the
    /// retried request was rejected again); the inner result keeps the
    /// server's declared codes as values for the caller to branch on.
    pub fn call<T>(
        &mut self,
        remote: &dyn Remote,
        f: impl Fn(&dyn Remote, &Session) -> ApiResult<T>,
    ) -> Result<ApiResult<T>> {
        let first = f(remote, &self.session);
        match &first {
            Err(e) if e.is(ErrorCode::AuthenticationFailed) => {}
            _ => return Ok(first),
        }

        tracing::debug!(user = %self.key_info.username, "session rejected, re-authenticating");
        self.reauthenticate(remote)?;

        let second = f(remote, &self.session);
        match &second {
            Err(e) if e.is(ErrorCode::AuthenticationFailed) => Err(Error::AuthenticationFailed),
            _ => Ok(second),
        }
    }

    /// Like [`call`](Self::call), but every server code is folded into the
    /// core taxonomy with `subject` as context.
    pub fn request<T>(
        &mut self,
        remote: &dyn Remote,
        subject: &str,
        f: impl Fn(&dyn Remote, &Session) -> ApiResult<T>,
    ) -> Result<T> {
        self.call(remote, f)?.map_err(|e| e.into_error(subject))
    }

    fn reauthenticate(&mut self, remote: &dyn Remote) -> Result<()> {
        let username = self.key_info.username.clone();
        let session = {
            let private_key = self.private_key()?;
            establish_session(remote, &username, private_key)?
        };
        self.config.set_session(&session)?;
        self.session = session;
        Ok(())
    }
}
