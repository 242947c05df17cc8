//! Login sessions: bearer tokens cached per environment, project and kind.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::atomic;
use crate::auth::Operation;
use crate::config::Environment;
use crate::error::{Result, TransferError};

/// Authorization scope of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Import,
    Export,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Import => "import",
            TokenKind::Export => "export",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bearer token with its validity window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub environment: Environment,
    pub project: String,
    pub kind: TokenKind,
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    pub fn new(
        environment: Environment,
        project: &str,
        kind: TokenKind,
        value: String,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self> {
        if expires_at <= issued_at {
            return Err(TransferError::Auth(format!(
                "token for {}:{}:{} expires before it is issued",
                environment, project, kind
            )));
        }
        Ok(Self {
            environment,
            project: project.to_string(),
            kind,
            value,
            issued_at,
            expires_at,
        })
    }

    /// Build a token from a JWT issued by the server, reading its `exp` and
    /// `iat` claims. A missing `iat` is taken as `now`.
    pub fn from_jwt(
        environment: Environment,
        project: &str,
        kind: TokenKind,
        value: String,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let claims = decode_claims(&value)
            .map_err(|e| TransferError::Auth(format!("server issued an unreadable token: {}", e)))?;
        let issued_at = claims
            .iat
            .and_then(|iat| DateTime::from_timestamp(iat, 0))
            .unwrap_or(now);
        let expires_at = DateTime::from_timestamp(claims.exp, 0)
            .ok_or_else(|| TransferError::Auth("token expiry out of range".into()))?;
        Self::new(environment, project, kind, value, issued_at, expires_at)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True when the token is still valid but expires within `window`.
    pub fn expires_soon(&self, now: DateTime<Utc>, window: Duration) -> bool {
        if self.is_expired(now) {
            return false;
        }
        match (self.expires_at - now).to_std() {
            Ok(remaining) => remaining <= window,
            Err(_) => true,
        }
    }

    /// Whether this token may be used for `operation`.
    pub fn authorizes(&self, operation: Operation) -> bool {
        self.kind == operation.token_kind()
    }
}

/// JWT claims the client relies on.
#[derive(Debug, Deserialize)]
pub(crate) struct Claims {
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
}

/// Read the claims of a JWT without verifying its signature.
///
/// The client has no verification key; the server remains the authority on
/// signatures, the client only needs the timestamps.
pub(crate) fn decode_claims(token: &str) -> Result<Claims> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;

    decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| TransferError::Auth(format!("invalid token: {}", e)))
}

/// On-disk form of a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredToken {
    token: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

type SessionFile = BTreeMap<Environment, BTreeMap<String, BTreeMap<TokenKind, StoredToken>>>;

/// Persisted login sessions.
///
/// Writes replace the whole file atomically; the last writer wins. Entries
/// that cannot be read are reported as absent so the caller re-authenticates.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> SessionFile {
        match atomic::read_json::<SessionFile>(&self.path) {
            Ok(Some(file)) => file,
            Ok(None) => SessionFile::new(),
            Err(e) => {
                warn!("Ignoring unreadable session file {}: {}", self.path.display(), e);
                SessionFile::new()
            }
        }
    }

    pub fn get(&self, environment: Environment, project: &str, kind: TokenKind) -> Option<Token> {
        let file = self.load();
        let stored = file.get(&environment)?.get(project)?.get(&kind)?.clone();
        match Token::new(
            environment,
            project,
            kind,
            stored.token,
            stored.issued_at,
            stored.expires_at,
        ) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("Ignoring invalid session entry {}:{}:{}: {}", environment, project, kind, e);
                None
            }
        }
    }

    pub fn put(&self, token: &Token) -> Result<()> {
        let mut file = self.load();
        file.entry(token.environment)
            .or_default()
            .entry(token.project.clone())
            .or_default()
            .insert(
                token.kind,
                StoredToken {
                    token: token.value.clone(),
                    issued_at: token.issued_at,
                    expires_at: token.expires_at,
                },
            );
        atomic::write_json(&self.path, &file)?;
        debug!(
            "Updated login session {}:{}:{}",
            token.environment, token.project, token.kind
        );
        Ok(())
    }

    pub fn remove(&self, environment: Environment, project: &str, kind: TokenKind) -> Result<()> {
        let mut file = self.load();
        let Some(projects) = file.get_mut(&environment) else {
            return Ok(());
        };
        if let Some(kinds) = projects.get_mut(project) {
            kinds.remove(&kind);
            if kinds.is_empty() {
                projects.remove(project);
            }
        }
        if projects.is_empty() {
            file.remove(&environment);
        }
        atomic::write_json(&self.path, &file)
    }

    /// Delete every stored session.
    pub fn clear(&self) -> Result<()> {
        atomic::remove(&self.path)
    }

    /// An absent or unreadable entry counts as expired.
    pub fn is_expired(
        &self,
        environment: Environment,
        project: &str,
        kind: TokenKind,
        now: DateTime<Utc>,
    ) -> bool {
        self.get(environment, project, kind)
            .map_or(true, |token| token.is_expired(now))
    }

    pub fn expires_soon(
        &self,
        environment: Environment,
        project: &str,
        kind: TokenKind,
        now: DateTime<Utc>,
        window: Duration,
    ) -> bool {
        self.get(environment, project, kind)
            .is_some_and(|token| token.expires_soon(now, window))
    }
}
