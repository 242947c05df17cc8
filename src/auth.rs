//! Authentication: choosing a flow, reusing cached sessions, obtaining tokens.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, info, warn};

use crate::client::check_response;
use crate::config::{Environment, Registry, Settings, TransferPolicy};
use crate::error::{Result, TransferError};
use crate::ident::project_from_username;
use crate::models::{ApiKeyResponse, CredentialsRequest, TokenResponse};
use crate::session::{decode_claims, SessionStore, Token, TokenKind};

/// Operations that need a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Upload,
    ResumeList,
    ResumeDelete,
    ResumeDeleteAll,
    Download,
    DownloadList,
}

impl Operation {
    /// Token kind an operation is authorized by.
    pub fn token_kind(&self) -> TokenKind {
        match self {
            Operation::Upload
            | Operation::ResumeList
            | Operation::ResumeDelete
            | Operation::ResumeDeleteAll => TokenKind::Import,
            Operation::Download | Operation::DownloadList => TokenKind::Export,
        }
    }

    pub fn is_export(&self) -> bool {
        self.token_kind() == TokenKind::Export
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Upload => "upload",
            Operation::ResumeList => "list resumable uploads",
            Operation::ResumeDelete => "delete a resumable upload",
            Operation::ResumeDeleteAll => "delete all resumable uploads",
            Operation::Download => "download",
            Operation::DownloadList => "list downloads",
        };
        f.write_str(name)
    }
}

/// How a token is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Username, password and one-time code, plus the registered API key.
    Credentials,
    /// Registered API key only; import operations only.
    ApiKey,
}

impl AuthMode {
    /// Choose the flow for an operation. Export operations always need the
    /// credential flow, whatever the caller asked for.
    pub fn select(operation: Operation, api_key_only: bool) -> Result<Self> {
        match (api_key_only, operation.is_export()) {
            (true, true) => Err(TransferError::Auth(format!(
                "cannot {} with API key authentication; log in with credentials",
                operation
            ))),
            (true, false) => Ok(AuthMode::ApiKey),
            (false, _) => Ok(AuthMode::Credentials),
        }
    }
}

/// Username, password and one-time code.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub otp: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("otp", &"***")
            .finish()
    }
}

/// Source of user credentials and confirmations.
pub trait CredentialProvider {
    /// Ask for credentials. Called at most once per authentication.
    fn credentials(&self) -> Result<Credentials>;

    /// Ask whether a session that expires soon should be refreshed now.
    fn confirm_refresh(&self, token: &Token) -> Result<bool>;
}

/// Whether a registered API key can no longer be used.
///
/// API keys are JWTs. A key whose expiry cannot be read counts as expired.
pub fn api_key_expired(api_key: &str, now: DateTime<Utc>) -> bool {
    match decode_claims(api_key) {
        Ok(claims) => claims.exp <= now.timestamp(),
        Err(e) => {
            debug!("Cannot read API key expiry, treating it as expired: {}", e);
            true
        }
    }
}

/// Obtains tokens for one environment, reusing cached login sessions.
pub struct Authenticator<P> {
    environment: Environment,
    base_url: String,
    policy: TransferPolicy,
    registry: Registry,
    registry_path: PathBuf,
    store: SessionStore,
    provider: P,
    http: Client,
}

impl<P: CredentialProvider> Authenticator<P> {
    /// Create an authenticator from settings, loading the API-key registry.
    pub fn new(settings: &Settings, provider: P) -> Result<Self> {
        Ok(Self {
            environment: settings.environment,
            base_url: settings.api_base(),
            policy: settings.policy,
            registry: Registry::load(&settings.registry_path())?,
            registry_path: settings.registry_path(),
            store: SessionStore::new(settings.session_path()),
            provider,
            http: Client::new(),
        })
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Get a token allowed to perform `operation` on `project`.
    ///
    /// With `api_key_only` the key flow is used and nothing is cached.
    /// Otherwise a cached session is reused while valid; one that expires
    /// within the policy window is refreshed if the provider confirms, and an
    /// expired or missing one forces a new login.
    pub async fn authorize(&self, project: &str, operation: Operation, api_key_only: bool) -> Result<Token> {
        let mode = AuthMode::select(operation, api_key_only)?;
        let kind = operation.token_kind();

        let token = match mode {
            AuthMode::ApiKey => {
                debug!("Using API key authentication for {}", project);
                self.key_flow(project).await?
            }
            AuthMode::Credentials => self.session_or_login(project, kind).await?,
        };

        if !token.authorizes(operation) {
            return Err(TransferError::Auth(format!(
                "an {} token cannot be used to {}",
                token.kind, operation
            )));
        }
        Ok(token)
    }

    /// Drop `token` from the session store if it is still the cached one.
    /// Returns whether an entry was removed.
    pub fn invalidate(&self, token: &Token) -> Result<bool> {
        match self.store.get(token.environment, &token.project, token.kind) {
            Some(cached) if cached.value == token.value => {}
            _ => return Ok(false),
        }
        self.store.remove(token.environment, &token.project, token.kind)?;
        info!(
            "Removed rejected login session {}:{}:{}",
            token.environment, token.project, token.kind
        );
        Ok(true)
    }

    /// Forget `token` when `err` shows the server no longer accepts it, so the
    /// next `authorize` logs in again.
    pub fn forget_if_rejected(&self, token: &Token, err: &TransferError) -> Result<bool> {
        match err {
            TransferError::SessionExpired(_) => self.invalidate(token),
            _ => Ok(false),
        }
    }

    async fn session_or_login(&self, project: &str, kind: TokenKind) -> Result<Token> {
        let now = Utc::now();
        debug!("Using login session {}:{}:{}", self.environment, project, kind);

        match self.store.get(self.environment, project, kind) {
            Some(token) if token.expires_soon(now, self.policy.expiry_window) => {
                info!("Your login session expires soon");
                if self.provider.confirm_refresh(&token)? {
                    self.credential_flow(project, kind).await
                } else {
                    warn!("Continuing with a session that expires at {}", token.expires_at);
                    Ok(token)
                }
            }
            Some(token) if !token.is_expired(now) => {
                debug!("Using token from existing login session");
                Ok(token)
            }
            Some(_) => {
                info!("Your login session has expired, please authenticate");
                self.credential_flow(project, kind).await
            }
            None => {
                info!("No login session for {}, please authenticate", project);
                self.credential_flow(project, kind).await
            }
        }
    }

    /// Look up the registered API key, rejecting expired ones.
    fn api_key(&self, project: &str) -> Result<&str> {
        let api_key = self.registry.require_api_key(self.environment, project)?;
        if api_key_expired(api_key, Utc::now()) {
            return Err(TransferError::Config(
                "your API key has expired; register your client again".into(),
            ));
        }
        Ok(api_key)
    }

    /// Exchange credentials and the API key for a token, and cache it.
    pub async fn credential_flow(&self, project: &str, kind: TokenKind) -> Result<Token> {
        let api_key = self.api_key(project)?;
        let credentials = self.provider.credentials()?;

        let request = self
            .http
            .post(format!("{}/{}/auth", self.base_url, project))
            .bearer_auth(api_key)
            .query(&[("type", kind.as_str())])
            .json(&CredentialsRequest {
                user_name: &credentials.username,
                password: &credentials.password,
                otp: &credentials.otp,
            });

        let token = self.request_token(request, project, kind).await?;
        self.store.put(&token)?;
        Ok(token)
    }

    /// Exchange the API key alone for an import token.
    pub async fn key_flow(&self, project: &str) -> Result<Token> {
        let api_key = self.api_key(project)?;
        let request = self
            .http
            .post(format!("{}/{}/auth/basic", self.base_url, project))
            .bearer_auth(api_key)
            .query(&[("type", TokenKind::Import.as_str())]);

        self.request_token(request, project, TokenKind::Import).await
    }

    /// Exchange credentials for a new API key. The project is taken from the
    /// `pNN-user` username. Returns the project and the key.
    pub async fn fetch_api_key(&self) -> Result<(String, String)> {
        let credentials = self.provider.credentials()?;
        let project = project_from_username(&credentials.username)?;

        let response = self
            .http
            .post(format!("{}/{}/apikey", self.base_url, project))
            .json(&CredentialsRequest {
                user_name: &credentials.username,
                password: &credentials.password,
                otp: &credentials.otp,
            })
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::Auth(format!(
                "credentials rejected ({}): {}",
                status, body
            )));
        }

        let body: ApiKeyResponse = check_response(response).await?.json().await?;
        debug!("Received API key for {}", project);
        Ok((project, body.api_key))
    }

    /// Record an API key for `project` in the current environment.
    pub fn save_api_key(&self, project: &str, api_key: &str) -> Result<()> {
        if api_key_expired(api_key, Utc::now()) {
            return Err(TransferError::Config(
                "the API key is expired or unreadable; request a new one".into(),
            ));
        }
        let mut registry = Registry::load(&self.registry_path)?;
        registry.insert(self.environment, project, api_key);
        registry.save(&self.registry_path)?;
        info!("Registered {} for API environment {}", project, self.environment);
        Ok(())
    }

    async fn request_token(&self, request: RequestBuilder, project: &str, kind: TokenKind) -> Result<Token> {
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::Auth(format!(
                "credentials or API key rejected ({}): {}",
                status, body
            )));
        }

        let response = check_response(response).await?;
        let body: TokenResponse = response.json().await?;
        Token::from_jwt(self.environment, project, kind, body.token, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    #[test]
    fn test_operation_kinds() {
        assert_eq!(Operation::Upload.token_kind(), TokenKind::Import);
        assert_eq!(Operation::ResumeDeleteAll.token_kind(), TokenKind::Import);
        assert_eq!(Operation::Download.token_kind(), TokenKind::Export);
        assert_eq!(Operation::DownloadList.token_kind(), TokenKind::Export);
    }

    #[test]
    fn test_select_mode() {
        assert_eq!(AuthMode::select(Operation::Upload, true).unwrap(), AuthMode::ApiKey);
        assert_eq!(AuthMode::select(Operation::Upload, false).unwrap(), AuthMode::Credentials);
        assert_eq!(
            AuthMode::select(Operation::Download, false).unwrap(),
            AuthMode::Credentials
        );
        assert!(matches!(
            AuthMode::select(Operation::Download, true),
            Err(TransferError::Auth(_))
        ));
        assert!(matches!(
            AuthMode::select(Operation::DownloadList, true),
            Err(TransferError::Auth(_))
        ));
    }

    #[test]
    fn test_api_key_expiry() {
        let now = Utc::now();
        let key = |exp: i64| {
            encode(
                &Header::default(),
                &json!({ "exp": exp }),
                &EncodingKey::from_secret(b"secret"),
            )
            .unwrap()
        };

        assert!(!api_key_expired(&key(now.timestamp() + 3600), now));
        assert!(api_key_expired(&key(now.timestamp() - 1), now));
        assert!(api_key_expired("opaque-key", now));
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let credentials = Credentials {
            username: "p11-alice".into(),
            password: "hunter2".into(),
            otp: "123456".into(),
        };
        let debug = format!("{:?}", credentials);
        assert!(debug.contains("p11-alice"));
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("123456"));
    }
}
