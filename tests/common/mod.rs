//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::cell::Cell;
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;

use secure_transfer::{
    CredentialProvider, Credentials, Environment, Result, Settings, Token, TokenKind,
};

pub const PROJECT: &str = "p11";

/// A signed JWT with the given lifetime relative to now.
pub fn jwt(valid_for_secs: i64) -> String {
    let now = Utc::now().timestamp();
    encode(
        &Header::default(),
        &json!({ "iat": now - 10, "exp": now + valid_for_secs, "sub": "p11-alice" }),
        &EncodingKey::from_secret(b"test-secret"),
    )
    .unwrap()
}

/// A token for PROJECT issued an hour ago and valid for another hour.
pub fn token(kind: TokenKind) -> Token {
    let now = Utc::now();
    Token::new(
        Environment::Test,
        PROJECT,
        kind,
        "test-token".to_string(),
        now - Duration::hours(1),
        now + Duration::hours(1),
    )
    .unwrap()
}

pub fn settings(config_dir: &Path, base_url: &str) -> Settings {
    let mut settings = Settings::new(Environment::Test, config_dir.to_path_buf());
    settings.base_url = Some(base_url.to_string());
    settings
}

/// Write `content` to `dir/name` and return the path.
pub fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Printable test payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

/// Credential provider with canned answers that counts its prompts.
pub struct ScriptedProvider {
    pub confirm: bool,
    pub credential_prompts: Cell<usize>,
    pub confirm_prompts: Cell<usize>,
}

impl ScriptedProvider {
    pub fn new(confirm: bool) -> Self {
        Self {
            confirm,
            credential_prompts: Cell::new(0),
            confirm_prompts: Cell::new(0),
        }
    }
}

impl CredentialProvider for &ScriptedProvider {
    fn credentials(&self) -> Result<Credentials> {
        self.credential_prompts.set(self.credential_prompts.get() + 1);
        Ok(Credentials {
            username: "p11-alice".to_string(),
            password: "correct horse".to_string(),
            otp: "123456".to_string(),
        })
    }

    fn confirm_refresh(&self, _token: &Token) -> Result<bool> {
        self.confirm_prompts.set(self.confirm_prompts.get() + 1);
        Ok(self.confirm)
    }
}
