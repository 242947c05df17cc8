//! Runtime settings, transfer policy and the local API-key registry.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::atomic;
use crate::error::{Result, TransferError};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Directory name used under the platform config directory.
const APP_DIR: &str = "secure_transfer";

const CONFIG_FILE: &str = "config.json";
const SESSION_FILE: &str = "session.json";

/// API environment a command runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Prod,
    Alt,
    Test,
}

impl Environment {
    pub const ALL: [Environment; 3] = [Environment::Prod, Environment::Alt, Environment::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Prod => "prod",
            Environment::Alt => "alt",
            Environment::Test => "test",
        }
    }

    /// Default API base URL for this environment.
    pub fn base_url(&self) -> &'static str {
        match self {
            Environment::Prod => "https://api.tsd.usit.no/v1",
            Environment::Alt => "https://alt.api.tsd.usit.no/v1",
            Environment::Test => "https://test.api.tsd.usit.no/v1",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        Environment::ALL
            .into_iter()
            .find(|env| env.as_str() == s.trim())
            .ok_or_else(|| TransferError::Config(format!("unknown API environment: {}", s)))
    }
}

/// Operational policy for transfers and login sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPolicy {
    /// Chunk size for resumable uploads.
    pub chunk_size: u64,
    /// Files strictly larger than this are uploaded in resumable mode.
    pub resumable_threshold: u64,
    /// How far ahead of expiry a cached token triggers a refresh prompt.
    pub expiry_window: Duration,
    /// Read buffer for single-shot streaming uploads and downloads.
    pub stream_buffer: usize,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            chunk_size: 50 * MIB,
            resumable_threshold: GIB,
            expiry_window: Duration::from_secs(5 * 60),
            stream_buffer: 64 * 1024,
        }
    }
}

/// Everything a command needs to know about where and how to run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: Environment,
    /// Overrides the environment's default base URL.
    pub base_url: Option<String>,
    pub config_dir: PathBuf,
    pub policy: TransferPolicy,
    pub verbose: bool,
}

impl Settings {
    pub fn new(environment: Environment, config_dir: PathBuf) -> Self {
        Self {
            environment,
            base_url: None,
            config_dir,
            policy: TransferPolicy::default(),
            verbose: false,
        }
    }

    /// Platform default location for local state.
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR))
            .ok_or_else(|| TransferError::Config("cannot determine config directory".into()))
    }

    /// Base URL for API calls, without a trailing slash.
    pub fn api_base(&self) -> String {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.environment.base_url())
            .trim_end_matches('/')
            .to_string()
    }

    pub fn registry_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn session_path(&self) -> PathBuf {
        self.config_dir.join(SESSION_FILE)
    }
}

/// Registered API keys, keyed by environment and project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Registry {
    keys: BTreeMap<Environment, BTreeMap<String, String>>,
}

impl Registry {
    /// Load the registry, treating a missing file as empty.
    pub fn load(path: &Path) -> Result<Self> {
        atomic::read_json(path)
            .map_err(|e| TransferError::Config(format!("cannot read {}: {}", path.display(), e)))
            .map(Option::unwrap_or_default)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic::write_json(path, self)
    }

    /// Delete the registry file.
    pub fn delete(path: &Path) -> Result<()> {
        atomic::remove(path)
    }

    pub fn api_key(&self, environment: Environment, project: &str) -> Option<&str> {
        self.keys
            .get(&environment)
            .and_then(|projects| projects.get(project))
            .map(String::as_str)
    }

    /// Look up an API key or fail with a registration hint.
    pub fn require_api_key(&self, environment: Environment, project: &str) -> Result<&str> {
        self.api_key(environment, project).ok_or_else(|| {
            TransferError::Config(format!(
                "client not registered for API environment {} and project {}; run `register` first",
                environment, project
            ))
        })
    }

    pub fn insert(&mut self, environment: Environment, project: &str, api_key: &str) {
        self.keys
            .entry(environment)
            .or_default()
            .insert(project.to_string(), api_key.to_string());
    }

    pub fn remove(&mut self, environment: Environment, project: &str) -> Option<String> {
        let projects = self.keys.get_mut(&environment)?;
        let removed = projects.remove(project);
        if projects.is_empty() {
            self.keys.remove(&environment);
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// All registrations as (environment, project, api key).
    pub fn entries(&self) -> impl Iterator<Item = (Environment, &str, &str)> {
        self.keys.iter().flat_map(|(env, projects)| {
            projects
                .iter()
                .map(move |(project, key)| (*env, project.as_str(), key.as_str()))
        })
    }
}

/// Mask an API key for display, keeping only its last few characters.
pub fn mask_key(key: &str) -> String {
    let count = key.chars().count();
    if count <= 6 {
        return "*".repeat(count);
    }
    let tail: String = key.chars().skip(count - 6).collect();
    format!("...{}", tail)
}
