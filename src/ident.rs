//! Validation of project identifiers and remote file names.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{Result, TransferError};

/// Project identifiers look like `p11`.
static PROJECT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^p[0-9]+$").expect("Invalid project regex"));

/// Usernames are prefixed with their project: `p11-alice`.
static USERNAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(p[0-9]+)-[A-Za-z0-9._-]+$").expect("Invalid username regex"));

/// Validate a project identifier.
///
/// # Examples
///
/// ```
/// use secure_transfer::ident::validate_project;
///
/// assert_eq!(validate_project(" p11 ").unwrap(), "p11");
/// assert!(validate_project("project-11").is_err());
/// ```
pub fn validate_project(project: &str) -> Result<String> {
    let trimmed = project.trim();
    if PROJECT_REGEX.is_match(trimmed) {
        return Ok(trimmed.to_string());
    }
    Err(TransferError::InvalidProject(project.to_string()))
}

/// Extract the project identifier from a `pNN-user` username.
pub fn project_from_username(username: &str) -> Result<String> {
    USERNAME_REGEX
        .captures(username.trim())
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| TransferError::InvalidProject(username.to_string()))
}

/// Name under which a local file is stored remotely.
pub fn remote_name(local_path: &Path) -> Result<String> {
    local_path
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .ok_or_else(|| TransferError::FileNotFound(local_path.display().to_string()))
}

/// Validate a user-supplied remote file name.
pub fn validate_remote_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." || trimmed.contains('/') {
        return Err(TransferError::FileNotFound(name.to_string()));
    }
    Ok(trimmed.to_string())
}
