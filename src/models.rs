//! Data models for the file API wire format.

use serde::{Deserialize, Serialize};

/// A half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Server view of a resumable upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumableUpload {
    pub id: String,
    pub filename: String,
    pub chunk_size: u64,
    pub total_size: u64,
    #[serde(default)]
    pub acked: Vec<ByteRange>,
    #[serde(default)]
    pub group: Option<String>,
}

impl ResumableUpload {
    pub fn acked_bytes(&self) -> u64 {
        self.acked.iter().map(ByteRange::len).sum()
    }
}

impl std::fmt::Display for ResumableUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}\t{} / {}\t{}",
            self.id,
            format_size(self.acked_bytes()),
            format_size(self.total_size),
            self.filename
        )
    }
}

/// Response from listing resumable uploads.
#[derive(Debug, Deserialize)]
pub struct ResumableListResponse {
    #[serde(default)]
    pub resumables: Vec<ResumableUpload>,
}

/// Body that opens a new resumable upload.
#[derive(Debug, Serialize)]
pub struct InitiateRequest<'a> {
    pub filename: &'a str,
    pub chunk_size: u64,
    pub total_size: u64,
    pub group: &'a str,
}

/// A file available for export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportEntry {
    pub filename: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_date: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
}

impl std::fmt::Display for ExportEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let size_str = self
            .size
            .map(format_size)
            .unwrap_or_else(|| "-".to_string());
        let modified = self.modified_date.as_deref().unwrap_or("-");
        write!(f, "{}\t{}\t{}", size_str, modified, self.filename)
    }
}

/// Response from the export listing endpoint.
#[derive(Debug, Deserialize)]
pub struct ExportListResponse {
    #[serde(default)]
    pub files: Vec<ExportEntry>,
}

/// Body for the credential flow.
#[derive(Debug, Serialize)]
pub struct CredentialsRequest<'a> {
    pub user_name: &'a str,
    pub password: &'a str,
    pub otp: &'a str,
}

/// Token issued by either auth endpoint.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

/// API key issued to a newly registered client.
#[derive(Debug, Deserialize)]
pub struct ApiKeyResponse {
    pub api_key: String,
}

/// Error body returned by the API.
#[derive(Debug, Deserialize)]
pub struct ApiErrorResponse {
    pub message: String,
}

/// Format bytes into human-readable size.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format seconds into human-readable time (e.g., "2m 15s", "1h 5m", "< 1s").
pub fn format_eta(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "--".to_string();
    }

    let secs = seconds.round() as u64;

    if secs == 0 {
        return "< 1s".to_string();
    }

    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let remaining_secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, remaining_secs)
    } else {
        format!("{}s", remaining_secs)
    }
}
