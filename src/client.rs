//! HTTP client for the file API: request plumbing and upload dispatch.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::TryStreamExt;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::io::AsyncRead;
use tracing::info;

use crate::auth::Operation;
use crate::config::TransferPolicy;
use crate::error::{Result, TransferError};
use crate::ident;
use crate::models::{format_size, ApiErrorResponse};
use crate::reader::ChunkReader;
use crate::resumable::{ResumableCoordinator, UploadSession};
use crate::selector::{select, TransferMode};
use crate::session::Token;

/// Header carrying the percent-encoded target file name of a streamed upload.
pub const FILENAME_HEADER: &str = "Filename";

/// Header naming the file group that will own an import.
pub const GROUP_HEADER: &str = "Group";

/// How an upload was carried out.
#[derive(Debug)]
pub enum UploadOutcome {
    /// Sent as one streamed request body.
    Streamed { filename: String, bytes: u64 },
    /// Sent chunk by chunk; the session has reached COMPLETE.
    Resumable(UploadSession),
}

/// Client bound to one project and one bearer token.
pub struct FileApiClient {
    http: Client,
    base_url: String,
    token: Token,
}

impl FileApiClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `base_url` - API base URL, e.g. `https://api.tsd.usit.no/v1`
    /// * `token` - Token scoped to the project the client operates on
    pub fn new(base_url: &str, token: Token) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn project(&self) -> &str {
        &self.token.project
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    /// Fail unless the client's token may be used for `operation`.
    pub fn authorize(&self, operation: Operation) -> Result<()> {
        if self.token.authorizes(operation) {
            return Ok(());
        }
        Err(TransferError::Auth(format!(
            "an {} token cannot be used to {}",
            self.token.kind, operation
        )))
    }

    /// Group owning imported files when none is given.
    pub fn default_group(&self) -> String {
        format!("{}-member-group", self.project())
    }

    /// Absolute URL of a project-scoped path.
    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.project(), path)
    }

    /// Send an authorized request and map error statuses.
    pub(crate) async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.bearer_auth(&self.token.value).send().await?;
        check_response(response).await
    }

    pub(crate) async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.send(request).await?;
        Ok(response.json().await?)
    }

    /// Upload a local file, choosing streaming or resumable mode.
    ///
    /// # Arguments
    /// * `local_path` - Path to the local file
    /// * `upload_id` - Resume an earlier resumable upload
    /// * `group` - Owning file group, defaults to the project member group
    /// * `policy` - Chunk size and resumable threshold
    pub async fn upload_file<P: AsRef<Path>>(
        &self,
        local_path: P,
        upload_id: Option<&str>,
        group: Option<&str>,
        policy: &TransferPolicy,
    ) -> Result<UploadOutcome> {
        self.authorize(Operation::Upload)?;
        let local_path = local_path.as_ref();

        let metadata = tokio::fs::metadata(local_path)
            .await
            .map_err(|_| TransferError::FileNotFound(local_path.display().to_string()))?;
        if !metadata.is_file() {
            return Err(TransferError::FileNotFound(local_path.display().to_string()));
        }

        let filename = ident::remote_name(local_path)?;
        let group = group
            .map(str::to_string)
            .unwrap_or_else(|| self.default_group());
        let size = metadata.len();

        match select(Some(size), upload_id, policy)? {
            TransferMode::Streaming => {
                info!("Streaming {} ({})", filename, format_size(size));
                let reader = ChunkReader::open(local_path, policy.stream_buffer).await?;
                let content_type = mime_guess::from_path(local_path)
                    .first_or_octet_stream()
                    .to_string();
                let bytes = self
                    .upload_stream(reader, &filename, &group, &content_type)
                    .await?;
                Ok(UploadOutcome::Streamed { filename, bytes })
            }
            TransferMode::Resumable {
                chunk_size,
                chunk_count,
            } => {
                info!(
                    "Uploading {} ({}) in {} chunk(s) of {}",
                    filename,
                    format_size(size),
                    chunk_count,
                    format_size(chunk_size)
                );
                let coordinator = ResumableCoordinator::new(self, &group);
                let session = coordinator
                    .upload_file(local_path, &filename, chunk_size, upload_id)
                    .await?;
                Ok(UploadOutcome::Resumable(session))
            }
        }
    }

    /// Upload standard input as one streamed body. Its size is unknown, so it
    /// never goes through the resumable protocol.
    pub async fn upload_stdin(
        &self,
        filename: &str,
        group: Option<&str>,
        policy: &TransferPolicy,
    ) -> Result<UploadOutcome> {
        self.authorize(Operation::Upload)?;
        let filename = ident::validate_remote_name(filename)?;
        let group = group
            .map(str::to_string)
            .unwrap_or_else(|| self.default_group());

        info!("Streaming standard input as {}", filename);
        let reader = ChunkReader::stdin(policy.stream_buffer);
        let bytes = self
            .upload_stream(reader, &filename, &group, "application/octet-stream")
            .await?;
        Ok(UploadOutcome::Streamed { filename, bytes })
    }

    /// Single-shot upload: the whole source goes out as one streamed request body.
    /// A failure part-way requires starting over from the first byte.
    /// Returns the number of bytes sent.
    pub async fn upload_stream<R>(
        &self,
        reader: ChunkReader<R>,
        filename: &str,
        group: &str,
        content_type: &str,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sent = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&sent);
        let stream = reader.into_stream().inspect_ok(move |payload| {
            counter.fetch_add(payload.len() as u64, Ordering::Relaxed);
        });
        let body = Body::wrap_stream(stream);
        let request = self
            .http
            .put(self.url("files/stream"))
            .header(FILENAME_HEADER, urlencoding::encode(filename).into_owned())
            .header(GROUP_HEADER, group)
            .header(CONTENT_TYPE, content_type)
            .body(body);

        self.send(request).await?;
        Ok(sent.load(Ordering::Relaxed))
    }
}

/// Map a non-success response to an error.
///
/// 401 means the server no longer accepts the token; 403 is an authorization
/// failure; gateway errors are transient network failures.
pub async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorResponse>(&error_body)
        .map(|e| e.message)
        .unwrap_or(error_body);

    Err(match status {
        StatusCode::UNAUTHORIZED => TransferError::SessionExpired(message),
        StatusCode::FORBIDDEN => TransferError::Auth(message),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            TransferError::Network(format!("{}: {}", status, message))
        }
        _ => TransferError::Api {
            status: status.as_u16(),
            message,
        },
    })
}
