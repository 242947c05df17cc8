//! Resumable uploads: chunked transfers tracked by the server across restarts.
//!
//! A session is opened with [`ResumableCoordinator::initiate`], fed chunk by
//! chunk with [`ResumableCoordinator::upload_chunk`] and closed with
//! [`ResumableCoordinator::complete`]. The server acknowledges each chunk by
//! returning the byte ranges it holds; those ranges are the only record of
//! progress, so a session interrupted at any point resumes from the first
//! gap when the same upload id is supplied again.

use std::fmt;
use std::path::Path;
use std::time::Instant;

use reqwest::RequestBuilder;
use tracing::{debug, info, warn};

use crate::auth::Operation;
use crate::client::FileApiClient;
use crate::error::{Result, TransferError};
use crate::models::{
    format_eta, format_size, ByteRange, InitiateRequest, ResumableListResponse, ResumableUpload,
};
use crate::reader::{chunk_count, Chunk, ChunkReader};

/// Lifecycle of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Init,
    Uploading,
    /// Interrupted by a network failure; resumable with the same upload id.
    Paused,
    Complete,
    /// Rejected by the server; must be deleted before retrying.
    Failed,
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Complete | UploadStatus::Failed)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStatus::Init => "init",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Complete => "complete",
            UploadStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Acknowledged byte ranges, strictly increasing and non-overlapping.
/// Adjacent ranges are merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckedRanges {
    ranges: Vec<ByteRange>,
}

impl AckedRanges {
    /// Validate ranges reported by the server for a file of `total` bytes.
    pub fn from_remote(ranges: &[ByteRange], total: u64) -> Result<Self> {
        let mut merged: Vec<ByteRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            if range.start >= range.end {
                return Err(TransferError::Protocol(format!(
                    "server reported an empty range {}..{}",
                    range.start, range.end
                )));
            }
            if range.end > total {
                return Err(TransferError::Protocol(format!(
                    "server acknowledged bytes up to {} of a {} byte file",
                    range.end, total
                )));
            }
            if let Some(last) = merged.last_mut() {
                if range.start < last.end {
                    return Err(TransferError::Protocol(format!(
                        "server reported overlapping or unordered ranges at offset {}",
                        range.start
                    )));
                }
                if range.start == last.end {
                    last.end = range.end;
                    continue;
                }
            }
            merged.push(*range);
        }
        Ok(Self { ranges: merged })
    }

    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    pub fn acked_bytes(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// Whether `[start, end)` lies entirely inside one acknowledged range.
    pub fn covers(&self, start: u64, end: u64) -> bool {
        self.ranges.iter().any(|r| r.start <= start && end <= r.end)
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.ranges.iter().any(|r| r.start < end && start < r.end)
    }

    /// First offset not acknowledged, counting from zero.
    pub fn first_gap(&self) -> u64 {
        match self.ranges.first() {
            Some(first) if first.start == 0 => first.end,
            _ => 0,
        }
    }
}

/// Client view of one resumable upload.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub upload_id: String,
    pub filename: String,
    pub chunk_size: u64,
    pub total_size: u64,
    pub acked: AckedRanges,
    pub status: UploadStatus,
}

impl UploadSession {
    fn from_remote(remote: ResumableUpload, status: UploadStatus) -> Result<Self> {
        if remote.chunk_size == 0 {
            return Err(TransferError::Protocol(format!(
                "upload {} has a zero chunk size",
                remote.id
            )));
        }
        let acked = AckedRanges::from_remote(&remote.acked, remote.total_size)?;
        Ok(Self {
            upload_id: remote.id,
            filename: remote.filename,
            chunk_size: remote.chunk_size,
            total_size: remote.total_size,
            acked,
            status,
        })
    }

    pub fn is_fully_acked(&self) -> bool {
        self.acked.acked_bytes() == self.total_size
    }

    /// Offset the next transmission starts from.
    pub fn resume_offset(&self) -> u64 {
        self.acked.first_gap()
    }

    pub fn chunk_count(&self) -> u64 {
        chunk_count(self.total_size, self.chunk_size)
    }

    pub fn acked_chunks(&self) -> u64 {
        self.acked
            .ranges()
            .iter()
            .map(|r| chunk_count(r.end, self.chunk_size) - r.start / self.chunk_size)
            .sum()
    }
}

fn protocol_rejection(err: TransferError) -> TransferError {
    match err {
        TransferError::Api {
            status: status @ (400 | 409 | 416),
            message,
        } => TransferError::Protocol(format!("server rejected request ({}): {}", status, message)),
        other => other,
    }
}

/// Drives the resumable protocol for one project.
pub struct ResumableCoordinator<'a> {
    client: &'a FileApiClient,
    group: String,
}

impl<'a> ResumableCoordinator<'a> {
    /// Create a coordinator whose new uploads are owned by `group`.
    pub fn new(client: &'a FileApiClient, group: &str) -> Self {
        Self {
            client,
            group: group.to_string(),
        }
    }

    fn url(&self, filename: Option<&str>) -> String {
        match filename {
            Some(name) => self
                .client
                .url(&format!("files/resumable/{}", urlencoding::encode(name))),
            None => self.client.url("files/resumable"),
        }
    }

    /// Send a request on a resumable route. Rejections of chunk ordering or
    /// size are protocol errors.
    async fn send_resumable(&self, request: RequestBuilder) -> Result<ResumableUpload> {
        self.client.send_json(request).await.map_err(protocol_rejection)
    }

    /// Open a new upload session, or reopen `upload_id` and resume from the
    /// first unacknowledged byte.
    pub async fn initiate(
        &self,
        filename: &str,
        chunk_size: u64,
        total_size: u64,
        upload_id: Option<&str>,
    ) -> Result<UploadSession> {
        self.client.authorize(Operation::Upload)?;

        let session = match upload_id {
            Some(id) => {
                let session = self.status(filename, id).await?;
                if session.total_size != total_size {
                    return Err(TransferError::Protocol(format!(
                        "upload {} expects {} bytes but {} has {}",
                        id, session.total_size, filename, total_size
                    )));
                }
                if session.chunk_size != chunk_size {
                    debug!(
                        "Resuming {} with its original chunk size {}",
                        id, session.chunk_size
                    );
                }
                info!(
                    "Resuming upload {} of {} at offset {}",
                    id,
                    filename,
                    session.resume_offset()
                );
                session
            }
            None => {
                if chunk_size == 0 {
                    return Err(TransferError::Config("chunk size must be positive".into()));
                }
                let request = self.client.http().post(self.url(None)).json(&InitiateRequest {
                    filename,
                    chunk_size,
                    total_size,
                    group: &self.group,
                });
                let remote = self.send_resumable(request).await?;
                let session = UploadSession::from_remote(remote, UploadStatus::Init)?;
                info!("Started upload {} of {}", session.upload_id, filename);
                session
            }
        };

        if session.filename != filename {
            return Err(TransferError::Protocol(format!(
                "upload {} belongs to {}, not {}",
                session.upload_id, session.filename, filename
            )));
        }
        Ok(session)
    }

    /// Fetch the server state of an upload.
    pub async fn status(&self, filename: &str, upload_id: &str) -> Result<UploadSession> {
        self.client.authorize(Operation::Upload)?;
        let request = self
            .client
            .http()
            .get(self.url(Some(filename)))
            .query(&[("id", upload_id)]);
        let remote = self.send_resumable(request).await?;
        UploadSession::from_remote(remote, UploadStatus::Init)
    }

    /// Send one chunk. Returns `false` without contacting the server when the
    /// chunk is already acknowledged.
    pub async fn upload_chunk(&self, session: &mut UploadSession, chunk: &Chunk) -> Result<bool> {
        let (start, end) = (chunk.offset, chunk.end());

        if chunk.size() == 0 || end > session.total_size {
            return Err(TransferError::Protocol(format!(
                "chunk {}..{} lies outside a {} byte upload",
                start, end, session.total_size
            )));
        }
        if start % session.chunk_size != 0 {
            return Err(TransferError::Protocol(format!(
                "chunk offset {} is not a multiple of the chunk size {}",
                start, session.chunk_size
            )));
        }
        if chunk.size() != session.chunk_size && end != session.total_size {
            return Err(TransferError::Protocol(format!(
                "non-final chunk at offset {} has {} bytes, expected {}",
                start,
                chunk.size(),
                session.chunk_size
            )));
        }

        if session.acked.covers(start, end) {
            debug!("Chunk at offset {} already acknowledged", start);
            return Ok(false);
        }
        if session.acked.overlaps(start, end) {
            return Err(TransferError::Protocol(format!(
                "chunk {}..{} partially overlaps acknowledged data",
                start, end
            )));
        }

        let offset = start.to_string();
        let request = self
            .client
            .http()
            .patch(self.url(Some(&session.filename)))
            .query(&[("id", session.upload_id.as_str()), ("offset", offset.as_str())])
            .body(chunk.payload.clone());

        let remote = self.send_resumable(request).await?;
        let acked = AckedRanges::from_remote(&remote.acked, session.total_size)?;
        if !acked.covers(start, end) {
            return Err(TransferError::Protocol(format!(
                "server did not acknowledge chunk {}..{}",
                start, end
            )));
        }

        session.acked = acked;
        session.status = UploadStatus::Uploading;
        debug!("Chunk {}..{} of {} acknowledged", start, end, session.upload_id);
        Ok(true)
    }

    /// Finalize a session whose bytes are all acknowledged.
    pub async fn complete(&self, session: &mut UploadSession) -> Result<()> {
        if !session.is_fully_acked() {
            return Err(TransferError::Protocol(format!(
                "upload {} has {} of {} bytes acknowledged",
                session.upload_id,
                session.acked.acked_bytes(),
                session.total_size
            )));
        }

        let request = self
            .client
            .http()
            .post(format!("{}/complete", self.url(Some(&session.filename))))
            .query(&[("id", session.upload_id.as_str())]);
        self.client.send(request).await.map_err(protocol_rejection)?;

        session.status = UploadStatus::Complete;
        info!("Upload {} of {} complete", session.upload_id, session.filename);
        Ok(())
    }

    /// Upload a whole file, resuming `upload_id` when given.
    ///
    /// Acknowledged chunks are never re-sent. A network failure leaves the
    /// session PAUSED on the server side; re-running with the same upload id
    /// continues from the first gap.
    pub async fn upload_file(
        &self,
        local_path: &Path,
        filename: &str,
        chunk_size: u64,
        upload_id: Option<&str>,
    ) -> Result<UploadSession> {
        let total_size = tokio::fs::metadata(local_path).await?.len();
        let mut session = self
            .initiate(filename, chunk_size, total_size, upload_id)
            .await?;

        match self.transfer(local_path, &mut session).await {
            Ok(()) => Ok(session),
            Err(e) => {
                if e.is_retryable() {
                    session.status = UploadStatus::Paused;
                    warn!(
                        "Upload {} paused at offset {}: {}; re-run with upload id {} to resume",
                        session.upload_id,
                        session.resume_offset(),
                        e,
                        session.upload_id
                    );
                } else {
                    session.status = UploadStatus::Failed;
                    warn!(
                        "Upload {} failed: {}; delete it before retrying",
                        session.upload_id, e
                    );
                }
                Err(e)
            }
        }
    }

    async fn transfer(&self, local_path: &Path, session: &mut UploadSession) -> Result<()> {
        let start = session.resume_offset();
        if start % session.chunk_size != 0 && start != session.total_size {
            return Err(TransferError::Protocol(format!(
                "acknowledged data ends at {}, inside a chunk",
                start
            )));
        }

        let chunk_size = usize::try_from(session.chunk_size)
            .map_err(|_| TransferError::Config("chunk size too large".into()))?;
        let mut reader = ChunkReader::open_at(local_path, start, chunk_size).await?;
        let total_chunks = session.chunk_count();
        let started = Instant::now();
        let mut sent_bytes = 0u64;

        session.status = UploadStatus::Uploading;
        while let Some(chunk) = reader.next_chunk().await? {
            if !self.upload_chunk(session, &chunk).await? {
                continue;
            }
            sent_bytes += chunk.size();

            let remaining = session.total_size - session.acked.acked_bytes();
            let rate = sent_bytes as f64 / started.elapsed().as_secs_f64();
            info!(
                "Chunk {}/{} acknowledged ({} of {}, eta {})",
                chunk.offset / session.chunk_size + 1,
                total_chunks,
                format_size(session.acked.acked_bytes()),
                format_size(session.total_size),
                format_eta(remaining as f64 / rate)
            );
        }

        self.complete(session).await
    }

    /// In-flight uploads of the project.
    pub async fn list(&self) -> Result<Vec<ResumableUpload>> {
        self.client.authorize(Operation::ResumeList)?;
        let response: ResumableListResponse = self
            .client
            .send_json(self.client.http().get(self.url(None)))
            .await?;
        Ok(response.resumables)
    }

    /// Cancel one upload.
    pub async fn delete(&self, upload_id: &str) -> Result<ResumableUpload> {
        self.client.authorize(Operation::ResumeDelete)?;
        let upload = self
            .list()
            .await?
            .into_iter()
            .find(|u| u.id == upload_id)
            .ok_or_else(|| TransferError::FileNotFound(format!("resumable upload {}", upload_id)))?;

        let request = self
            .client
            .http()
            .delete(self.url(Some(&upload.filename)))
            .query(&[("id", upload_id)]);
        self.client.send(request).await?;
        info!("Deleted upload {} of {}", upload.id, upload.filename);
        Ok(upload)
    }

    /// Cancel every upload of the project.
    pub async fn delete_all(&self) -> Result<()> {
        self.client.authorize(Operation::ResumeDeleteAll)?;
        self.client
            .send(self.client.http().delete(self.url(None)))
            .await?;
        info!("Deleted all resumable uploads of {}", self.client.project());
        Ok(())
    }
}
