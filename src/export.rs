//! Export listing and resumable downloads.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use reqwest::header::{ETAG, IF_RANGE, RANGE};
use reqwest::{Response, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::auth::Operation;
use crate::client::{check_response, FileApiClient};
use crate::error::{Result, TransferError};
use crate::ident;
use crate::models::{ExportEntry, ExportListResponse};

/// Where a partial download stands, tied to one version of the remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportHandle {
    /// Entity tag of the remote content the partial belongs to.
    pub content_id: String,
    pub filename: String,
    pub byte_offset: u64,
}

/// Result of a download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    /// Bytes written by this invocation.
    pub bytes_written: u64,
    /// Offset the transfer continued from; zero for a fresh download.
    pub resumed_from: u64,
    /// Identifier to pass back to resume this download.
    pub content_id: Option<String>,
}

/// Compare entity tags, ignoring quoting and the weak-validator prefix.
fn same_content(a: &str, b: &str) -> bool {
    fn normalize(tag: &str) -> &str {
        tag.trim().trim_start_matches("W/").trim_matches('"')
    }
    normalize(a) == normalize(b)
}

fn response_etag(response: &Response) -> Option<String> {
    response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Downloads files from the project's export area.
pub struct ExportManager<'a> {
    client: &'a FileApiClient,
}

impl<'a> ExportManager<'a> {
    pub fn new(client: &'a FileApiClient) -> Self {
        Self { client }
    }

    fn url(&self, filename: Option<&str>) -> String {
        match filename {
            Some(name) => self
                .client
                .url(&format!("files/export/{}", urlencoding::encode(name))),
            None => self.client.url("files/export"),
        }
    }

    /// Files available for download.
    pub async fn list(&self) -> Result<Vec<ExportEntry>> {
        self.client.authorize(Operation::DownloadList)?;
        let response: ExportListResponse = self
            .client
            .send_json(self.client.http().get(self.url(None)))
            .await?;
        Ok(response.files)
    }

    /// Work out where a resumed download stands locally.
    ///
    /// The offset is the size of the existing partial file; without a partial
    /// there is nothing to resume.
    pub async fn resume_handle(
        &self,
        filename: &str,
        destination: &Path,
        content_id: &str,
    ) -> Result<Option<ExportHandle>> {
        match tokio::fs::metadata(destination).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(Some(ExportHandle {
                content_id: content_id.to_string(),
                filename: filename.to_string(),
                byte_offset: meta.len(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Download `filename` into `destination` (a file path or a directory).
    ///
    /// With `resume_id`, an existing partial at the destination is continued
    /// from its current size, but only if the remote content identifier still
    /// matches; otherwise the download restarts from zero.
    pub async fn download<P: AsRef<Path>>(
        &self,
        filename: &str,
        destination: P,
        resume_id: Option<&str>,
    ) -> Result<DownloadOutcome> {
        self.client.authorize(Operation::Download)?;
        let filename = ident::validate_remote_name(filename)?;
        let destination = destination.as_ref();

        let final_path = if destination.is_dir() {
            destination.join(&filename)
        } else {
            destination.to_path_buf()
        };

        let handle = match resume_id {
            Some(id) => self.resume_handle(&filename, &final_path, id).await?,
            None => None,
        };

        if let Some(handle) = handle {
            let response = self.fetch(&filename, Some(&handle)).await?;
            match response.status() {
                StatusCode::PARTIAL_CONTENT => {
                    let etag = response_etag(&response);
                    if etag.as_deref().is_some_and(|tag| same_content(tag, &handle.content_id)) {
                        info!("Resuming {} at offset {}", filename, handle.byte_offset);
                        let file = OpenOptions::new().append(true).open(&final_path).await?;
                        let written = write_body(response, file).await?;
                        return Ok(DownloadOutcome {
                            path: final_path,
                            bytes_written: written,
                            resumed_from: handle.byte_offset,
                            content_id: etag,
                        });
                    }
                    warn!("Partial content for {} has a different identifier; restarting", filename);
                }
                StatusCode::RANGE_NOT_SATISFIABLE => {
                    info!("{} is already complete", filename);
                    return Ok(DownloadOutcome {
                        path: final_path,
                        bytes_written: 0,
                        resumed_from: handle.byte_offset,
                        content_id: Some(handle.content_id),
                    });
                }
                _ => {
                    warn!("Remote {} changed since the partial download; restarting from zero", filename);
                    return self.write_fresh(response, final_path).await;
                }
            }
        } else if resume_id.is_some() {
            debug!("No partial download at {}, starting from zero", final_path.display());
        }

        let response = self.fetch(&filename, None).await?;
        self.write_fresh(response, final_path).await
    }

    async fn fetch(&self, filename: &str, handle: Option<&ExportHandle>) -> Result<Response> {
        let mut request = self.client.http().get(self.url(Some(filename)));
        if let Some(handle) = handle {
            request = request
                .header(RANGE, format!("bytes={}-", handle.byte_offset))
                .header(IF_RANGE, handle.content_id.as_str());
        }

        let response = request.bearer_auth(&self.client.token().value).send().await?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE && handle.is_some() {
            return Ok(response);
        }
        check_response(response).await
    }

    async fn write_fresh(&self, response: Response, path: PathBuf) -> Result<DownloadOutcome> {
        let content_id = response_etag(&response);
        let file = File::create(&path).await?;
        let written = write_body(response, file).await?;
        if let Some(id) = &content_id {
            debug!("Download identifier for {}: {}", path.display(), id);
        }
        Ok(DownloadOutcome {
            path,
            bytes_written: written,
            resumed_from: 0,
            content_id,
        })
    }
}

/// Stream a response body to a file.
async fn write_body(response: Response, mut file: File) -> Result<u64> {
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_content() {
        assert!(same_content("\"abc\"", "abc"));
        assert!(same_content("W/\"abc\"", "\"abc\""));
        assert!(!same_content("\"abc\"", "\"abd\""));
    }
}
