//! Choice between single-shot streaming and resumable uploads.

use crate::config::TransferPolicy;
use crate::error::{Result, TransferError};
use crate::reader::chunk_count;

/// Upload mode chosen for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// One request with one streamed body.
    Streaming,
    /// Chunked upload that survives restarts.
    Resumable { chunk_size: u64, chunk_count: u64 },
}

/// Pick the upload mode for a source of `size` bytes (`None` when unknown,
/// as for standard input).
///
/// Resumable mode is used when a resume id is given or the size exceeds the
/// policy threshold. Sources of unknown size always stream and cannot resume.
pub fn select(size: Option<u64>, resume_id: Option<&str>, policy: &TransferPolicy) -> Result<TransferMode> {
    if policy.chunk_size == 0 {
        return Err(TransferError::Config("chunk size must be positive".into()));
    }

    let Some(size) = size else {
        if resume_id.is_some() {
            return Err(TransferError::Config(
                "resumable uploads need a regular file, not standard input".into(),
            ));
        }
        return Ok(TransferMode::Streaming);
    };

    if resume_id.is_some() || size > policy.resumable_threshold {
        return Ok(TransferMode::Resumable {
            chunk_size: policy.chunk_size,
            chunk_count: chunk_count(size, policy.chunk_size),
        });
    }

    Ok(TransferMode::Streaming)
}
