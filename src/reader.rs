//! Lazy, bounded-memory chunking of files and standard input.

use std::io;
use std::io::SeekFrom;
use std::path::Path;

use bytes::Bytes;
use futures::Stream;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, Stdin};

/// A slice of the source tagged with its byte offset.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub payload: Bytes,
}

impl Chunk {
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Offset one past the last byte of this chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.size()
    }
}

/// Pulls fixed-size chunks from an async byte source.
///
/// Every chunk except the last is exactly `chunk_size` bytes; short reads
/// from the source are coalesced. Only the chunk being returned is held in
/// memory. The sequence ends at end of input and is never empty-terminated:
/// an empty source yields no chunks at all.
pub struct ChunkReader<R> {
    inner: R,
    chunk_size: usize,
    offset: u64,
    done: bool,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    /// Wrap a source whose first byte is at offset zero.
    pub fn new(inner: R, chunk_size: usize) -> Self {
        Self::starting_at(inner, 0, chunk_size)
    }

    fn starting_at(inner: R, offset: u64, chunk_size: usize) -> Self {
        Self {
            inner,
            chunk_size: chunk_size.max(1),
            offset,
            done: false,
        }
    }

    /// Offset of the next chunk to be returned.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Read the next chunk, or `None` at end of input.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Chunk>> {
        if self.done {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.done = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }

        buf.truncate(filled);
        let chunk = Chunk {
            offset: self.offset,
            payload: Bytes::from(buf),
        };
        self.offset += filled as u64;
        Ok(Some(chunk))
    }

    /// Turn the reader into a stream of payloads, suitable as a streamed request body.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> {
        futures::stream::try_unfold(self, |mut reader| async move {
            Ok(reader
                .next_chunk()
                .await?
                .map(|chunk| (chunk.payload, reader)))
        })
    }
}

impl ChunkReader<File> {
    /// Open a file from its beginning.
    pub async fn open<P: AsRef<Path>>(path: P, chunk_size: usize) -> io::Result<Self> {
        Self::open_at(path, 0, chunk_size).await
    }

    /// Reopen a file positioned at `offset`; chunk offsets continue from there.
    pub async fn open_at<P: AsRef<Path>>(path: P, offset: u64, chunk_size: usize) -> io::Result<Self> {
        let mut file = File::open(path).await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(Self::starting_at(file, offset, chunk_size))
    }
}

impl ChunkReader<Stdin> {
    /// Read from standard input. Not restartable.
    pub fn stdin(chunk_size: usize) -> Self {
        Self::new(tokio::io::stdin(), chunk_size)
    }
}

/// Number of chunks a source of `total` bytes splits into.
pub fn chunk_count(total: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total.div_ceil(chunk_size)
}
