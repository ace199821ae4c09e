//! Chunked file transfer.
//!
//! [`ChunkCursor`] is the producer half: it opens the content stream on the
//! first pull and hands out one bounded chunk per pull. [`ChunkSink`] is the
//! consumer half: it checks sequence order, appends to the destination and
//! verifies the total against the terminal marker before releasing the node.
//! Neither holds more than one chunk in memory.

use crate::error::{Result, SyncError};
use crate::protocol::{FileNodeChunk, FileNodeEndChunk, PullChunk};
use crate::store::{ContentSink, ContentStream, NodeRecord};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default chunk size (64KB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Largest configurable chunk size (16MB - well under the 64MB frame limit)
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Number of chunks a resource of `size` bytes is split into.
pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size as u64)
}

// =============================================================================
// Producer
// =============================================================================

/// Producer side of one container.
///
/// Created closed, with only the size announced in `FileNodeData`. The
/// content stream is attached on the first pull and dropped as soon as the
/// last byte has been read, so at most the containers being pulled hold an
/// open reader.
pub struct ChunkCursor {
    container_id: String,
    node_id: String,
    reader: Option<Box<dyn AsyncRead + Send + Unpin>>,
    file_size: u64,
    chunk_size: usize,
    next_sequence: u32,
    bytes_read: u64,
}

impl ChunkCursor {
    pub fn new(
        container_id: impl Into<String>,
        node_id: impl Into<String>,
        file_size: u64,
        chunk_size: usize,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            node_id: node_id.into(),
            reader: None,
            file_size,
            chunk_size: chunk_size.max(1),
            next_sequence: 0,
            bytes_read: 0,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    pub fn is_exhausted(&self) -> bool {
        self.bytes_read >= self.file_size
    }

    /// Attach the content stream. Its length must still match the size
    /// announced to the peer.
    pub fn open(&mut self, content: ContentStream) -> Result<()> {
        if content.length != self.file_size {
            return Err(SyncError::storage(format!(
                "Content of {} changed size from {} to {} bytes",
                self.node_id, self.file_size, content.length
            )));
        }
        self.reader = Some(content.reader);
        Ok(())
    }

    /// Read the next chunk, `None` once the declared length has been read.
    pub async fn next_chunk(&mut self) -> Result<Option<FileNodeChunk>> {
        if self.is_exhausted() {
            self.reader = None;
            return Ok(None);
        }

        let reader = self.reader.as_mut().ok_or_else(|| {
            SyncError::storage(format!("Content of container {} is not open", self.container_id))
        })?;

        let want = (self.file_size - self.bytes_read).min(self.chunk_size as u64) as usize;
        let mut buf = vec![0u8; want];
        let mut filled = 0;

        while filled < want {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(SyncError::storage(format!(
                    "Content for container {} ended after {} of {} bytes",
                    self.container_id,
                    self.bytes_read + filled as u64,
                    self.file_size
                )));
            }
            filled += n;
        }

        let chunk = FileNodeChunk {
            container_id: self.container_id.clone(),
            file_size: self.file_size,
            sequence: self.next_sequence,
            chunk_size: self.chunk_size as u32,
            data: Bytes::from(buf),
        };

        self.bytes_read += want as u64;
        self.next_sequence += 1;
        if self.is_exhausted() {
            self.reader = None;
        }

        Ok(Some(chunk))
    }

    /// Terminal marker for this container.
    pub fn end_chunk(&self) -> FileNodeEndChunk {
        FileNodeEndChunk {
            container_id: self.container_id.clone(),
            file_size: self.file_size,
        }
    }
}

// =============================================================================
// Consumer
// =============================================================================

/// Consumer side of one container.
///
/// Holds the announced node until its content has been verified; the
/// destination sink is only created when the container is first pulled.
pub struct ChunkSink {
    container_id: String,
    node: NodeRecord,
    file_size: u64,
    next_sequence: u32,
    received: u64,
    sink: Option<Box<dyn ContentSink>>,
}

impl ChunkSink {
    pub fn new(container_id: impl Into<String>, node: NodeRecord, file_size: u64) -> Self {
        Self {
            container_id: container_id.into(),
            node,
            file_size,
            next_sequence: 0,
            received: 0,
            sink: None,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    pub fn open(&mut self, sink: Box<dyn ContentSink>) {
        self.sink = Some(sink);
    }

    /// Pull request for the next expected chunk.
    pub fn next_pull(&self) -> PullChunk {
        PullChunk {
            container_id: self.container_id.clone(),
            sequence: self.next_sequence,
            file_size: self.file_size,
        }
    }

    /// Append one chunk. Chunks must arrive in sequence order.
    pub async fn append(&mut self, chunk: &FileNodeChunk) -> Result<()> {
        if chunk.sequence != self.next_sequence {
            return Err(SyncError::protocol(format!(
                "Chunk {} for container {} out of sequence, expected {}",
                chunk.sequence, self.container_id, self.next_sequence
            )));
        }

        let len = chunk.data.len() as u64;
        if self.received + len > self.file_size {
            return Err(SyncError::Integrity {
                container_id: self.container_id.clone(),
                expected: self.file_size,
                actual: self.received + len,
            });
        }

        let sink = self.sink.as_mut().ok_or_else(|| {
            SyncError::protocol(format!(
                "Chunk for container {} before it was pulled",
                self.container_id
            ))
        })?;
        sink.write_chunk(&chunk.data).await?;
        self.received += len;
        self.next_sequence += 1;
        Ok(())
    }

    /// Verify the byte count against the terminal marker and commit.
    ///
    /// Returns the node together with the byte count; it is only trusted
    /// once this succeeds. On mismatch the sink is dropped uncommitted,
    /// discarding partial data.
    pub async fn finish(self, end: &FileNodeEndChunk) -> Result<(NodeRecord, u64)> {
        if end.file_size != self.file_size || self.received != end.file_size {
            return Err(SyncError::Integrity {
                container_id: self.container_id,
                expected: end.file_size,
                actual: self.received,
            });
        }

        let sink = self.sink.ok_or_else(|| {
            SyncError::protocol(format!(
                "End marker for container {} before it was pulled",
                self.container_id
            ))
        })?;
        sink.commit().await?;
        Ok((self.node, self.received))
    }
}
