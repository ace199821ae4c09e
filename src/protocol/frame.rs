//! Frame reading/writing.

use super::message::{Message, MessageType};
use crate::error::{Result, SyncError};
use bytes::Bytes;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Read a single frame from the stream.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly at a frame
/// boundary. A stream that ends inside a frame is a transport error.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<(MessageType, Bytes)>> {
    let len = match r.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(SyncError::transport(e)),
    };

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        return Err(SyncError::protocol(format!(
            "Frame size {} exceeds maximum allowed size {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let tag = r.read_u8().await.map_err(SyncError::transport)?;
    let msg_type = MessageType::from_u8(tag)
        .ok_or_else(|| SyncError::protocol(format!("Unknown message type 0x{:02x}", tag)))?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .map_err(SyncError::transport)?;

    Ok(Some((msg_type, Bytes::from(payload))))
}

/// Read and decode the next message, `None` on clean EOF.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Message>> {
    match read_frame(r).await? {
        Some((msg_type, payload)) => Message::decode(msg_type, payload).map(Some),
        None => Ok(None),
    }
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.map_err(SyncError::transport)?;
    w.flush().await.map_err(SyncError::transport)?;
    Ok(())
}
