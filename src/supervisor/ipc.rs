//! Length-delimited JSON framing for the parent↔child control channel,
//! carried over the child's stdin/stdout pipes.
//!
//! Wire format: `[u32 LE length][JSON payload]`, the same shape as the
//! Unix-socket framing used elsewhere in the broader codebase, minus the
//! binary PTY frame types this channel has no use for.

use anyhow::{bail, Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected rather than read into memory.
const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Serialize `message` and write it as one length-prefixed frame.
pub async fn write_message<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    message: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(message).context("serialize ipc message")?;
    let len = u32::try_from(payload.len()).context("ipc message too large")?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame and deserialize it.
///
/// Returns `Ok(None)` on a clean EOF before any bytes of a new frame
/// arrive (the other end closed the pipe).
pub async fn read_message<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        bail!("ipc frame of {len} bytes exceeds max {MAX_FRAME_SIZE}");
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    let message = serde_json::from_slice(&payload).context("deserialize ipc message")?;
    Ok(Some(message))
}
