//! Length-prefixed frame codec.
//!
//! Every message in both directions is a 4-byte big-endian length
//! followed by exactly that many bytes of UTF-8 JSON. Frames above a
//! fixed bound are rejected before the body is read so a hostile or
//! corrupted length prefix cannot balloon memory.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::SpotihifiError;

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reads one frame body.
///
/// # Errors
///
/// [`SpotihifiError::Transport`] on socket failure or EOF mid-frame;
/// [`SpotihifiError::Protocol`] when the length prefix exceeds
/// [`MAX_FRAME_LEN`] (the stream is desynchronized after that, so the
/// caller should disconnect).
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, SpotihifiError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(SpotihifiError::Protocol(format!(
            "frame length {len} exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Writes one frame.
///
/// # Errors
///
/// [`SpotihifiError::Transport`] on socket failure;
/// [`SpotihifiError::Protocol`] when the body exceeds [`MAX_FRAME_LEN`].
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), SpotihifiError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_LEN {
        return Err(SpotihifiError::Protocol(format!(
            "outbound frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
            body.len()
        )));
    }

    let header = (body.len() as u32).to_be_bytes();
    writer.write_all(&header).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}
