//! Length-prefixed message frames over QUIC streams.
//!
//! Each frame is a u32-le length followed by a postcard-encoded
//! [`Message`]. A clean end-of-stream between frames reads as `None`.

use anyhow::Result;
use iroh::endpoint::{RecvStream, SendStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::protocol::Message;

/// Frames larger than this are rejected before allocation.
pub(crate) const MAX_FRAME_LEN: usize = 1024 * 1024;

pub async fn write_frame(stream: &mut SendStream, data: &[u8]) -> Result<()> {
    let len = data.len() as u32;
    stream.write_u32_le(len).await?;
    stream.write_all(data).await?;
    Ok(())
}

pub async fn read_frame(stream: &mut RecvStream) -> Result<Option<Vec<u8>>> {
    let len = match stream.read_u32_le().await {
        Ok(v) => v as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame of {len} bytes exceeds limit");
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Encode and send one message. A serialization failure is reported as
/// [`MessageSerialize`](crate::DhtError::MessageSerialize) so the caller can
/// tear the session down.
pub async fn write_message(stream: &mut SendStream, msg: &Message) -> Result<()> {
    let bytes = msg.encode()?;
    write_frame(stream, &bytes).await
}

/// Read and decode the next message, or `None` on a clean end-of-stream.
/// Malformed frames surface as
/// [`MessageDeserialize`](crate::DhtError::MessageDeserialize).
pub async fn read_message(stream: &mut RecvStream) -> Result<Option<Message>> {
    match read_frame(stream).await? {
        Some(bytes) => Ok(Some(Message::decode(&bytes)?)),
        None => Ok(None),
    }
}
