//! Length-prefixed frame encoding and decoding.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Message, ProtocolError, MAX_MESSAGE_SIZE};

/// Write one frame: `u32` big-endian length (code plus body), the code byte,
/// then the body.
pub async fn write_frame<W>(writer: &mut W, msg: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame_len = msg.frame_len();
    if frame_len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: frame_len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    writer.write_all(&(frame_len as u32).to_be_bytes()).await?;
    writer.write_all(&[msg.code]).await?;
    writer.write_all(&msg.body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean EOF at a frame boundary;
/// EOF inside a frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Message>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_bytes = [0u8; 4];
    // A zero-byte read here is the only clean close; once any of the length
    // prefix has arrived, EOF is mid-frame and must surface as an error.
    if reader.read(&mut len_bytes[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_bytes[1..]).await?;
    let frame_len = u32::from_be_bytes(len_bytes) as usize;
    if frame_len < 1 {
        return Err(ProtocolError::InvalidMessage(
            "frame too short for a message code".to_string(),
        ));
    }
    if frame_len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: frame_len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut code = [0u8; 1];
    reader.read_exact(&mut code).await?;
    let mut body = vec![0u8; frame_len - 1];
    reader.read_exact(&mut body).await?;
    Ok(Some(Message {
        code: code[0],
        body: Bytes::from(body),
    }))
}
