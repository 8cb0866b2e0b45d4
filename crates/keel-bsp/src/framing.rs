use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

/// Upper bound for a single framed message; larger frames are rejected before allocating.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Reads one `Content-Length` framed JSON message. Returns `Ok(None)` on a clean EOF
/// between messages.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Value>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            if content_length.is_some() {
                return Err(TransportError::ConnectionClosed);
            }
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if content_length.is_some() {
                break;
            }
            // Tolerate stray blank lines between messages.
            continue;
        }

        let Some((name, value)) = trimmed.split_once(':') else {
            return Err(TransportError::InvalidHeader {
                line: trimmed.to_owned(),
            });
        };
        if name.trim().eq_ignore_ascii_case("Content-Length") {
            let len = value
                .trim()
                .parse::<usize>()
                .map_err(|_| TransportError::InvalidHeader {
                    line: trimmed.to_owned(),
                })?;
            content_length = Some(len);
        }
    }

    let len = content_length.ok_or(TransportError::MissingContentLength)?;
    if len > MAX_MESSAGE_BYTES {
        return Err(TransportError::MessageTooLarge {
            len,
            max: MAX_MESSAGE_BYTES,
        });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

pub async fn write_message<W>(writer: &mut W, message: &Value) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_vec(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", json.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}
