//! Isolation boundary wire protocol
//!
//! The supervisor and its worker process exchange length-prefixed JSON
//! frames: a 4-byte little-endian payload length followed by the payload.
//! Only plain data crosses the boundary.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single frame payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Supervisor → worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Hello {
        version: u32,
    },
    /// Load the plugin and run its `init` / `start` hooks.
    Start {
        plugin_path: String,
        type_name: Option<String>,
        port: u16,
    },
    /// Call the plugin's `stop` hook.
    Stop,
    /// Stop the plugin and exit the worker.
    Shutdown,
}

/// Worker → supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    HelloOk { version: u32, pid: u32 },
    /// `error` is `None` on success.
    Started { error: Option<String> },
    Stopped,
    Err { message: String },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("protocol version mismatch: supervisor={expected}, worker={actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(Response),
}

impl ProtocolError {
    /// The peer closed the connection.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn check_len(len_bytes: [u8; 4]) -> Result<usize, ProtocolError> {
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(len)
}

/// Write one frame to a blocking writer.
pub fn write_frame<W: std::io::Write, T: Serialize>(mut w: W, msg: &T) -> Result<(), ProtocolError> {
    w.write_all(&encode(msg)?)?;
    w.flush()?;
    Ok(())
}

/// Read one frame from a blocking reader.
pub fn read_frame<R: std::io::Read, T: DeserializeOwned>(mut r: R) -> Result<T, ProtocolError> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let mut payload = vec![0u8; check_len(len_bytes)?];
    r.read_exact(&mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Write one frame to an async writer.
pub async fn write_frame_async<W, T>(w: &mut W, msg: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    w.write_all(&encode(msg)?).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame from an async reader.
pub async fn read_frame_async<R, T>(r: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes).await?;
    let mut payload = vec![0u8; check_len(len_bytes)?];
    r.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Request::Stop).unwrap();

        let payload = br#"{"type":"stop"}"#;
        assert_eq!(&buf[..4], &(payload.len() as u32).to_le_bytes());
        assert_eq!(&buf[4..], payload);
    }

    #[test]
    fn test_start_request_carries_plain_data() {
        let mut buf = Vec::new();
        let req = Request::Start {
            plugin_path: "/srv/bin/libapp.so".to_string(),
            type_name: None,
            port: 2020,
        };
        write_frame(&mut buf, &req).unwrap();

        let decoded: Request = read_frame(Cursor::new(buf)).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_le_bytes());
        let err = read_frame::<_, Response>(Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
    }

    #[test]
    fn test_truncated_stream_is_eof() {
        let err = read_frame::<_, Response>(Cursor::new(vec![1u8, 0])).unwrap_err();
        assert!(err.is_eof());
    }

    #[tokio::test]
    async fn test_async_frames_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame_async(&mut client, &Request::Hello { version: PROTOCOL_VERSION })
            .await
            .unwrap();
        let req: Request = read_frame_async(&mut server).await.unwrap();
        assert_eq!(req, Request::Hello { version: PROTOCOL_VERSION });

        write_frame_async(
            &mut server,
            &Response::Started {
                error: Some("NoHostFound: nothing here".to_string()),
            },
        )
        .await
        .unwrap();
        let resp: Response = read_frame_async(&mut client).await.unwrap();
        assert_eq!(
            resp,
            Response::Started {
                error: Some("NoHostFound: nothing here".to_string())
            }
        );
    }
}
