//! Wire frames for the networked transport
//!
//! Requests and responses are bincode payloads behind a 4-byte big-endian
//! length prefix. Every request carries a fresh random correlation id; the
//! matching response must echo it, which lets the caller reject spoofed or
//! crossed replies. Error responses carry a fresh random id instead.

use crate::contact::ContactRecord;
use crate::error::{Error, Result};
use crate::id::NodeId;
use crate::protocol::ProtocolDescriptor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; anything larger is malformed
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// One RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub sender_id: NodeId,
    pub sender_descriptor: ProtocolDescriptor,
    pub random_id: NodeId,
    pub op: RpcOp,
}

/// Operation-specific request fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcOp {
    Ping,
    Store {
        key: NodeId,
        value: Vec<u8>,
        is_cached: bool,
        expiration_secs: u64,
    },
    FindNode {
        key: NodeId,
    },
    FindValue {
        key: NodeId,
    },
}

/// One RPC response, always carrying the correlation id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub random_id: NodeId,
    pub payload: RpcPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcPayload {
    Pong,
    Stored,
    Contacts(Vec<ContactRecord>),
    Value(Vec<u8>),
    Error(String),
}

/// Write one length-prefixed frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::Malformed(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed the
/// connection cleanly at a frame boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Malformed(format!("frame of {len} bytes exceeds limit")));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let message =
        bincode::deserialize(&body).map_err(|e| Error::Malformed(format!("bad frame: {e}")))?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let request = RpcRequest {
            sender_id: NodeId::from_u64(1),
            sender_descriptor: ProtocolDescriptor::Tcp {
                addr: "127.0.0.1:7001".parse().unwrap(),
            },
            random_id: NodeId::from_u64(99),
            op: RpcOp::FindNode {
                key: NodeId::mid(),
            },
        };

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &request).await.unwrap();

        let mut cursor = std::io::Cursor::new(buffer);
        let decoded: RpcRequest = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded.sender_id, request.sender_id);
        assert_eq!(decoded.random_id, request.random_id);
        assert!(matches!(decoded.op, RpcOp::FindNode { key } if key == NodeId::mid()));

        // nothing further: clean EOF
        let next: Option<RpcRequest> = read_frame(&mut cursor).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buffer);
        let result: Result<Option<RpcResponse>> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(Error::Malformed(_))));
    }
}
