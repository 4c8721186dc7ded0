/// Wire protocol between a chat client and the message relay
use crate::error::{ChatError, Result};
use crate::types::{Conversation, ConversationId, Message};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload accepted in a single frame (1 MiB)
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Correlates an acked request with its reply
pub type RequestId = u64;

/// Frames sent by the client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame on every connection
    Authenticate { token: String, protocol_version: u8 },

    /// Subscribe to a conversation room
    JoinConversation { conversation_id: ConversationId },

    /// Create or fetch the conversation with `counterpart_id`
    StartConversation {
        request_id: RequestId,
        counterpart_id: String,
    },

    /// Persist and broadcast a message
    SendMessage {
        request_id: RequestId,
        conversation_id: ConversationId,
        body: String,
    },

    Ping { timestamp: i64 },
}

/// Frames sent by the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Authenticated { user_id: String },

    /// Credential refused; the relay closes the connection after this
    Rejected { reason: String },

    ConversationStarted {
        request_id: RequestId,
        conversation: Conversation,
        messages: Vec<Message>,
    },

    MessageSent { request_id: RequestId, message: Message },

    RequestFailed { request_id: RequestId, error: String },

    /// Pushed to every member of the room, sender included
    NewMessage { message: Message },

    Pong { timestamp: i64 },
}

impl ClientFrame {
    pub fn frame_type(&self) -> &'static str {
        match self {
            ClientFrame::Authenticate { .. } => "authenticate",
            ClientFrame::JoinConversation { .. } => "join_conversation",
            ClientFrame::StartConversation { .. } => "start_conversation",
            ClientFrame::SendMessage { .. } => "send_message",
            ClientFrame::Ping { .. } => "ping",
        }
    }
}

impl ServerFrame {
    pub fn frame_type(&self) -> &'static str {
        match self {
            ServerFrame::Authenticated { .. } => "authenticated",
            ServerFrame::Rejected { .. } => "rejected",
            ServerFrame::ConversationStarted { .. } => "conversation_started",
            ServerFrame::MessageSent { .. } => "message_sent",
            ServerFrame::RequestFailed { .. } => "request_failed",
            ServerFrame::NewMessage { .. } => "new_message",
            ServerFrame::Pong { .. } => "pong",
        }
    }

    /// Request this frame answers, if it is an ack
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ServerFrame::ConversationStarted { request_id, .. }
            | ServerFrame::MessageSent { request_id, .. }
            | ServerFrame::RequestFailed { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}

impl fmt::Display for ClientFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientFrame({})", self.frame_type())
    }
}

impl fmt::Display for ServerFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerFrame({})", self.frame_type())
    }
}

/// Protocol frame with length prefix
#[derive(Debug)]
pub struct Frame {
    pub length: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame from a serializable value
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(ChatError::Protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                payload.len(),
                MAX_FRAME_LEN
            )));
        }
        Ok(Self {
            length: payload.len() as u32,
            payload,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ChatError::Protocol(format!("invalid frame: {}", e)))
    }

    /// Serialize frame to bytes (length prefix + payload)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.payload.len());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse frame from bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }

        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

        if data.len() < 4 + length {
            return None;
        }

        Some(Self {
            length: length as u32,
            payload: data[4..4 + length].to_vec(),
        })
    }
}

/// Read one frame. Returns `Ok(None)` when the peer closed the stream
/// between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ChatError::Io(e)),
    }

    let length = u32::from_be_bytes(len_buf) as usize;
    if length > MAX_FRAME_LEN {
        return Err(ChatError::Protocol(format!(
            "incoming frame of {} bytes exceeds limit of {}",
            length, MAX_FRAME_LEN
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    let frame = Frame {
        length: length as u32,
        payload,
    };
    frame.decode().map(Some)
}

/// Write one frame and flush it
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = Frame::encode(value)?;
    writer.write_all(&frame.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let msg = ClientFrame::Ping { timestamp: 12345 };
        let frame = Frame::encode(&msg).unwrap();
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[..4], &(frame.payload.len() as u32).to_be_bytes());
        let parsed = Frame::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.decode::<ClientFrame>().unwrap(), msg);
    }

    #[test]
    fn test_truncated_frame_is_incomplete() {
        let frame = Frame::encode(&ClientFrame::Ping { timestamp: 1 }).unwrap();
        let bytes = frame.to_bytes();
        assert!(Frame::from_bytes(&bytes[..bytes.len() - 1]).is_none());
        assert!(Frame::from_bytes(&bytes[..3]).is_none());
    }

    #[test]
    fn test_tag_names() {
        let json = serde_json::to_value(ClientFrame::StartConversation {
            request_id: 3,
            counterpart_id: "bob".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "start_conversation");
        assert_eq!(json["counterpart_id"], "bob");
    }

    #[test]
    fn test_request_id_only_on_acks() {
        let failed = ServerFrame::RequestFailed {
            request_id: 9,
            error: "nope".to_string(),
        };
        assert_eq!(failed.request_id(), Some(9));
        assert_eq!(ServerFrame::Pong { timestamp: 0 }.request_id(), None);
    }

    #[tokio::test]
    async fn test_oversized_incoming_frame_rejected() {
        let mut data = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        data.extend_from_slice(b"{}");
        let mut reader = &data[..];
        let result: Result<Option<ClientFrame>> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(ChatError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_clean_eof_reads_none() {
        let mut reader: &[u8] = &[];
        let result: Option<ServerFrame> = read_frame(&mut reader).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = ServerFrame::Authenticated {
            user_id: "alice".to_string(),
        };
        write_frame(&mut a, &sent).await.unwrap();
        let got: Option<ServerFrame> = read_frame(&mut b).await.unwrap();
        assert_eq!(got, Some(sent));
    }
}
