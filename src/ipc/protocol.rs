//! Wire protocol for the control socket.
//!
//! Every message is a 4-byte big-endian length prefix followed by that many
//! bytes of UTF-8 JSON: `{ "type": <int>, "id": <string>, "data": <object> }`.
//! Messages longer than 1 MiB terminate the connection.

use crate::defaults;
use crate::error::{Result, VoxdError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Message discriminator. The first three are client→server, the rest
/// server→client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Command = 0,
    Subscribe = 1,
    Unsubscribe = 2,
    Transcription = 3,
    Status = 4,
    Error = 5,
    Ack = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = VoxdError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Command),
            1 => Ok(Self::Subscribe),
            2 => Ok(Self::Unsubscribe),
            3 => Ok(Self::Transcription),
            4 => Ok(Self::Status),
            5 => Ok(Self::Error),
            6 => Ok(Self::Ack),
            other => Err(VoxdError::IpcProtocol {
                message: format!("unknown message type: {}", other),
            }),
        }
    }
}

/// One framed message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub data: Value,
}

impl Message {
    pub fn new(kind: MessageType, id: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind as u8,
            id: id.into(),
            data,
        }
    }

    /// Typed view of the `type` field.
    pub fn message_type(&self) -> Result<MessageType> {
        MessageType::try_from(self.kind)
    }

    /// Client→server command.
    pub fn command(id: impl Into<String>, action: &str, params: Value) -> Self {
        Self::new(
            MessageType::Command,
            id,
            json!({ "action": action, "params": params }),
        )
    }

    /// Successful command reply carrying the per-action result.
    pub fn ack(id: impl Into<String>, result: Value) -> Self {
        Self::new(
            MessageType::Ack,
            id,
            json!({ "success": true, "result": result }),
        )
    }

    /// Error reply for a failed command or protocol problem.
    pub fn error(id: impl Into<String>, message: &str) -> Self {
        Self::new(MessageType::Error, id, json!({ "message": message }))
    }

    /// Action name of a command message, if present.
    pub fn action(&self) -> Option<&str> {
        self.data.get("action").and_then(Value::as_str)
    }

    /// Params object of a command message; empty object when absent.
    pub fn params(&self) -> Value {
        self.data
            .get("params")
            .cloned()
            .unwrap_or_else(|| json!({}))
    }
}

/// Status broadcast payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusPayload {
    pub listening: bool,
    pub clients: usize,
    pub model: String,
    pub language: String,
    pub vad_enabled: bool,
    /// Seconds since the daemon started.
    pub uptime: u64,
}

/// Write one length-framed message.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() as u32 > defaults::MAX_MESSAGE_LEN {
        return Err(VoxdError::IpcProtocol {
            message: format!("outgoing message too large: {} bytes", payload.len()),
        });
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-framed message.
///
/// A length over 1 MiB or malformed JSON is an `IpcProtocol` error; the
/// caller is expected to drop the connection. EOF surfaces as an I/O error.
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncReadExt + Unpin,
{
    let length = reader.read_u32().await?;
    if length > defaults::MAX_MESSAGE_LEN {
        return Err(VoxdError::IpcProtocol {
            message: format!("message too large: {} bytes", length),
        });
    }
    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(|e| VoxdError::IpcProtocol {
        message: format!("malformed message: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let message = Message::command("q1", "get_status", json!({}));
        let mut buffer = Vec::new();
        write_message(&mut buffer, &message).await.unwrap();

        let mut cursor = std::io::Cursor::new(buffer);
        let decoded = read_message(&mut cursor).await.unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.message_type().unwrap(), MessageType::Command);
        assert_eq!(decoded.action(), Some("get_status"));
    }

    #[tokio::test]
    async fn test_frame_has_big_endian_length_prefix() {
        let message = Message::new(MessageType::Subscribe, "s1", json!({}));
        let mut buffer = Vec::new();
        write_message(&mut buffer, &message).await.unwrap();

        let expected_len = (buffer.len() - 4) as u32;
        assert_eq!(
            u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]),
            expected_len
        );
    }

    #[tokio::test]
    async fn test_wire_field_names() {
        let message = Message::ack("cmd-7", json!({ "listening": true }));
        let mut buffer = Vec::new();
        write_message(&mut buffer, &message).await.unwrap();

        let value: Value = serde_json::from_slice(&buffer[4..]).unwrap();
        assert_eq!(value["type"], 6);
        assert_eq!(value["id"], "cmd-7");
        assert_eq!(value["data"]["success"], true);
        assert_eq!(value["data"]["result"]["listening"], true);
    }

    #[tokio::test]
    async fn test_oversize_incoming_length_is_protocol_error() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(defaults::MAX_MESSAGE_LEN + 1).to_be_bytes());
        buffer.extend_from_slice(b"ignored");

        let mut cursor = std::io::Cursor::new(buffer);
        let result = read_message(&mut cursor).await;
        assert!(matches!(result, Err(VoxdError::IpcProtocol { .. })));
    }

    #[tokio::test]
    async fn test_malformed_json_is_protocol_error() {
        let payload = b"{ not json";
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buffer.extend_from_slice(payload);

        let mut cursor = std::io::Cursor::new(buffer);
        let result = read_message(&mut cursor).await;
        assert!(matches!(result, Err(VoxdError::IpcProtocol { .. })));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&100u32.to_be_bytes());
        buffer.extend_from_slice(b"short");

        let mut cursor = std::io::Cursor::new(buffer);
        let result = read_message(&mut cursor).await;
        assert!(matches!(result, Err(VoxdError::Io(_))));
    }

    #[test]
    fn test_message_type_mapping() {
        for (value, expected) in [
            (0, MessageType::Command),
            (1, MessageType::Subscribe),
            (2, MessageType::Unsubscribe),
            (3, MessageType::Transcription),
            (4, MessageType::Status),
            (5, MessageType::Error),
            (6, MessageType::Ack),
        ] {
            assert_eq!(MessageType::try_from(value).unwrap(), expected);
            assert_eq!(expected as u8, value);
        }
        assert!(MessageType::try_from(7).is_err());
    }

    #[test]
    fn test_missing_id_and_data_default() {
        let decoded: Message = serde_json::from_str(r#"{ "type": 1 }"#).unwrap();
        assert_eq!(decoded.kind, 1);
        assert_eq!(decoded.id, "");
        assert_eq!(decoded.data, Value::Null);
        assert_eq!(decoded.params(), json!({}));
    }

    #[test]
    fn test_error_message_shape() {
        let message = Message::error("x", "Unknown action: fly");
        assert_eq!(message.kind, 5);
        assert_eq!(message.data["message"], "Unknown action: fly");
    }
}
