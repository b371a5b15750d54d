//! IPC client for talking to a running daemon.
//!
//! Used by `voxctl` and by integration tests. One connection carries both
//! command round-trips and the event stream; replies are matched to
//! commands by message id.

use crate::error::{Result, VoxdError};
use crate::ipc::protocol::{Message, MessageType, read_message, write_message};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UnixStream;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Connection to the daemon's control socket.
pub struct DaemonClient {
    stream: UnixStream,
}

impl DaemonClient {
    /// Connect to the daemon at `socket_path`.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| VoxdError::IpcConnection {
                message: format!(
                    "failed to connect to {}: {} (is the daemon running?)",
                    socket_path.display(),
                    e
                ),
            })?;
        Ok(Self { stream })
    }

    /// Send a command and wait for its Ack or Error.
    ///
    /// Broadcast events that arrive while waiting are discarded; use
    /// [`DaemonClient::next_event`] for streaming.
    pub async fn command(&mut self, action: &str, params: Value) -> Result<Value> {
        let id = format!(
            "{}-{}",
            std::process::id(),
            NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed)
        );
        write_message(&mut self.stream, &Message::command(&id, action, params)).await?;

        loop {
            let message = read_message(&mut self.stream).await?;
            match message.message_type() {
                Ok(MessageType::Ack) if message.id == id => {
                    return Ok(message
                        .data
                        .get("result")
                        .cloned()
                        .unwrap_or(Value::Null));
                }
                Ok(MessageType::Error) if message.id == id => {
                    let reason = message
                        .data
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error");
                    return Err(VoxdError::IpcProtocol {
                        message: reason.to_string(),
                    });
                }
                // Unrelated traffic (events, stale replies): skip.
                _ => continue,
            }
        }
    }

    /// Opt in to transcription events.
    pub async fn subscribe(&mut self) -> Result<()> {
        self.toggle_subscription(MessageType::Subscribe).await
    }

    /// Opt out of transcription events.
    pub async fn unsubscribe(&mut self) -> Result<()> {
        self.toggle_subscription(MessageType::Unsubscribe).await
    }

    async fn toggle_subscription(&mut self, kind: MessageType) -> Result<()> {
        let id = format!(
            "{}-{}",
            std::process::id(),
            NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed)
        );
        write_message(&mut self.stream, &Message::new(kind, &id, Value::Null)).await?;
        loop {
            let message = read_message(&mut self.stream).await?;
            if message.id == id {
                return Ok(());
            }
        }
    }

    /// Wait for the next server message (transcription, status, ...).
    pub async fn next_event(&mut self) -> Result<Message> {
        read_message(&mut self.stream).await
    }
}
