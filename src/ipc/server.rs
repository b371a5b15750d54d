//! Unix-socket IPC server and broadcast hub.
//!
//! One task per connection reads length-framed commands and writes replies;
//! a per-connection forwarder task drains the broadcast channel toward the
//! client. All writes to one connection go through a shared mutex, so a
//! client observes events in broadcast order. Errors on one connection
//! never affect another.

use crate::error::{Result, VoxdError};
use crate::ipc::protocol::{Message, MessageType, StatusPayload, read_message, write_message};
use crate::stt::transcriber::TranscriptionResult;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

/// Handler for client commands. Implemented by the daemon.
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync {
    /// Execute `action` and return the per-action result object.
    ///
    /// An `Err` becomes an Error message to the originating client only.
    async fn handle(&self, action: &str, params: &Value) -> Result<Value>;
}

/// Events fanned out to connected clients.
#[derive(Debug, Clone)]
pub enum BroadcastEvent {
    /// Sent to subscribed clients only.
    Transcription(Arc<Value>),
    /// Sent to every connection.
    Status(Arc<Value>),
}

/// Per-connection record owned by the hub.
struct ClientRecord {
    subscribed: Arc<AtomicBool>,
}

/// IPC server for the control socket.
pub struct IpcServer {
    socket_path: PathBuf,
    event_tx: broadcast::Sender<BroadcastEvent>,
    clients: Arc<Mutex<HashMap<u64, ClientRecord>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    next_client_id: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl IpcServer {
    /// Create a server bound later (at `run`) to `socket_path`.
    pub fn new(socket_path: PathBuf) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            socket_path,
            event_tx,
            clients: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
            next_client_id: AtomicU64::new(1),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Broadcast a transcription to subscribed clients.
    pub fn broadcast_transcription(&self, result: &TranscriptionResult) {
        if let Ok(value) = serde_json::to_value(result) {
            // No receivers is fine; nobody is connected.
            let _ = self
                .event_tx
                .send(BroadcastEvent::Transcription(Arc::new(value)));
        }
    }

    /// Broadcast a status update to every connection.
    pub fn broadcast_status(&self, status: &StatusPayload) {
        if let Ok(value) = serde_json::to_value(status) {
            let _ = self.event_tx.send(BroadcastEvent::Status(Arc::new(value)));
        }
    }

    /// Bind the socket and serve until [`IpcServer::stop`].
    ///
    /// The socket file is unlinked before bind; a bind failure is fatal to
    /// startup and surfaces to the caller.
    pub async fn run<H>(&self, handler: Arc<H>) -> Result<()>
    where
        H: CommandHandler + 'static,
    {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| VoxdError::IpcSocket {
                message: format!("failed to remove existing socket: {}", e),
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| VoxdError::IpcSocket {
            message: format!("failed to bind {}: {}", self.socket_path.display(), e),
        })?;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            // Accept with a timeout so shutdown is observed promptly.
            let accepted = tokio::time::timeout(
                tokio::time::Duration::from_millis(100),
                listener.accept(),
            )
            .await;

            match accepted {
                Ok(Ok((stream, _))) => self.accept_client(stream, Arc::clone(&handler)),
                Ok(Err(e)) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    eprintln!("voxd: accept failed: {}", e);
                }
                Err(_) => continue, // timeout; re-check shutdown flag
            }
        }

        Ok(())
    }

    fn accept_client<H>(&self, stream: UnixStream, handler: Arc<H>)
    where
        H: CommandHandler + 'static,
    {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        // New connections receive transcriptions by default.
        let subscribed = Arc::new(AtomicBool::new(true));

        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(
                id,
                ClientRecord {
                    subscribed: Arc::clone(&subscribed),
                },
            );
        }

        let events = self.event_tx.subscribe();
        let clients = Arc::clone(&self.clients);
        let task = tokio::spawn(async move {
            handle_client(stream, handler, events, Arc::clone(&subscribed)).await;
            if let Ok(mut clients) = clients.lock() {
                clients.remove(&id);
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
    }

    /// Stop accepting, drop every connection, and unlink the socket.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);

        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if let Ok(mut clients) = self.clients.lock() {
            clients.clear();
        }
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

/// Serve one connection until EOF, protocol violation, or send failure.
async fn handle_client<H>(
    stream: UnixStream,
    handler: Arc<H>,
    events: broadcast::Receiver<BroadcastEvent>,
    subscribed: Arc<AtomicBool>,
) where
    H: CommandHandler,
{
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));

    // Forwarder: broadcast channel → this client's socket. Exits on send
    // failure, which also tears down the read loop below.
    let mut forwarder = tokio::spawn(forward_events(
        events,
        Arc::clone(&writer),
        Arc::clone(&subscribed),
    ));

    let read_loop = async {
        loop {
            let message = match read_message(&mut reader).await {
                Ok(message) => message,
                // EOF, oversized frame, malformed JSON: close the connection.
                Err(_) => break,
            };
            if dispatch_message(&message, &handler, &writer, &subscribed)
                .await
                .is_err()
            {
                break;
            }
        }
    };

    tokio::select! {
        _ = &mut forwarder => {}
        _ = read_loop => {}
    }
    forwarder.abort();
}

/// Handle one client→server message and write the reply.
async fn dispatch_message<H>(
    message: &Message,
    handler: &Arc<H>,
    writer: &Arc<tokio::sync::Mutex<tokio::net::unix::OwnedWriteHalf>>,
    subscribed: &Arc<AtomicBool>,
) -> Result<()>
where
    H: CommandHandler,
{
    let reply = match message.message_type() {
        Ok(MessageType::Command) => {
            let action = message.action().unwrap_or("").to_string();
            let params = message.params();
            match handler.handle(&action, &params).await {
                Ok(result) => Message::ack(&message.id, result),
                Err(e) => Message::error(&message.id, &e.to_string()),
            }
        }
        Ok(MessageType::Subscribe) => {
            subscribed.store(true, Ordering::SeqCst);
            Message::ack(&message.id, json!({ "subscribed": true }))
        }
        Ok(MessageType::Unsubscribe) => {
            subscribed.store(false, Ordering::SeqCst);
            Message::ack(&message.id, json!({ "subscribed": false }))
        }
        // Server→client types coming from a client are ignored.
        Ok(_) => return Ok(()),
        Err(e) => Message::error(&message.id, &e.to_string()),
    };

    let mut writer = writer.lock().await;
    write_message(&mut *writer, &reply).await
}

async fn forward_events(
    mut events: broadcast::Receiver<BroadcastEvent>,
    writer: Arc<tokio::sync::Mutex<tokio::net::unix::OwnedWriteHalf>>,
    subscribed: Arc<AtomicBool>,
) {
    loop {
        let (kind, data) = match events.recv().await {
            Ok(BroadcastEvent::Transcription(data)) => {
                if !subscribed.load(Ordering::SeqCst) {
                    continue;
                }
                (MessageType::Transcription, data)
            }
            Ok(BroadcastEvent::Status(data)) => (MessageType::Status, data),
            // This client fell behind; skip what was lost and keep going.
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let message = Message::new(kind, event_id(), (*data).clone());
        let mut writer = writer.lock().await;
        if write_message(&mut *writer, &message).await.is_err() {
            // Send failure marks this subscriber for reaping.
            break;
        }
    }
}

/// Event ids are nanosecond timestamps, unique enough per connection.
fn event_id() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio::time::{Duration, sleep, timeout};

    struct MockHandler;

    #[async_trait::async_trait]
    impl CommandHandler for MockHandler {
        async fn handle(&self, action: &str, params: &Value) -> Result<Value> {
            match action {
                "get_status" => Ok(json!({ "listening": true })),
                "echo" => Ok(params.clone()),
                other => Err(VoxdError::Other(format!("Unknown action: {}", other))),
            }
        }
    }

    async fn start_server(dir: &TempDir) -> (Arc<IpcServer>, PathBuf) {
        let socket_path = dir.path().join("voxd-test.sock");
        let server = Arc::new(IpcServer::new(socket_path.clone()));
        let run_server = Arc::clone(&server);
        tokio::spawn(async move { run_server.run(Arc::new(MockHandler)).await });

        // Wait for the socket to appear.
        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        (server, socket_path)
    }

    async fn connect(path: &Path) -> UnixStream {
        UnixStream::connect(path).await.expect("connect failed")
    }

    async fn send(stream: &mut UnixStream, message: &Message) {
        write_message(stream, message).await.expect("send failed");
    }

    async fn recv(stream: &mut UnixStream) -> Message {
        timeout(Duration::from_secs(2), read_message(stream))
            .await
            .expect("timed out waiting for message")
            .expect("read failed")
    }

    fn sample_result(text: &str) -> TranscriptionResult {
        TranscriptionResult {
            text: text.to_string(),
            confidence: 0.9,
            language: "en".to_string(),
            processing_time_ms: 10,
            audio_duration_ms: 1200,
            is_final: true,
            segments: vec![],
        }
    }

    #[tokio::test]
    async fn test_command_round_trip_matches_id() {
        let dir = TempDir::new().unwrap();
        let (server, path) = start_server(&dir).await;

        let mut client = connect(&path).await;
        send(&mut client, &Message::command("q1", "get_status", json!({}))).await;

        let reply = recv(&mut client).await;
        assert_eq!(reply.message_type().unwrap(), MessageType::Ack);
        assert_eq!(reply.id, "q1");
        assert_eq!(reply.data["success"], true);
        assert_eq!(reply.data["result"]["listening"], true);

        server.stop();
    }

    #[tokio::test]
    async fn test_unknown_action_returns_error_with_id() {
        let dir = TempDir::new().unwrap();
        let (server, path) = start_server(&dir).await;

        let mut client = connect(&path).await;
        send(&mut client, &Message::command("q2", "fly", json!({}))).await;

        let reply = recv(&mut client).await;
        assert_eq!(reply.message_type().unwrap(), MessageType::Error);
        assert_eq!(reply.id, "q2");
        assert_eq!(reply.data["message"], "Unknown action: fly");

        server.stop();
    }

    #[tokio::test]
    async fn test_new_connection_receives_transcriptions_by_default() {
        let dir = TempDir::new().unwrap();
        let (server, path) = start_server(&dir).await;

        let mut client = connect(&path).await;
        sleep(Duration::from_millis(50)).await;
        server.broadcast_transcription(&sample_result("hello"));

        let event = recv(&mut client).await;
        assert_eq!(event.message_type().unwrap(), MessageType::Transcription);
        assert_eq!(event.data["text"], "hello");
        assert_eq!(event.data["is_final"], true);

        server.stop();
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let (server, path) = start_server(&dir).await;

        let mut client = connect(&path).await;
        for _ in 0..2 {
            send(&mut client, &Message::new(MessageType::Subscribe, "s", json!({}))).await;
            let ack = recv(&mut client).await;
            assert_eq!(ack.data["result"]["subscribed"], true);
        }

        for _ in 0..2 {
            send(
                &mut client,
                &Message::new(MessageType::Unsubscribe, "u", json!({})),
            )
            .await;
            let ack = recv(&mut client).await;
            assert_eq!(ack.data["result"]["subscribed"], false);
        }

        // Unsubscribed: a transcription must not arrive.
        server.broadcast_transcription(&sample_result("ignored"));
        let nothing = timeout(Duration::from_millis(200), read_message(&mut client)).await;
        assert!(nothing.is_err(), "unsubscribed client received an event");

        server.stop();
    }

    #[tokio::test]
    async fn test_fan_out_reaches_only_subscribed_clients() {
        let dir = TempDir::new().unwrap();
        let (server, path) = start_server(&dir).await;

        let mut subscribed_a = connect(&path).await;
        let mut subscribed_b = connect(&path).await;
        let mut unsubscribed = connect(&path).await;

        send(
            &mut unsubscribed,
            &Message::new(MessageType::Unsubscribe, "u1", json!({})),
        )
        .await;
        let _ = recv(&mut unsubscribed).await;

        server.broadcast_transcription(&sample_result("to the subscribed"));

        for client in [&mut subscribed_a, &mut subscribed_b] {
            let event = recv(client).await;
            assert_eq!(event.message_type().unwrap(), MessageType::Transcription);
            assert_eq!(event.data["text"], "to the subscribed");
        }
        let nothing = timeout(Duration::from_millis(200), read_message(&mut unsubscribed)).await;
        assert!(nothing.is_err());

        server.stop();
    }

    #[tokio::test]
    async fn test_events_arrive_in_broadcast_order() {
        let dir = TempDir::new().unwrap();
        let (server, path) = start_server(&dir).await;

        let mut client = connect(&path).await;
        sleep(Duration::from_millis(50)).await;
        for i in 0..5 {
            server.broadcast_transcription(&sample_result(&format!("event-{}", i)));
        }

        for i in 0..5 {
            let event = recv(&mut client).await;
            assert_eq!(event.data["text"], format!("event-{}", i));
        }

        server.stop();
    }

    #[tokio::test]
    async fn test_dead_client_is_reaped_without_disturbing_survivor() {
        let dir = TempDir::new().unwrap();
        let (server, path) = start_server(&dir).await;

        let mut survivor = connect(&path).await;
        let doomed = connect(&path).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(server.client_count(), 2);

        drop(doomed);
        for i in 0..5 {
            server.broadcast_transcription(&sample_result(&format!("n-{}", i)));
            // Give the forwarders a moment between sends so the dead
            // socket's write failure surfaces.
            sleep(Duration::from_millis(10)).await;
        }

        for i in 0..5 {
            let event = recv(&mut survivor).await;
            assert_eq!(event.data["text"], format!("n-{}", i));
        }

        // The dead connection is eventually removed from the registry.
        for _ in 0..100 {
            if server.client_count() == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.client_count(), 1);

        server.stop();
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let dir = TempDir::new().unwrap();
        let (server, path) = start_server(&dir).await;

        let mut client = connect(&path).await;
        sleep(Duration::from_millis(50)).await;

        // Announce a 2 MiB frame; the server must hang up.
        client
            .write_all(&(2 * 1024 * 1024_u32).to_be_bytes())
            .await
            .unwrap();

        let closed = timeout(Duration::from_secs(2), read_message(&mut client)).await;
        match closed {
            Ok(Err(_)) => {}
            Ok(Ok(m)) => panic!("expected close, got {:?}", m),
            Err(_) => panic!("server did not close the connection"),
        }

        server.stop();
    }

    #[tokio::test]
    async fn test_malformed_json_closes_connection() {
        let dir = TempDir::new().unwrap();
        let (server, path) = start_server(&dir).await;

        let mut client = connect(&path).await;
        let garbage = b"{ definitely not json";
        client
            .write_all(&(garbage.len() as u32).to_be_bytes())
            .await
            .unwrap();
        client.write_all(garbage).await.unwrap();

        let closed = timeout(Duration::from_secs(2), read_message(&mut client)).await;
        assert!(matches!(closed, Ok(Err(_))), "connection should close");

        server.stop();
    }

    #[tokio::test]
    async fn test_stop_unlinks_socket() {
        let dir = TempDir::new().unwrap();
        let (server, path) = start_server(&dir).await;
        assert!(path.exists());
        server.stop();
        sleep(Duration::from_millis(200)).await;
        assert!(!path.exists());
    }
}
