use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{ClientMessage, ServerMessage};
use crate::session::{RelayFrame, SessionEntry, SessionRegistry};
use crate::storage::StorageClient;

type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Connection lifecycle: Connected(unjoined) → Joined → Disconnected.
/// "Not yet joined" is a distinct state, not a pair of empty fields.
enum ConnState {
    Connected,
    Joined {
        user_id: String,
        session: Arc<SessionEntry>,
    },
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<SessionRegistry>>,
) -> Response {
    info!("New WebSocket connection attempt");
    ws.on_upgrade(move |socket| handle_socket(socket, registry))
}

/// Per-socket message loop. A single connection's messages are processed in
/// receipt order; work for different connections interleaves at await
/// points.
async fn handle_socket(socket: WebSocket, registry: Arc<SessionRegistry>) {
    let connection_id = Uuid::new_v4().to_string();
    info!("WebSocket connection established: {}", connection_id);

    let (sender, mut receiver) = socket.split();
    // The relay task and the dispatch loop both write to the socket.
    let sender: WsSender = Arc::new(Mutex::new(sender));

    let mut state = ConnState::Connected;
    let mut relay_task: Option<JoinHandle<()>> = None;
    // Diagnostic liveness flag; membership is driven by transport close only.
    let mut last_seen = tokio::time::Instant::now();

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let message: ClientMessage = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed message on connection {}: {}", connection_id, e);
                send_error(&sender, format!("malformed message: {}", e)).await;
                continue;
            }
        };

        match message {
            ClientMessage::Ping => {
                last_seen = tokio::time::Instant::now();
                debug!("Ping on connection {} (last seen reset)", connection_id);
                send(
                    &sender,
                    &ServerMessage::Pong {
                        date: Utc::now().to_rfc3339(),
                    },
                )
                .await;
            }
            ClientMessage::Join {
                session_id,
                user_id,
            } => {
                if matches!(state, ConnState::Joined { .. }) {
                    send_error(&sender, "already joined a session").await;
                    continue;
                }
                if let Some((user_id, session, task)) =
                    handle_join(&registry, &connection_id, &sender, session_id, user_id).await
                {
                    relay_task = Some(task);
                    state = ConnState::Joined { user_id, session };
                }
            }
            session_message => {
                let ConnState::Joined { user_id, session } = &state else {
                    send_error(&sender, "must join a session first").await;
                    continue;
                };
                handle_session_message(
                    session_message,
                    user_id,
                    session,
                    &connection_id,
                    &sender,
                    registry.storage(),
                )
                .await;
            }
        }
    }

    // Socket closed or errored. In-flight work above has already completed;
    // only membership bookkeeping remains.
    if let Some(task) = relay_task {
        task.abort();
    }
    if let ConnState::Joined { user_id, session } = state {
        let now_empty = {
            let mut clients = session.clients.write().await;
            clients.remove(&connection_id);
            clients.is_empty()
        };
        broadcast_to_session(
            &session,
            &connection_id,
            &ServerMessage::UserLeft {
                user_id: user_id.clone(),
            },
        );
        info!(
            "User {} left session {} (connection {}, last seen {:?} ago)",
            user_id,
            session.id,
            connection_id,
            last_seen.elapsed()
        );
        if now_empty {
            registry.schedule_cleanup(session.id.clone());
        }
    }
    info!("WebSocket connection terminated: {}", connection_id);
}

/// Join handshake: bootstrap or look up the session, register the
/// connection, start relaying peer frames, acknowledge, announce.
async fn handle_join(
    registry: &Arc<SessionRegistry>,
    connection_id: &str,
    sender: &WsSender,
    session_id: Option<String>,
    user_id: Option<String>,
) -> Option<(String, Arc<SessionEntry>, JoinHandle<()>)> {
    let (Some(session_id), Some(user_id)) = (session_id, user_id) else {
        send_error(sender, "join requires sessionId and userId").await;
        return None;
    };

    let session = match registry.get_or_bootstrap(&session_id).await {
        Ok(session) => session,
        Err(e) => {
            error!("Join of session {} failed: {}", session_id, e);
            send_error(sender, format!("join failed: {}", e)).await;
            return None;
        }
    };

    session
        .clients
        .write()
        .await
        .insert(connection_id.to_string(), user_id.clone());

    let relay_task = spawn_relay(
        session.relay.subscribe(),
        connection_id.to_string(),
        sender.clone(),
    );

    send(
        sender,
        &ServerMessage::Joined {
            session_id: session_id.clone(),
            user_id: user_id.clone(),
            restored: session.restored,
        },
    )
    .await;
    broadcast_to_session(
        &session,
        connection_id,
        &ServerMessage::UserJoined {
            user_id: user_id.clone(),
        },
    );
    info!(
        "User {} joined session {} on connection {}",
        user_id, session_id, connection_id
    );
    Some((user_id, session, relay_task))
}

/// Dispatch for messages that require the Joined state.
async fn handle_session_message(
    message: ClientMessage,
    user_id: &str,
    session: &Arc<SessionEntry>,
    connection_id: &str,
    sender: &WsSender,
    storage: &Arc<StorageClient>,
) {
    match message {
        ClientMessage::FileOperation { data } => {
            let result = {
                let mut collab = session.collab.lock().await;
                collab.apply_file_operation(user_id, &data).await
            };
            match result {
                Ok(()) => {
                    broadcast_to_session(
                        session,
                        connection_id,
                        &ServerMessage::FileOperation {
                            user_id: user_id.to_string(),
                            timestamp: Utc::now(),
                            data,
                        },
                    );
                    session.autocommit.schedule_commit(user_id);
                    send(sender, &ServerMessage::FileOperationSuccess).await;
                }
                Err(e) => {
                    warn!(
                        "File operation by {} in session {} failed: {}",
                        user_id, session.id, e
                    );
                    send_error(sender, e.to_string()).await;
                }
            }
        }
        ClientMessage::DocUpdate { data } => {
            let result = {
                let mut collab = session.collab.lock().await;
                collab.merge_document_update(&data.doc_id, &data.delta)
            };
            match result {
                Ok(()) => {
                    broadcast_to_session(
                        session,
                        connection_id,
                        &ServerMessage::DocUpdate {
                            user_id: user_id.to_string(),
                            data,
                        },
                    );
                    session.autocommit.schedule_commit(user_id);
                }
                Err(e) => {
                    warn!(
                        "Document update by {} in session {} failed: {}",
                        user_id, session.id, e
                    );
                    send_error(sender, e.to_string()).await;
                }
            }
        }
        ClientMessage::GetFiles => match storage.list_files(&session.id).await {
            Ok(files) => send(sender, &ServerMessage::Files { data: files }).await,
            Err(e) => send_error(sender, e.to_string()).await,
        },
        ClientMessage::GetFile { data } => {
            match storage.read_file(&session.id, &data.path).await {
                Ok(content) => {
                    send(
                        sender,
                        &ServerMessage::FileContent {
                            data: crate::models::FileContent {
                                path: data.path,
                                content,
                            },
                        },
                    )
                    .await
                }
                Err(e) => send_error(sender, e.to_string()).await,
            }
        }
        // Handled before dispatch.
        ClientMessage::Join { .. } | ClientMessage::Ping => {}
    }
}

/// Forward session relay frames to this socket, skipping its own frames.
fn spawn_relay(
    mut rx: broadcast::Receiver<RelayFrame>,
    connection_id: String,
    sender: WsSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if frame.sender_id == connection_id {
                        continue;
                    }
                    if sender
                        .lock()
                        .await
                        .send(Message::Text(frame.payload))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Connection {} lagged behind, {} relay frames dropped",
                        connection_id, skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn broadcast_to_session(session: &SessionEntry, sender_id: &str, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(payload) => {
            // No receivers just means no peers are connected.
            let _ = session.relay.send(RelayFrame {
                sender_id: sender_id.to_string(),
                payload,
            });
        }
        Err(e) => error!("Failed to serialize broadcast for {}: {}", session.id, e),
    }
}

async fn send(sender: &WsSender, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(text) => {
            if sender.lock().await.send(Message::Text(text)).await.is_err() {
                debug!("Failed to send reply, connection is gone");
            }
        }
        Err(e) => error!("Failed to serialize reply: {}", e),
    }
}

async fn send_error(sender: &WsSender, error: impl Into<String>) {
    send(
        sender,
        &ServerMessage::Error {
            error: error.into(),
        },
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocUpdate, FileOperation};
    use crate::routes::create_routes;
    use crate::session::registry::RegistrySettings;
    use crate::storage::StorageClient;
    use loro::{LoroDoc, ToJson};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    type Client =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    struct TestServer {
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        _root: TempDir,
    }

    async fn start_server() -> TestServer {
        let root = TempDir::new().unwrap();
        let storage = Arc::new(StorageClient::local_only(root.path()));
        let registry = Arc::new(SessionRegistry::new(
            storage,
            RegistrySettings {
                grace_period: Duration::from_millis(100),
                idle_cooldown: Duration::from_secs(300),
                sweep_interval: Duration::from_secs(3600),
                autocommit_debounce: Duration::from_millis(50),
            },
        ));
        let app = create_routes(registry.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        TestServer {
            addr,
            registry,
            _root: root,
        }
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
        ws
    }

    async fn send_json(ws: &mut Client, value: Value) {
        ws.send(WsMessage::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    async fn recv_json(ws: &mut Client) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a message")
                .expect("stream ended")
                .unwrap();
            if let WsMessage::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn join(ws: &mut Client, session_id: &str, user_id: &str) {
        send_json(
            ws,
            json!({"type": "join", "sessionId": session_id, "userId": user_id}),
        )
        .await;
        let reply = recv_json(ws).await;
        assert_eq!(reply["type"], "joined");
        assert_eq!(reply["sessionId"], session_id);
        assert_eq!(reply["userId"], user_id);
    }

    #[tokio::test]
    async fn join_creates_an_empty_workspace() {
        let server = start_server().await;
        let mut ws = connect(server.addr).await;

        send_json(&mut ws, json!({"type": "join", "sessionId": "s1", "userId": "u1"})).await;
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["type"], "joined");
        assert_eq!(reply["restored"], false);

        assert!(server.registry.storage().workspace_dir("s1").is_dir());
        send_json(&mut ws, json!({"type": "getFiles"})).await;
        let files = recv_json(&mut ws).await;
        assert_eq!(files["type"], "files");
        assert_eq!(files["data"], json!([]));
    }

    #[tokio::test]
    async fn join_with_missing_ids_is_rejected_without_closing() {
        let server = start_server().await;
        let mut ws = connect(server.addr).await;

        send_json(&mut ws, json!({"type": "join", "sessionId": "s1"})).await;
        assert_eq!(recv_json(&mut ws).await["type"], "error");

        // Still Connected: a complete join succeeds on the same socket.
        join(&mut ws, "s1", "u1").await;
    }

    #[tokio::test]
    async fn session_messages_require_join() {
        let server = start_server().await;
        let mut ws = connect(server.addr).await;

        send_json(&mut ws, json!({"type": "getFiles"})).await;
        assert_eq!(recv_json(&mut ws).await["type"], "error");

        send_json(&mut ws, json!({"type": "ping"})).await;
        assert_eq!(recv_json(&mut ws).await["type"], "pong");
    }

    #[tokio::test]
    async fn malformed_messages_get_an_error_reply() {
        let server = start_server().await;
        let mut ws = connect(server.addr).await;

        ws.send(WsMessage::Text("not json at all".into())).await.unwrap();
        assert_eq!(recv_json(&mut ws).await["type"], "error");

        send_json(&mut ws, json!({"type": "ping"})).await;
        assert_eq!(recv_json(&mut ws).await["type"], "pong");
    }

    #[tokio::test]
    async fn file_operations_relay_to_peers_but_not_the_sender() {
        let server = start_server().await;
        let mut alice = connect(server.addr).await;
        let mut bob = connect(server.addr).await;
        join(&mut alice, "s1", "u1").await;
        join(&mut bob, "s1", "u2").await;
        // Alice sees Bob arrive, so his relay subscription is live.
        let announced = recv_json(&mut alice).await;
        assert_eq!(announced["type"], "userJoined");
        assert_eq!(announced["userId"], "u2");

        send_json(
            &mut alice,
            serde_json::to_value(&ClientMessage::FileOperation {
                data: FileOperation::Create {
                    path: "a.txt".to_string(),
                    content: "hi".to_string(),
                },
            })
            .unwrap(),
        )
        .await;

        // The sender gets the acknowledgment, not the relay.
        assert_eq!(recv_json(&mut alice).await["type"], "fileOperationSuccess");

        let relayed = recv_json(&mut bob).await;
        assert_eq!(relayed["type"], "fileOperation");
        assert_eq!(relayed["userId"], "u1");
        assert_eq!(relayed["data"]["action"], "create");
        assert_eq!(relayed["data"]["path"], "a.txt");

        assert_eq!(
            server.registry.storage().read_file("s1", "a.txt").await.unwrap(),
            "hi"
        );
    }

    #[tokio::test]
    async fn failed_operations_error_the_sender_without_broadcast() {
        let server = start_server().await;
        let mut alice = connect(server.addr).await;
        let mut bob = connect(server.addr).await;
        join(&mut alice, "s1", "u1").await;
        join(&mut bob, "s1", "u2").await;
        assert_eq!(recv_json(&mut alice).await["type"], "userJoined");

        send_json(
            &mut alice,
            json!({"type": "fileOperation",
                   "data": {"action": "create", "path": "../evil.txt", "content": "x"}}),
        )
        .await;
        assert_eq!(recv_json(&mut alice).await["type"], "error");

        // Bob sees nothing; the next frame he receives is a later valid op.
        send_json(
            &mut alice,
            json!({"type": "fileOperation",
                   "data": {"action": "create", "path": "ok.txt", "content": "x"}}),
        )
        .await;
        assert_eq!(recv_json(&mut alice).await["type"], "fileOperationSuccess");
        let relayed = recv_json(&mut bob).await;
        assert_eq!(relayed["data"]["path"], "ok.txt");
    }

    #[tokio::test]
    async fn delete_of_a_missing_file_succeeds() {
        let server = start_server().await;
        let mut ws = connect(server.addr).await;
        join(&mut ws, "s1", "u1").await;

        send_json(
            &mut ws,
            json!({"type": "fileOperation", "data": {"action": "delete", "path": "missing.txt"}}),
        )
        .await;
        assert_eq!(recv_json(&mut ws).await["type"], "fileOperationSuccess");
    }

    #[tokio::test]
    async fn doc_updates_merge_server_side_and_relay() {
        let server = start_server().await;
        let mut alice = connect(server.addr).await;
        let mut bob = connect(server.addr).await;
        join(&mut alice, "s1", "u1").await;
        join(&mut bob, "s1", "u2").await;
        assert_eq!(recv_json(&mut alice).await["type"], "userJoined");

        let source = LoroDoc::new();
        source.get_text("body").insert(0, "hello").unwrap();
        let delta = source.export(loro::ExportMode::Snapshot).unwrap();

        send_json(
            &mut alice,
            serde_json::to_value(&ClientMessage::DocUpdate {
                data: DocUpdate {
                    doc_id: "d1".to_string(),
                    delta: delta.clone(),
                },
            })
            .unwrap(),
        )
        .await;

        let relayed = recv_json(&mut bob).await;
        assert_eq!(relayed["type"], "docUpdate");
        assert_eq!(relayed["userId"], "u1");
        let update: DocUpdate = serde_json::from_value(relayed["data"].clone()).unwrap();
        assert_eq!(update.delta, delta);

        let session = server.registry.get("s1").await.unwrap();
        let state = session.collab.lock().await.document_state("d1").unwrap();
        let doc = LoroDoc::new();
        doc.import(&state).unwrap();
        assert_eq!(
            doc.get_deep_value().to_json_value()["body"],
            json!("hello")
        );
    }

    #[tokio::test]
    async fn get_file_answers_the_requester_only() {
        let server = start_server().await;
        let mut ws = connect(server.addr).await;
        join(&mut ws, "s1", "u1").await;

        send_json(
            &mut ws,
            json!({"type": "fileOperation", "data": {"action": "create", "path": "a.txt", "content": "hi"}}),
        )
        .await;
        assert_eq!(recv_json(&mut ws).await["type"], "fileOperationSuccess");

        send_json(&mut ws, json!({"type": "getFile", "data": {"path": "a.txt"}})).await;
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["type"], "fileContent");
        assert_eq!(reply["data"]["content"], "hi");

        send_json(&mut ws, json!({"type": "getFile", "data": {"path": "nope.txt"}})).await;
        assert_eq!(recv_json(&mut ws).await["type"], "error");
    }

    #[tokio::test]
    async fn disconnect_announces_user_left_and_evicts_after_the_grace_period() {
        let server = start_server().await;
        let mut alice = connect(server.addr).await;
        let mut bob = connect(server.addr).await;
        join(&mut alice, "s1", "u1").await;
        join(&mut bob, "s1", "u2").await;
        assert_eq!(recv_json(&mut alice).await["type"], "userJoined");

        drop(bob);
        let left = recv_json(&mut alice).await;
        assert_eq!(left["type"], "userLeft");
        assert_eq!(left["userId"], "u2");
        assert!(server.registry.get("s1").await.is_some());

        drop(alice);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(server.registry.get("s1").await.is_none());
    }
}
