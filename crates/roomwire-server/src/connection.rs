use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use roomwire_core::protocol::Frame;
use roomwire_core::{ConnectionId, UserId};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Traffic from connection tasks to the single processing task.
#[derive(Debug)]
pub enum Inbound {
    Frame(ConnectionId, String),
    Closed(ConnectionId),
}

/// One live WebSocket connection and the rooms it has joined.
pub struct Connection {
    pub id: ConnectionId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
    dropped: AtomicU64,
    /// room name -> user id this connection joined it as.
    rooms: Mutex<HashMap<String, UserId>>,
}

impl Connection {
    fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
            dropped: AtomicU64::new(0),
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn mark_closed(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }

    /// Messages dropped because the outbound queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue a raw text frame. Never blocks; a full queue drops the message.
    pub fn send(&self, text: String) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    conn_id = %self.id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn send_frame(&self, frame: &Frame) -> bool {
        match frame.encode() {
            Ok(text) => self.send(text),
            Err(e) => {
                tracing::error!(conn_id = %self.id, error = %e, "failed to encode frame");
                false
            }
        }
    }

    pub fn emit(&self, event: &str, data: Value) -> bool {
        self.send_frame(&Frame::event(event, data))
    }

    pub fn ack(&self, id: u64, data: Value) -> bool {
        self.send_frame(&Frame::ack(id, data))
    }

    pub fn join_room(&self, room: &str, user_id: UserId) {
        self.rooms.lock().insert(room.to_string(), user_id);
    }

    pub fn leave_room(&self, room: &str) -> Option<UserId> {
        self.rooms.lock().remove(room)
    }

    pub fn rooms(&self) -> Vec<String> {
        self.rooms.lock().keys().cloned().collect()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// All live connections, keyed by id.
pub struct ConnectionRegistry {
    conns: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            conns: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Register a new connection and return it with its outbound receiver.
    pub fn register(&self) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let id = ConnectionId::next();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let conn = Arc::new(Connection::new(id.clone(), tx));
        self.conns.insert(id, Arc::clone(&conn));
        (conn, rx)
    }

    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.conns.remove(id).map(|(_, conn)| {
            conn.mark_closed();
            conn
        })
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.conns.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn is_open(&self, id: &ConnectionId) -> bool {
        self.conns
            .get(id)
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    pub fn emit_to(&self, id: &ConnectionId, event: &str, data: Value) -> bool {
        self.get(id).map(|c| c.emit(event, data)).unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.conns.len()
    }
}

/// Drive one WebSocket: a writer draining the outbound queue with periodic
/// pings, and a reader forwarding text frames to `inbound`. Whichever side
/// stops first, or server shutdown, ends the connection; `Inbound::Closed`
/// is always delivered.
pub async fn handle_ws_connection(
    socket: WebSocket,
    conn: Arc<Connection>,
    mut rx: mpsc::Receiver<String>,
    inbound: mpsc::Sender<Inbound>,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_conn = Arc::clone(&conn);
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if !writer_conn.is_alive() {
                        tracing::info!(conn_id = %writer_conn.id, "connection timed out");
                        break;
                    }
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(conn_id = %writer_conn.id, "sent ping");
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader_conn = Arc::clone(&conn);
    let reader_inbound = inbound.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let text = match msg {
                WsMessage::Text(text) => text.to_string(),
                WsMessage::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::warn!(conn_id = %reader_conn.id, "ignoring non-utf8 binary frame");
                        continue;
                    }
                },
                WsMessage::Pong(_) => {
                    reader_conn.record_pong();
                    continue;
                }
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {
                    reader_conn.record_pong();
                    continue;
                }
            };
            reader_conn.record_pong();
            if reader_inbound
                .send(Inbound::Frame(reader_conn.id.clone(), text))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
        _ = shutdown.cancelled() => {
            reader.abort();
            writer.abort();
        }
    }

    conn.mark_closed();
    let _ = inbound.send(Inbound::Closed(conn.id.clone())).await;
}
