//! Real-time transport: the WebSocket hub and the per-connection tasks.
//!
//! The hub owns the userId → client map. Register, unregister, and broadcast
//! requests arrive over three serial channels and the event loop is the only
//! code that touches the map, so producers never contend on it. Producers get
//! three thread-safe operations: [`HubHandle::send_to_user`],
//! [`HubHandle::send_to_role`], and [`HubHandle::is_connected`] (served from
//! a mirror the loop maintains).
//!
//! Each connection owns a reader and a writer task. The writer drains a
//! bounded queue and emits protocol pings; the reader enforces the pong
//! deadline and feeds `location_update` frames into the ingress pipeline.
//! A client whose queue overflows is evicted rather than ever blocking a
//! producer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::fleet::context::ServiceContext;
use crate::fleet::location::{self, DriverLocationUpdate, LocationSample};
use crate::fleet::models::{timefmt, UserRole};
use crate::fleet::shift::ShiftSnapshot;
use crate::metrics;
use crate::web::auth;

/// Read deadline; every pong pushes it out again.
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Server ping cadence; must beat the pong deadline.
pub const PING_PERIOD: Duration = Duration::from_secs(54);
/// Largest inbound frame accepted.
pub const MAX_MESSAGE_SIZE: usize = 2048;
/// Outbound frames buffered per client before eviction.
pub const SEND_QUEUE: usize = 256;

/// Frames the server originates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Pong {
        #[serde(with = "timefmt")]
        timestamp: i64,
    },
    RouteAssigned {
        data: ShiftSnapshot,
    },
    ShiftUpdate {
        data: ShiftSnapshot,
    },
    ShiftDeleted {
        data: ShiftDeletedData,
    },
    DriverLocationUpdate {
        data: DriverLocationUpdate,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ShiftDeletedData {
    pub shift_id: Uuid,
}

impl ServerFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Pong { .. } => "pong",
            ServerFrame::RouteAssigned { .. } => "route_assigned",
            ServerFrame::ShiftUpdate { .. } => "shift_update",
            ServerFrame::ShiftDeleted { .. } => "shift_deleted",
            ServerFrame::DriverLocationUpdate { .. } => "driver_location_update",
        }
    }
}

/// Frames accepted from clients.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping {},
    LocationUpdate(LocationSample),
}

/// One registered connection as the hub sees it.
#[derive(Debug, Clone)]
pub struct HubClient {
    pub user_id: Uuid,
    pub role: UserRole,
    pub conn_id: Uuid,
    sender: mpsc::Sender<Message>,
}

#[derive(Debug)]
struct Unregister {
    user_id: Uuid,
    conn_id: Uuid,
}

#[derive(Debug)]
enum Fanout {
    User(Uuid, String),
    Role(UserRole, String),
}

/// Producer-side handle. Cheap to clone; every operation is non-blocking.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<HubClient>,
    unregister_tx: mpsc::Sender<Unregister>,
    broadcast_tx: mpsc::Sender<Fanout>,
    connected: Arc<RwLock<HashSet<Uuid>>>,
}

impl HubHandle {
    pub fn send_to_user(&self, user_id: Uuid, frame: &ServerFrame) {
        if let Some(payload) = encode(frame) {
            match self.broadcast_tx.try_send(Fanout::User(user_id, payload)) {
                Ok(()) => {
                    metrics::WS_FRAMES_SENT.with_label_values(&[frame.kind()]).inc();
                }
                Err(_) => {
                    tracing::debug!(user_id = %user_id, "hub unavailable, frame dropped");
                }
            }
        }
    }

    pub fn send_to_role(&self, role: UserRole, frame: &ServerFrame) {
        if let Some(payload) = encode(frame) {
            match self.broadcast_tx.try_send(Fanout::Role(role, payload)) {
                Ok(()) => {
                    metrics::WS_FRAMES_SENT.with_label_values(&[frame.kind()]).inc();
                }
                Err(_) => {
                    tracing::debug!(role = role.as_str(), "hub unavailable, frame dropped");
                }
            }
        }
    }

    pub fn is_connected(&self, user_id: Uuid) -> bool {
        self.connected.read().contains(&user_id)
    }

    async fn register(&self, client: HubClient) {
        let _ = self.register_tx.send(client).await;
    }

    async fn unregister(&self, user_id: Uuid, conn_id: Uuid) {
        let _ = self.unregister_tx.send(Unregister { user_id, conn_id }).await;
    }

    /// Handle with no event loop behind it; sends vanish. For tests and
    /// tooling that never serve sockets.
    pub fn detached() -> HubHandle {
        let (register_tx, _) = mpsc::channel(1);
        let (unregister_tx, _) = mpsc::channel(1);
        let (broadcast_tx, _) = mpsc::channel(1);
        HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            connected: Arc::new(RwLock::new(HashSet::new())),
        }
    }
}

fn encode(frame: &ServerFrame) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(payload) => Some(payload),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode server frame");
            None
        }
    }
}

/// Spawns the hub event loop and returns its handle.
pub fn spawn_hub() -> HubHandle {
    let (register_tx, mut register_rx) = mpsc::channel::<HubClient>(64);
    let (unregister_tx, mut unregister_rx) = mpsc::channel::<Unregister>(64);
    let (broadcast_tx, mut broadcast_rx) = mpsc::channel::<Fanout>(1024);
    let connected = Arc::new(RwLock::new(HashSet::new()));
    let connected_loop = Arc::clone(&connected);

    tokio::spawn(async move {
        let mut clients: HashMap<Uuid, HubClient> = HashMap::new();

        loop {
            tokio::select! {
                maybe = register_rx.recv() => {
                    let client = match maybe { Some(c) => c, None => break };
                    if clients.insert(client.user_id, client.clone()).is_some() {
                        // Second connection for the same user replaces the
                        // first; the old writer sees its queue close.
                        metrics::WS_CLIENTS_EVICTED
                            .with_label_values(&["replaced"])
                            .inc();
                    }
                    connected_loop.write().insert(client.user_id);
                    metrics::WS_CONNECTED_CLIENTS.set(clients.len() as i64);
                }
                maybe = unregister_rx.recv() => {
                    let unreg = match maybe { Some(u) => u, None => break };
                    let matches = clients
                        .get(&unreg.user_id)
                        .map_or(false, |c| c.conn_id == unreg.conn_id);
                    if matches {
                        clients.remove(&unreg.user_id);
                        connected_loop.write().remove(&unreg.user_id);
                        metrics::WS_CONNECTED_CLIENTS.set(clients.len() as i64);
                    }
                }
                maybe = broadcast_rx.recv() => {
                    let fanout = match maybe { Some(f) => f, None => break };
                    let mut evicted: Vec<Uuid> = Vec::new();
                    match fanout {
                        Fanout::User(user_id, payload) => {
                            if let Some(client) = clients.get(&user_id) {
                                if client.sender.try_send(Message::Text(payload)).is_err() {
                                    evicted.push(user_id);
                                }
                            }
                        }
                        Fanout::Role(role, payload) => {
                            for client in clients.values() {
                                if client.role != role {
                                    continue;
                                }
                                if client
                                    .sender
                                    .try_send(Message::Text(payload.clone()))
                                    .is_err()
                                {
                                    evicted.push(client.user_id);
                                }
                            }
                        }
                    }
                    for user_id in evicted {
                        // Back-pressure by eviction: dropping the sender
                        // closes the writer, which closes the socket.
                        clients.remove(&user_id);
                        connected_loop.write().remove(&user_id);
                        metrics::WS_CLIENTS_EVICTED
                            .with_label_values(&["queue_full"])
                            .inc();
                        metrics::WS_CONNECTED_CLIENTS.set(clients.len() as i64);
                        tracing::warn!(user_id = %user_id, "client queue overflow, evicting");
                    }
                }
            }
        }
    });

    HubHandle {
        register_tx,
        unregister_tx,
        broadcast_tx,
        connected,
    }
}

/// `GET /ws?token=<jwt>`: validates the token (query parameter preferred,
/// Authorization header as fallback) and upgrades, or refuses with 401.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(ctx): State<Arc<ServiceContext>>,
) -> Result<Response, StatusCode> {
    let token = params
        .get("token")
        .cloned()
        .or_else(|| auth::bearer_token(&headers));
    let token = token.ok_or(StatusCode::UNAUTHORIZED)?;
    let claims = auth::verify_token(&ctx.config.jwt_secret, &token)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    Ok(ws
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, claims, ctx)))
}

async fn handle_socket(socket: WebSocket, claims: auth::Claims, ctx: Arc<ServiceContext>) {
    let conn_id = Uuid::new_v4();
    let (queue_tx, queue_rx) = mpsc::channel::<Message>(SEND_QUEUE);

    ctx.hub
        .register(HubClient {
            user_id: claims.user_id,
            role: claims.role,
            conn_id,
            sender: queue_tx.clone(),
        })
        .await;
    tracing::info!(user_id = %claims.user_id, role = claims.role.as_str(), "websocket connected");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, queue_rx));

    read_loop(stream, &claims, &ctx, &queue_tx).await;

    ctx.hub.unregister(claims.user_id, conn_id).await;
    if claims.role == UserRole::Driver {
        if let Err(err) = location::disconnect(&ctx, claims.user_id) {
            tracing::warn!(error = %err, "failed to mark driver disconnected");
        }
    }
    writer.abort();
    tracing::info!(user_id = %claims.user_id, "websocket disconnected");
}

async fn write_loop(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut queue_rx: mpsc::Receiver<Message>,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            maybe = queue_rx.recv() => {
                match maybe {
                    Some(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    // Queue closed: the hub evicted or replaced this client.
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    claims: &auth::Claims,
    ctx: &Arc<ServiceContext>,
    queue_tx: &mpsc::Sender<Message>,
) {
    let mut deadline = tokio::time::Instant::now() + PONG_WAIT;

    loop {
        let msg = match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => {
                tracing::debug!(user_id = %claims.user_id, "pong deadline missed");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(_))) => return,
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Pong(_) => {
                deadline = tokio::time::Instant::now() + PONG_WAIT;
            }
            Message::Text(text) => {
                if text.len() > MAX_MESSAGE_SIZE {
                    tracing::warn!(user_id = %claims.user_id, "oversized frame, closing");
                    return;
                }
                handle_client_frame(claims, ctx, queue_tx, &text).await;
            }
            Message::Close(_) => return,
            // Axum answers protocol pings itself.
            Message::Ping(_) | Message::Binary(_) => {}
        }
    }
}

async fn handle_client_frame(
    claims: &auth::Claims,
    ctx: &Arc<ServiceContext>,
    queue_tx: &mpsc::Sender<Message>,
    text: &str,
) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::debug!(user_id = %claims.user_id, error = %err, "unparseable client frame");
            return;
        }
    };

    match frame {
        ClientFrame::Ping {} => {
            let pong = ServerFrame::Pong {
                timestamp: chrono::Utc::now().timestamp(),
            };
            if let Some(payload) = encode(&pong) {
                let _ = queue_tx.try_send(Message::Text(payload));
            }
        }
        ClientFrame::LocationUpdate(sample) => {
            if claims.role != UserRole::Driver {
                return;
            }
            if let Err(err) = location::ingest(ctx, claims.user_id, sample).await {
                tracing::warn!(user_id = %claims.user_id, error = %err, "location ingest failed");
            }
        }
    }
}
