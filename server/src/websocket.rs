//! WebSocket transport for conversation channels

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use sqlx::{Pool, Sqlite};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use lms_chat_shared::GroupEvent;

use crate::auth::TokenAuthenticator;
use crate::channel::{self, render_delivery, ChannelState, ChatChannel, ChatServices, FrameOutcome};
use crate::config::ServerConfig;
use crate::db::sqlite::SqliteBackend;
use crate::fabric::InProcessFabric;

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

/// Simple token-bucket rate limiter (not shared across threads)
struct RateLimiter {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: std::time::Instant,
}

impl RateLimiter {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: std::time::Instant::now(),
        }
    }

    /// Try to consume one token. Returns false if rate limit exceeded.
    fn try_consume(&mut self) -> bool {
        let now = std::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

/// Server state shared across connections
pub struct ServerState {
    pub db_pool: Pool<Sqlite>,
    pub config: ServerConfig,
    pub chat: ChatServices,
    /// Current total connection count (for enforcing max_connections)
    connection_count: AtomicUsize,
    /// Per-IP connection counts (for enforcing max_connections_per_ip)
    ip_connections: DashMap<IpAddr, usize>,
}

impl ServerState {
    /// SQLite-backed directory and store, in-process fabric
    pub fn new(db_pool: Pool<Sqlite>, config: ServerConfig) -> Self {
        let backend = Arc::new(SqliteBackend::new(db_pool.clone()));
        let chat = ChatServices {
            authenticator: Arc::new(TokenAuthenticator::from_config(&config)),
            directory: backend.clone(),
            store: backend,
            fabric: Arc::new(InProcessFabric::new()),
            outbound_buffer: config.outbound_buffer,
            echo_to_sender: config.echo_to_sender,
        };
        Self::with_services(db_pool, config, chat)
    }

    pub fn with_services(db_pool: Pool<Sqlite>, config: ServerConfig, chat: ChatServices) -> Self {
        Self {
            db_pool,
            config,
            chat,
            connection_count: AtomicUsize::new(0),
            ip_connections: DashMap::new(),
        }
    }

    /// Live WebSocket connections
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Try to acquire a connection slot. Returns None if limits are exceeded.
    fn try_acquire_connection(self: &Arc<Self>, ip: IpAddr) -> Option<ConnectionSlot> {
        let max_global = self.config.max_connections;
        let max_per_ip = self.config.max_connections_per_ip;

        // Global limit (0 = unlimited); check and increment in one step
        self.connection_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (max_global == 0 || count < max_global).then_some(count + 1)
            })
            .ok()?;

        // Per-IP limit (0 = unlimited); the entry holds the shard lock
        if max_per_ip > 0 {
            let mut count = self.ip_connections.entry(ip).or_insert(0);
            if *count >= max_per_ip {
                drop(count);
                self.connection_count.fetch_sub(1, Ordering::AcqRel);
                return None;
            }
            *count += 1;
        }

        Some(ConnectionSlot {
            state: self.clone(),
            ip,
        })
    }

    /// Release a connection slot.
    fn release_connection(&self, ip: IpAddr) {
        self.connection_count.fetch_sub(1, Ordering::AcqRel);
        if self.config.max_connections_per_ip == 0 {
            return;
        }
        // Decrement and remove under the same lock
        self.ip_connections.remove_if_mut(&ip, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    /// Distinct client IPs holding a connection slot
    pub fn tracked_ips(&self) -> usize {
        self.ip_connections.len()
    }
}

/// Held for the lifetime of a connection; releases its slot on drop
struct ConnectionSlot {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.release_connection(self.ip);
    }
}

// ---------------------------------------------------------------------------
// WebSocket upgrade handler
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub username: Option<String>,
}

/// Raw `Authorization` header; a non-UTF-8 value reads as empty
pub(crate) fn authorization_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .map(|v| v.to_str().unwrap_or_default())
}

/// Handle WebSocket upgrade.
///
/// The handshake (credential check, both directory lookups, inbox
/// subscription) completes before the upgrade is accepted. Any failure
/// refuses the upgrade with a bare status code.
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    let participants = match channel::authenticate(
        &state.chat,
        params.username.as_deref(),
        authorization_header(&headers),
    )
    .await
    {
        Ok(participants) => {
            debug!(
                "Handshake from {} as {} ({:?} -> {:?})",
                addr,
                participants.subject.username,
                ChannelState::Connecting,
                ChannelState::Authenticated
            );
            participants
        }
        Err(e) => {
            warn!(
                "Handshake from {} refused ({:?} -> {:?}): {}",
                addr,
                ChannelState::Connecting,
                ChannelState::Closed,
                e
            );
            return e.status().into_response();
        }
    };

    let Some(slot) = state.try_acquire_connection(addr.ip()) else {
        warn!("Connection rejected for {}: limit exceeded", addr.ip());
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    // If the upgrade never completes the closure is dropped, taking the
    // subscription and the slot with it
    let (chat, deliveries) = ChatChannel::subscribe(state.chat.clone(), participants);

    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, addr, chat, deliveries, slot))
        .into_response()
}

// ---------------------------------------------------------------------------
// Socket lifecycle
// ---------------------------------------------------------------------------

async fn handle_socket(
    socket: WebSocket,
    state: Arc<ServerState>,
    addr: SocketAddr,
    mut chat: ChatChannel,
    mut deliveries: mpsc::Receiver<GroupEvent>,
    _slot: ConnectionSlot,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    info!(
        "{} connected from {} (peer {})",
        chat.subject().username,
        addr,
        chat.peer().username
    );

    // Frames the receive loop needs written, such as a policy close
    let (control_tx, mut control_rx) = mpsc::channel::<Message>(1);

    // Forward fabric deliveries to the socket + send periodic pings
    let ping_interval_secs = state.config.ws_ping_interval;
    let mut forward_task = tokio::spawn(async move {
        let mut ping_ticker = tokio::time::interval(Duration::from_secs(ping_interval_secs));
        ping_ticker.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                Some(frame) = control_rx.recv() => {
                    let closing = matches!(frame, Message::Close(_));
                    if ws_sender.send(frame).await.is_err() || closing {
                        break;
                    }
                }
                event = deliveries.recv() => {
                    match event {
                        Some(event) => {
                            let text = match render_delivery(&event) {
                                Ok(text) => text,
                                Err(e) => {
                                    error!("Failed to encode delivery: {}", e);
                                    continue;
                                }
                            };
                            if ws_sender.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_ticker.tick() => {
                    if ws_sender.send(Message::Ping(vec![])).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Disabled unless a burst allowance is configured
    let mut rate_limiter = (state.config.rate_limit_burst > 0.0).then(|| {
        RateLimiter::new(state.config.rate_limit_burst, state.config.rate_limit_per_sec)
    });
    let mut policy_close = None;

    // Main receive loop
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    if let Some(limiter) = rate_limiter.as_mut() {
                        if !limiter.try_consume() {
                            warn!(
                                "Rate limit exceeded for {} ({}), closing connection",
                                chat.subject().username,
                                addr
                            );
                            policy_close = Some(CloseFrame {
                                code: close_code::POLICY,
                                reason: "rate limit exceeded".into(),
                            });
                            break;
                        }
                    }
                    match chat.handle_text(&text).await {
                        Ok(FrameOutcome::Sent { message, delivered }) => {
                            debug!(
                                "Message {} from {} to {} delivered to {} connection(s)",
                                message.id,
                                chat.subject().username,
                                chat.peer().username,
                                delivered
                            );
                        }
                        Ok(FrameOutcome::Ignored) => {}
                        Err(e) => {
                            // The frame is dropped; the session stays open
                            error!("Error handling message from {}: {}", addr, e);
                        }
                    }
                }
                Message::Binary(_) => { /* ignore binary frames */ }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => { /* axum auto-responds to pings */ }
            },
            Some(Err(e)) => {
                debug!("WebSocket error from {}: {}", addr, e);
                break;
            }
            None => break,
        }
    }

    // Cleanup; a policy close is flushed while the forward task is still live
    if let Some(frame) = policy_close {
        if control_tx.send(Message::Close(Some(frame))).await.is_ok() {
            let _ = tokio::time::timeout(Duration::from_secs(1), &mut forward_task).await;
        }
    }
    chat.close();
    forward_task.abort();
    info!("{} disconnected ({})", chat.subject().username, addr);
}
