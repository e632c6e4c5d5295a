//! Agent channel server.
//!
//! Accepts WebSocket links from forwarder agents. A fresh link gets one
//! authentication window: the first message must be `auth` and, when
//! authentication is enabled, carry the shared token. Everything after a
//! successful `auth_result` flows between the socket and the node pool.
//!
//! Each connection carries a process-unique id so a replaced connection's
//! teardown can never evict the node entry of its successor.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use blehub_proto::wire::{AgentMessage, CoordinatorMessage};

use crate::pool::{LinkCommand, PoolHandle};

/// How long a fresh link may sit before its first message.
const AUTH_WINDOW: Duration = Duration::from_secs(5);

/// Capacity of the per-link outbound queue.
const LINK_QUEUE: usize = 32;

/// Authentication is disabled when the configured token is empty or the
/// literal `"none"`; any presented token passes then.
pub fn auth_token_ok(configured: &str, presented: &str) -> bool {
    if configured.is_empty() || configured == "none" {
        return true;
    }
    configured == presented
}

pub struct AgentServer {
    listener: TcpListener,
    token: String,
    pool: PoolHandle,
    cancel: CancellationToken,
}

impl AgentServer {
    /// Bind the agent channel. The effective address is available through
    /// [`AgentServer::local_addr`] (useful with an ephemeral port).
    pub async fn bind(
        addr: SocketAddr,
        token: String,
        pool: PoolHandle,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            token,
            pool,
            cancel,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop: spawn one handler task per incoming link until the
    /// cancellation token fires.
    pub async fn run(self) {
        let addr = self.listener.local_addr().ok();
        tracing::info!(addr = ?addr, "agent channel listening");
        let conn_ids = Arc::new(AtomicU64::new(1));

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            tracing::debug!(peer = %peer, "agent connection accepted");
                            let token = self.token.clone();
                            let pool = self.pool.clone();
                            let cancel = self.cancel.clone();
                            let conn_id = conn_ids.fetch_add(1, Ordering::Relaxed);
                            tokio::spawn(async move {
                                match tokio_tungstenite::accept_async(stream).await {
                                    Ok(ws) => {
                                        handle_agent_link(ws, peer, conn_id, token, pool, cancel)
                                            .await;
                                    }
                                    Err(e) => {
                                        tracing::debug!(peer = %peer, error = %e, "ws handshake failed");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "agent channel accept failed");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("agent channel: cancellation requested, shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_agent_link(
    ws: WebSocketStream<TcpStream>,
    peer: SocketAddr,
    conn_id: u64,
    token: String,
    pool: PoolHandle,
    cancel: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    // --- authentication phase ---
    let node_id = match authenticate(&mut ws_tx, &mut ws_rx, &token).await {
        Some(node_id) => node_id,
        None => {
            tracing::info!(peer = %peer, "agent link rejected");
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };
    tracing::info!(peer = %peer, node_id = %node_id, "agent authenticated");

    // --- registered phase ---
    let (link_tx, mut link_rx) = tokio::sync::mpsc::channel::<LinkCommand>(LINK_QUEUE);
    pool.register(node_id.clone(), conn_id, link_tx).await;

    loop {
        tokio::select! {
            outbound = link_rx.recv() => {
                match outbound {
                    Some(LinkCommand::Send(msg)) => {
                        let text = match serde_json::to_string(&msg) {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to serialize outbound message");
                                continue;
                            }
                        };
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(LinkCommand::Ping) => {
                        if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                    Some(LinkCommand::Close) | None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            inbound = ws_rx.next() => {
                let msg = match inbound {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::debug!(node_id = %node_id, error = %e, "agent link read error");
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Text(text) => {
                        // Malformed content is discarded without closing.
                        if let Some(decoded) = AgentMessage::decode(&text) {
                            pool.message(node_id.clone(), decoded).await;
                        } else {
                            tracing::debug!(node_id = %node_id, "discarding unrecognized message");
                        }
                    }
                    Message::Pong(_) => {
                        pool.pong(node_id.clone(), conn_id).await;
                    }
                    Message::Ping(data) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    tracing::info!(node_id = %node_id, "agent link closed");
    pool.link_closed(node_id, conn_id).await;
}

/// Run the auth window. Returns the node id on success; `None` means the
/// link was refused (an `auth_result{success:false}` has been sent when the
/// violation was a message rather than a timeout).
async fn authenticate<S, R>(ws_tx: &mut S, ws_rx: &mut R, token: &str) -> Option<String>
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::Instant::now() + AUTH_WINDOW;

    loop {
        let msg = match tokio::time::timeout_at(deadline, ws_rx.next()).await {
            Ok(Some(Ok(msg))) => msg,
            // Timeout, stream end, or transport error: nothing to answer.
            _ => return None,
        };

        let text = match msg {
            Message::Text(text) => text,
            // Transport frames do not count against the auth window.
            Message::Ping(data) => {
                let _ = ws_tx.send(Message::Pong(data)).await;
                continue;
            }
            Message::Pong(_) => continue,
            _ => return None,
        };

        return match AgentMessage::decode(&text) {
            Some(AgentMessage::Auth {
                token: presented,
                node_id,
            }) if auth_token_ok(token, &presented) => {
                let ok = CoordinatorMessage::AuthResult { success: true };
                if send_json(ws_tx, &ok).await.is_err() {
                    return None;
                }
                Some(node_id.unwrap_or_else(generated_node_id))
            }
            // Wrong token, a non-auth first message, or garbage: refuse.
            _ => {
                let no = CoordinatorMessage::AuthResult { success: false };
                let _ = send_json(ws_tx, &no).await;
                None
            }
        };
    }
}

async fn send_json<S>(ws_tx: &mut S, msg: &CoordinatorMessage) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let text = serde_json::to_string(msg).map_err(|_| ())?;
    ws_tx.send(Message::Text(text)).await.map_err(|_| ())
}

fn generated_node_id() -> String {
    format!("node-{}", Uuid::new_v4())
}
