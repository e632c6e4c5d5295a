//! Coordinator link: connect, authenticate, relay.
//!
//! One session per WebSocket connection. Outside the session the runner
//! sleeps out the backoff; inside it the loop multiplexes coordinator
//! messages, endpoint events, and the periodic status report. Per-link work
//! is serialized: instructions are handled in arrival order, one at a time.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use blehub_ble::{DiscoveredDevice, EndpointEvent, EndpointHandle};
use blehub_proto::wire::{AgentMessage, CoordinatorMessage, ScanDevice};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Delay before echoing the battery level back to a `get_battery`. The BLE
/// round trip is not awaited; the echo carries the last level we have.
const BATTERY_ECHO_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Coordinator agent-channel URL, e.g. `ws://host:9741/`.
    pub server_url: String,
    pub token: String,
    /// Stable identifier; the coordinator generates one when omitted.
    pub node_id: Option<String>,
    pub status_interval: Duration,
}

impl ForwarderConfig {
    pub fn new(server_url: String, token: String, node_id: Option<String>) -> Self {
        Self {
            server_url,
            token,
            node_id,
            status_interval: Duration::from_secs(10),
        }
    }
}

/// Why a session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// The coordinator rejected our auth; the link was closed.
    AuthRejected,
    /// Link dropped, closed, or a send failed.
    Closed,
}

pub struct Forwarder {
    config: ForwarderConfig,
    endpoint: EndpointHandle,
    cancel: CancellationToken,
    backoff: crate::Backoff,
    authenticated: bool,
    ble_connected: bool,
    last_battery: Option<u8>,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig, endpoint: EndpointHandle, cancel: CancellationToken) -> Self {
        Self {
            config,
            endpoint,
            cancel,
            backoff: crate::Backoff::default(),
            authenticated: false,
            ble_connected: false,
            last_battery: None,
        }
    }

    /// Reconnect loop. Runs until cancelled.
    pub async fn run(mut self) {
        loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("forwarder: cancellation requested, shutting down");
                    return;
                }
                result = connect_async(self.config.server_url.as_str()) => result,
            };

            match attempt {
                Ok((ws, _response)) => {
                    tracing::info!(url = %self.config.server_url, "connected to coordinator");
                    match self.run_session(ws).await {
                        SessionEnd::AuthRejected => {
                            tracing::error!("coordinator rejected authentication");
                        }
                        SessionEnd::Closed => {
                            tracing::warn!("coordinator link closed");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "coordinator connection failed");
                }
            }

            let delay = self.backoff.next_delay();
            tracing::info!(delay_secs = delay.as_secs(), "reconnecting to coordinator");
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_session(&mut self, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> SessionEnd {
        self.authenticated = false;
        self.ble_connected = self.endpoint.is_ready();
        let (mut ws_tx, ws_rx) = ws.split();

        let auth = AgentMessage::Auth {
            token: self.config.token.clone(),
            node_id: self.config.node_id.clone(),
        };
        if self.send(&mut ws_tx, &auth).await.is_err() {
            return SessionEnd::Closed;
        }

        match self.session_loop(&mut ws_tx, ws_rx).await {
            Ok(end) => end,
            Err(e) => {
                tracing::warn!(error = %e, "session ended on transport error");
                SessionEnd::Closed
            }
        }
    }

    async fn session_loop(
        &mut self,
        ws_tx: &mut WsSink,
        mut ws_rx: WsSource,
    ) -> Result<SessionEnd, WsError> {
        let mut status_timer = tokio::time::interval(self.config.status_interval);
        status_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut endpoint_events = self.endpoint.subscribe_events();
        let mut battery_echo_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Closed);
                }

                msg = ws_rx.next() => {
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => return Err(e),
                        None => return Ok(SessionEnd::Closed),
                    };
                    match msg {
                        Message::Text(text) => {
                            // Malformed content never closes the link.
                            if let Some(decoded) = CoordinatorMessage::decode(&text) {
                                if let Some(end) = self
                                    .handle_message(ws_tx, decoded, &mut battery_echo_at)
                                    .await?
                                {
                                    return Ok(end);
                                }
                            } else {
                                tracing::debug!("discarding unrecognized message");
                            }
                        }
                        Message::Ping(data) => {
                            ws_tx.send(Message::Pong(data)).await?;
                        }
                        Message::Close(_) => return Ok(SessionEnd::Closed),
                        _ => {}
                    }
                }

                _ = status_timer.tick() => {
                    if self.authenticated {
                        self.send_status(ws_tx).await?;
                    }
                }

                event = endpoint_events.recv() => {
                    match event {
                        Ok(event) => self.handle_endpoint_event(ws_tx, event).await?,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "endpoint event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            tracing::warn!("endpoint gone, closing session");
                            return Ok(SessionEnd::Closed);
                        }
                    }
                }

                _ = sleep_until_opt(battery_echo_at) => {
                    battery_echo_at = None;
                    let level = self.last_battery.unwrap_or(0);
                    self.send(ws_tx, &AgentMessage::Battery { level }).await?;
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        ws_tx: &mut WsSink,
        msg: CoordinatorMessage,
        battery_echo_at: &mut Option<Instant>,
    ) -> Result<Option<SessionEnd>, WsError> {
        match msg {
            CoordinatorMessage::AuthResult { success: false } => {
                return Ok(Some(SessionEnd::AuthRejected));
            }
            CoordinatorMessage::AuthResult { success: true } => {
                tracing::info!("authenticated with coordinator");
                self.authenticated = true;
                self.backoff.reset();
                self.send_status(ws_tx).await?;
            }
            CoordinatorMessage::Command { id, data } => {
                let success = match decode_command_payload(&data) {
                    Some(bytes) => self.endpoint.write(bytes).await,
                    None => {
                        tracing::warn!(id, "command payload is not valid hex");
                        false
                    }
                };
                self.send(ws_tx, &AgentMessage::CommandResult { id, success })
                    .await?;
            }
            CoordinatorMessage::GetBattery => {
                self.endpoint.request_battery().await;
                *battery_echo_at = Some(Instant::now() + BATTERY_ECHO_DELAY);
            }
            CoordinatorMessage::GetRssi => {
                // Stay silent when no reading is available.
                if let Some(value) = self.endpoint.read_rssi().await {
                    self.send(ws_tx, &AgentMessage::Rssi {
                        value: i32::from(value),
                    })
                    .await?;
                }
            }
            CoordinatorMessage::Scan { duration } => {
                // No duration on the wire: the endpoint's configured scan
                // window applies.
                let found = self
                    .endpoint
                    .scan(duration.map(Duration::from_millis))
                    .await;
                let devices = scan_devices_to_wire(found);
                self.send(ws_tx, &AgentMessage::ScanResult { devices })
                    .await?;
            }
            CoordinatorMessage::Connect => {
                tracing::info!("coordinator requested BLE connect");
                self.endpoint.connect().await;
            }
            CoordinatorMessage::DisconnectBle => {
                tracing::info!("coordinator requested BLE disconnect");
                self.endpoint.disconnect().await;
                self.send_status(ws_tx).await?;
            }
        }
        Ok(None)
    }

    async fn handle_endpoint_event(
        &mut self,
        ws_tx: &mut WsSink,
        event: EndpointEvent,
    ) -> Result<(), WsError> {
        match event {
            EndpointEvent::Connected => {
                self.ble_connected = true;
                if self.authenticated {
                    self.send_status(ws_tx).await?;
                }
            }
            EndpointEvent::Disconnected => {
                self.ble_connected = false;
                if self.authenticated {
                    self.send_status(ws_tx).await?;
                }
            }
            EndpointEvent::Battery(level) => {
                self.last_battery = Some(level);
                if self.authenticated {
                    self.send(ws_tx, &AgentMessage::Battery { level }).await?;
                }
            }
        }
        Ok(())
    }

    async fn send_status(&mut self, ws_tx: &mut WsSink) -> Result<(), WsError> {
        let status = AgentMessage::Status {
            ble_connected: self.ble_connected,
            battery: self.last_battery,
        };
        self.send(ws_tx, &status).await
    }

    async fn send(&self, ws_tx: &mut WsSink, msg: &AgentMessage) -> Result<(), WsError> {
        let text = serde_json::to_string(msg).map_err(|e| {
            WsError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        ws_tx.send(Message::Text(text)).await
    }
}

/// `command.data` is the frame as a hex string; odd length or stray
/// characters invalidate the whole command.
pub fn decode_command_payload(data: &str) -> Option<Vec<u8>> {
    hex::decode(data).ok()
}

pub fn scan_devices_to_wire(found: Vec<DiscoveredDevice>) -> Vec<ScanDevice> {
    found
        .into_iter()
        .map(|d| ScanDevice {
            address: Some(d.address),
            name: d.name,
            rssi: i32::from(d.rssi),
            detection_method: Some(d.detection_method.as_str().to_string()),
        })
        .collect()
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
