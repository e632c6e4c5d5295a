//! The endpoint actor: one radio, at most one device link.
//!
//! Commands arrive over an mpsc channel, connection state is published on a
//! watch channel, and connect/disconnect/battery events go out on a
//! broadcast channel. All BLE work is serialized through the `run()` loop,
//! so a connect attempt, a timed scan, and a write never race each other.

use std::collections::HashSet;
use std::pin::Pin;
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use blehub_proto::frame;

use crate::selector::{DetectionMethod, DeviceSelector};
use crate::{UART_RX_CHAR_UUID, UART_TX_CHAR_UUID};

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// How often the discovery loop re-polls the adapter's peripheral list.
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("no BLE adapter at index {0}")]
    AdapterNotFound(usize),
    #[error("device not found within the discovery window")]
    DeviceNotFound,
    #[error("characteristic {0} missing after service discovery")]
    CharacteristicMissing(Uuid),
    #[error("ble error: {0}")]
    Ble(#[from] btleplug::Error),
}

/// Connection state, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointState {
    #[default]
    Idle,
    Connecting,
    Discovering,
    Ready,
    Disconnected,
}

/// Events emitted by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointEvent {
    Connected,
    Disconnected,
    Battery(u8),
}

/// One peripheral found by a timed scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub detection_method: DetectionMethod,
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub selector: DeviceSelector,
    /// HCI interface index on hosts with several radios.
    pub adapter_index: usize,
    /// Scan window used when a scan request names no duration of its own.
    pub scan_duration: Duration,
    pub reconnect_delay: Duration,
    pub battery_check_interval: Duration,
    /// How long a connect attempt may search before "device not found".
    pub discovery_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            selector: DeviceSelector::default(),
            adapter_index: 0,
            scan_duration: Duration::from_millis(10_000),
            reconnect_delay: Duration::from_millis(5_000),
            battery_check_interval: Duration::from_millis(1_800_000),
            discovery_timeout: Duration::from_secs(30),
        }
    }
}

enum EndpointCommand {
    Connect,
    Disconnect,
    Write {
        bytes: Vec<u8>,
        reply: oneshot::Sender<bool>,
    },
    Scan {
        duration: Option<Duration>,
        reply: oneshot::Sender<Vec<DiscoveredDevice>>,
    },
    ReadRssi {
        reply: oneshot::Sender<Option<i16>>,
    },
    RequestBattery,
}

/// Cloneable handle to a running [`Endpoint`].
#[derive(Clone)]
pub struct EndpointHandle {
    cmd_tx: mpsc::Sender<EndpointCommand>,
    state_rx: watch::Receiver<EndpointState>,
    event_tx: broadcast::Sender<EndpointEvent>,
}

impl EndpointHandle {
    /// Arm auto-reconnect and bring the link up. Idempotent while an attempt
    /// is already in flight.
    pub async fn connect(&self) {
        let _ = self.cmd_tx.send(EndpointCommand::Connect).await;
    }

    /// Disarm auto-reconnect and tear the link down.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(EndpointCommand::Disconnect).await;
    }

    /// Write a frame to the TX characteristic. `false` unless the endpoint
    /// is ready and the write went out.
    pub async fn write(&self, bytes: Vec<u8>) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(EndpointCommand::Write { bytes, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Timed discovery of compatible peripherals, deduplicated by address.
    /// The configured scan window applies when `duration` is `None`. Empty
    /// on any scan error.
    pub async fn scan(&self, duration: Option<Duration>) -> Vec<DiscoveredDevice> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(EndpointCommand::Scan { duration, reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Signal strength of the active link, if any.
    pub async fn read_rssi(&self) -> Option<i16> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(EndpointCommand::ReadRssi { reply })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Fire a battery query at the device; the level arrives later as an
    /// [`EndpointEvent::Battery`].
    pub async fn request_battery(&self) {
        let _ = self.cmd_tx.send(EndpointCommand::RequestBattery).await;
    }

    pub fn state(&self) -> EndpointState {
        *self.state_rx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == EndpointState::Ready
    }

    /// Watch channel for state transitions.
    pub fn watch_state(&self) -> watch::Receiver<EndpointState> {
        self.state_rx.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EndpointEvent> {
        self.event_tx.subscribe()
    }
}

struct DeviceLink {
    peripheral: Peripheral,
    tx_char: btleplug::api::Characteristic,
}

/// The endpoint actor. Construct with [`Endpoint::new`], then drive with
/// [`Endpoint::run`] on a task of its own.
pub struct Endpoint {
    config: EndpointConfig,
    cmd_rx: mpsc::Receiver<EndpointCommand>,
    state_tx: watch::Sender<EndpointState>,
    event_tx: broadcast::Sender<EndpointEvent>,
    cancel: CancellationToken,
    auto_reconnect: bool,
    reconnect_at: Option<Instant>,
    link: Option<DeviceLink>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, cancel: CancellationToken) -> (Self, EndpointHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(EndpointState::Idle);
        let (event_tx, _) = broadcast::channel(32);
        let handle = EndpointHandle {
            cmd_tx,
            state_rx,
            event_tx: event_tx.clone(),
        };
        let endpoint = Self {
            config,
            cmd_rx,
            state_tx,
            event_tx,
            cancel,
            auto_reconnect: false,
            reconnect_at: None,
            link: None,
        };
        (endpoint, handle)
    }

    /// Main loop. Returns when cancelled or when every handle is gone.
    pub async fn run(mut self) -> Result<(), EndpointError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .nth(self.config.adapter_index)
            .ok_or(EndpointError::AdapterNotFound(self.config.adapter_index))?;
        let mut central_events = adapter.events().await?;
        let mut notifications: Option<NotificationStream> = None;
        let mut battery_timer = tokio::time::interval(self.config.battery_check_interval);
        battery_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(adapter = self.config.adapter_index, "ble endpoint started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("ble endpoint: cancellation requested, shutting down");
                    break;
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(&adapter, cmd, &mut notifications).await,
                        None => {
                            tracing::info!("ble endpoint: all handles dropped, shutting down");
                            break;
                        }
                    }
                }
                event = central_events.next() => {
                    match event {
                        Some(event) => self.handle_central_event(event, &mut notifications).await,
                        None => {
                            tracing::warn!("ble endpoint: adapter event stream ended");
                            break;
                        }
                    }
                }
                notification = next_notification(&mut notifications) => {
                    match notification {
                        Some(n) => self.handle_notification(n),
                        None => notifications = None,
                    }
                }
                _ = battery_timer.tick() => {
                    if self.is_ready() {
                        self.query_battery().await;
                    }
                }
                _ = reconnect_due(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.try_connect(&adapter, &mut notifications).await;
                }
            }
        }

        if let Some(link) = self.link.take() {
            let _ = link.peripheral.disconnect().await;
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.link.is_some()
    }

    fn set_state(&self, state: EndpointState) {
        let _ = self.state_tx.send(state);
    }

    async fn handle_command(
        &mut self,
        adapter: &Adapter,
        cmd: EndpointCommand,
        notifications: &mut Option<NotificationStream>,
    ) {
        match cmd {
            EndpointCommand::Connect => {
                self.auto_reconnect = true;
                if self.link.is_none() {
                    self.try_connect(adapter, notifications).await;
                }
            }
            EndpointCommand::Disconnect => {
                self.auto_reconnect = false;
                self.reconnect_at = None;
                self.teardown(notifications, EndpointState::Idle).await;
            }
            EndpointCommand::Write { bytes, reply } => {
                let _ = reply.send(self.write_frame(&bytes).await);
            }
            EndpointCommand::Scan { duration, reply } => {
                let duration = duration.unwrap_or(self.config.scan_duration);
                let devices = match self.run_scan(adapter, duration).await {
                    Ok(devices) => devices,
                    Err(e) => {
                        tracing::warn!(error = %e, "scan failed");
                        Vec::new()
                    }
                };
                let _ = reply.send(devices);
            }
            EndpointCommand::ReadRssi { reply } => {
                let _ = reply.send(self.read_link_rssi().await);
            }
            EndpointCommand::RequestBattery => {
                if self.is_ready() {
                    self.query_battery().await;
                }
            }
        }
    }

    async fn handle_central_event(
        &mut self,
        event: CentralEvent,
        notifications: &mut Option<NotificationStream>,
    ) {
        if let CentralEvent::DeviceDisconnected(id) = event {
            let ours = self
                .link
                .as_ref()
                .is_some_and(|link| link.peripheral.id() == id);
            if ours {
                tracing::warn!("device link lost");
                self.teardown(notifications, EndpointState::Disconnected).await;
                if self.auto_reconnect {
                    self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
                }
            }
        }
    }

    fn handle_notification(&self, notification: ValueNotification) {
        if notification.uuid != UART_RX_CHAR_UUID {
            return;
        }
        if let Some(level) = frame::parse_notification(&notification.value) {
            tracing::debug!(level, "battery report");
            let _ = self.event_tx.send(EndpointEvent::Battery(level));
        }
    }

    /// Drop the link, emit `Disconnected` if we had one, settle on `state`.
    async fn teardown(&mut self, notifications: &mut Option<NotificationStream>, state: EndpointState) {
        *notifications = None;
        if let Some(link) = self.link.take() {
            let _ = link.peripheral.disconnect().await;
            let _ = self.event_tx.send(EndpointEvent::Disconnected);
        }
        self.set_state(state);
    }

    /// One full connect attempt. On failure the retry timer is armed; the
    /// endpoint keeps retrying at `reconnect_delay` until disarmed.
    async fn try_connect(&mut self, adapter: &Adapter, notifications: &mut Option<NotificationStream>) {
        if self.link.is_some() || !self.auto_reconnect {
            return;
        }
        self.set_state(EndpointState::Connecting);
        match self.connect_once(adapter).await {
            Ok((link, stream)) => {
                tracing::info!(address = %link.peripheral.address(), "device connected");
                *notifications = Some(stream);
                self.link = Some(link);
                self.set_state(EndpointState::Ready);
                let _ = self.event_tx.send(EndpointEvent::Connected);
                // Prime the battery level right away; the interval refreshes it.
                self.query_battery().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "connect attempt failed");
                self.set_state(EndpointState::Disconnected);
                if self.auto_reconnect {
                    self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
                }
            }
        }
    }

    async fn connect_once(
        &mut self,
        adapter: &Adapter,
    ) -> Result<(DeviceLink, NotificationStream), EndpointError> {
        let peripheral = self.find_device(adapter).await?;
        peripheral.connect().await?;
        self.set_state(EndpointState::Discovering);
        peripheral.discover_services().await?;

        let chars = peripheral.characteristics();
        let tx_char = chars
            .iter()
            .find(|c| c.uuid == UART_TX_CHAR_UUID)
            .cloned()
            .ok_or(EndpointError::CharacteristicMissing(UART_TX_CHAR_UUID))?;
        let rx_char = chars
            .iter()
            .find(|c| c.uuid == UART_RX_CHAR_UUID)
            .cloned()
            .ok_or(EndpointError::CharacteristicMissing(UART_RX_CHAR_UUID))?;

        // Ready is only entered once the RX subscription holds.
        peripheral.subscribe(&rx_char).await?;
        let stream = peripheral.notifications().await?;
        Ok((
            DeviceLink {
                peripheral,
                tx_char,
            },
            stream,
        ))
    }

    /// Scan until the selector matches a peripheral or the discovery window
    /// closes.
    async fn find_device(&self, adapter: &Adapter) -> Result<Peripheral, EndpointError> {
        adapter.start_scan(ScanFilter::default()).await?;
        let deadline = Instant::now() + self.config.discovery_timeout;
        let mut found = None;

        'search: loop {
            for p in adapter.peripherals().await? {
                let props = match p.properties().await {
                    Ok(Some(props)) => props,
                    _ => continue,
                };
                let address = props.address.to_string();
                if self.config.selector.is_target(
                    &address,
                    props.local_name.as_deref(),
                    &props.services,
                ) {
                    found = Some(p);
                    break 'search;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(DISCOVERY_POLL_INTERVAL).await;
        }

        let _ = adapter.stop_scan().await;
        found.ok_or(EndpointError::DeviceNotFound)
    }

    async fn run_scan(
        &self,
        adapter: &Adapter,
        duration: Duration,
    ) -> Result<Vec<DiscoveredDevice>, EndpointError> {
        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(duration).await;
        let peripherals = adapter.peripherals().await?;
        let _ = adapter.stop_scan().await;

        let mut seen = HashSet::new();
        let mut devices = Vec::new();
        for p in peripherals {
            let props = match p.properties().await {
                Ok(Some(props)) => props,
                _ => continue,
            };
            let address = props.address.to_string();
            if !seen.insert(address.clone()) {
                continue;
            }
            let Some(method) = self
                .config
                .selector
                .detect(props.local_name.as_deref(), &props.services)
            else {
                continue;
            };
            let Some(rssi) = props.rssi else {
                continue;
            };
            devices.push(DiscoveredDevice {
                address,
                name: props.local_name,
                rssi,
                detection_method: method,
            });
        }
        tracing::debug!(count = devices.len(), "scan window closed");
        Ok(devices)
    }

    async fn write_frame(&self, bytes: &[u8]) -> bool {
        let Some(link) = self.link.as_ref() else {
            tracing::debug!("write dropped: endpoint not ready");
            return false;
        };
        match link
            .peripheral
            .write(&link.tx_char, bytes, WriteType::WithoutResponse)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "ble write failed");
                false
            }
        }
    }

    async fn query_battery(&self) {
        let query = frame::encode_battery_query();
        self.write_frame(query.bytes()).await;
    }

    async fn read_link_rssi(&self) -> Option<i16> {
        let link = self.link.as_ref()?;
        match link.peripheral.properties().await {
            Ok(Some(props)) => props.rssi,
            _ => None,
        }
    }
}

async fn next_notification(stream: &mut Option<NotificationStream>) -> Option<ValueNotification> {
    match stream.as_mut() {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

async fn reconnect_due(at: Option<Instant>) {
    match at {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
