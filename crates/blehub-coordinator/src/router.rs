//! Routing layer: one frame in, one endpoint out.
//!
//! `submit` prefers the local radio and falls back to the active remote
//! node; callers get a plain success flag, or [`RouteError::NoPath`] when
//! neither endpoint can take the frame. Command frames are written twice
//! with a 300 ms gap on whichever endpoint was chosen, to ride out
//! occasional radio-level losses; find and battery-query frames go out once.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;

use blehub_ble::{EndpointEvent, EndpointHandle};
use blehub_proto::frame::Frame;
use blehub_proto::wire::CoordinatorMessage;

use crate::pool::{PoolHandle, PoolNotification};

/// Gap between the two writes of a command frame.
pub const COMMAND_RESEND_GAP: Duration = Duration::from_millis(300);

/// Patience for battery/RSSI round trips through the pool.
const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no path to device: local endpoint not ready and no active node")]
    NoPath,
}

/// Routes user-facing operations to the local endpoint or the active agent.
#[derive(Clone)]
pub struct Router {
    local: EndpointHandle,
    pool: PoolHandle,
}

impl Router {
    pub fn new(local: EndpointHandle, pool: PoolHandle) -> Self {
        Self { local, pool }
    }

    /// Route one frame. Success for the remote path means the active node
    /// confirmed the write within the command timeout.
    pub async fn submit(&self, frame: Frame) -> Result<bool, RouteError> {
        if self.local.is_ready() {
            let bytes = frame.bytes().to_vec();
            if frame.is_command() {
                let local = self.local.clone();
                let again = bytes.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(COMMAND_RESEND_GAP).await;
                    local.write(again).await;
                });
            }
            return Ok(self.local.write(bytes).await);
        }

        if self.pool.snapshot().active.is_none() {
            return Err(RouteError::NoPath);
        }

        let data = hex::encode(frame.bytes());
        if frame.is_command() {
            let pool = self.pool.clone();
            let again = data.clone();
            tokio::spawn(async move {
                tokio::time::sleep(COMMAND_RESEND_GAP).await;
                // Best-effort repeat; the caller's answer is the first send.
                let _ = pool.submit_command(again).await;
            });
        }
        Ok(self.pool.submit_command(data).await)
    }

    /// Battery level, preferring the local endpoint. Falls back to the
    /// active node's last reported level when the round trip times out.
    pub async fn request_battery(&self) -> Option<u8> {
        if self.local.is_ready() {
            let mut events = self.local.subscribe_events();
            self.local.request_battery().await;
            return wait_for_local_battery(&mut events, QUERY_TIMEOUT).await;
        }

        let snapshot = self.pool.snapshot();
        let active = snapshot.active.as_ref()?;
        let fallback = snapshot
            .nodes
            .iter()
            .find(|n| &n.node_id == active)
            .and_then(|n| n.last_battery);

        let mut notifications = self.pool.subscribe();
        if !self.pool.send_to_active(CoordinatorMessage::GetBattery).await {
            return fallback;
        }
        match wait_for_pool_battery(&mut notifications, QUERY_TIMEOUT).await {
            Some(level) => Some(level),
            None => fallback,
        }
    }

    /// Live signal strength of the current writer, or `None` when unknown.
    pub async fn request_rssi(&self) -> Option<i32> {
        if self.local.is_ready() {
            return self.local.read_rssi().await.map(i32::from);
        }

        self.pool.snapshot().active.as_ref()?;
        let mut notifications = self.pool.subscribe();
        if !self.pool.send_to_active(CoordinatorMessage::GetRssi).await {
            return None;
        }
        wait_for_pool_rssi(&mut notifications, QUERY_TIMEOUT).await
    }
}

async fn wait_for_local_battery(
    events: &mut broadcast::Receiver<EndpointEvent>,
    timeout: Duration,
) -> Option<u8> {
    let deadline = Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(EndpointEvent::Battery(level))) => return Some(level),
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            _ => return None,
        }
    }
}

async fn wait_for_pool_battery(
    notifications: &mut broadcast::Receiver<PoolNotification>,
    timeout: Duration,
) -> Option<u8> {
    let deadline = Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, notifications.recv()).await {
            Ok(Ok(PoolNotification::Battery { level })) => return Some(level),
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            _ => return None,
        }
    }
}

async fn wait_for_pool_rssi(
    notifications: &mut broadcast::Receiver<PoolNotification>,
    timeout: Duration,
) -> Option<i32> {
    let deadline = Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, notifications.recv()).await {
            Ok(Ok(PoolNotification::Rssi { value })) => return Some(value),
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            _ => return None,
        }
    }
}
