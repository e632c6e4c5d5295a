//! Agent channel wire protocol.
//!
//! JSON objects over WebSocket text frames, tagged by a mandatory `type`
//! field. Two spellings are fixed by deployed agents and cannot change:
//! `nodeId` and `bleConnected` are camelCase while everything else is
//! snake_case.
//!
//! Decoding is lenient: [`AgentMessage::decode`] and
//! [`CoordinatorMessage::decode`] return `None` for unparseable text, a
//! missing `type`, or wrongly-typed fields. Callers drop such messages
//! without closing the link.

use serde::{Deserialize, Serialize};

/// One discovered peripheral inside a `scan_result`.
///
/// `address` is absent on platforms whose BLE stack hides MAC addresses;
/// `rssi` is always present because the election keys on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanDevice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub rssi: i32,
    #[serde(
        rename = "detectionMethod",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub detection_method: Option<String>,
}

/// Messages an agent sends to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Mandatory first message on a fresh link.
    Auth {
        token: String,
        #[serde(rename = "nodeId", default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
    },
    /// Periodic report, also emitted on BLE connect/disconnect edges.
    Status {
        #[serde(rename = "bleConnected")]
        ble_connected: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        battery: Option<u8>,
    },
    /// Reply to a `scan` instruction.
    ScanResult { devices: Vec<ScanDevice> },
    /// Unsolicited battery level, or the reply to `get_battery`.
    Battery { level: u8 },
    /// Reply to `get_rssi`.
    Rssi { value: i32 },
    /// Reply to `command`.
    CommandResult { id: u64, success: bool },
}

/// Messages the coordinator sends to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    /// Sent exactly once per link, immediately after the auth decision.
    AuthResult { success: bool },
    /// Write this frame to the device. `data` is the frame as lowercase hex.
    /// A missing `id` defaults to 0; the write is still attempted and
    /// answered with a `command_result`.
    Command {
        #[serde(default)]
        id: u64,
        data: String,
    },
    GetBattery,
    GetRssi,
    /// Run a timed scan and reply with `scan_result`. Milliseconds; an
    /// agent falls back to its configured scan window when omitted.
    Scan {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
    },
    /// Bring the BLE endpoint up.
    Connect,
    /// Bring the BLE endpoint down.
    DisconnectBle,
}

impl AgentMessage {
    /// Lenient decode: `None` means "silently discard".
    pub fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

impl CoordinatorMessage {
    /// Lenient decode: `None` means "silently discard".
    pub fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}
