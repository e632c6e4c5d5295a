//! Host-side BLE stack wrapper.
//!
//! An [`Endpoint`] owns at most one connection to the device and is used
//! identically by the coordinator (local radio) and by every forwarder
//! agent. Commands go in over a channel handle, connection state is
//! published on a watch channel, and connect/disconnect/battery events come
//! out on a broadcast channel.

use uuid::{uuid, Uuid};

pub mod endpoint;
pub mod selector;

pub use endpoint::{
    DiscoveredDevice, Endpoint, EndpointConfig, EndpointError, EndpointEvent, EndpointHandle,
    EndpointState,
};
pub use selector::{AddressType, DetectionMethod, DeviceSelector};

/// Nordic UART service the device exposes.
pub const UART_SERVICE_UUID: Uuid = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");

/// TX characteristic: host writes frames here, without response.
pub const UART_TX_CHAR_UUID: Uuid = uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");

/// RX characteristic: the device notifies frames here.
pub const UART_RX_CHAR_UUID: Uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");
