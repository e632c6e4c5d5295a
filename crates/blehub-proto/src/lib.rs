//! Protocol layer shared by the coordinator and forwarder agents.
//!
//! Two independent surfaces live here:
//!
//! - [`frame`]: the byte frames the device itself understands, written to
//!   and notified from its UART characteristics.
//! - [`wire`]: the JSON messages exchanged between the coordinator and its
//!   forwarder agents over the agent channel.
//!
//! Both are pure: no IO, no async, no clocks.

pub mod frame;
pub mod wire;

pub use frame::{encode_battery_query, encode_command, encode_find, parse_notification, Frame, FrameKind};
pub use wire::{AgentMessage, CoordinatorMessage, ScanDevice};
