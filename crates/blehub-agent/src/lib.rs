//! Forwarder agent runtime.
//!
//! A long-lived process that keeps a WebSocket link to the coordinator open
//! (exponential backoff between attempts) and drives one BLE endpoint on its
//! behalf. The endpoint is never brought up on the agent's own initiative:
//! connection is coordinator-gated.

pub mod backoff;
pub mod forwarder;

pub use backoff::Backoff;
pub use forwarder::{Forwarder, ForwarderConfig};
