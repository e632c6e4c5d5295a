//! Coordinator core.
//!
//! Three sub-modules, wired together by the `blehubd` binary:
//!
//! - [`server`]: accepts and authenticates forwarder agent links.
//! - [`pool`]: the node pool: registration, liveness, the single-active
//!   invariant, and the scan/elect/promote handoff cycle. One owning task;
//!   every mutation goes through its event channel.
//! - [`router`]: routes user-facing operations to the local BLE endpoint
//!   or the active remote agent.

pub mod pool;
pub mod router;
pub mod server;

pub use pool::{
    HandoffPhase, LinkCommand, NodePool, NodeSnapshot, PoolConfig, PoolHandle, PoolNotification,
    PoolSnapshot,
};
pub use router::{RouteError, Router};
pub use server::AgentServer;
