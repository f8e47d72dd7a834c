//! # relay-driver
//!
//! Engine-facing network driver over a relay transport.
//!
//! This crate provides:
//! - `RelayDriver`, the polled driver contract (listen, connect, send,
//!   pop events, disconnect, stats)
//! - The connection registry and event bridge it owns
//! - The acceptor (hosting side) and connector (client side) that turn
//!   transport callbacks into queued events

pub mod acceptor;
pub mod connector;
pub mod driver;
pub mod event_bridge;
pub mod registry;

#[cfg(test)]
mod testing;

pub use acceptor::{Acceptor, AcceptorState};
pub use connector::{Connector, ConnectorState};
pub use driver::{DRIVER_NAME, RelayDriver, Role};
pub use event_bridge::EventBridge;
pub use registry::{ConnectionRecord, ConnectionRegistry, SharedRegistry};
