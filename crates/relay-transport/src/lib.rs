//! Relay transport facade and implementations
//!
//! This crate provides:
//! - The facade traits the driver consumes (`RelayTransport`, `RelayListener`,
//!   `RelayDialer`, `RelayConnection`) and the callback traits they drive
//! - An in-process loopback transport for tests and local sessions
//! - A TCP relay transport backed by tokio, with MessagePack framing

pub mod facade;
pub mod frame;
pub mod loopback;
pub mod tcp;

pub use facade::{
    ConnectionInfo, DialerCallbacks, ListenerCallbacks, RelayConnection, RelayDialer,
    RelayListener, RelayTransport,
};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use tcp::{TcpRelayConfig, TcpRelayTransport};
