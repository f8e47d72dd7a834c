//! # relay-core
//!
//! Core types shared by the relay transport driver crates.
//!
//! This crate provides:
//! - Peer and connection identifiers
//! - Channel kinds and their mapping onto transport reliability
//! - Network events handed to the host application
//! - Driver configuration and statistics
//! - The error type used across the workspace

pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod stats;
pub mod sync;

pub use channel::{ChannelKind, ReliabilityLevel};
pub use config::DriverConfig;
pub use error::{RelayError, Result};
pub use event::{NetworkEvent, NetworkEventKind};
pub use identity::{ConnectionId, PeerIdentity};
pub use stats::{ConnectionStats, DriverStats};
