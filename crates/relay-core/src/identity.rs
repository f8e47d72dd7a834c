//! Peer and connection identifiers

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identity of a remote participant.
///
/// Unlike [`ConnectionId`], an identity outlives a single session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(pub u64);

impl PeerIdentity {
    /// Derive an identity from a human-readable seed (first 8 bytes of SHA-256)
    pub fn derive(seed: &str) -> Self {
        let digest = Sha256::digest(seed.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        PeerIdentity(u64::from_be_bytes(bytes))
    }

    /// Whether this is the zero (unset) identity
    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for PeerIdentity {
    fn from(value: u64) -> Self {
        PeerIdentity(value)
    }
}

/// Session-scoped connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// Id under which a client reports everything coming from its server
    pub const SERVER: ConnectionId = ConnectionId(0);
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for ConnectionId {
    fn from(value: u32) -> Self {
        ConnectionId(value)
    }
}
