//! Test doubles

use relay_core::sync::lock;
use relay_core::{ConnectionId, PeerIdentity, RelayError, ReliabilityLevel, Result};
use relay_transport::RelayConnection;
use std::sync::{Arc, Mutex};

/// Connection that records every call made on it
pub struct FakeConnection {
    pub id: ConnectionId,
    pub identity: PeerIdentity,
    pub calls: Mutex<Vec<String>>,
}

impl FakeConnection {
    pub fn new(id: u32, identity: u64) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId(id),
            identity: PeerIdentity(identity),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn is_closed(&self) -> bool {
        lock(&self.calls).iter().any(|c| c == "close")
    }
}

impl RelayConnection for FakeConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_identity(&self) -> PeerIdentity {
        self.identity
    }

    fn send(&self, _data: &[u8], _reliability: ReliabilityLevel) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::ConnectionClosed(self.id.0));
        }
        lock(&self.calls).push("send".into());
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        lock(&self.calls).push("flush".into());
        Ok(())
    }

    fn close(&self) {
        lock(&self.calls).push("close".into());
    }
}
