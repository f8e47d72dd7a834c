//! Relay network driver
//!
//! The host application calls [`RelayDriver::pump`] and drains
//! [`RelayDriver::pop_event`] once per tick, and calls connect, send and
//! disconnect on demand. Nothing here is fatal: failures come back as
//! `false`, a silent no-op, or the unknown stats sentinel, and are logged.

use crate::acceptor::Acceptor;
use crate::connector::{Connector, ConnectorState};
use crate::event_bridge::EventBridge;
use crate::registry::{ConnectionRecord, ConnectionRegistry, SharedRegistry};
use relay_core::stats::rtt_millis;
use relay_core::sync::lock;
use relay_core::{
    ChannelKind, ConnectionId, DriverConfig, DriverStats, NetworkEvent, PeerIdentity,
};
use relay_transport::{RelayConnection, RelayTransport};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Name reported by [`RelayDriver::driver_name`]
pub const DRIVER_NAME: &str = "RelayNetworkDriver";

/// What the driver is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Uninitialized,
    Hosting,
    Connecting,
    Active,
}

/// Bytes handed to and received from the transport
#[derive(Debug, Default)]
struct Traffic {
    per_connection: HashMap<ConnectionId, (u64, u64)>,
    total_sent: u64,
    total_received: u64,
}

impl Traffic {
    fn record_sent(&mut self, connection: ConnectionId, bytes: usize) {
        self.per_connection.entry(connection).or_default().0 += bytes as u64;
        self.total_sent += bytes as u64;
    }

    /// Count received bytes; per-connection only for connections still tracked
    fn record_received(&mut self, connection: Option<ConnectionId>, bytes: usize) {
        if let Some(connection) = connection {
            self.per_connection.entry(connection).or_default().1 += bytes as u64;
        }
        self.total_received += bytes as u64;
    }

    fn connection(&self, connection: ConnectionId) -> (u64, u64) {
        self.per_connection
            .get(&connection)
            .copied()
            .unwrap_or_default()
    }

    fn forget(&mut self, connection: ConnectionId) {
        self.per_connection.remove(&connection);
    }
}

/// Network driver over a relay transport
pub struct RelayDriver<T: RelayTransport> {
    transport: T,
    config: Option<DriverConfig>,
    local_identity: PeerIdentity,
    target_identity: Option<PeerIdentity>,
    role: Role,
    registry: SharedRegistry,
    events: EventBridge,
    acceptor: Option<Acceptor>,
    connector: Option<Connector>,
    traffic: Traffic,
}

impl<T: RelayTransport> RelayDriver<T> {
    /// Create a driver over `transport`. Call `initialize` before anything else.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            config: None,
            local_identity: PeerIdentity::default(),
            target_identity: None,
            role: Role::Uninitialized,
            registry: ConnectionRegistry::shared(),
            events: EventBridge::new(),
            acceptor: None,
            connector: None,
            traffic: Traffic::default(),
        }
    }

    pub fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_identity(&self) -> PeerIdentity {
        self.local_identity
    }

    pub fn is_initialized(&self) -> bool {
        self.config.is_some()
    }

    /// Lifecycle of the client connection, if one was started
    pub fn connector_state(&self) -> Option<ConnectorState> {
        self.connector.as_ref().map(|c| c.state())
    }

    /// Record configuration and prepare the transport.
    ///
    /// Expected to be called once. Returns `false` if no local identity can
    /// be determined.
    pub fn initialize(&mut self, config: DriverConfig) -> bool {
        let local = if config.local_identity.is_unset() {
            self.transport.local_identity()
        } else {
            config.local_identity
        };
        if local.is_unset() {
            error!("No local identity configured and transport has none");
            return false;
        }

        self.transport
            .set_send_buffer_size(config.effective_send_buffer_size());
        self.transport.init_relay_access();

        self.local_identity = local;
        if config.target_identity.is_some() {
            self.target_identity = config.target_identity;
        }
        info!(
            "{} initialized as {} (message size {})",
            DRIVER_NAME, local, config.message_size
        );
        self.config = Some(config);
        true
    }

    /// Peer dialed by [`connect`](Self::connect)
    pub fn set_target_identity(&mut self, target: PeerIdentity) {
        self.target_identity = Some(target);
    }

    /// Start hosting. Valid only while uninitialized.
    pub fn listen(&mut self) -> bool {
        if !self.is_initialized() {
            error!("listen called before initialize");
            return false;
        }
        if self.role != Role::Uninitialized {
            warn!("listen called while {:?}", self.role);
            return false;
        }

        let mut acceptor = Acceptor::new(self.registry.clone(), self.events.clone());
        if let Err(e) = acceptor.listen(&self.transport, self.local_identity) {
            error!("Failed to initialize listener: {}", e);
            return false;
        }

        self.acceptor = Some(acceptor);
        self.role = Role::Hosting;
        info!("Created relay listener for {}", self.local_identity);
        true
    }

    /// Connect to the configured target identity
    pub fn connect(&mut self) -> bool {
        match self.target_identity {
            Some(target) => self.connect_to(target),
            None => {
                error!("connect called without a target identity");
                false
            }
        }
    }

    /// Connect to `target`.
    ///
    /// Returns once the dial is issued; establishment arrives later as a
    /// `Connected` event from [`ConnectionId::SERVER`].
    pub fn connect_to(&mut self, target: PeerIdentity) -> bool {
        if !self.is_initialized() {
            error!("connect called before initialize");
            return false;
        }
        if self.role != Role::Uninitialized {
            warn!("connect called while {:?}", self.role);
            return false;
        }

        self.role = Role::Connecting;
        let mut connector = Connector::new(self.events.clone());
        if let Err(e) = connector.connect(&self.transport, target) {
            error!("Failed to connect to {}: {}", target, e);
            self.role = Role::Uninitialized;
            return false;
        }

        self.target_identity = Some(target);
        self.connector = Some(connector);
        self.role = Role::Active;
        info!("Connecting to {}", target);
        true
    }

    /// Tear down every connection and return to `Uninitialized`.
    /// Safe to call when nothing is connected.
    pub fn disconnect(&mut self) {
        if let Some(mut acceptor) = self.acceptor.take() {
            acceptor.close();
            info!("Closed relay listener");
        }
        if let Some(mut connector) = self.connector.take() {
            connector.close();
            info!("Closed connection to server");
        }
        lock(&self.registry).clear();
        self.traffic.per_connection.clear();
        self.role = Role::Uninitialized;
    }

    /// Flush and close one hosted connection. Unknown ids are ignored.
    pub fn disconnect_connection(&mut self, connection: ConnectionId) {
        let record = lock(&self.registry).lookup(connection).cloned();
        if let Some(record) = record {
            close_flushed(record.handle.as_ref());
            lock(&self.registry).remove(connection);
            self.traffic.forget(connection);
            info!("Disconnected {} ({})", connection, record.identity);
            return;
        }

        // Registry and transport can briefly disagree; ask the listener too
        let live = self
            .acceptor
            .as_ref()
            .and_then(|acceptor| acceptor.find_live(connection));
        match live {
            Some(handle) => {
                close_flushed(handle.as_ref());
                lock(&self.registry).remove(connection);
                self.traffic.forget(connection);
                info!("Disconnected unregistered connection {}", connection);
            }
            None => trace!("disconnect of unknown connection {} ignored", connection),
        }
    }

    /// Drain transport callbacks into the event queue. Call once per tick.
    ///
    /// Transport errors are logged and the tick continues.
    pub fn pump(&mut self) {
        if let Some(acceptor) = self.acceptor.as_mut() {
            if let Err(e) = acceptor.pump() {
                warn!("Error receiving data on listener: {}", e);
            }
        }
        if let Some(connector) = self.connector.as_mut() {
            if let Err(e) = connector.pump() {
                warn!("Error receiving data on connection: {}", e);
            }
        }
    }

    /// Take the next event, oldest first
    pub fn pop_event(&mut self) -> Option<NetworkEvent> {
        let event = self.events.pop_event()?;
        match &event {
            NetworkEvent::Message {
                connection,
                payload,
            } => {
                let tracked = *connection == ConnectionId::SERVER
                    || lock(&self.registry).contains(*connection);
                self.traffic
                    .record_received(tracked.then_some(*connection), payload.len());
            }
            NetworkEvent::Disconnected { connection } => self.traffic.forget(*connection),
            NetworkEvent::Connected { .. } => {}
        }
        Some(event)
    }

    /// Send to the server. Only valid as a client; ignored while hosting.
    pub fn send(&mut self, channel: ChannelKind, payload: &[u8]) {
        if self.role != Role::Active {
            trace!("client send ignored while {:?}", self.role);
            return;
        }
        let Some(handle) = self.connector.as_ref().and_then(|c| c.connection()) else {
            trace!("client send ignored, no server connection");
            return;
        };
        self.transmit(handle.as_ref(), ConnectionId::SERVER, channel, payload);
    }

    /// Send to one hosted connection. Ignored if not hosting or not connected.
    pub fn send_to(&mut self, channel: ChannelKind, payload: &[u8], target: ConnectionId) {
        if self.role != Role::Hosting {
            trace!("host send ignored while {:?}", self.role);
            return;
        }
        let live = self
            .acceptor
            .as_ref()
            .and_then(|acceptor| acceptor.find_live(target));
        match live {
            Some(handle) => self.transmit(handle.as_ref(), target, channel, payload),
            None => trace!("send to {} skipped, not connected", target),
        }
    }

    /// Send to every currently connected id in `targets`; others are skipped
    pub fn send_to_many(&mut self, channel: ChannelKind, payload: &[u8], targets: &[ConnectionId]) {
        if self.role != Role::Hosting {
            trace!("host send ignored while {:?}", self.role);
            return;
        }
        let live = self
            .acceptor
            .as_ref()
            .map(|acceptor| acceptor.connected())
            .unwrap_or_default();
        for handle in live {
            let id = handle.id();
            if targets.contains(&id) {
                self.transmit(handle.as_ref(), id, channel, payload);
            }
        }
    }

    fn transmit(
        &mut self,
        handle: &dyn RelayConnection,
        key: ConnectionId,
        channel: ChannelKind,
        payload: &[u8],
    ) {
        if let Some(config) = &self.config {
            if payload.len() > config.message_size {
                warn!(
                    "Message of {} bytes exceeds advisory size {}",
                    payload.len(),
                    config.message_size
                );
            }
        }

        match handle.send(payload, channel.reliability()) {
            Ok(()) => self.traffic.record_sent(key, payload.len()),
            Err(e) => debug!("Send to {} failed: {}", key, e),
        }
    }

    /// Registry record for a hosted connection
    pub fn lookup(&self, connection: ConnectionId) -> Option<ConnectionRecord> {
        lock(&self.registry).lookup(connection).cloned()
    }

    /// All registered hosted connections
    pub fn connections(&self) -> Vec<ConnectionRecord> {
        lock(&self.registry)
            .all_connections()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Aggregate statistics. RTT is the mean over connections that report
    /// one, or `-1` when none do.
    pub fn get_stats(&self) -> DriverStats {
        let handles: Vec<Arc<dyn RelayConnection>> = match self.role {
            Role::Hosting => self
                .acceptor
                .as_ref()
                .map(|a| a.connected())
                .unwrap_or_default(),
            Role::Active | Role::Connecting => self
                .connector
                .as_ref()
                .and_then(|c| c.connection())
                .into_iter()
                .collect(),
            Role::Uninitialized => Vec::new(),
        };

        let rtts: Vec<f32> = handles
            .iter()
            .filter_map(|h| h.stats().and_then(|s| s.rtt))
            .map(|rtt| rtt_millis(Some(rtt)))
            .collect();
        let rtt_ms = if rtts.is_empty() {
            -1.0
        } else {
            rtts.iter().sum::<f32>() / rtts.len() as f32
        };

        DriverStats {
            rtt_ms,
            total_data_sent: self.traffic.total_sent,
            total_data_received: self.traffic.total_received,
        }
    }

    /// Statistics for one connection, or the unknown sentinel if it is not live
    pub fn get_stats_for(&self, connection: ConnectionId) -> DriverStats {
        let Some(handle) = self.live_connection(connection) else {
            return DriverStats::UNKNOWN;
        };

        let (sent, received) = self.traffic.connection(connection);
        DriverStats {
            rtt_ms: rtt_millis(handle.stats().and_then(|s| s.rtt)),
            total_data_sent: sent,
            total_data_received: received,
        }
    }

    fn live_connection(&self, connection: ConnectionId) -> Option<Arc<dyn RelayConnection>> {
        match self.role {
            Role::Hosting => lock(&self.registry)
                .lookup(connection)
                .map(|r| r.handle.clone())
                .or_else(|| self.acceptor.as_ref()?.find_live(connection)),
            Role::Active | Role::Connecting if connection == ConnectionId::SERVER => {
                self.connector.as_ref()?.connection()
            }
            _ => None,
        }
    }

    /// Close everything; equivalent to `disconnect`
    pub fn shutdown(&mut self) {
        self.disconnect();
    }
}

impl<T: RelayTransport> Drop for RelayDriver<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn close_flushed(handle: &dyn RelayConnection) {
    if let Err(e) = handle.flush() {
        debug!("Flush before close on {} failed: {}", handle.id(), e);
    }
    handle.close();
}
