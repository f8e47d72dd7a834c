//! Hosting side: accepts inbound connections and feeds the event bridge

use crate::event_bridge::EventBridge;
use crate::registry::SharedRegistry;
use relay_core::sync::lock;
use relay_core::{ConnectionId, NetworkEvent, PeerIdentity, Result};
use relay_transport::{
    ConnectionInfo, ListenerCallbacks, RelayConnection, RelayListener, RelayTransport,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Lifecycle of an [`Acceptor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    Idle,
    Listening,
    Closed,
}

/// Owns the transport listener while hosting
pub struct Acceptor {
    listener: Option<Box<dyn RelayListener>>,
    registry: SharedRegistry,
    events: EventBridge,
    state: AcceptorState,
}

impl Acceptor {
    /// Create an idle acceptor that registers into `registry` and reports to `events`
    pub fn new(registry: SharedRegistry, events: EventBridge) -> Self {
        Self {
            listener: None,
            registry,
            events,
            state: AcceptorState::Idle,
        }
    }

    pub fn state(&self) -> AcceptorState {
        self.state
    }

    /// Open a listener bound to `local`. On failure the acceptor stays idle.
    pub fn listen(&mut self, transport: &dyn RelayTransport, local: PeerIdentity) -> Result<()> {
        let listener = transport.open_listener(local)?;
        self.listener = Some(listener);
        self.state = AcceptorState::Listening;
        Ok(())
    }

    /// Drain the listener's pending callbacks
    pub fn pump(&mut self) -> Result<()> {
        let Some(listener) = self.listener.as_mut() else {
            return Ok(());
        };
        let mut callbacks = AcceptorCallbacks {
            registry: &self.registry,
            events: &self.events,
        };
        listener.receive(&mut callbacks)
    }

    /// Connections the transport currently reports as live
    pub fn connected(&self) -> Vec<Arc<dyn RelayConnection>> {
        self.listener
            .as_ref()
            .map(|l| l.connected())
            .unwrap_or_default()
    }

    /// Find a live connection by id
    pub fn find_live(&self, connection: ConnectionId) -> Option<Arc<dyn RelayConnection>> {
        self.connected().into_iter().find(|c| c.id() == connection)
    }

    /// Close the listener and every connection it holds
    pub fn close(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            listener.close();
        }
        self.state = AcceptorState::Closed;
    }
}

/// Callback sink handed to the listener during a pump
struct AcceptorCallbacks<'a> {
    registry: &'a SharedRegistry,
    events: &'a EventBridge,
}

impl ListenerCallbacks for AcceptorCallbacks<'_> {
    fn on_connecting(&mut self, info: &ConnectionInfo) -> bool {
        if lock(self.registry).contains(info.connection) {
            debug!("Connection {} already registered", info.connection);
            return false;
        }
        info!("Accepting connection from peer {}", info.identity);
        true
    }

    fn on_connected(&mut self, connection: Arc<dyn RelayConnection>, info: &ConnectionInfo) {
        let registered = lock(self.registry).register(info.connection, info.identity, connection);
        if registered {
            info!("Connected with peer {} as {}", info.identity, info.connection);
            self.events.enqueue(NetworkEvent::Connected {
                connection: info.connection,
            });
        } else {
            debug!("Duplicate connect for {}, ignoring", info.connection);
        }
    }

    fn on_disconnected(&mut self, info: &ConnectionInfo) {
        lock(self.registry).remove(info.connection);
        info!("Disconnected peer {} ({})", info.identity, info.connection);
        self.events.enqueue(NetworkEvent::Disconnected {
            connection: info.connection,
        });
    }

    fn on_message(&mut self, connection: ConnectionId, data: &[u8]) {
        self.events.enqueue(NetworkEvent::message(connection, data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use crate::testing::FakeConnection;
    use relay_transport::LoopbackNetwork;

    fn info(id: u32) -> ConnectionInfo {
        ConnectionInfo {
            connection: ConnectionId(id),
            identity: PeerIdentity(u64::from(id) + 1000),
        }
    }

    #[test]
    fn test_duplicate_connected_is_noop() {
        let registry = ConnectionRegistry::shared();
        let events = EventBridge::new();
        let mut callbacks = AcceptorCallbacks {
            registry: &registry,
            events: &events,
        };

        callbacks.on_connected(FakeConnection::new(1, 1001), &info(1));
        callbacks.on_connected(FakeConnection::new(1, 1001), &info(1));

        assert_eq!(lock(&registry).len(), 1);
        assert_eq!(events.len(), 1);
        assert!(!callbacks.on_connecting(&info(1)));
        assert!(callbacks.on_connecting(&info(2)));
    }

    #[test]
    fn test_disconnect_removes_and_reports() {
        let registry = ConnectionRegistry::shared();
        let events = EventBridge::new();
        let mut callbacks = AcceptorCallbacks {
            registry: &registry,
            events: &events,
        };

        callbacks.on_connected(FakeConnection::new(4, 1004), &info(4));
        callbacks.on_disconnected(&info(4));

        assert!(lock(&registry).is_empty());
        assert_eq!(
            events.pop_event(),
            Some(NetworkEvent::Connected {
                connection: ConnectionId(4)
            })
        );
        assert_eq!(
            events.pop_event(),
            Some(NetworkEvent::Disconnected {
                connection: ConnectionId(4)
            })
        );
    }

    #[test]
    fn test_message_is_copied() {
        let registry = ConnectionRegistry::shared();
        let events = EventBridge::new();
        let mut callbacks = AcceptorCallbacks {
            registry: &registry,
            events: &events,
        };

        let mut buffer = b"first".to_vec();
        callbacks.on_message(ConnectionId(1), &buffer);
        buffer.copy_from_slice(b"again");
        callbacks.on_message(ConnectionId(1), &buffer);
        drop(buffer);

        assert_eq!(
            events.pop_event().unwrap().payload(),
            Some(&b"first"[..])
        );
        assert_eq!(
            events.pop_event().unwrap().payload(),
            Some(&b"again"[..])
        );
    }

    #[test]
    fn test_listen_failure_stays_idle() {
        let network = LoopbackNetwork::new();
        let transport = network.transport(PeerIdentity(1));
        let _taken = transport.open_listener(PeerIdentity(1)).unwrap();

        let mut acceptor = Acceptor::new(ConnectionRegistry::shared(), EventBridge::new());
        assert!(acceptor.listen(&transport, PeerIdentity(1)).is_err());
        assert_eq!(acceptor.state(), AcceptorState::Idle);
        assert!(acceptor.connected().is_empty());
        assert!(acceptor.pump().is_ok());
    }

    #[test]
    fn test_pump_registers_inbound() {
        let network = LoopbackNetwork::new();
        let host = network.transport(PeerIdentity(1));
        let guest = network.transport(PeerIdentity(2));

        let registry = ConnectionRegistry::shared();
        let events = EventBridge::new();
        let mut acceptor = Acceptor::new(registry.clone(), events.clone());
        acceptor.listen(&host, PeerIdentity(1)).unwrap();
        assert_eq!(acceptor.state(), AcceptorState::Listening);

        let _dialer = guest.open_dialer(PeerIdentity(1)).unwrap();
        acceptor.pump().unwrap();

        let record = lock(&registry).lookup(ConnectionId(1)).cloned().unwrap();
        assert_eq!(record.identity, PeerIdentity(2));
        assert!(acceptor.find_live(ConnectionId(1)).is_some());
        assert_eq!(
            events.pop_event(),
            Some(NetworkEvent::Connected {
                connection: ConnectionId(1)
            })
        );

        acceptor.close();
        assert_eq!(acceptor.state(), AcceptorState::Closed);
        assert!(!network.is_listening(PeerIdentity(1)));
    }
}
