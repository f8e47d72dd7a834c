//! Client side: one outbound connection to a server peer
//!
//! Everything the connector reports uses [`ConnectionId::SERVER`], whatever
//! id the transport gave the connection.

use crate::event_bridge::EventBridge;
use relay_core::{ConnectionId, NetworkEvent, PeerIdentity, Result};
use relay_transport::{
    ConnectionInfo, DialerCallbacks, RelayConnection, RelayDialer, RelayTransport,
};
use std::sync::Arc;
use tracing::info;

/// Lifecycle of a [`Connector`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// Owns the transport dialer while acting as a client
pub struct Connector {
    dialer: Option<Box<dyn RelayDialer>>,
    events: EventBridge,
    state: ConnectorState,
    target: Option<PeerIdentity>,
}

impl Connector {
    pub fn new(events: EventBridge) -> Self {
        Self {
            dialer: None,
            events,
            state: ConnectorState::Idle,
            target: None,
        }
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    /// Peer this connector dialed
    pub fn target(&self) -> Option<PeerIdentity> {
        self.target
    }

    /// Dial `target`. Establishment is reported later through a `Connected` event.
    pub fn connect(&mut self, transport: &dyn RelayTransport, target: PeerIdentity) -> Result<()> {
        let dialer = transport.open_dialer(target)?;
        self.dialer = Some(dialer);
        self.target = Some(target);
        self.state = ConnectorState::Connecting;
        Ok(())
    }

    /// Drain the dialer's pending callbacks.
    ///
    /// Once the server connection is reported lost the dialer is released.
    pub fn pump(&mut self) -> Result<()> {
        let Some(dialer) = self.dialer.as_mut() else {
            return Ok(());
        };
        let mut callbacks = ConnectorCallbacks {
            events: &self.events,
            state: &mut self.state,
        };
        let result = dialer.receive(&mut callbacks);

        if self.state == ConnectorState::Closed {
            if let Some(mut dialer) = self.dialer.take() {
                dialer.close();
            }
        }
        result
    }

    /// Whether the connector still holds a dialer
    pub fn has_dialer(&self) -> bool {
        self.dialer.is_some()
    }

    /// The outbound connection, while one is open
    pub fn connection(&self) -> Option<Arc<dyn RelayConnection>> {
        match self.state {
            ConnectorState::Connecting | ConnectorState::Connected => {
                self.dialer.as_ref().map(|d| d.connection())
            }
            ConnectorState::Idle | ConnectorState::Closed => None,
        }
    }

    pub fn close(&mut self) {
        if let Some(mut dialer) = self.dialer.take() {
            dialer.close();
        }
        self.state = ConnectorState::Closed;
    }
}

struct ConnectorCallbacks<'a> {
    events: &'a EventBridge,
    state: &'a mut ConnectorState,
}

impl DialerCallbacks for ConnectorCallbacks<'_> {
    fn on_connected(&mut self, info: &ConnectionInfo) {
        if *self.state == ConnectorState::Connected {
            return;
        }
        *self.state = ConnectorState::Connected;
        info!("Connected to server peer {}", info.identity);
        self.events.enqueue(NetworkEvent::Connected {
            connection: ConnectionId::SERVER,
        });
    }

    fn on_disconnected(&mut self, info: &ConnectionInfo) {
        if *self.state == ConnectorState::Closed {
            return;
        }
        *self.state = ConnectorState::Closed;
        info!("Disconnected from server peer {}", info.identity);
        self.events.enqueue(NetworkEvent::Disconnected {
            connection: ConnectionId::SERVER,
        });
    }

    fn on_message(&mut self, data: &[u8]) {
        self.events
            .enqueue(NetworkEvent::message(ConnectionId::SERVER, data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ReliabilityLevel;
    use relay_transport::{LoopbackNetwork, RelayListener};

    struct AcceptAll;

    impl relay_transport::ListenerCallbacks for AcceptAll {
        fn on_connecting(&mut self, _info: &ConnectionInfo) -> bool {
            true
        }
        fn on_connected(&mut self, _connection: Arc<dyn RelayConnection>, _info: &ConnectionInfo) {}
        fn on_disconnected(&mut self, _info: &ConnectionInfo) {}
        fn on_message(&mut self, _connection: ConnectionId, _data: &[u8]) {}
    }

    fn server(network: &LoopbackNetwork) -> Box<dyn RelayListener> {
        network
            .transport(PeerIdentity(1))
            .open_listener(PeerIdentity(1))
            .unwrap()
    }

    #[test]
    fn test_connect_failure_stays_idle() {
        let network = LoopbackNetwork::new();
        let transport = network.transport(PeerIdentity(2));
        let mut connector = Connector::new(EventBridge::new());

        assert!(connector.connect(&transport, PeerIdentity(1)).is_err());
        assert_eq!(connector.state(), ConnectorState::Idle);
        assert!(connector.connection().is_none());
    }

    #[test]
    fn test_events_use_server_id() {
        let network = LoopbackNetwork::new();
        let mut listener = server(&network);
        let transport = network.transport(PeerIdentity(2));
        let events = EventBridge::new();
        let mut connector = Connector::new(events.clone());

        connector.connect(&transport, PeerIdentity(1)).unwrap();
        assert_eq!(connector.state(), ConnectorState::Connecting);
        assert_eq!(connector.target(), Some(PeerIdentity(1)));

        listener.receive(&mut AcceptAll).unwrap();
        let server_side = listener.connected().remove(0);
        server_side
            .send(b"welcome", ReliabilityLevel::Reliable)
            .unwrap();
        server_side.flush().unwrap();

        connector.pump().unwrap();
        assert_eq!(connector.state(), ConnectorState::Connected);
        assert_eq!(
            events.pop_event(),
            Some(NetworkEvent::Connected {
                connection: ConnectionId::SERVER
            })
        );
        assert_eq!(
            events.pop_event(),
            Some(NetworkEvent::message(ConnectionId::SERVER, b"welcome"))
        );

        server_side.close();
        connector.pump().unwrap();
        assert_eq!(connector.state(), ConnectorState::Closed);
        assert_eq!(
            events.pop_event(),
            Some(NetworkEvent::Disconnected {
                connection: ConnectionId::SERVER
            })
        );
        assert!(connector.connection().is_none());
        assert!(!connector.has_dialer());

        // Released dialer means later pumps are quiet
        connector.pump().unwrap();
        assert!(events.pop_event().is_none());
    }
}
