//! Transport facade consumed by the driver
//!
//! A relay transport hands out listeners (inbound) and dialers (outbound).
//! Neither invokes callbacks on its own: callbacks only run inside
//! `receive`, on the thread that calls it.

use relay_core::{ConnectionId, ConnectionStats, PeerIdentity, ReliabilityLevel, Result};
use std::sync::Arc;

/// What the transport knows about a connection when it reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection: ConnectionId,
    pub identity: PeerIdentity,
}

/// Handle to one established connection
pub trait RelayConnection: Send + Sync {
    /// Transport-assigned connection id
    fn id(&self) -> ConnectionId;

    /// Identity of the peer at the other end
    fn remote_identity(&self) -> PeerIdentity;

    /// Queue `data` for sending. Does not wait for delivery.
    fn send(&self, data: &[u8], reliability: ReliabilityLevel) -> Result<()>;

    /// Push queued outbound data onto the wire
    fn flush(&self) -> Result<()>;

    /// Close the connection. Idempotent.
    fn close(&self);

    /// Connection statistics, if the transport tracks them
    fn stats(&self) -> Option<ConnectionStats> {
        None
    }
}

/// Callbacks driven by [`RelayListener::receive`]
pub trait ListenerCallbacks {
    /// A peer is asking to connect; return `true` to accept
    fn on_connecting(&mut self, info: &ConnectionInfo) -> bool;

    /// A connection finished establishing
    fn on_connected(&mut self, connection: Arc<dyn RelayConnection>, info: &ConnectionInfo);

    /// A connection was lost (remote close, timeout or protocol error)
    fn on_disconnected(&mut self, info: &ConnectionInfo);

    /// A message arrived. `data` is only valid for the duration of the call.
    fn on_message(&mut self, connection: ConnectionId, data: &[u8]);
}

/// Callbacks driven by [`RelayDialer::receive`]
pub trait DialerCallbacks {
    fn on_connected(&mut self, info: &ConnectionInfo);

    fn on_disconnected(&mut self, info: &ConnectionInfo);

    /// A message arrived. `data` is only valid for the duration of the call.
    fn on_message(&mut self, data: &[u8]);
}

/// Listening socket accepting inbound connections
pub trait RelayListener: Send {
    /// Drain pending transport events, invoking `callbacks` synchronously
    fn receive(&mut self, callbacks: &mut dyn ListenerCallbacks) -> Result<()>;

    /// Connections the transport currently considers live
    fn connected(&self) -> Vec<Arc<dyn RelayConnection>>;

    /// Stop listening and close every connection
    fn close(&mut self);
}

/// Single outbound connection
pub trait RelayDialer: Send {
    /// Drain pending transport events, invoking `callbacks` synchronously
    fn receive(&mut self, callbacks: &mut dyn DialerCallbacks) -> Result<()>;

    /// The outbound connection
    fn connection(&self) -> Arc<dyn RelayConnection>;

    fn close(&mut self);
}

/// Relay transport the driver is built on
pub trait RelayTransport {
    /// Identity of the local user as known to the relay
    fn local_identity(&self) -> PeerIdentity;

    /// Prepare access to the relay network
    fn init_relay_access(&self) {}

    /// Size hint for per-connection send buffers
    fn set_send_buffer_size(&self, _bytes: usize) {}

    /// Open a listener bound to `local`
    fn open_listener(&self, local: PeerIdentity) -> Result<Box<dyn RelayListener>>;

    /// Open a connection to `target`
    fn open_dialer(&self, target: PeerIdentity) -> Result<Box<dyn RelayDialer>>;
}
