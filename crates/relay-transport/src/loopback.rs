//! In-process loopback transport
//!
//! A shared `LoopbackNetwork` broker routes connections between transports
//! by identity. Sends are buffered per side and delivered when the sender
//! flushes or pumps its own endpoint, so a close without a flush loses data
//! the way a real relay does.

use crate::facade::{
    ConnectionInfo, DialerCallbacks, ListenerCallbacks, RelayConnection, RelayDialer,
    RelayListener, RelayTransport,
};
use relay_core::sync::lock;
use relay_core::{
    ConnectionId, ConnectionStats, PeerIdentity, RelayError, ReliabilityLevel, Result,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

type Inbox<T> = Arc<Mutex<VecDeque<T>>>;

enum ListenerEvent {
    Incoming(Arc<Link>),
    Message(ConnectionId, Vec<u8>),
    Closed(ConnectionId),
}

enum DialerEvent {
    Accepted,
    Message(Vec<u8>),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Listener,
    Dialer,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Listener => 0,
            Side::Dialer => 1,
        }
    }
}

/// Both ends of one loopback connection
struct Link {
    id: ConnectionId,
    listener_identity: PeerIdentity,
    dialer_identity: PeerIdentity,
    listener_inbox: Inbox<ListenerEvent>,
    dialer_inbox: Inbox<DialerEvent>,
    closed_by: Mutex<Option<Side>>,
    outbound: [Mutex<Vec<Vec<u8>>>; 2],
    stats: [Mutex<ConnectionStats>; 2],
}

impl Link {
    fn closed_by(&self) -> Option<Side> {
        *lock(&self.closed_by)
    }

    fn send(&self, side: Side, data: &[u8]) -> Result<()> {
        if self.closed_by().is_some() {
            return Err(RelayError::ConnectionClosed(self.id.0));
        }
        lock(&self.outbound[side.index()]).push(data.to_vec());
        lock(&self.stats[side.index()]).bytes_sent += data.len() as u64;
        Ok(())
    }

    fn flush(&self, side: Side) {
        let pending: Vec<Vec<u8>> = lock(&self.outbound[side.index()]).drain(..).collect();
        if pending.is_empty() || self.closed_by().is_some() {
            return;
        }

        let delivered: u64 = pending.iter().map(|p| p.len() as u64).sum();
        match side {
            Side::Listener => {
                let mut inbox = lock(&self.dialer_inbox);
                inbox.extend(pending.into_iter().map(DialerEvent::Message));
                lock(&self.stats[Side::Dialer.index()]).bytes_received += delivered;
            }
            Side::Dialer => {
                let mut inbox = lock(&self.listener_inbox);
                inbox.extend(
                    pending
                        .into_iter()
                        .map(|p| ListenerEvent::Message(self.id, p)),
                );
                lock(&self.stats[Side::Listener.index()]).bytes_received += delivered;
            }
        }
    }

    fn close(&self, side: Side) {
        {
            let mut closed_by = lock(&self.closed_by);
            if closed_by.is_some() {
                return;
            }
            *closed_by = Some(side);
        }

        // Anything not flushed yet is lost
        lock(&self.outbound[side.index()]).clear();

        match side {
            Side::Listener => lock(&self.dialer_inbox).push_back(DialerEvent::Closed),
            Side::Dialer => lock(&self.listener_inbox).push_back(ListenerEvent::Closed(self.id)),
        }
        debug!("Loopback connection {} closed by {:?}", self.id, side);
    }

    fn info(&self, side: Side) -> ConnectionInfo {
        ConnectionInfo {
            connection: self.id,
            identity: match side {
                Side::Listener => self.dialer_identity,
                Side::Dialer => self.listener_identity,
            },
        }
    }
}

/// One side's handle onto a [`Link`]
struct LoopbackConnection {
    link: Arc<Link>,
    side: Side,
}

impl RelayConnection for LoopbackConnection {
    fn id(&self) -> ConnectionId {
        self.link.id
    }

    fn remote_identity(&self) -> PeerIdentity {
        self.link.info(self.side).identity
    }

    fn send(&self, data: &[u8], reliability: ReliabilityLevel) -> Result<()> {
        trace!(
            "Loopback send {} bytes on {} ({:?})",
            data.len(),
            self.link.id,
            reliability
        );
        self.link.send(self.side, data)
    }

    fn flush(&self) -> Result<()> {
        self.link.flush(self.side);
        Ok(())
    }

    fn close(&self) {
        self.link.close(self.side);
    }

    fn stats(&self) -> Option<ConnectionStats> {
        Some(*lock(&self.link.stats[self.side.index()]))
    }
}

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<PeerIdentity, Inbox<ListenerEvent>>,
    next_connection: u32,
}

/// Shared broker routing connections between loopback transports
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport for `identity` attached to this network
    pub fn transport(&self, identity: PeerIdentity) -> LoopbackTransport {
        LoopbackTransport {
            identity,
            network: self.clone(),
            fail_next_receive: Arc::new(AtomicBool::new(false)),
            relay_ready: AtomicBool::new(false),
            send_buffer_size: AtomicUsize::new(0),
        }
    }

    /// Whether someone is listening under `identity`
    pub fn is_listening(&self, identity: PeerIdentity) -> bool {
        lock(&self.state).listeners.contains_key(&identity)
    }

    fn next_connection_id(&self) -> ConnectionId {
        let mut state = lock(&self.state);
        // Id 0 is reserved for the client's view of its server
        state.next_connection += 1;
        ConnectionId(state.next_connection)
    }
}

/// Loopback transport for one local identity
pub struct LoopbackTransport {
    identity: PeerIdentity,
    network: LoopbackNetwork,
    fail_next_receive: Arc<AtomicBool>,
    relay_ready: AtomicBool,
    send_buffer_size: AtomicUsize,
}

impl LoopbackTransport {
    /// Make the next `receive` on any endpoint of this transport fail once.
    /// Pending events stay queued for the following call.
    pub fn fail_next_receive(&self) {
        self.fail_next_receive.store(true, Ordering::SeqCst);
    }

    /// Whether `init_relay_access` has been called
    pub fn relay_ready(&self) -> bool {
        self.relay_ready.load(Ordering::SeqCst)
    }

    /// Last value passed to `set_send_buffer_size`
    pub fn send_buffer_size(&self) -> usize {
        self.send_buffer_size.load(Ordering::SeqCst)
    }
}

impl RelayTransport for LoopbackTransport {
    fn local_identity(&self) -> PeerIdentity {
        self.identity
    }

    fn init_relay_access(&self) {
        self.relay_ready.store(true, Ordering::SeqCst);
    }

    fn set_send_buffer_size(&self, bytes: usize) {
        self.send_buffer_size.store(bytes, Ordering::SeqCst);
    }

    fn open_listener(&self, local: PeerIdentity) -> Result<Box<dyn RelayListener>> {
        let inbox: Inbox<ListenerEvent> = Arc::new(Mutex::new(VecDeque::new()));
        {
            let mut state = lock(&self.network.state);
            if state.listeners.contains_key(&local) {
                return Err(RelayError::Setup(format!(
                    "{} is already listening",
                    local
                )));
            }
            state.listeners.insert(local, inbox.clone());
        }

        debug!("Loopback listener open for {}", local);
        Ok(Box::new(LoopbackListener {
            identity: local,
            network: self.network.clone(),
            inbox,
            connected: Vec::new(),
            fail_next_receive: self.fail_next_receive.clone(),
            closed: false,
        }))
    }

    fn open_dialer(&self, target: PeerIdentity) -> Result<Box<dyn RelayDialer>> {
        let listener_inbox = lock(&self.network.state)
            .listeners
            .get(&target)
            .cloned()
            .ok_or_else(|| RelayError::Setup(format!("No listener for {}", target)))?;

        let link = Arc::new(Link {
            id: self.network.next_connection_id(),
            listener_identity: target,
            dialer_identity: self.identity,
            listener_inbox: listener_inbox.clone(),
            dialer_inbox: Arc::new(Mutex::new(VecDeque::new())),
            closed_by: Mutex::new(None),
            outbound: [Mutex::new(Vec::new()), Mutex::new(Vec::new())],
            stats: [
                Mutex::new(ConnectionStats::default()),
                Mutex::new(ConnectionStats::default()),
            ],
        });

        lock(&listener_inbox).push_back(ListenerEvent::Incoming(link.clone()));
        debug!("Loopback dial {} -> {} as {}", self.identity, target, link.id);

        Ok(Box::new(LoopbackDialer {
            link,
            fail_next_receive: self.fail_next_receive.clone(),
        }))
    }
}

struct LoopbackListener {
    identity: PeerIdentity,
    network: LoopbackNetwork,
    inbox: Inbox<ListenerEvent>,
    connected: Vec<Arc<Link>>,
    fail_next_receive: Arc<AtomicBool>,
    closed: bool,
}

impl RelayListener for LoopbackListener {
    fn receive(&mut self, callbacks: &mut dyn ListenerCallbacks) -> Result<()> {
        if self.fail_next_receive.swap(false, Ordering::SeqCst) {
            return Err(RelayError::Transport("injected receive failure".into()));
        }
        if self.closed {
            return Ok(());
        }

        for link in &self.connected {
            link.flush(Side::Listener);
        }

        let pending: Vec<ListenerEvent> = lock(&self.inbox).drain(..).collect();
        for event in pending {
            match event {
                ListenerEvent::Incoming(link) => {
                    if link.closed_by().is_some() {
                        continue;
                    }
                    let info = link.info(Side::Listener);
                    if callbacks.on_connecting(&info) {
                        self.connected.push(link.clone());
                        lock(&link.dialer_inbox).push_back(DialerEvent::Accepted);
                        let handle = Arc::new(LoopbackConnection {
                            link,
                            side: Side::Listener,
                        });
                        callbacks.on_connected(handle, &info);
                    } else {
                        link.close(Side::Listener);
                    }
                }
                ListenerEvent::Message(id, payload) => {
                    // Data still queued for a link we closed ourselves is dropped
                    let live = self
                        .connected
                        .iter()
                        .any(|l| l.id == id && l.closed_by() != Some(Side::Listener));
                    if live {
                        callbacks.on_message(id, &payload);
                    }
                }
                ListenerEvent::Closed(id) => {
                    if let Some(pos) = self.connected.iter().position(|l| l.id == id) {
                        let link = self.connected.remove(pos);
                        callbacks.on_disconnected(&link.info(Side::Listener));
                    }
                }
            }
        }

        self.connected
            .retain(|link| link.closed_by() != Some(Side::Listener));
        Ok(())
    }

    fn connected(&self) -> Vec<Arc<dyn RelayConnection>> {
        self.connected
            .iter()
            .filter(|link| link.closed_by() != Some(Side::Listener))
            .map(|link| {
                Arc::new(LoopbackConnection {
                    link: link.clone(),
                    side: Side::Listener,
                }) as Arc<dyn RelayConnection>
            })
            .collect()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        lock(&self.network.state).listeners.remove(&self.identity);

        for event in lock(&self.inbox).drain(..) {
            if let ListenerEvent::Incoming(link) = event {
                link.close(Side::Listener);
            }
        }
        for link in self.connected.drain(..) {
            link.close(Side::Listener);
        }
        debug!("Loopback listener for {} closed", self.identity);
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.close();
    }
}

struct LoopbackDialer {
    link: Arc<Link>,
    fail_next_receive: Arc<AtomicBool>,
}

impl RelayDialer for LoopbackDialer {
    fn receive(&mut self, callbacks: &mut dyn DialerCallbacks) -> Result<()> {
        if self.fail_next_receive.swap(false, Ordering::SeqCst) {
            return Err(RelayError::Transport("injected receive failure".into()));
        }

        self.link.flush(Side::Dialer);

        let info = self.link.info(Side::Dialer);
        let pending: Vec<DialerEvent> = lock(&self.link.dialer_inbox).drain(..).collect();
        for event in pending {
            match event {
                DialerEvent::Accepted => callbacks.on_connected(&info),
                DialerEvent::Message(payload) => callbacks.on_message(&payload),
                DialerEvent::Closed => callbacks.on_disconnected(&info),
            }
        }
        Ok(())
    }

    fn connection(&self) -> Arc<dyn RelayConnection> {
        Arc::new(LoopbackConnection {
            link: self.link.clone(),
            side: Side::Dialer,
        })
    }

    fn close(&mut self) {
        self.link.close(Side::Dialer);
    }
}

impl Drop for LoopbackDialer {
    fn drop(&mut self) {
        self.link.close(Side::Dialer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        log: Vec<String>,
        handles: Vec<Arc<dyn RelayConnection>>,
        accept: bool,
    }

    impl ListenerCallbacks for Recorder {
        fn on_connecting(&mut self, info: &ConnectionInfo) -> bool {
            self.log.push(format!("connecting {}", info.connection));
            self.accept
        }

        fn on_connected(&mut self, connection: Arc<dyn RelayConnection>, info: &ConnectionInfo) {
            self.log.push(format!("connected {}", info.connection));
            self.handles.push(connection);
        }

        fn on_disconnected(&mut self, info: &ConnectionInfo) {
            self.log.push(format!("disconnected {}", info.connection));
        }

        fn on_message(&mut self, connection: ConnectionId, data: &[u8]) {
            self.log.push(format!(
                "message {} {}",
                connection,
                String::from_utf8_lossy(data)
            ));
        }
    }

    impl DialerCallbacks for Recorder {
        fn on_connected(&mut self, _info: &ConnectionInfo) {
            self.log.push("connected".into());
        }

        fn on_disconnected(&mut self, _info: &ConnectionInfo) {
            self.log.push("disconnected".into());
        }

        fn on_message(&mut self, data: &[u8]) {
            self.log
                .push(format!("message {}", String::from_utf8_lossy(data)));
        }
    }

    fn accepting() -> Recorder {
        Recorder {
            accept: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_dial_accept_and_exchange() {
        let network = LoopbackNetwork::new();
        let host = network.transport(PeerIdentity(1));
        let guest = network.transport(PeerIdentity(2));

        let mut listener = host.open_listener(PeerIdentity(1)).unwrap();
        let mut dialer = guest.open_dialer(PeerIdentity(1)).unwrap();

        let mut server_cb = accepting();
        let mut client_cb = accepting();

        listener.receive(&mut server_cb).unwrap();
        assert_eq!(server_cb.log, vec!["connecting #1", "connected #1"]);
        assert_eq!(server_cb.handles[0].remote_identity(), PeerIdentity(2));

        dialer
            .connection()
            .send(b"ping", ReliabilityLevel::Reliable)
            .unwrap();
        dialer.receive(&mut client_cb).unwrap();
        assert_eq!(client_cb.log, vec!["connected"]);

        listener.receive(&mut server_cb).unwrap();
        assert_eq!(server_cb.log.last().unwrap(), "message #1 ping");

        server_cb.handles[0]
            .send(b"pong", ReliabilityLevel::Unreliable)
            .unwrap();
        server_cb.handles[0].flush().unwrap();
        dialer.receive(&mut client_cb).unwrap();
        assert_eq!(client_cb.log.last().unwrap(), "message pong");

        let stats = dialer.connection().stats().unwrap();
        assert_eq!(stats.bytes_sent, 4);
        assert_eq!(stats.bytes_received, 4);
        assert_eq!(stats.rtt, None);
    }

    #[test]
    fn test_dial_unknown_target_fails() {
        let network = LoopbackNetwork::new();
        let guest = network.transport(PeerIdentity(2));
        assert!(matches!(
            guest.open_dialer(PeerIdentity(99)),
            Err(RelayError::Setup(_))
        ));
    }

    #[test]
    fn test_duplicate_listener_fails() {
        let network = LoopbackNetwork::new();
        let host = network.transport(PeerIdentity(1));
        let _listener = host.open_listener(PeerIdentity(1)).unwrap();
        assert!(host.open_listener(PeerIdentity(1)).is_err());
    }

    #[test]
    fn test_rejected_connection_reports_closed() {
        let network = LoopbackNetwork::new();
        let mut listener = network
            .transport(PeerIdentity(1))
            .open_listener(PeerIdentity(1))
            .unwrap();
        let mut dialer = network
            .transport(PeerIdentity(2))
            .open_dialer(PeerIdentity(1))
            .unwrap();

        let mut server_cb = Recorder::default();
        listener.receive(&mut server_cb).unwrap();
        assert_eq!(server_cb.log, vec!["connecting #1"]);
        assert!(listener.connected().is_empty());

        let mut client_cb = Recorder::default();
        dialer.receive(&mut client_cb).unwrap();
        assert_eq!(client_cb.log, vec!["disconnected"]);
    }

    #[test]
    fn test_close_without_flush_drops_pending() {
        let network = LoopbackNetwork::new();
        let mut listener = network
            .transport(PeerIdentity(1))
            .open_listener(PeerIdentity(1))
            .unwrap();
        let mut dialer = network
            .transport(PeerIdentity(2))
            .open_dialer(PeerIdentity(1))
            .unwrap();

        let mut server_cb = accepting();
        listener.receive(&mut server_cb).unwrap();

        let conn = server_cb.handles[0].clone();
        conn.send(b"lost", ReliabilityLevel::Reliable).unwrap();
        conn.close();
        assert!(conn.send(b"late", ReliabilityLevel::Reliable).is_err());

        let mut client_cb = Recorder::default();
        dialer.receive(&mut client_cb).unwrap();
        assert_eq!(client_cb.log, vec!["connected", "disconnected"]);

        listener.receive(&mut server_cb).unwrap();
        assert!(listener.connected().is_empty());
    }

    #[test]
    fn test_local_close_drops_queued_messages() {
        let network = LoopbackNetwork::new();
        let mut listener = network
            .transport(PeerIdentity(1))
            .open_listener(PeerIdentity(1))
            .unwrap();
        let dialer = network
            .transport(PeerIdentity(2))
            .open_dialer(PeerIdentity(1))
            .unwrap();

        let mut server_cb = accepting();
        listener.receive(&mut server_cb).unwrap();

        // Delivered to the listener's inbox before the local close
        let outbound = dialer.connection();
        outbound.send(b"in flight", ReliabilityLevel::Reliable).unwrap();
        outbound.flush().unwrap();
        server_cb.handles[0].close();

        listener.receive(&mut server_cb).unwrap();
        assert_eq!(server_cb.log, vec!["connecting #1", "connected #1"]);
        assert!(listener.connected().is_empty());
    }

    #[test]
    fn test_remote_close_fires_disconnected() {
        let network = LoopbackNetwork::new();
        let mut listener = network
            .transport(PeerIdentity(1))
            .open_listener(PeerIdentity(1))
            .unwrap();
        let mut dialer = network
            .transport(PeerIdentity(2))
            .open_dialer(PeerIdentity(1))
            .unwrap();

        let mut server_cb = accepting();
        listener.receive(&mut server_cb).unwrap();
        dialer.close();

        // Still listed until the close is drained
        assert_eq!(listener.connected().len(), 1);
        listener.receive(&mut server_cb).unwrap();
        assert_eq!(server_cb.log.last().unwrap(), "disconnected #1");
        assert!(listener.connected().is_empty());
    }

    #[test]
    fn test_injected_failure_keeps_events() {
        let network = LoopbackNetwork::new();
        let host = network.transport(PeerIdentity(1));
        let mut listener = host.open_listener(PeerIdentity(1)).unwrap();
        let _dialer = network
            .transport(PeerIdentity(2))
            .open_dialer(PeerIdentity(1))
            .unwrap();

        host.fail_next_receive();
        let mut server_cb = accepting();
        assert!(listener.receive(&mut server_cb).is_err());
        assert!(server_cb.log.is_empty());

        listener.receive(&mut server_cb).unwrap();
        assert_eq!(server_cb.log, vec!["connecting #1", "connected #1"]);
    }

    #[test]
    fn test_listener_close_unregisters() {
        let network = LoopbackNetwork::new();
        let mut listener = network
            .transport(PeerIdentity(1))
            .open_listener(PeerIdentity(1))
            .unwrap();
        assert!(network.is_listening(PeerIdentity(1)));
        listener.close();
        assert!(!network.is_listening(PeerIdentity(1)));
    }
}
