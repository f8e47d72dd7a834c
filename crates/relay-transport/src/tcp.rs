//! TCP relay transport
//!
//! Each endpoint owns a small tokio runtime. Background tasks read frames
//! off the sockets and queue transport events on unbounded channels; the
//! listener and dialer only drain those channels inside `receive`, so every
//! callback runs on the caller's thread.
//!
//! TCP is reliable and ordered, so both reliability levels share the stream.

use crate::facade::{
    ConnectionInfo, DialerCallbacks, ListenerCallbacks, RelayConnection, RelayDialer,
    RelayListener, RelayTransport,
};
use crate::frame::{self, Frame};
use relay_core::sync::lock;
use relay_core::{
    ConnectionId, ConnectionStats, PeerIdentity, RelayError, ReliabilityLevel, Result,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

/// Smallest write buffer we hand to a connection
const MIN_WRITE_BUFFER: usize = 8 * 1024;

/// Configuration for the TCP relay transport
#[derive(Debug, Clone)]
pub struct TcpRelayConfig {
    /// Address listeners bind to (port 0 picks a free port)
    pub bind_addr: SocketAddr,
    /// Where to reach each known peer
    pub directory: HashMap<PeerIdentity, SocketAddr>,
    /// Connect and handshake timeout
    pub connect_timeout: Duration,
    /// Longest `flush` waits for the writer
    pub flush_timeout: Duration,
}

impl Default for TcpRelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 27020)),
            directory: HashMap::new(),
            connect_timeout: Duration::from_secs(10),
            flush_timeout: Duration::from_secs(2),
        }
    }
}

impl TcpRelayConfig {
    /// Add a directory entry
    pub fn with_peer(mut self, identity: PeerIdentity, addr: SocketAddr) -> Self {
        self.directory.insert(identity, addr);
        self
    }
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
}

enum WriterCommand {
    Frame(Vec<u8>),
    Flush(std::sync::mpsc::Sender<()>),
    Close,
}

/// One TCP connection; writes go through a dedicated writer task
struct TcpConnection {
    id: ConnectionId,
    remote: PeerIdentity,
    commands: mpsc::UnboundedSender<WriterCommand>,
    counters: Arc<Counters>,
    closed: AtomicBool,
    flush_timeout: Duration,
    reader: Mutex<Option<AbortHandle>>,
}

impl TcpConnection {
    fn spawn(
        handle: &Handle,
        id: ConnectionId,
        remote: PeerIdentity,
        stream: OwnedWriteHalf,
        buffer_size: usize,
        flush_timeout: Duration,
    ) -> Arc<Self> {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        handle.spawn(writer_task(
            id,
            BufWriter::with_capacity(buffer_size.max(MIN_WRITE_BUFFER), stream),
            commands_rx,
        ));

        Arc::new(Self {
            id,
            remote,
            commands,
            counters: Arc::new(Counters::default()),
            closed: AtomicBool::new(false),
            flush_timeout,
            reader: Mutex::new(None),
        })
    }

    /// Tie the read task to this connection so a local close stops it
    fn attach_reader(&self, reader: AbortHandle) {
        *lock(&self.reader) = Some(reader);
        if self.is_closed() {
            self.stop_reader();
        }
    }

    fn stop_reader(&self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection: self.id,
            identity: self.remote,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send_frame(&self, frame: &Frame) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::ConnectionClosed(self.id.0));
        }
        let bytes = frame::encode(frame)?;
        self.commands
            .send(WriterCommand::Frame(bytes))
            .map_err(|_| RelayError::ConnectionClosed(self.id.0))
    }
}

impl RelayConnection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_identity(&self) -> PeerIdentity {
        self.remote
    }

    fn send(&self, data: &[u8], reliability: ReliabilityLevel) -> Result<()> {
        self.send_frame(&Frame::Data {
            reliable: reliability == ReliabilityLevel::Reliable,
            payload: data.to_vec(),
        })?;
        self.counters
            .sent
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        self.commands
            .send(WriterCommand::Flush(ack_tx))
            .map_err(|_| RelayError::ConnectionClosed(self.id.0))?;

        ack_rx
            .recv_timeout(self.flush_timeout)
            .map_err(|e| match e {
                std::sync::mpsc::RecvTimeoutError::Timeout => {
                    RelayError::Transport(format!("Flush on {} timed out", self.id))
                }
                std::sync::mpsc::RecvTimeoutError::Disconnected => {
                    RelayError::ConnectionClosed(self.id.0)
                }
            })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(WriterCommand::Close);
            self.stop_reader();
        }
    }

    fn stats(&self) -> Option<ConnectionStats> {
        Some(ConnectionStats {
            rtt: None,
            bytes_sent: self.counters.sent.load(Ordering::Relaxed),
            bytes_received: self.counters.received.load(Ordering::Relaxed),
        })
    }
}

async fn writer_task(
    id: ConnectionId,
    mut writer: BufWriter<OwnedWriteHalf>,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Frame(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!("Write on {} failed: {}", id, e);
                    break;
                }
                // Batch back-to-back frames, flush once the queue is idle
                if commands.is_empty() {
                    if let Err(e) = writer.flush().await {
                        debug!("Flush on {} failed: {}", id, e);
                        break;
                    }
                }
            }
            WriterCommand::Flush(ack) => {
                if let Err(e) = writer.flush().await {
                    debug!("Flush on {} failed: {}", id, e);
                    break;
                }
                let _ = ack.send(());
            }
            WriterCommand::Close => {
                if let Ok(bytes) = frame::encode(&Frame::Goodbye) {
                    let _ = writer.write_all(&bytes).await;
                }
                let _ = writer.flush().await;
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
    debug!("Writer for {} exiting", id);
}

enum ListenerEvent {
    Incoming(Arc<TcpConnection>),
    Message(ConnectionId, Vec<u8>),
    Closed(ConnectionId),
}

enum DialerEvent {
    Accepted,
    Message(Vec<u8>),
    Closed,
}

/// Shared state for the accept loop and its handshakes
#[derive(Clone)]
struct AcceptContext {
    handle: Handle,
    events: mpsc::UnboundedSender<ListenerEvent>,
    next_connection: Arc<AtomicU32>,
    buffer_size: usize,
    connect_timeout: Duration,
    flush_timeout: Duration,
}

async fn accept_loop(listener: TcpListener, ctx: AcceptContext) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handshake(stream, ctx).await {
                debug!("Handshake with {} failed: {}", addr, e);
            }
        });
    }
}

async fn handshake(stream: TcpStream, ctx: AcceptContext) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut read_half, write_half) = stream.into_split();

    let hello = tokio::time::timeout(ctx.connect_timeout, frame::read_frame(&mut read_half))
        .await
        .map_err(|_| RelayError::Transport("Handshake timed out".into()))??;
    let identity = match hello {
        Frame::Hello { identity } => identity,
        other => {
            return Err(RelayError::Protocol(format!(
                "Expected Hello, got {:?}",
                other
            )));
        }
    };

    let id = ConnectionId(ctx.next_connection.fetch_add(1, Ordering::SeqCst));
    let connection = TcpConnection::spawn(
        &ctx.handle,
        id,
        identity,
        write_half,
        ctx.buffer_size,
        ctx.flush_timeout,
    );
    let counters = connection.counters.clone();

    ctx.events
        .send(ListenerEvent::Incoming(connection.clone()))
        .map_err(|_| RelayError::Transport("Listener closed".into()))?;
    let reader = tokio::spawn(listener_reader(read_half, id, counters, ctx.events));
    connection.attach_reader(reader.abort_handle());
    Ok(())
}

async fn listener_reader(
    mut reader: OwnedReadHalf,
    id: ConnectionId,
    counters: Arc<Counters>,
    events: mpsc::UnboundedSender<ListenerEvent>,
) {
    loop {
        match frame::read_frame(&mut reader).await {
            Ok(Frame::Data { payload, .. }) => {
                counters
                    .received
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
                if events.send(ListenerEvent::Message(id, payload)).is_err() {
                    return;
                }
            }
            Ok(Frame::Goodbye) => break,
            Ok(other) => {
                warn!("Unexpected frame on {}: {:?}", id, other);
                break;
            }
            Err(e) => {
                debug!("Read on {} ended: {}", id, e);
                break;
            }
        }
    }
    let _ = events.send(ListenerEvent::Closed(id));
}

async fn dialer_reader(
    mut reader: OwnedReadHalf,
    counters: Arc<Counters>,
    events: mpsc::UnboundedSender<DialerEvent>,
) {
    loop {
        let event = match frame::read_frame(&mut reader).await {
            Ok(Frame::Welcome { .. }) => DialerEvent::Accepted,
            Ok(Frame::Data { payload, .. }) => {
                counters
                    .received
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
                DialerEvent::Message(payload)
            }
            Ok(Frame::Goodbye) => break,
            Ok(other) => {
                warn!("Unexpected frame from server: {:?}", other);
                break;
            }
            Err(e) => {
                debug!("Read from server ended: {}", e);
                break;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
    let _ = events.send(DialerEvent::Closed);
}

/// TCP relay transport for one local identity
pub struct TcpRelayTransport {
    identity: PeerIdentity,
    config: TcpRelayConfig,
    runtime: Arc<Runtime>,
    next_connection: Arc<AtomicU32>,
    send_buffer_size: AtomicUsize,
    listen_addr: Mutex<Option<SocketAddr>>,
}

impl TcpRelayTransport {
    /// Create a transport and its runtime
    pub fn new(identity: PeerIdentity, config: TcpRelayConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("relay-tcp")
            .enable_all()
            .build()?;

        Ok(Self {
            identity,
            config,
            runtime: Arc::new(runtime),
            next_connection: Arc::new(AtomicU32::new(1)),
            send_buffer_size: AtomicUsize::new(MIN_WRITE_BUFFER),
            listen_addr: Mutex::new(None),
        })
    }

    /// Handle onto the transport's runtime
    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    /// Address the most recent listener bound to
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *lock(&self.listen_addr)
    }
}

impl RelayTransport for TcpRelayTransport {
    fn local_identity(&self) -> PeerIdentity {
        self.identity
    }

    fn init_relay_access(&self) {
        debug!(
            "Relay directory has {} peers",
            self.config.directory.len()
        );
    }

    fn set_send_buffer_size(&self, bytes: usize) {
        self.send_buffer_size.store(bytes, Ordering::SeqCst);
    }

    fn open_listener(&self, local: PeerIdentity) -> Result<Box<dyn RelayListener>> {
        let std_listener = std::net::TcpListener::bind(self.config.bind_addr).map_err(|e| {
            RelayError::Setup(format!("Failed to bind {}: {}", self.config.bind_addr, e))
        })?;
        std_listener.set_nonblocking(true)?;
        let addr = std_listener.local_addr()?;

        let listener = {
            let _guard = self.runtime.enter();
            TcpListener::from_std(std_listener)?
        };
        *lock(&self.listen_addr) = Some(addr);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = AcceptContext {
            handle: self.runtime.handle().clone(),
            events: events_tx,
            next_connection: self.next_connection.clone(),
            buffer_size: self.send_buffer_size.load(Ordering::SeqCst),
            connect_timeout: self.config.connect_timeout,
            flush_timeout: self.config.flush_timeout,
        };
        let accept_task = self.runtime.spawn(accept_loop(listener, ctx));

        info!("Listening as {} on {}", local, addr);
        Ok(Box::new(TcpRelayListener {
            identity: local,
            events: events_rx,
            connected: Vec::new(),
            accept_task,
            closed: false,
            _runtime: self.runtime.clone(),
        }))
    }

    fn open_dialer(&self, target: PeerIdentity) -> Result<Box<dyn RelayDialer>> {
        let addr = self
            .config
            .directory
            .get(&target)
            .copied()
            .ok_or_else(|| RelayError::Setup(format!("No relay address for {}", target)))?;

        let stream = std::net::TcpStream::connect_timeout(&addr, self.config.connect_timeout)
            .map_err(|e| {
                RelayError::Setup(format!("Failed to connect to {} at {}: {}", target, addr, e))
            })?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;

        let stream = {
            let _guard = self.runtime.enter();
            TcpStream::from_std(stream)?
        };
        let (read_half, write_half) = stream.into_split();

        let handle = self.runtime.handle();
        let connection = TcpConnection::spawn(
            handle,
            ConnectionId::SERVER,
            target,
            write_half,
            self.send_buffer_size.load(Ordering::SeqCst),
            self.config.flush_timeout,
        );
        connection.send_frame(&Frame::Hello {
            identity: self.identity,
        })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reader = handle.spawn(dialer_reader(
            read_half,
            connection.counters.clone(),
            events_tx,
        ));
        connection.attach_reader(reader.abort_handle());

        info!("Dialing {} at {}", target, addr);
        Ok(Box::new(TcpRelayDialer {
            connection,
            events: events_rx,
            _runtime: self.runtime.clone(),
        }))
    }
}

struct TcpRelayListener {
    identity: PeerIdentity,
    events: mpsc::UnboundedReceiver<ListenerEvent>,
    connected: Vec<Arc<TcpConnection>>,
    accept_task: JoinHandle<()>,
    closed: bool,
    _runtime: Arc<Runtime>,
}

impl RelayListener for TcpRelayListener {
    fn receive(&mut self, callbacks: &mut dyn ListenerCallbacks) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        while let Ok(event) = self.events.try_recv() {
            match event {
                ListenerEvent::Incoming(connection) => {
                    let info = connection.info();
                    if !callbacks.on_connecting(&info) {
                        connection.close();
                        continue;
                    }
                    if let Err(e) = connection.send_frame(&Frame::Welcome {
                        identity: self.identity,
                    }) {
                        debug!("Could not welcome {}: {}", info.connection, e);
                        continue;
                    }
                    self.connected.push(connection.clone());
                    callbacks.on_connected(connection, &info);
                }
                ListenerEvent::Message(id, payload) => {
                    if self.connected.iter().any(|c| c.id == id && !c.is_closed()) {
                        callbacks.on_message(id, &payload);
                    }
                }
                ListenerEvent::Closed(id) => {
                    if let Some(pos) = self.connected.iter().position(|c| c.id == id) {
                        let connection = self.connected.remove(pos);
                        connection.close();
                        callbacks.on_disconnected(&connection.info());
                    }
                }
            }
        }

        self.connected.retain(|c| !c.is_closed());
        Ok(())
    }

    fn connected(&self) -> Vec<Arc<dyn RelayConnection>> {
        self.connected
            .iter()
            .filter(|c| !c.is_closed())
            .map(|c| c.clone() as Arc<dyn RelayConnection>)
            .collect()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.accept_task.abort();

        while let Ok(event) = self.events.try_recv() {
            if let ListenerEvent::Incoming(connection) = event {
                connection.close();
            }
        }
        for connection in self.connected.drain(..) {
            connection.close();
        }
        self.events.close();
        info!("Listener for {} closed", self.identity);
    }
}

impl Drop for TcpRelayListener {
    fn drop(&mut self) {
        self.close();
    }
}

struct TcpRelayDialer {
    connection: Arc<TcpConnection>,
    events: mpsc::UnboundedReceiver<DialerEvent>,
    _runtime: Arc<Runtime>,
}

impl RelayDialer for TcpRelayDialer {
    fn receive(&mut self, callbacks: &mut dyn DialerCallbacks) -> Result<()> {
        let info = self.connection.info();
        while let Ok(event) = self.events.try_recv() {
            match event {
                DialerEvent::Accepted => callbacks.on_connected(&info),
                DialerEvent::Message(payload) => callbacks.on_message(&payload),
                DialerEvent::Closed => callbacks.on_disconnected(&info),
            }
        }
        Ok(())
    }

    fn connection(&self) -> Arc<dyn RelayConnection> {
        self.connection.clone()
    }

    fn close(&mut self) {
        self.connection.close();
    }
}

impl Drop for TcpRelayDialer {
    fn drop(&mut self) {
        self.connection.close();
    }
}
