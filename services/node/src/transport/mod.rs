//! Node-to-node transport.
//!
//! One TCP listener per node. Links are addressed by the peer's
//! [`NodeIdentity`], learned during the identity exchange that opens every
//! connection.
//!
//! ```text
//!   callers ──Command──┐
//!                      ├──> IO loop (owns listener + link writers)
//!   reader tasks ──────┘        │ classifies every inbound frame:
//!                               ├─ HANDSHAKE_RESPONSE -> pending handshake
//!                               ├─ HANDSHAKE_REQUEST  -> handler, echo response
//!                               └─ anything else      -> handler.on_packet
//! ```
//!
//! The IO loop never touches a socket write. It hands encoded frames to a
//! bounded per-link queue drained by that link's writer task, so
//! [`PacketSender::send`] never blocks and a peer that stops reading cannot
//! stall traffic to anyone else. A full queue or a stalled write drops the
//! link. Only one outbound handshake runs at a time per transport.

mod error;
mod link;

pub use error::TransportError;
pub use link::{parse_address, MAX_FRAME_LEN};

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use shoal_id::{ActorId, KeySequence, NodeId, NodeIdentity, RequestKey};
use shoal_reconcile::BackoffPolicy;
use shoal_wire::{EncodeContext, InternalPacket, MessageType};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use link::{FrameReader, FrameWriter, LinkEvent, Outgoing};

// =============================================================================
// Configuration
// =============================================================================

/// Transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Host to bind and advertise.
    pub host: String,

    /// Preferred port. Zero lets the OS choose.
    pub port: u16,

    /// Ports tried (preferred, preferred + 1, ...) before giving up.
    pub max_bind_attempts: u32,

    /// Wait for a handshake response, per attempt.
    pub handshake_timeout: Duration,

    /// Handshake attempts before the connect fails.
    pub handshake_retries: u32,

    /// Delay between handshake attempts.
    pub handshake_backoff: BackoffPolicy,

    /// Pause between opening a link and sending the handshake request.
    pub link_settle_delay: Duration,

    /// Frames queued per link before the link is dropped as too slow.
    pub send_queue_capacity: usize,

    /// Longest a single frame write may stall before the link is dropped.
    pub write_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_bind_attempts: 100,
            handshake_timeout: Duration::from_millis(3000),
            handshake_retries: 3,
            handshake_backoff: BackoffPolicy::exact(Duration::from_millis(100), Duration::from_secs(5)),
            link_settle_delay: Duration::from_millis(20),
            send_queue_capacity: 1024,
            write_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Seams
// =============================================================================

/// Non-blocking, identity-addressed packet send.
pub trait PacketSender: Send + Sync + 'static {
    /// Queues `packet` for `peer`.
    ///
    /// Errors here mean the packet was never queued. Failures after queueing
    /// are reported through [`TransportHandler::on_send_failed`].
    fn send(&self, peer: &NodeIdentity, packet: InternalPacket) -> Result<(), TransportError>;
}

/// Callbacks invoked from the IO loop. Implementations must not block.
pub trait TransportHandler: Send + Sync + 'static {
    /// A peer asked to join. The returned payload is echoed back as the
    /// handshake response; `None` sends no response.
    fn on_handshake_request(
        &self,
        sender: &Arc<dyn PacketSender>,
        peer: &NodeIdentity,
        packet: &InternalPacket,
    ) -> Option<Bytes>;

    /// Application traffic (requests and replies).
    fn on_packet(&self, sender: &Arc<dyn PacketSender>, peer: &NodeIdentity, packet: InternalPacket);

    /// A queued packet could not be written.
    fn on_send_failed(&self, peer: &NodeIdentity, packet: &InternalPacket, error: &TransportError);

    /// A link closed from the remote side.
    fn on_disconnected(&self, peer: &NodeIdentity);
}

/// Result of a successful outbound handshake.
#[derive(Debug, Clone)]
pub struct HandshakeReply {
    /// Identity the peer announced.
    pub peer: NodeIdentity,

    /// Handshake response payload.
    pub payload: Bytes,
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
    handshakes_initiated: AtomicU64,
    handshakes_accepted: AtomicU64,
    handshakes_failed: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_failures: AtomicU64,
    links: AtomicU64,
}

/// Point-in-time transport counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub handshakes_initiated: u64,
    pub handshakes_accepted: u64,
    pub handshakes_failed: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub send_failures: u64,
    pub links: u64,
}

// =============================================================================
// Transport
// =============================================================================

enum Command {
    Send {
        peer: NodeIdentity,
        packet: InternalPacket,
    },
    Attach {
        peer: NodeIdentity,
        reader: FrameReader,
        writer: FrameWriter,
        outbound: bool,
    },
    Disconnect {
        peer: NodeIdentity,
    },
}

struct PendingHandshake {
    peer: NodeIdentity,
    key: RequestKey,
    tx: oneshot::Sender<Bytes>,
}

struct Shared {
    identity: NodeIdentity,
    node_id: NodeId,
    config: TransportConfig,
    commands: mpsc::UnboundedSender<Command>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    pending_handshake: Mutex<Option<PendingHandshake>>,
    handshake_keys: KeySequence,
    counters: Counters,
}

impl Shared {
    fn set_pending(&self, pending: Option<PendingHandshake>) {
        let mut slot = self
            .pending_handshake
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = pending;
    }

    /// Takes the pending handshake if `packet` answers it.
    fn take_pending(&self, peer: &NodeIdentity, key: RequestKey) -> Option<PendingHandshake> {
        let mut slot = self
            .pending_handshake
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let answers = slot
            .as_ref()
            .is_some_and(|pending| pending.peer == *peer && pending.key == key);
        if answers {
            slot.take()
        } else {
            None
        }
    }
}

struct TransportSender {
    shared: Arc<Shared>,
}

impl PacketSender for TransportSender {
    fn send(&self, peer: &NodeIdentity, packet: InternalPacket) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.shared
            .commands
            .send(Command::Send {
                peer: peer.clone(),
                packet,
            })
            .map_err(|_| TransportError::Closed)
    }
}

/// A running node transport.
pub struct NodeTransport {
    shared: Arc<Shared>,
    sender: Arc<dyn PacketSender>,
    port: u16,
    handshake_lock: tokio::sync::Mutex<()>,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl NodeTransport {
    /// Binds the listener and starts the IO loop.
    ///
    /// If the preferred port is taken, the following ports are tried up to
    /// `max_bind_attempts` in total.
    pub async fn start(
        config: TransportConfig,
        identity: NodeIdentity,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Self, TransportError> {
        let listener = bind_with_fallback(&config).await?;
        let port = listener.local_addr()?.port();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (link_events, link_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            node_id: identity.node_id(),
            identity,
            config,
            commands,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            pending_handshake: Mutex::new(None),
            handshake_keys: KeySequence::new(),
            counters: Counters::default(),
        });
        let sender: Arc<dyn PacketSender> = Arc::new(TransportSender {
            shared: Arc::clone(&shared),
        });

        let io_loop = IoLoop {
            shared: Arc::clone(&shared),
            sender: Arc::clone(&sender),
            handler,
            listener,
            commands: command_rx,
            link_events: link_rx,
            link_events_tx: link_events,
            links: HashMap::new(),
            next_link_id: 0,
            ctx: EncodeContext::new(),
        };
        let io_task = tokio::spawn(io_loop.run());

        info!(
            node_id = %shared.node_id,
            host = %shared.config.host,
            port,
            "Transport listening"
        );

        Ok(Self {
            shared,
            sender,
            port,
            handshake_lock: tokio::sync::Mutex::new(()),
            io_task: Mutex::new(Some(io_task)),
        })
    }

    /// Port actually bound.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Address peers should dial.
    pub fn local_address(&self) -> String {
        format!("tcp://{}:{}", self.shared.config.host, self.port)
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.shared.identity
    }

    pub fn node_id(&self) -> NodeId {
        self.shared.node_id
    }

    /// Shared handle for sending.
    pub fn sender(&self) -> Arc<dyn PacketSender> {
        Arc::clone(&self.sender)
    }

    /// Queues a packet for `peer`.
    pub fn send(&self, peer: &NodeIdentity, packet: InternalPacket) -> Result<(), TransportError> {
        self.sender.send(peer, packet)
    }

    /// Dials `address` and performs a handshake.
    ///
    /// Only one handshake runs at a time; concurrent callers queue on the
    /// handshake lock. Attempts are retried with backoff. Once every attempt
    /// failed, any link to the peer is dropped.
    pub async fn connect_async(
        &self,
        address: &str,
        payload: Bytes,
    ) -> Result<HandshakeReply, TransportError> {
        let socket_addr = parse_address(address)?;
        let _guard = self.handshake_lock.lock().await;

        let config = &self.shared.config;
        let attempts = config.handshake_retries.max(1);
        let mut last_error = String::new();
        let mut last_peer: Option<NodeIdentity> = None;

        for attempt in 1..=attempts {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            self.shared.counters.handshakes_initiated.fetch_add(1, Ordering::Relaxed);

            match self.try_handshake(address, &socket_addr, payload.clone(), &mut last_peer).await {
                Ok(reply) => {
                    debug!(address = %address, peer = %reply.peer, attempt, "Handshake completed");
                    return Ok(reply);
                }
                Err(TransportError::Closed) => return Err(TransportError::Closed),
                Err(e) => {
                    warn!(address = %address, attempt, attempts, error = %e, "Handshake attempt failed");
                    last_error = e.to_string();
                }
            }

            if attempt < attempts {
                let delay = config.handshake_backoff.delay(attempt - 1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shared.shutdown.cancelled() => return Err(TransportError::Closed),
                }
            }
        }

        self.shared.counters.handshakes_failed.fetch_add(1, Ordering::Relaxed);
        if let Some(peer) = last_peer {
            self.disconnect(&peer);
        }

        Err(TransportError::HandshakeFailed {
            address: address.to_string(),
            attempts,
            last_error,
        })
    }

    async fn try_handshake(
        &self,
        address: &str,
        socket_addr: &str,
        payload: Bytes,
        last_peer: &mut Option<NodeIdentity>,
    ) -> Result<HandshakeReply, TransportError> {
        let config = &self.shared.config;

        let stream = tokio::time::timeout(config.handshake_timeout, TcpStream::connect(socket_addr))
            .await
            .map_err(|_| TransportError::Connect {
                address: address.to_string(),
                source: std::io::Error::new(ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| TransportError::Connect {
                address: address.to_string(),
                source,
            })?;

        let (peer, reader, writer) =
            link::exchange_identity(stream, &self.shared.identity, address, config.handshake_timeout).await?;
        *last_peer = Some(peer.clone());

        self.shared
            .commands
            .send(Command::Attach {
                peer: peer.clone(),
                reader,
                writer,
                outbound: true,
            })
            .map_err(|_| TransportError::Closed)?;

        tokio::time::sleep(config.link_settle_delay).await;

        let key = self.shared.handshake_keys.next_key();
        let (tx, rx) = oneshot::channel();
        self.shared.set_pending(Some(PendingHandshake {
            peer: peer.clone(),
            key,
            tx,
        }));

        let request = InternalPacket::new(
            self.shared.node_id,
            MessageType::HANDSHAKE_REQUEST,
            ActorId::default(),
            payload,
        )
        .with_request_key(key);

        if let Err(e) = self.send(&peer, request) {
            self.shared.set_pending(None);
            return Err(e);
        }

        let outcome = tokio::select! {
            response = rx => response.map_err(|_| TransportError::Closed),
            _ = tokio::time::sleep(config.handshake_timeout) => Err(TransportError::HandshakeTimeout {
                peer: peer.clone(),
                timeout: config.handshake_timeout,
            }),
            _ = self.shared.shutdown.cancelled() => Err(TransportError::Closed),
        };
        self.shared.set_pending(None);

        outcome.map(|payload| HandshakeReply { peer, payload })
    }

    /// Drops the link to `peer`, if any.
    pub fn disconnect(&self, peer: &NodeIdentity) {
        let _ = self.shared.commands.send(Command::Disconnect { peer: peer.clone() });
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TransportStats {
        let c = &self.shared.counters;
        TransportStats {
            handshakes_initiated: c.handshakes_initiated.load(Ordering::Relaxed),
            handshakes_accepted: c.handshakes_accepted.load(Ordering::Relaxed),
            handshakes_failed: c.handshakes_failed.load(Ordering::Relaxed),
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            packets_received: c.packets_received.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
            links: c.links.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stops accepting sends, cancels in-flight handshakes and closes every
    /// socket. Idempotent.
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.shutdown.cancel();

        let task = self
            .io_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        info!(node_id = %self.shared.node_id, "Transport shut down");
    }
}

async fn bind_with_fallback(config: &TransportConfig) -> Result<TcpListener, TransportError> {
    if config.port == 0 {
        let address = format!("{}:0", config.host);
        return TcpListener::bind(&address)
            .await
            .map_err(|source| TransportError::Bind { address, source });
    }

    let attempts = config.max_bind_attempts.max(1);
    for offset in 0..attempts {
        let Some(port) = u16::try_from(offset).ok().and_then(|o| config.port.checked_add(o)) else {
            break;
        };
        let address = format!("{}:{}", config.host, port);

        match TcpListener::bind(&address).await {
            Ok(listener) => {
                if offset > 0 {
                    info!(preferred = config.port, port, "Preferred port in use, bound fallback");
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!(port, "Port in use");
            }
            Err(source) => return Err(TransportError::Bind { address, source }),
        }
    }

    error!(host = %config.host, first_port = config.port, attempts, "No free port");
    Err(TransportError::PortsExhausted {
        host: config.host.clone(),
        first_port: config.port,
        attempts,
    })
}

// =============================================================================
// IO Loop
// =============================================================================

struct Link {
    link_id: u64,
    outbound: bool,
    queue: mpsc::Sender<Outgoing>,
    reader: AbortHandle,
    writer: AbortHandle,
}

struct IoLoop {
    shared: Arc<Shared>,
    sender: Arc<dyn PacketSender>,
    handler: Arc<dyn TransportHandler>,
    listener: TcpListener,
    commands: mpsc::UnboundedReceiver<Command>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    link_events_tx: mpsc::UnboundedSender<LinkEvent>,
    links: HashMap<NodeIdentity, Link>,
    next_link_id: u64,
    ctx: EncodeContext,
}

impl IoLoop {
    async fn run(mut self) {
        let shutdown = self.shared.shutdown.clone();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(command) = self.commands.recv() => self.handle_command(command),

                Some(event) = self.link_events.recv() => self.handle_link_event(event),

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => self.spawn_inbound(stream, remote.to_string()),
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }

        for (_, link) in self.links.drain() {
            link.reader.abort();
            link.writer.abort();
        }
        self.shared.counters.links.store(0, Ordering::Relaxed);
    }

    fn spawn_inbound(&self, stream: TcpStream, remote: String) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let timeout = shared.config.handshake_timeout;
            match link::exchange_identity(stream, &shared.identity, &remote, timeout).await {
                Ok((peer, reader, writer)) => {
                    debug!(peer = %peer, remote = %remote, "Inbound link opened");
                    let _ = shared.commands.send(Command::Attach {
                        peer,
                        reader,
                        writer,
                        outbound: false,
                    });
                }
                Err(e) => warn!(remote = %remote, error = %e, "Inbound identity exchange failed"),
            }
        });
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { peer, packet } => self.write(&peer, packet),
            Command::Attach {
                peer,
                reader,
                writer,
                outbound,
            } => self.attach(peer, reader, writer, outbound),
            Command::Disconnect { peer } => {
                if let Some(link) = self.links.remove(&peer) {
                    link.reader.abort();
                    self.shared.counters.links.fetch_sub(1, Ordering::Relaxed);
                    debug!(peer = %peer, link_id = link.link_id, "Link dropped");
                }
            }
        }
    }

    /// Installs a link for `peer`.
    ///
    /// When both nodes dial each other at once, each side ends up with one
    /// outbound and one inbound link. Both sides keep the link dialed by the
    /// larger node id and drop the other, so they agree on the survivor. A
    /// newer link in the same direction always replaces the older one.
    fn attach(&mut self, peer: NodeIdentity, reader: FrameReader, writer: FrameWriter, outbound: bool) {
        if let Some(existing) = self.links.get(&peer) {
            let dialed_by_larger = (self.shared.node_id > peer.node_id()) == outbound;
            if existing.outbound != outbound && !dialed_by_larger {
                debug!(peer = %peer, kept = existing.link_id, outbound, "Dropping duplicate link");
                return;
            }
        }

        self.next_link_id += 1;
        let link_id = self.next_link_id;
        let reader = link::spawn_reader(link_id, peer.clone(), reader, self.link_events_tx.clone());
        let (queue, queue_rx) = mpsc::channel(self.shared.config.send_queue_capacity.max(1));
        let writer = link::spawn_writer(
            link_id,
            peer.clone(),
            writer,
            queue_rx,
            self.shared.config.write_timeout,
            self.link_events_tx.clone(),
        );

        let link = Link {
            link_id,
            outbound,
            queue,
            reader: reader.abort_handle(),
            writer: writer.abort_handle(),
        };
        match self.links.insert(peer.clone(), link) {
            Some(previous) => {
                previous.reader.abort();
                debug!(peer = %peer, link_id, replaced = previous.link_id, "Link replaced");
            }
            None => {
                self.shared.counters.links.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %peer, link_id, "Link attached");
            }
        }
    }

    /// Queues `packet` on the peer's link without waiting for the socket.
    fn write(&mut self, peer: &NodeIdentity, packet: InternalPacket) {
        let Some(link) = self.links.get(peer) else {
            self.send_failed(peer, &packet, TransportError::NotConnected(peer.clone()));
            return;
        };

        let frame = packet.encode(&mut self.ctx);
        match link.queue.try_send(Outgoing { frame, packet }) {
            Ok(()) => {
                self.shared.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(outgoing)) => {
                self.send_failed(peer, &outgoing.packet, TransportError::SendQueueFull(peer.clone()));
                self.drop_link(peer, "send queue full");
            }
            Err(TrySendError::Closed(outgoing)) => {
                let error = TransportError::LinkFailed {
                    peer: peer.clone(),
                    reason: "writer stopped".to_string(),
                };
                self.send_failed(peer, &outgoing.packet, error);
                self.drop_link(peer, "writer stopped");
            }
        }
    }

    fn send_failed(&self, peer: &NodeIdentity, packet: &InternalPacket, error: TransportError) {
        self.shared.counters.send_failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            peer = %peer,
            message_type = %packet.message_type(),
            request_key = %packet.request_key(),
            error = %error,
            "Send failed"
        );
        self.handler.on_send_failed(peer, packet, &error);
    }

    /// Drops a link that can no longer carry traffic and reports the peer as
    /// disconnected.
    fn drop_link(&mut self, peer: &NodeIdentity, reason: &str) {
        let Some(link) = self.links.remove(peer) else {
            return;
        };
        link.reader.abort();
        link.writer.abort();
        self.shared.counters.links.fetch_sub(1, Ordering::Relaxed);
        warn!(peer = %peer, link_id = link.link_id, reason, "Dropping link");
        self.handler.on_disconnected(peer);
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame { link_id: _, peer, frame } => {
                self.shared.counters.packets_received.fetch_add(1, Ordering::Relaxed);
                match InternalPacket::decode(frame.freeze()) {
                    Ok(packet) => self.classify(peer, packet),
                    Err(e) => warn!(peer = %peer, error = %e, "Dropping undecodable frame"),
                }
            }
            LinkEvent::Closed { link_id, peer } => {
                let current = self.links.get(&peer).map(|link| link.link_id);
                if current == Some(link_id) {
                    self.links.remove(&peer);
                    self.shared.counters.links.fetch_sub(1, Ordering::Relaxed);
                    info!(peer = %peer, link_id, "Link closed by peer");
                    self.handler.on_disconnected(&peer);
                }
            }
            LinkEvent::WriteFailed {
                link_id,
                peer,
                packet,
                error,
            } => {
                self.send_failed(&peer, &packet, error);
                if self.links.get(&peer).map(|link| link.link_id) == Some(link_id) {
                    self.drop_link(&peer, "write failed");
                }
            }
        }
    }

    fn classify(&mut self, peer: NodeIdentity, packet: InternalPacket) {
        let message_type = packet.message_type();

        if message_type == MessageType::HANDSHAKE_RESPONSE {
            match self.shared.take_pending(&peer, packet.request_key()) {
                Some(pending) => {
                    let _ = pending.tx.send(packet.payload);
                }
                None => debug!(peer = %peer, request_key = %packet.request_key(), "Unexpected handshake response"),
            }
            return;
        }

        if message_type == MessageType::HANDSHAKE_REQUEST {
            self.shared.counters.handshakes_accepted.fetch_add(1, Ordering::Relaxed);
            if let Some(payload) = self.handler.on_handshake_request(&self.sender, &peer, &packet) {
                let response = InternalPacket::new(
                    self.shared.node_id,
                    MessageType::HANDSHAKE_RESPONSE,
                    ActorId::default(),
                    payload,
                )
                .with_request_key(packet.request_key());
                self.write(&peer, response);
            }
            return;
        }

        debug!(
            peer = %peer,
            message_type = %message_type,
            request_key = %packet.request_key(),
            is_reply = packet.is_reply(),
            "Packet received"
        );
        self.handler.on_packet(&self.sender, &peer, packet);
    }
}
