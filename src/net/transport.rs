//! Connection-owning transport.
//!
//! The transport exclusively owns live connections; every other component
//! refers to peers by `NodeId` through its lookup interface. Each
//! established connection runs a read task and a write task; the write task
//! also drives ping liveness. All state-changing observations are emitted as
//! [`NetEvent`]s and serialized by the node's event loop.

use crate::crypto::Keypair;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::net::connection::ConnectionManager;
use crate::net::framing::{self, SessionKey};
use crate::net::message::{HandshakeAckPayload, HandshakePayload, Message};
use crate::net::peer_manager::PeerManager;
use crate::net::types::{
    ConnState, DRAIN_FLUSH_SECS, IDLE_READ_TIMEOUT_SECS, MAX_MISSED_PONGS, PROTOCOL_VERSION,
    SEND_QUEUE_CAPACITY,
};
use crate::rbac::Role;
use crate::trust::cert::JoinCertificate;
use crate::trust::crl::CrlStore;
use crate::trust::genesis::GenesisBlock;
use crate::types::{NodeId, now};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct TransportConfig {
    pub listen_address: SocketAddr,
    pub network_id: String,
    pub max_connections: usize,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    /// Endpoint advertised to peers for reverse dials (None when not
    /// reachable, e.g. behind NAT).
    pub advertised_endpoint: Option<SocketAddr>,
}

/// Observations surfaced to the node event loop.
#[derive(Debug)]
pub enum NetEvent {
    PeerConnected {
        node_id: NodeId,
        endpoint: SocketAddr,
        roles: Vec<Role>,
        inbound: bool,
    },
    PeerDisconnected {
        node_id: NodeId,
        reason: String,
    },
    Frame {
        from: NodeId,
        message: Message,
    },
}

/// Bounded per-connection send queue.
///
/// Overflow drops the oldest non-Control message. If every queued message is
/// Control the connection is saturated beyond recovery and must be failed.
struct SendQueue {
    inner: Mutex<VecDeque<Message>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl SendQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, message: Message, metrics: &Metrics) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ProtocolViolation("connection closed".into()));
        }
        let mut queue = self.inner.lock().expect("send queue lock");
        if queue.len() >= self.capacity {
            match queue.iter().position(|m| !m.is_control()) {
                Some(pos) => {
                    queue.remove(pos);
                    metrics.messages_dropped.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    return Err(Error::RateLimited(
                        "send queue saturated with control traffic".into(),
                    ));
                }
            }
        }
        queue.push_back(message);
        drop(queue);
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self) -> Message {
        loop {
            let notified = self.notify.notified();
            if let Some(message) = self.inner.lock().expect("send queue lock").pop_front() {
                return message;
            }
            notified.await;
        }
    }

    fn is_empty(&self) -> bool {
        self.inner.lock().expect("send queue lock").is_empty()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// One established connection as seen by the rest of the node.
pub struct ConnHandle {
    pub node_id: NodeId,
    pub endpoint: SocketAddr,
    pub inbound: bool,
    pub established_at: u64,
    state: Mutex<ConnState>,
    queue: Arc<SendQueue>,
    cancel: CancellationToken,
    pending_pings: AtomicU32,
    last_rx: AtomicU64,
}

impl ConnHandle {
    pub fn state(&self) -> ConnState {
        *self.state.lock().expect("conn state lock")
    }

    fn set_state(&self, state: ConnState) {
        *self.state.lock().expect("conn state lock") = state;
    }
}

struct HandshakeOutcome {
    peer: NodeId,
    roles: Vec<Role>,
    session: SessionKey,
    /// Where the peer says it accepts dials (dialer side of the exchange).
    advertised: Option<SocketAddr>,
}

pub struct Transport {
    cfg: TransportConfig,
    identity: Arc<Keypair>,
    /// Current join certificate; replaced in place on renewal so subsequent
    /// handshakes present the new one.
    cert: Arc<RwLock<JoinCertificate>>,
    genesis: Arc<GenesisBlock>,
    crl: Arc<CrlStore>,
    peers: Arc<PeerManager>,
    metrics: Arc<Metrics>,
    conns: RwLock<HashMap<NodeId, Arc<ConnHandle>>>,
    pub conn_mgr: ConnectionManager,
    events: mpsc::Sender<NetEvent>,
    accept_cancel: CancellationToken,
    cancel: CancellationToken,
    weak: Weak<Transport>,
}

impl Transport {
    pub fn new(
        cfg: TransportConfig,
        identity: Arc<Keypair>,
        cert: Arc<RwLock<JoinCertificate>>,
        genesis: Arc<GenesisBlock>,
        crl: Arc<CrlStore>,
        peers: Arc<PeerManager>,
        metrics: Arc<Metrics>,
    ) -> (Arc<Self>, mpsc::Receiver<NetEvent>) {
        let (events, event_rx) = mpsc::channel(1024);
        let cancel = CancellationToken::new();
        let conn_mgr = ConnectionManager::new(cfg.max_connections);
        let transport = Arc::new_cyclic(|weak| Self {
            cfg,
            identity,
            cert,
            genesis,
            crl,
            peers,
            metrics,
            conns: RwLock::new(HashMap::new()),
            conn_mgr,
            events,
            accept_cancel: cancel.child_token(),
            cancel,
            weak: weak.clone(),
        });
        (transport, event_rx)
    }

    /// Owned handle to self, for spawning connection tasks.
    fn arc(&self) -> Arc<Transport> {
        self.weak.upgrade().expect("transport alive")
    }

    /// Bind the listener and start accepting.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.cfg.listen_address).await?;
        let local = listener.local_addr()?;
        info!("mesh transport listening on {}", local);

        let transport = self.arc();
        tokio::spawn(async move {
            transport.accept_loop(listener).await;
        });
        Ok(local)
    }

    async fn accept_loop(&self, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.accept_cancel.cancelled() => {
                    debug!("accept loop stopped");
                    return;
                }
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept error: {}", e);
                            continue;
                        }
                    };
                    if self.conn_mgr.try_acquire().is_err() {
                        self.metrics.record_error(&Error::PoolFull);
                        debug!("refusing {}: pool full", remote);
                        continue;
                    }
                    let transport = self.arc();
                    tokio::spawn(async move {
                        transport.run_inbound(stream, remote).await;
                    });
                }
            }
        }
    }

    async fn run_inbound(&self, stream: TcpStream, remote: SocketAddr) {
        let (mut reader, mut writer) = stream.into_split();
        let result = timeout(
            self.cfg.handshake_timeout,
            self.handshake_accept(&mut reader, &mut writer),
        )
        .await
        .map_err(|_| Error::Timeout("handshake".into()))
        .and_then(|r| r);

        match result {
            Ok(outcome) => {
                self.finish_connection(reader, writer, remote, outcome, true)
                    .await;
            }
            Err(e) => {
                self.on_handshake_failure(remote, None, &e);
                self.conn_mgr.release();
            }
        }
    }

    /// Dial an endpoint in the background, deduplicated and backoff-gated.
    pub fn dial(&self, endpoint: SocketAddr) {
        if self.cancel.is_cancelled() || self.is_connected_to(&endpoint) {
            return;
        }
        if !self.conn_mgr.can_retry(&endpoint, now()) {
            return;
        }
        if !self.conn_mgr.start_dialing(endpoint) {
            return;
        }
        let transport = self.arc();
        tokio::spawn(async move {
            transport.run_dial(endpoint).await;
            transport.conn_mgr.finish_dialing(&endpoint);
        });
    }

    async fn run_dial(&self, endpoint: SocketAddr) {
        if self.conn_mgr.try_acquire().is_err() {
            self.metrics.record_error(&Error::PoolFull);
            return;
        }

        let connect = timeout(self.cfg.handshake_timeout, TcpStream::connect(endpoint)).await;
        let stream = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("dial {} failed: {}", endpoint, e);
                self.conn_mgr.record_failure(endpoint);
                self.conn_mgr.release();
                return;
            }
            Err(_) => {
                self.metrics
                    .record_error(&Error::Timeout("dial".into()));
                self.conn_mgr.record_failure(endpoint);
                self.conn_mgr.release();
                return;
            }
        };

        let (mut reader, mut writer) = stream.into_split();
        let result = timeout(
            self.cfg.handshake_timeout,
            self.handshake_dial(&mut reader, &mut writer),
        )
        .await
        .map_err(|_| Error::Timeout("handshake".into()))
        .and_then(|r| r);

        match result {
            Ok(outcome) => {
                self.conn_mgr.record_success(&endpoint);
                self.finish_connection(reader, writer, endpoint, outcome, false)
                    .await;
            }
            Err(e) => {
                self.on_handshake_failure(endpoint, None, &e);
                self.conn_mgr.record_failure(endpoint);
                self.conn_mgr.release();
            }
        }
    }

    fn on_handshake_failure(&self, remote: SocketAddr, peer: Option<NodeId>, err: &Error) {
        self.metrics.record_error(err);
        self.metrics
            .handshakes_failed
            .fetch_add(1, Ordering::Relaxed);
        if err.is_security_relevant() {
            if let Some(peer) = peer {
                self.peers.record_misbehavior(&peer, now());
            }
        }
        debug!("handshake with {} failed: {}", remote, err);
    }

    fn current_cert(&self) -> JoinCertificate {
        self.cert.read().expect("cert lock").clone()
    }

    fn validate_peer_cert(&self, cert: &JoinCertificate) -> Result<()> {
        cert.validate(&self.genesis, self.crl.current().as_ref(), now())
    }

    async fn handshake_dial(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<HandshakeOutcome> {
        let nonce: [u8; 32] = rand::random();
        let hello = HandshakePayload::new(
            &self.identity,
            self.current_cert(),
            &self.cfg.network_id,
            PROTOCOL_VERSION,
            nonce.to_vec(),
            self.cfg.advertised_endpoint,
        )?;
        let (kind, payload) = Message::Handshake(hello).encode()?;
        framing::write_frame(writer, kind, &payload, None).await?;

        let (kind, payload) = framing::read_frame(reader, None).await?;
        let ack = match Message::decode(kind, &payload)? {
            Some(Message::HandshakeAck(ack)) => ack,
            _ => {
                return Err(Error::ProtocolViolation(
                    "expected handshake ack".into(),
                ));
            }
        };

        ack.verify_signature()?;
        self.validate_peer_cert(&ack.cert)?;
        if ack.echo_nonce != nonce {
            return Err(Error::ProtocolViolation("handshake nonce mismatch".into()));
        }

        let session = SessionKey::derive(&nonce, &ack.nonce, &self.cfg.network_id);
        Ok(HandshakeOutcome {
            peer: ack.cert.subject_pubkey,
            roles: ack.cert.roles.clone(),
            session,
            advertised: None,
        })
    }

    async fn handshake_accept(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<HandshakeOutcome> {
        let (kind, payload) = framing::read_frame(reader, None).await?;
        let hello = match Message::decode(kind, &payload)? {
            Some(Message::Handshake(hello)) => hello,
            _ => return Err(Error::ProtocolViolation("expected handshake".into())),
        };

        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(Error::ProtocolViolation(format!(
                "protocol version {}",
                hello.protocol_version
            )));
        }
        if hello.network_id != self.cfg.network_id {
            return Err(Error::ProtocolViolation(format!(
                "foreign network {}",
                hello.network_id
            )));
        }
        hello.verify_signature()?;
        self.validate_peer_cert(&hello.cert)?;

        let nonce: [u8; 32] = rand::random();
        let ack = HandshakeAckPayload::new(
            &self.identity,
            self.current_cert(),
            nonce.to_vec(),
            hello.nonce.clone(),
        )?;
        let (kind, payload) = Message::HandshakeAck(ack).encode()?;
        framing::write_frame(writer, kind, &payload, None).await?;

        let session = SessionKey::derive(&hello.nonce, &nonce, &self.cfg.network_id);
        Ok(HandshakeOutcome {
            peer: hello.cert.subject_pubkey,
            roles: hello.cert.roles.clone(),
            session,
            advertised: hello.listen_endpoint,
        })
    }

    async fn finish_connection(
        &self,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        remote: SocketAddr,
        outcome: HandshakeOutcome,
        inbound: bool,
    ) {
        if outcome.peer == self.identity.node_id() {
            debug!("dropping self-connection via {}", remote);
            self.conn_mgr.release();
            return;
        }
        if self.peers.is_blacklisted(&outcome.peer, now()) {
            self.metrics
                .record_error(&Error::PeerBlacklisted(now()));
            debug!("rejecting blacklisted peer {}", outcome.peer.short());
            self.conn_mgr.release();
            return;
        }

        // Gossip-facing endpoint: prefer the advertised listen address.
        let endpoint = outcome.advertised.unwrap_or(remote);

        let handle = Arc::new(ConnHandle {
            node_id: outcome.peer,
            endpoint,
            inbound,
            established_at: now(),
            state: Mutex::new(ConnState::Established),
            queue: Arc::new(SendQueue::new(SEND_QUEUE_CAPACITY)),
            cancel: self.cancel.child_token(),
            pending_pings: AtomicU32::new(0),
            last_rx: AtomicU64::new(now()),
        });

        {
            let mut conns = self.conns.write().expect("conns lock");
            if conns.contains_key(&outcome.peer) {
                // Outbound dial raced an inbound accept; keep the first.
                drop(conns);
                debug!("duplicate connection to {}", outcome.peer.short());
                self.conn_mgr.release();
                return;
            }
            conns.insert(outcome.peer, handle.clone());
        }

        self.metrics
            .handshakes_completed
            .fetch_add(1, Ordering::Relaxed);
        info!(
            peer = %outcome.peer.short(),
            %endpoint,
            inbound,
            "connection established"
        );

        let _ = self
            .events
            .send(NetEvent::PeerConnected {
                node_id: outcome.peer,
                endpoint,
                roles: outcome.roles,
                inbound,
            })
            .await;

        let transport = self.arc();
        let read_handle = handle.clone();
        let read_session = outcome.session.clone();
        tokio::spawn(async move {
            transport.run_reader(read_handle, reader, read_session).await;
        });

        let transport = self.arc();
        tokio::spawn(async move {
            transport.run_writer(handle, writer, outcome.session).await;
        });
    }

    async fn run_reader(
        self: Arc<Self>,
        handle: Arc<ConnHandle>,
        mut reader: OwnedReadHalf,
        session: SessionKey,
    ) {
        let idle = Duration::from_secs(IDLE_READ_TIMEOUT_SECS);
        let reason = loop {
            let frame = tokio::select! {
                _ = handle.cancel.cancelled() => break "closed",
                frame = timeout(idle, framing::read_frame(&mut reader, Some(&session))) => frame,
            };
            let frame = match frame {
                Err(_) => {
                    self.metrics.record_error(&Error::Timeout("idle read".into()));
                    break "idle timeout";
                }
                Ok(Err(e)) => {
                    self.metrics.record_error(&e);
                    break "read error";
                }
                Ok(Ok(frame)) => frame,
            };

            self.metrics.frames_in.fetch_add(1, Ordering::Relaxed);
            handle.last_rx.store(now(), Ordering::Relaxed);

            let message = match Message::decode(frame.0, &frame.1) {
                // Unknown kind: ignored for forward compatibility.
                Ok(None) => continue,
                Ok(Some(message)) => message,
                Err(e) => {
                    self.metrics.record_error(&e);
                    self.peers.record_misbehavior(&handle.node_id, now());
                    break "malformed frame";
                }
            };

            if message.allowed_pre_handshake() {
                self.metrics
                    .record_error(&Error::ProtocolViolation("handshake replay".into()));
                break "handshake replay";
            }

            match message {
                Message::Ping(nonce) => {
                    let _ = handle.queue.push(Message::Pong(nonce), &self.metrics);
                }
                Message::Pong(nonce) => {
                    handle.pending_pings.store(0, Ordering::SeqCst);
                    let rtt = now_millis().saturating_sub(nonce);
                    self.peers.record_latency(&handle.node_id, rtt);
                    self.peers.record_good(&handle.node_id, now());
                }
                other => {
                    if self
                        .events
                        .send(NetEvent::Frame {
                            from: handle.node_id,
                            message: other,
                        })
                        .await
                        .is_err()
                    {
                        break "node stopped";
                    }
                }
            }
        };
        self.remove_connection(&handle.node_id, reason).await;
    }

    async fn run_writer(
        self: Arc<Self>,
        handle: Arc<ConnHandle>,
        mut writer: OwnedWriteHalf,
        session: SessionKey,
    ) {
        let mut ping_timer = tokio::time::interval(self.cfg.ping_interval);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping_timer.tick().await; // first tick fires immediately

        let reason = loop {
            tokio::select! {
                _ = handle.cancel.cancelled() => break "closed",
                _ = ping_timer.tick() => {
                    if handle.pending_pings.load(Ordering::SeqCst) >= MAX_MISSED_PONGS {
                        self.metrics.record_error(&Error::Timeout("pong".into()));
                        break "missed pongs";
                    }
                    // Ping only idle links; active traffic already proves liveness.
                    let idle_for = now().saturating_sub(handle.last_rx.load(Ordering::Relaxed));
                    if idle_for >= self.cfg.ping_interval.as_secs() {
                        let (kind, payload) = match Message::Ping(now_millis()).encode() {
                            Ok(frame) => frame,
                            Err(_) => break "encode error",
                        };
                        handle.pending_pings.fetch_add(1, Ordering::SeqCst);
                        if let Err(e) = framing::write_frame(&mut writer, kind, &payload, Some(&session)).await {
                            self.metrics.record_error(&e);
                            break "write error";
                        }
                        self.metrics.frames_out.fetch_add(1, Ordering::Relaxed);
                    }
                }
                message = handle.queue.pop() => {
                    let (kind, payload) = match message.encode() {
                        Ok(frame) => frame,
                        Err(e) => {
                            self.metrics.record_error(&e);
                            continue;
                        }
                    };
                    if let Err(e) = framing::write_frame(&mut writer, kind, &payload, Some(&session)).await {
                        self.metrics.record_error(&e);
                        break "write error";
                    }
                    self.metrics.frames_out.fetch_add(1, Ordering::Relaxed);
                }
            }
        };
        self.remove_connection(&handle.node_id, reason).await;
    }

    async fn remove_connection(&self, node_id: &NodeId, reason: &str) {
        let removed = self.conns.write().expect("conns lock").remove(node_id);
        if let Some(handle) = removed {
            let drained = handle.state() == ConnState::Draining || reason == "closed";
            handle.set_state(if drained {
                ConnState::Closed
            } else {
                ConnState::Failed
            });
            handle.queue.close();
            handle.cancel.cancel();
            self.conn_mgr.release();
            info!(peer = %node_id.short(), reason, "connection closed");
            let _ = self
                .events
                .send(NetEvent::PeerDisconnected {
                    node_id: *node_id,
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Queue a message for a connected peer.
    pub fn send(&self, to: &NodeId, message: Message) -> Result<()> {
        let handle = self
            .conns
            .read()
            .expect("conns lock")
            .get(to)
            .cloned()
            .ok_or_else(|| Error::NoRoute(to.to_string()))?;
        match handle.queue.push(message, &self.metrics) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Control saturation fails the connection.
                handle.cancel.cancel();
                Err(e)
            }
        }
    }

    /// Send to every established peer except `except`. Returns the count.
    pub fn broadcast(&self, message: &Message, except: Option<&NodeId>) -> usize {
        let targets: Vec<Arc<ConnHandle>> = self
            .conns
            .read()
            .expect("conns lock")
            .values()
            .filter(|h| Some(&h.node_id) != except)
            .cloned()
            .collect();
        let mut sent = 0;
        for handle in targets {
            if handle.queue.push(message.clone(), &self.metrics).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    pub fn is_connected(&self, node_id: &NodeId) -> bool {
        self.conns.read().expect("conns lock").contains_key(node_id)
    }

    fn is_connected_to(&self, endpoint: &SocketAddr) -> bool {
        self.conns
            .read()
            .expect("conns lock")
            .values()
            .any(|h| h.endpoint == *endpoint)
    }

    pub fn connected_ids(&self) -> Vec<NodeId> {
        self.conns.read().expect("conns lock").keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.conns.read().expect("conns lock").len()
    }

    /// Drain one connection: flush its queue (capped) then close.
    pub fn disconnect(&self, node_id: NodeId, reason: &'static str) {
        let handle = self.conns.read().expect("conns lock").get(&node_id).cloned();
        if let Some(handle) = handle {
            handle.set_state(ConnState::Draining);
            let transport = self.arc();
            tokio::spawn(async move {
                flush_queue(&handle, DRAIN_FLUSH_SECS).await;
                transport.remove_connection(&node_id, reason).await;
            });
        }
    }

    /// Graceful shutdown: stop accepting, flush all queues (5 s cap), then
    /// cancel every connection task.
    pub async fn shutdown(&self) {
        self.accept_cancel.cancel();
        let handles: Vec<Arc<ConnHandle>> = self
            .conns
            .read()
            .expect("conns lock")
            .values()
            .cloned()
            .collect();
        for handle in &handles {
            handle.set_state(ConnState::Draining);
        }
        for handle in &handles {
            flush_queue(handle, DRAIN_FLUSH_SECS).await;
        }
        self.cancel.cancel();
    }
}

async fn flush_queue(handle: &Arc<ConnHandle>, cap_secs: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(cap_secs);
    while !handle.queue.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
