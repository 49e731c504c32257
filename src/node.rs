//! Top-level node runtime.
//!
//! The node owns one instance of every store. The routing table, duplicate
//! guard, control handler and policy state are owned by the event loop task
//! and mutated only there; the peer manager, CRL store and audit log are
//! shared behind their own locks (ordering: peer_manager → routing → audit).

use crate::audit::{AuditKind, AuditLog};
use crate::certman::{CertEvent, CertManager};
use crate::config::NodeConfig;
use crate::control::{ControlAction, ControlHandler, ControlMessage};
use crate::crypto::Keypair;
use crate::error::Error;
use crate::metrics::{self, HealthInputs, Metrics};
use crate::net::discovery;
use crate::net::message::{
    DataPacket, Message, RouteAnnouncePayload, RouteWithdrawPayload, SignedPeerList,
};
use crate::net::peer::PeerSnapshot;
use crate::net::rate_limit::PeerRateLimits;
use crate::net::peer_manager::PeerManager;
use crate::net::transport::{NetEvent, Transport, TransportConfig};
use crate::net::types::DEFAULT_PORT;
use crate::rbac::Role;
use crate::routing::{DropReason, ForwardDecision, RoutingTable, SeenCache, forward_decision};
use crate::storage::Storage;
use crate::trust::authority::{AuthorityClient, HttpAuthority, JoinRequest};
use crate::trust::cert::JoinCertificate;
use crate::trust::crl::{Crl, CrlStore};
use crate::trust::genesis::GenesisBlock;
use crate::trust::policy::PolicyManifest;
use crate::types::{NodeId, now};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Validity requested when joining for the first time.
const JOIN_VALIDITY_HOURS: u64 = 7 * 24;

/// Cadence of the status/health log line.
const STATUS_INTERVAL_SECS: u64 = 30;

/// Fatal error carrying the process exit code.
///
/// 1 configuration, 2 trust-chain rejection, 3 certificate unobtainable,
/// 4 fatal internal error.
#[derive(Debug)]
pub struct NodeError {
    pub exit_code: i32,
    pub error: Error,
}

impl NodeError {
    fn config(error: Error) -> Self {
        Self { exit_code: 1, error }
    }

    fn trust(error: Error) -> Self {
        Self { exit_code: 2, error }
    }

    fn certificate(error: Error) -> Self {
        Self { exit_code: 3, error }
    }

    fn fatal(error: Error) -> Self {
        Self { exit_code: 4, error }
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (exit code {})", self.error, self.exit_code)
    }
}

impl std::error::Error for NodeError {}

/// Run a node with the HTTPS Network Authority from the configuration.
pub async fn run(cfg: NodeConfig) -> Result<(), NodeError> {
    let authority = HttpAuthority::new(&cfg.authority_url).map_err(NodeError::config)?;
    run_with(cfg, Arc::new(authority)).await
}

/// Run a node against an injected authority client (used by tests).
pub async fn run_with(
    cfg: NodeConfig,
    authority: Arc<dyn AuthorityClient>,
) -> Result<(), NodeError> {
    let node = Node::bootstrap(cfg, authority).await?;
    node.run().await
}

struct Node {
    cfg: NodeConfig,
    storage: Storage,
    identity: Arc<Keypair>,
    actor: String,
    genesis: Arc<GenesisBlock>,
    audit: Arc<AuditLog>,
    metrics: Arc<Metrics>,
    peers: Arc<PeerManager>,
    crl: Arc<CrlStore>,
    cert: Arc<RwLock<JoinCertificate>>,
    transport: Arc<Transport>,
    net_events: mpsc::Receiver<NetEvent>,
    cert_events: mpsc::Receiver<CertEvent>,
    renewal_failures: Arc<AtomicU32>,
    cancel: CancellationToken,

    // Event-loop-owned state.
    routing: RoutingTable,
    seen: SeenCache,
    control: ControlHandler,
    policy: Option<PolicyManifest>,
    rate_limits: HashMap<NodeId, PeerRateLimits>,
}

impl Node {
    async fn bootstrap(
        cfg: NodeConfig,
        authority: Arc<dyn AuthorityClient>,
    ) -> Result<Node, NodeError> {
        cfg.validate().map_err(NodeError::config)?;
        let storage = Storage::open(&cfg.data_dir).map_err(NodeError::config)?;

        // Trust anchor first: nothing runs under an unverified genesis.
        let genesis: GenesisBlock = match storage
            .load_json(&storage.genesis_path())
            .map_err(NodeError::trust)?
        {
            Some(genesis) => genesis,
            None => {
                let fetched = authority.fetch_genesis().await.map_err(NodeError::trust)?;
                storage
                    .save_json(&storage.genesis_path(), &fetched)
                    .map_err(NodeError::fatal)?;
                fetched
            }
        };
        genesis.verify(now()).map_err(NodeError::trust)?;
        let genesis = Arc::new(genesis);

        // A broken audit chain is fatal before any other work.
        let audit =
            Arc::new(AuditLog::open(&storage.audit_path()).map_err(NodeError::fatal)?);

        let identity = Arc::new(
            storage
                .load_or_create_identity()
                .map_err(NodeError::config)?,
        );
        let actor = identity.node_id().to_string();

        // Stored CRL is best-effort: an unreadable or invalid one is
        // discarded, the gossip layer will re-fetch.
        let stored_crl: Option<Crl> = storage
            .load_json(&storage.crl_path())
            .ok()
            .flatten()
            .filter(|crl: &Crl| crl.verify(&genesis).is_ok());
        let crl = Arc::new(CrlStore::new(stored_crl));

        let stored_policy: Option<PolicyManifest> = storage
            .load_json(&storage.policy_path())
            .ok()
            .flatten()
            .filter(|p: &PolicyManifest| p.verify(&genesis).is_ok());

        // Join certificate: reuse a stored valid one, otherwise ask the NA.
        let stored_cert: Option<JoinCertificate> = storage
            .load_json(&storage.cert_path())
            .ok()
            .flatten()
            .filter(|c: &JoinCertificate| {
                c.subject_pubkey == identity.node_id()
                    && c.validate(&genesis, crl.current().as_ref(), now()).is_ok()
            });
        let cert = match stored_cert {
            Some(cert) => cert,
            None => {
                let request = JoinRequest::new(&identity, vec![cfg.role], JOIN_VALIDITY_HOURS)
                    .map_err(NodeError::fatal)?;
                let issued = authority
                    .join(&request)
                    .await
                    .map_err(NodeError::certificate)?;
                issued
                    .validate(&genesis, crl.current().as_ref(), now())
                    .map_err(NodeError::certificate)?;
                storage
                    .save_json(&storage.cert_path(), &issued)
                    .map_err(NodeError::fatal)?;
                audit
                    .append(AuditKind::CertIssued, &actor, &actor, "bootstrap join")
                    .map_err(NodeError::fatal)?;
                issued
            }
        };
        let cert = Arc::new(RwLock::new(cert));

        let metrics = Arc::new(Metrics::new());
        let peers = Arc::new(PeerManager::new(cfg.reputation_blacklist_threshold));
        if let Ok(Some(snapshot)) = storage.load_json::<Vec<PeerSnapshot>>(&storage.peers_path())
        {
            peers.restore(&snapshot);
            info!("warm start with {} remembered peers", peers.len());
        }

        let advertised = if cfg.listen_address.ip().is_unspecified() {
            None
        } else {
            Some(cfg.listen_address)
        };
        let (transport, net_events) = Transport::new(
            TransportConfig {
                listen_address: cfg.listen_address,
                network_id: genesis.network_id(),
                max_connections: cfg.max_connections,
                handshake_timeout: Duration::from_secs(cfg.handshake_timeout_s),
                ping_interval: Duration::from_secs(cfg.ping_interval_s),
                advertised_endpoint: advertised,
            },
            identity.clone(),
            cert.clone(),
            genesis.clone(),
            crl.clone(),
            peers.clone(),
            metrics.clone(),
        );

        let cancel = CancellationToken::new();
        let (cert_tx, cert_events) = mpsc::channel(16);
        let cert_manager = CertManager::new(
            identity.clone(),
            cert.clone(),
            genesis.clone(),
            crl.clone(),
            authority,
            cfg.renewal_ratio,
            cert_tx,
        );
        let renewal_failures = cert_manager.failure_counter();
        tokio::spawn(cert_manager.run(cancel.child_token()));

        let max_hops = stored_policy
            .as_ref()
            .map(|p| p.routing.max_hops)
            .unwrap_or(cfg.max_hops);
        let routing = RoutingTable::new(identity.node_id(), max_hops);
        let control = ControlHandler::new(genesis.clone(), crl.clone());

        Ok(Node {
            cfg,
            storage,
            identity,
            actor,
            genesis,
            audit,
            metrics,
            peers,
            crl,
            cert,
            transport,
            net_events,
            cert_events,
            renewal_failures,
            cancel,
            routing,
            seen: SeenCache::default(),
            control,
            policy: stored_policy,
            rate_limits: HashMap::new(),
        })
    }

    async fn run(mut self) -> Result<(), NodeError> {
        self.transport
            .start()
            .await
            .map_err(NodeError::fatal)?;
        self.audit_log(AuditKind::NodeStarted, "", "");
        info!(
            node = %self.identity.node_id(),
            network = %self.genesis.network_id(),
            "node started"
        );

        // Bootstrap connectivity: genesis anchors plus configured extras.
        for anchor in &self.genesis.bootstrap_anchors {
            self.transport.dial(anchor.endpoint);
        }
        for endpoint in &self.cfg.bootstrap_endpoints {
            self.transport.dial(*endpoint);
        }

        let mut discovery_timer =
            tokio::time::interval(Duration::from_secs(self.cfg.discovery_interval_s));
        let mut announce_timer =
            tokio::time::interval(Duration::from_secs(self.cfg.route_announce_interval_s));
        let mut crl_timer =
            tokio::time::interval(Duration::from_secs(self.cfg.crl_announce_interval_s));
        let mut cleanup_timer = tokio::time::interval(Duration::from_secs(
            (self.cfg.stale_peer_timeout_s / 4).max(30),
        ));
        let mut status_timer =
            tokio::time::interval(Duration::from_secs(STATUS_INTERVAL_SECS));
        // Interval 0 fires immediately; skip that initial burst.
        discovery_timer.tick().await;
        announce_timer.tick().await;
        crl_timer.tick().await;
        cleanup_timer.tick().await;
        status_timer.tick().await;

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let mut cert_events_open = true;
        let mut exit: Result<(), NodeError> = Ok(());
        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("interrupt received, draining");
                    break;
                }
                maybe = self.net_events.recv() => {
                    match maybe {
                        Some(event) => {
                            if self.handle_net_event(event) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                maybe = self.cert_events.recv(), if cert_events_open => {
                    match maybe {
                        Some(CertEvent::Renewed(cert)) => {
                            let subject = self.actor.clone();
                            self.audit_log(AuditKind::CertRenewed, &subject, "");
                            self.metrics.cert_renewals.fetch_add(1, Ordering::Relaxed);
                            if let Err(e) = self.storage.save_json(&self.storage.cert_path(), &cert) {
                                warn!("failed to persist renewed certificate: {}", e);
                            }
                        }
                        Some(CertEvent::RenewalFailed { attempt, error }) => {
                            debug!(attempt, "renewal failed: {}", error);
                        }
                        Some(CertEvent::Expired) => {
                            let subject = self.actor.clone();
                            self.audit_log(AuditKind::CertExpired, &subject, "");
                            exit = Err(NodeError::certificate(Error::ExpiredCert));
                            break;
                        }
                        None => cert_events_open = false,
                    }
                }
                _ = discovery_timer.tick() => self.on_discovery_tick(),
                _ = announce_timer.tick() => self.on_announce_tick(),
                _ = crl_timer.tick() => self.on_crl_tick(),
                _ = cleanup_timer.tick() => self.on_cleanup_tick(),
                _ = status_timer.tick() => self.on_status_tick(),
            }
        }

        self.shutdown().await;
        exit
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self
            .storage
            .save_json(&self.storage.peers_path(), &self.peers.snapshot())
        {
            warn!("failed to persist peer snapshot: {}", e);
        }
        self.transport.shutdown().await;
        self.cancel.cancel();
        self.audit_log(AuditKind::NodeStopped, "", "");
        info!("node stopped");
    }

    fn audit_log(&self, kind: AuditKind, subject: &str, detail: &str) {
        if let Err(e) = self.audit.append(kind, &self.actor, subject, detail) {
            warn!("audit append failed: {}", e);
        }
    }

    /// Record an error against a peer: metrics always, audit + reputation
    /// for security-relevant kinds. Remote peers only ever see a generic
    /// rejection.
    fn punish(&mut self, peer: &NodeId, err: &Error) {
        self.metrics.record_error(err);
        if err.is_security_relevant() {
            let audit_kind = match err {
                Error::BadSignature(_) => AuditKind::SignatureInvalid,
                _ => AuditKind::AuthFailure,
            };
            self.audit_log(audit_kind, &peer.to_string(), err.kind());
            if let Some(until) = self.peers.record_misbehavior(peer, now()) {
                self.audit_log(
                    AuditKind::NodeBlacklisted,
                    &peer.to_string(),
                    &format!("reputation, until {until}"),
                );
                self.transport.disconnect(*peer, "blacklisted");
            }
        }
    }

    /// Returns true when the event loop must stop (remote shutdown).
    fn handle_net_event(&mut self, event: NetEvent) -> bool {
        match event {
            NetEvent::PeerConnected {
                node_id,
                endpoint,
                roles,
                inbound,
            } => {
                let first_sighting = self.peers.mark_connected(node_id, endpoint, &roles, now());
                self.rate_limits.entry(node_id).or_default();
                if first_sighting {
                    self.audit_log(AuditKind::NodeJoined, &node_id.to_string(), "");
                }
                self.audit_log(
                    AuditKind::ConnEstablished,
                    &node_id.to_string(),
                    if inbound { "inbound" } else { "outbound" },
                );
                self.audit_log(AuditKind::AuthSuccess, &node_id.to_string(), "handshake");
                // Prime the new link: our table and a peer-list exchange.
                let adverts = self.routing.announce_round();
                let _ = self.transport.send(
                    &node_id,
                    Message::RouteAnnounce(RouteAnnouncePayload { entries: adverts }),
                );
                let _ = self.transport.send(&node_id, Message::PeerListRequest);
                false
            }
            NetEvent::PeerDisconnected { node_id, reason } => {
                self.peers.mark_disconnected(&node_id);
                self.rate_limits.remove(&node_id);
                let kind = if reason == "closed" || reason == "revoked" || reason == "blacklisted"
                {
                    AuditKind::ConnClosed
                } else {
                    AuditKind::ConnFailed
                };
                self.audit_log(kind, &node_id.to_string(), &reason);
                let withdrawals = self.routing.invalidate_next_hop(&node_id, now());
                if !withdrawals.is_empty() {
                    self.metrics
                        .routes_withdrawn
                        .fetch_add(withdrawals.len() as u64, Ordering::Relaxed);
                    self.transport.broadcast(
                        &Message::RouteWithdraw(RouteWithdrawPayload {
                            entries: withdrawals,
                        }),
                        Some(&node_id),
                    );
                }
                false
            }
            NetEvent::Frame { from, message } => self.handle_frame(from, message),
        }
    }

    fn rate_limited(&mut self, from: &NodeId, message: &Message) -> bool {
        let limits = self.rate_limits.entry(*from).or_default();
        let allowed = match message {
            Message::PeerListResponse(_) | Message::PeerListRequest => {
                limits.peer_lists.try_consume(1.0)
            }
            Message::RouteAnnounce(_) | Message::RouteWithdraw(_) => {
                limits.route_announces.try_consume(1.0)
            }
            Message::CrlAnnounce { .. } | Message::CrlRequest { .. } | Message::CrlPush(_) => {
                limits.crl_messages.try_consume(1.0)
            }
            Message::Control(_) => limits.control_messages.try_consume(1.0),
            _ => true,
        };
        if !allowed {
            let err = Error::RateLimited(message.kind_name().to_string());
            self.metrics.record_error(&err);
            self.peers.record_misbehavior(from, now());
        }
        !allowed
    }

    fn handle_frame(&mut self, from: NodeId, message: Message) -> bool {
        if self.rate_limited(&from, &message) {
            return false;
        }
        match message {
            Message::PeerListRequest => {
                match discovery::build_peer_list(
                    &self.identity,
                    &self.peers,
                    self.cfg.peer_gossip_cap,
                    &from,
                ) {
                    Ok(list) => {
                        let _ = self
                            .transport
                            .send(&from, Message::PeerListResponse(list));
                    }
                    Err(e) => warn!("failed to build peer list: {}", e),
                }
                false
            }
            Message::PeerListResponse(list) => {
                self.on_peer_list(from, list);
                false
            }
            Message::RouteAnnounce(payload) => {
                let mut accepted = 0u64;
                for advert in &payload.entries {
                    if self.routing.apply_advert(advert, from, now()) {
                        accepted += 1;
                    }
                }
                if accepted > 0 {
                    self.metrics
                        .routes_installed
                        .fetch_add(accepted, Ordering::Relaxed);
                    self.peers.record_good(&from, now());
                }
                false
            }
            Message::RouteWithdraw(payload) => {
                let mut reflooded = Vec::new();
                for withdrawal in &payload.entries {
                    if self.routing.apply_withdrawal(withdrawal, now()) {
                        reflooded.push(withdrawal.clone());
                    }
                }
                if !reflooded.is_empty() {
                    self.metrics
                        .routes_withdrawn
                        .fetch_add(reflooded.len() as u64, Ordering::Relaxed);
                    self.transport.broadcast(
                        &Message::RouteWithdraw(RouteWithdrawPayload { entries: reflooded }),
                        Some(&from),
                    );
                }
                false
            }
            Message::Data(packet) | Message::DataForward(packet) => {
                self.on_data_packet(from, packet);
                false
            }
            Message::Control(control) => self.on_control(from, control),
            Message::CrlAnnounce { sequence } => {
                if sequence > self.crl.sequence() {
                    let _ = self.transport.send(
                        &from,
                        Message::CrlRequest {
                            since: self.crl.sequence(),
                        },
                    );
                }
                false
            }
            Message::CrlRequest { since } => {
                if let Some(crl) = self.crl.current() {
                    if crl.sequence > since {
                        let _ = self.transport.send(&from, Message::CrlPush(crl));
                    }
                }
                false
            }
            Message::CrlPush(crl) => {
                self.on_crl_push(from, crl);
                false
            }
            // Handshake frames never reach the event loop; ping/pong are
            // answered inside the transport.
            _ => false,
        }
    }

    fn on_peer_list(&mut self, from: NodeId, list: SignedPeerList) {
        match discovery::verify_peer_list(&list, &from, self.cfg.peer_gossip_cap) {
            Ok(()) => {
                let self_id = self.identity.node_id();
                let entries: Vec<_> = list
                    .entries
                    .into_iter()
                    .filter(|e| e.node_id != self_id)
                    .collect();
                self.peers.merge_gossip(&entries, now());
                self.peers.record_good(&from, now());
            }
            Err(e) => self.punish(&from, &e),
        }
    }

    fn on_data_packet(&mut self, from: NodeId, mut packet: DataPacket) {
        if packet.dest.is_broadcast() {
            if !self.seen.check_and_insert(&packet.payload_id, now()) {
                return;
            }
            self.deliver(&packet);
            if packet.ttl > 1 {
                packet.ttl -= 1;
                let flooded = self
                    .transport
                    .broadcast(&Message::DataForward(packet), Some(&from));
                if flooded > 0 {
                    self.metrics
                        .broadcasts_flooded
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
            return;
        }

        let decision = forward_decision(
            &packet,
            &self.identity.node_id(),
            &self.routing,
            &mut self.seen,
            now(),
            self.cfg.route_stale_timeout_s(),
        );
        match decision {
            ForwardDecision::Deliver => self.deliver(&packet),
            ForwardDecision::Forward(next_hop) => {
                packet.ttl -= 1;
                if self
                    .transport
                    .send(&next_hop, Message::DataForward(packet))
                    .is_ok()
                {
                    self.metrics
                        .packets_forwarded
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
            ForwardDecision::Drop(reason) => {
                let err = match reason {
                    DropReason::TtlExpired => Error::TtlExpired,
                    DropReason::NoRoute => Error::NoRoute(packet.dest.to_string()),
                    DropReason::Duplicate => {
                        // Loop guard hit; not an error counter, just drop.
                        return;
                    }
                };
                self.metrics.record_error(&err);
                if matches!(reason, DropReason::TtlExpired) {
                    // The previous hop should have dropped this packet.
                    self.peers.record_misbehavior(&from, now());
                }
            }
        }
    }

    fn deliver(&self, packet: &DataPacket) {
        self.metrics
            .packets_delivered
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            source = %packet.source.short(),
            bytes = packet.payload.len(),
            "datagram delivered"
        );
    }

    /// Returns true when the accepted control message was a shutdown.
    fn on_control(&mut self, from: NodeId, message: ControlMessage) -> bool {
        self.audit_log(
            AuditKind::ControlReceived,
            &message.issuer_cert.subject_pubkey.to_string(),
            &message.message_id,
        );
        match self.control.accept(&message, now()) {
            Ok(action) => {
                self.metrics.control_accepted.fetch_add(1, Ordering::Relaxed);
                self.audit_log(
                    AuditKind::ControlAccepted,
                    &message.issuer_cert.subject_pubkey.to_string(),
                    &format!("{} {}", message.kind.as_str(), message.message_id),
                );
                self.peers.record_good(&from, now());
                match action {
                    ControlAction::ApplyPolicy(manifest) => {
                        self.apply_policy(manifest);
                        false
                    }
                    ControlAction::ApplyCrl(crl) => {
                        self.on_crl_push(from, crl);
                        false
                    }
                    ControlAction::Shutdown => {
                        info!("shutdown requested by control plane");
                        true
                    }
                    ControlAction::Acknowledge => false,
                }
            }
            Err(e) => {
                self.metrics.control_rejected.fetch_add(1, Ordering::Relaxed);
                self.audit_log(
                    AuditKind::ControlRejected,
                    &message.issuer_cert.subject_pubkey.to_string(),
                    e.kind(),
                );
                self.punish(&from, &e);
                false
            }
        }
    }

    fn apply_policy(&mut self, manifest: PolicyManifest) {
        let current_id = self.policy.as_ref().map(|p| p.policy_id);
        if manifest.supersedes(self.policy.as_ref()) {
            self.routing.set_max_hops(manifest.routing.max_hops);
            if let Err(e) = self
                .storage
                .save_json(&self.storage.policy_path(), &manifest)
            {
                warn!("failed to persist policy: {}", e);
            }
            self.audit_log(
                AuditKind::PolicyApplied,
                "",
                &format!("policy_id {}", manifest.policy_id),
            );
            self.policy = Some(manifest);
        } else if current_id == Some(manifest.policy_id) {
            // Same manifest re-applied: a no-op by construction.
            debug!(policy_id = manifest.policy_id, "policy already applied");
        } else {
            debug!(
                policy_id = manifest.policy_id,
                "ignoring superseded policy"
            );
        }
    }

    fn on_crl_push(&mut self, from: NodeId, crl: Crl) {
        let sequence = crl.sequence;
        match self.crl.apply(crl, &self.genesis) {
            Ok(newly_revoked) => {
                self.metrics.crl_updates.fetch_add(1, Ordering::Relaxed);
                self.audit_log(
                    AuditKind::CrlUpdated,
                    "",
                    &format!("sequence {sequence}"),
                );
                if let Some(current) = self.crl.current() {
                    if let Err(e) = self
                        .storage
                        .save_json(&self.storage.crl_path(), &current)
                    {
                        warn!("failed to persist CRL: {}", e);
                    }
                }
                for subject in newly_revoked {
                    self.audit_log(
                        AuditKind::NodeBlacklisted,
                        &subject.to_string(),
                        &format!("sequence {sequence}"),
                    );
                    self.audit_log(AuditKind::CertRevoked, &subject.to_string(), "");
                    if self.transport.is_connected(&subject) {
                        self.transport.disconnect(subject, "revoked");
                    }
                }
                // Propagate: announce the new sequence so neighbors pull it;
                // anchors re-flood the full list for emergency pushes.
                self.transport
                    .broadcast(&Message::CrlAnnounce { sequence }, Some(&from));
                if self.cfg.role == Role::Anchor {
                    if let Some(current) = self.crl.current() {
                        self.transport
                            .broadcast(&Message::CrlPush(current), Some(&from));
                    }
                }
            }
            Err(Error::BadSignature(detail)) => {
                self.audit_log(AuditKind::CrlInvalidSignature, &from.to_string(), &detail);
                self.punish(&from, &Error::BadSignature(detail));
            }
            Err(e) => {
                // Stale sequence: normal gossip noise.
                debug!("CRL from {} not applied: {}", from.short(), e);
            }
        }
    }

    fn on_discovery_tick(&mut self) {
        self.transport.broadcast(&Message::PeerListRequest, None);

        // Keep dialing toward known-but-disconnected peers and anchors.
        let at = now();
        for (node_id, endpoint) in self.peers.dial_candidates(at) {
            if !self.transport.is_connected(&node_id) {
                self.transport.dial(endpoint);
            }
        }
        for anchor in &self.genesis.bootstrap_anchors {
            self.transport.dial(anchor.endpoint);
        }
    }

    fn on_announce_tick(&mut self) {
        let entries = self.routing.announce_round();
        self.transport
            .broadcast(&Message::RouteAnnounce(RouteAnnouncePayload { entries }), None);

        let removed = self
            .routing
            .sweep(now(), self.cfg.route_stale_timeout_s());
        if !removed.is_empty() {
            debug!("swept {} stale routes", removed.len());
        }
    }

    fn on_crl_tick(&mut self) {
        let sequence = self.crl.sequence();
        if sequence > 0 {
            self.transport
                .broadcast(&Message::CrlAnnounce { sequence }, None);
        }
    }

    fn on_cleanup_tick(&mut self) {
        let evicted = self
            .peers
            .evict_stale(now(), self.cfg.stale_peer_timeout_s);
        for node_id in evicted {
            self.rate_limits.remove(&node_id);
            self.audit_log(AuditKind::NodeLeft, &node_id.to_string(), "stale");
        }
    }

    fn on_status_tick(&self) {
        let cert_expires_in = self.cert.read().expect("cert lock").remaining(now());
        let report = metrics::assess(&HealthInputs {
            cert_expires_in,
            consecutive_renewal_failures: self.renewal_failures.load(Ordering::SeqCst),
            connected_peers: self.transport.connection_count(),
            crl_age: self
                .crl
                .current()
                .map(|c| now().saturating_sub(c.issued_at))
                .unwrap_or(u64::MAX),
        });
        info!(
            health = report.state.as_str(),
            peers = self.transport.connection_count(),
            routes = self.routing.len(),
            crl_seq = self.crl.sequence(),
            "status"
        );
        for concern in &report.concerns {
            debug!("health concern: {}", concern);
        }
    }
}

/// Default listen address helper for CLI parsing.
pub fn default_listen() -> String {
    format!("0.0.0.0:{DEFAULT_PORT}")
}
