//! The store node: one mutex-guarded state bundle and every RPC handler.
//!
//! All of the node's mutable state (leadership, log, dictionary, registry)
//! lives in [`NodeCore`] behind a single `tokio::sync::Mutex`. Handlers take the
//! lock, mutate, snapshot whatever they need to send, and release it before any
//! network I/O. Leader writes are additionally serialized by a write gate so
//! entries fan out in index order.
//!
//! The write path lives in [`crate::replication`], reads in [`crate::read`] and
//! the failure detector in [`crate::election`]; they all extend [`StoreNode`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::coordinator::Coordinator;
use crate::dictionary::Dictionary;
use crate::election;
use crate::error::{StoreError, StoreResult};
use crate::log::{AcceptOutcome, Log, LogEntry, ReconcileReport};
use crate::message::{unexpected, Request, Response};
use crate::registry::{PeerInfo, PeerRegistry};
use crate::server::Server;
use crate::state::{CandidateInfo, NodeState, Role};

pub(crate) struct NodeCore {
    pub(crate) state: NodeState,
    pub(crate) log: Log,
    pub(crate) dictionary: Dictionary,
    pub(crate) registry: PeerRegistry,
}

impl NodeCore {
    fn new(self_address: &str) -> Self {
        Self {
            state: NodeState::new(self_address),
            log: Log::new(),
            dictionary: Dictionary::new(),
            registry: PeerRegistry::new(),
        }
    }

    pub(crate) fn ensure_connected(&self) -> StoreResult<()> {
        if self.state.is_connected {
            Ok(())
        } else {
            Err(StoreError::Disconnected)
        }
    }

    /// Gate for leader-only calls. Followers redirect to the leader they know,
    /// falling back to the registry's leader flag.
    pub(crate) fn ensure_leader(&self) -> StoreResult<()> {
        self.ensure_connected()?;
        if self.state.is_leader() {
            return Ok(());
        }
        let leader = self
            .state
            .leader_address
            .clone()
            .or_else(|| self.registry.leader().map(str::to_string));
        Err(StoreError::NotLeader { leader })
    }

    pub(crate) fn candidate_info(&self) -> CandidateInfo {
        CandidateInfo {
            log_length: self.log.len(),
            committed_count: self.log.committed_count(),
        }
    }

    pub(crate) fn self_info(&self) -> PeerInfo {
        PeerInfo::new(self.state.self_address.clone(), self.state.is_leader())
    }

    /// Marks `index` committed and applies it when it is the newest committed
    /// write for its key.
    pub(crate) fn commit(&mut self, index: u64) -> bool {
        if self.log.commit(index).is_none() {
            return false;
        }
        if self.log.is_latest_committed(index) {
            if let Some(entry) = self.log.get(index) {
                self.dictionary.apply(entry);
            }
        }
        true
    }

    /// Follows `leader` at the current term, stepping down if needed.
    fn follow(&mut self, leader: &str) {
        if leader == self.state.self_address {
            return;
        }
        self.state.become_follower(Some(leader.to_string()));
        if !self.registry.contains(leader) {
            self.registry.insert(PeerInfo::new(leader, true));
        }
        self.registry.set_leader(Some(leader));
    }

    fn apply_reconcile(&mut self, entries: Vec<LogEntry>) -> ReconcileReport {
        let report = self.log.reconcile(entries);
        self.dictionary.rebuild(&self.log);
        report
    }
}

/// Point-in-time view of a node.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub address: String,
    pub role: Role,
    pub leader: Option<String>,
    pub term: u64,
    pub is_connected: bool,
    pub log_length: usize,
    pub committed_count: usize,
    pub peers: Vec<String>,
    pub store: BTreeMap<i64, String>,
}

pub(crate) struct Shared {
    pub(crate) core: Mutex<NodeCore>,
    pub(crate) write_gate: Mutex<()>,
    pub(crate) config: NodeConfig,
    pub(crate) coordinator: Arc<dyn Coordinator>,
    /// Wakes the timeout watcher when the leader's registry entry is evicted.
    pub(crate) election_trigger: Notify,
    reconciling: AtomicBool,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct StoreNode {
    pub(crate) shared: Arc<Shared>,
}

impl StoreNode {
    pub fn new(config: NodeConfig, coordinator: Arc<dyn Coordinator>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let core = NodeCore::new(&config.public_address);
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(core),
                write_gate: Mutex::new(()),
                config,
                coordinator,
                election_trigger: Notify::new(),
                reconciling: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.shared.config.public_address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, NodeCore> {
        self.shared.core.lock().await
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shared.shutdown.subscribe()
    }

    /// Stops the server, every connection task and the background timers.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    pub async fn status(&self) -> NodeStatus {
        let core = self.lock().await;
        NodeStatus {
            address: core.state.self_address.clone(),
            role: core.state.role,
            leader: core.state.leader_address.clone(),
            term: core.state.term,
            is_connected: core.state.is_connected,
            log_length: core.log.len(),
            committed_count: core.log.committed_count(),
            peers: core.registry.addresses(),
            store: core.dictionary.snapshot(),
        }
    }

    pub async fn log_entries(&self) -> Vec<LogEntry> {
        self.lock().await.log.entries().to_vec()
    }

    /// Dispatches one inbound request.
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Write { key, value } => match self.write(key, value).await {
                Ok(()) => Response::Ack {
                    ok: true,
                    term: self.term().await,
                },
                Err(error) => Response::Error { error },
            },
            Request::FastRead { key } => self.fast_read(key).await.into(),
            Request::DefaultRead { key } => self.default_read(key).await.into(),
            Request::ConsistentRead { key } => self.consistent_read(key).await.into(),
            Request::ReplicateEntry {
                term,
                leader,
                entry,
            } => self.replicate_entry(term, &leader, entry).await,
            Request::CommitEntry {
                term,
                leader,
                entry,
            } => self.commit_entry(term, &leader, entry).await,
            Request::RegisterPeer { peer } => self.register_peer(peer).await,
            Request::PullLog { requester } => {
                debug!(node = %self.address(), %requester, "serving log pull");
                Response::Log {
                    entries: self.log_entries().await,
                }
            }
            Request::Heartbeat {
                leader,
                term,
                timestamp_ms,
                log_length,
                committed_count,
            } => {
                self.heartbeat(&leader, term, timestamp_ms, log_length, committed_count)
                    .await
            }
            Request::RequestVote {
                candidate,
                term,
                info,
            } => self.request_vote(&candidate, term, info).await,
            Request::AnnounceLeader { leader, term } => self.announce_leader(&leader, term).await,
        }
    }

    pub async fn term(&self) -> u64 {
        self.lock().await.state.term
    }

    async fn replicate_entry(&self, term: u64, leader: &str, entry: LogEntry) -> Response {
        let outcome = {
            let mut core = self.lock().await;
            if term < core.state.term {
                return stale(core.state.term);
            }
            core.state.observe_term(term);
            core.follow(leader);
            core.log.accept(entry.clone())
        };

        let ok = match outcome {
            AcceptOutcome::Appended | AcceptOutcome::Duplicate | AcceptOutcome::Replaced => true,
            AcceptOutcome::Gap | AcceptOutcome::Conflict => {
                debug!(
                    node = %self.address(),
                    index = entry.index,
                    ?outcome,
                    "entry does not fit local log, catching up from leader"
                );
                self.catch_up(leader).await;
                self.holds(&entry).await
            }
        };
        Response::Ack {
            ok,
            term: self.term().await,
        }
    }

    async fn commit_entry(&self, term: u64, leader: &str, entry: LogEntry) -> Response {
        let missing = {
            let mut core = self.lock().await;
            if term < core.state.term {
                return stale(core.state.term);
            }
            core.state.observe_term(term);
            core.follow(leader);
            let present = core
                .log
                .get(entry.index)
                .is_some_and(|local| local.same_write(&entry));
            !present
                && matches!(
                    core.log.accept(entry.clone()),
                    AcceptOutcome::Gap | AcceptOutcome::Conflict
                )
        };
        if missing {
            self.catch_up(leader).await;
        }

        let mut core = self.lock().await;
        let ok = match core.log.get(entry.index) {
            Some(local) if local.same_write(&entry) => {
                if core.commit(entry.index) {
                    debug!(node = %self.address(), index = entry.index, key = entry.key, "entry committed");
                }
                true
            }
            _ => false,
        };
        Response::Ack {
            ok,
            term: core.state.term,
        }
    }

    async fn register_peer(&self, peer: PeerInfo) -> Response {
        let (is_new, disagreement, we_lead, connection, me) = {
            let mut core = self.lock().await;
            let known_leader = core.state.leader_address.clone();
            let is_new = core.registry.insert(peer.clone());
            // Keep our own view of the leader flag; the caller's claim is only compared.
            core.registry.set_leader(known_leader.as_deref());
            let claims_leader = peer.is_leader;
            let we_think_leader = known_leader.as_deref() == Some(peer.address.as_str());
            (
                is_new,
                claims_leader != we_think_leader,
                core.state.is_leader(),
                core.registry.connection(&peer.address),
                core.self_info(),
            )
        };
        info!(node = %self.address(), peer = %peer.address, new = is_new, "peer registered");

        if is_new {
            if let Some(connection) = connection {
                let retry = self.config().retry.clone();
                let node = self.clone();
                tokio::spawn(async move {
                    let request = Request::RegisterPeer { peer: me };
                    if let Err(err) = connection.call_with_retry(&request, &retry).await {
                        node.evict(connection.address(), &err).await;
                    }
                });
            }
        }
        if disagreement {
            let node = self.clone();
            tokio::spawn(async move { node.settle_leadership().await });
        }

        Response::Registered {
            is_leader: we_lead,
        }
    }

    /// Adopts the coordinator's leader record after a peer disagreed with ours.
    async fn settle_leadership(&self) {
        let peers = match self.shared.coordinator.pull_peer_list().await {
            Ok(peers) => peers,
            Err(err) => {
                warn!(node = %self.address(), error = ?err, "failed to pull peer list");
                return;
            }
        };
        let Some(leader) = peers.into_iter().find(|peer| peer.is_leader) else {
            return;
        };
        let mut core = self.lock().await;
        if core.state.leader() != Some(leader.address.as_str()) && !core.state.is_leader() {
            info!(node = %self.address(), leader = %leader.address, "adopting coordinator's leader");
            core.follow(&leader.address);
        }
    }

    async fn heartbeat(
        &self,
        leader: &str,
        term: u64,
        timestamp_ms: u64,
        log_length: usize,
        committed_count: usize,
    ) -> Response {
        let (diverged, term) = {
            let mut core = self.lock().await;
            if term < core.state.term {
                debug!(node = %self.address(), %leader, term, "rejecting stale heartbeat");
                return stale(core.state.term);
            }
            core.state.observe_term(term);
            let changed = core.state.leader() != Some(leader);
            core.follow(leader);
            let diverged = changed
                || core.log.len() != log_length
                || core.log.committed_count() != committed_count;
            (diverged && core.state.is_connected, core.state.term)
        };
        debug!(node = %self.address(), %leader, term, timestamp_ms, "heartbeat");

        if diverged {
            self.spawn_reconcile(leader.to_string());
        }
        Response::Ack { ok: true, term }
    }

    async fn request_vote(&self, candidate: &str, term: u64, info: CandidateInfo) -> Response {
        let mut core = self.lock().await;
        let ours = core.candidate_info();
        let granted = core.state.consider_vote(candidate, term, info, ours);
        if core.state.leader().is_none() {
            core.registry.set_leader(None);
        }
        info!(node = %self.address(), %candidate, term, granted, "vote requested");
        Response::Vote {
            granted,
            term: core.state.term,
        }
    }

    async fn announce_leader(&self, leader: &str, term: u64) -> Response {
        let (changed, term) = {
            let mut core = self.lock().await;
            if term < core.state.term {
                return stale(core.state.term);
            }
            core.state.observe_term(term);
            let changed = core.state.leader() != Some(leader);
            core.follow(leader);
            (changed && core.state.is_connected, core.state.term)
        };
        info!(node = %self.address(), %leader, term, "leader announced");
        if changed {
            self.spawn_reconcile(leader.to_string());
        }
        Response::Ack { ok: true, term }
    }

    /// Adopts a higher term seen in a reply, stepping down if we led.
    pub(crate) async fn observe_term(&self, term: u64) {
        let mut core = self.lock().await;
        let was_leader = core.state.is_leader();
        if core.state.observe_term(term) {
            core.registry.set_leader(None);
            if was_leader {
                warn!(node = %self.address(), term, "newer term observed, stepping down");
            }
        }
    }

    /// Drops a peer whose calls exhausted the retry budget.
    pub(crate) async fn evict(&self, address: &str, err: &StoreError) {
        let (removed, lost_leader) = {
            let mut core = self.lock().await;
            let was_leader = core.state.leader() == Some(address);
            let removed = core.registry.remove(address);
            if was_leader && !core.state.is_leader() {
                core.state.leader_address = None;
            }
            (removed, was_leader)
        };
        let Some((_, connection)) = removed else {
            return;
        };
        warn!(node = %self.address(), peer = %address, error = %err, "evicting unreachable peer");
        connection.close().await;
        if lost_leader {
            self.shared.election_trigger.notify_one();
        }
    }

    /// Pulls the leader's log, reconciles against it and rebuilds the dictionary.
    pub(crate) async fn reconcile_from(&self, leader: &str) -> StoreResult<ReconcileReport> {
        let connection = self
            .lock()
            .await
            .registry
            .connection(leader)
            .ok_or_else(|| StoreError::not_leader(leader))?;
        let request = Request::PullLog {
            requester: self.address().to_string(),
        };
        let entries = match connection
            .call_with_retry(&request, &self.config().retry)
            .await?
        {
            Response::Log { entries } => entries,
            Response::Error { error } => return Err(error),
            other => return Err(unexpected(&other)),
        };

        let mut core = self.lock().await;
        if core.state.leader() != Some(leader) {
            return Err(StoreError::not_leader(core.state.leader().unwrap_or_default()));
        }
        let report = core.apply_reconcile(entries);
        if report.discarded > 0 || report.adopted > 0 {
            info!(
                node = %self.address(),
                %leader,
                kept = report.kept,
                discarded = report.discarded,
                adopted = report.adopted,
                "log reconciled"
            );
        }
        Ok(report)
    }

    async fn catch_up(&self, leader: &str) {
        if let Err(err) = self.reconcile_from(leader).await {
            warn!(node = %self.address(), %leader, error = %err, "catch-up failed");
        }
    }

    /// Background reconciliation; at most one runs at a time.
    fn spawn_reconcile(&self, leader: String) {
        if self.shared.reconciling.swap(true, Ordering::AcqRel) {
            return;
        }
        let node = self.clone();
        tokio::spawn(async move {
            node.catch_up(&leader).await;
            node.shared.reconciling.store(false, Ordering::Release);
        });
    }

    async fn holds(&self, entry: &LogEntry) -> bool {
        self.lock()
            .await
            .log
            .get(entry.index)
            .is_some_and(|local| local.same_write(entry))
    }

    /// Joins the network through the coordinator and starts the timers.
    pub async fn bootstrap(&self) -> Result<()> {
        let registration = self
            .shared
            .coordinator
            .register_node(self.address())
            .await
            .context("failed to register with coordinator")?;

        if registration.is_initial_leader {
            let mut core = self.lock().await;
            for peer in registration.peers {
                core.registry.insert(peer);
            }
            core.state.become_leader();
            core.state.is_connected = true;
            info!(node = %self.address(), "bootstrapped as initial leader");
        } else {
            self.join(registration.peers).await;
        }

        election::spawn_background(self);
        Ok(())
    }

    async fn join(&self, peers: Vec<PeerInfo>) {
        let leader = peers
            .iter()
            .find(|peer| peer.is_leader)
            .map(|peer| peer.address.clone());
        {
            let mut core = self.lock().await;
            for peer in &peers {
                core.registry.insert(peer.clone());
            }
            core.registry.set_leader(leader.as_deref());
            core.state.become_follower(leader.clone());
        }

        // Catch up before announcing ourselves so nothing reads a stale dictionary.
        if let Some(leader) = &leader {
            match self.reconcile_from(leader).await {
                Ok(report) => info!(
                    node = %self.address(),
                    %leader,
                    entries = report.kept + report.adopted,
                    "pulled leader log"
                ),
                Err(err) => warn!(node = %self.address(), %leader, error = %err, "initial log pull failed"),
            }
        } else {
            warn!(node = %self.address(), "coordinator knows no leader, waiting for an election");
        }

        let me = PeerInfo::new(self.address(), false);
        for peer in &peers {
            let Some(connection) = self.lock().await.registry.connection(&peer.address) else {
                continue;
            };
            let request = Request::RegisterPeer { peer: me.clone() };
            match connection
                .call_with_retry(&request, &self.config().retry)
                .await
            {
                Ok(Response::Registered { is_leader }) if is_leader != peer.is_leader => warn!(
                    node = %self.address(),
                    peer = %peer.address,
                    claims_leader = is_leader,
                    "peer disagrees with coordinator about leadership"
                ),
                Ok(Response::Registered { .. }) => {}
                Ok(other) => warn!(node = %self.address(), peer = %peer.address, error = %unexpected(&other), "registration refused"),
                Err(err) => self.evict(&peer.address, &err).await,
            }
        }

        let mut core = self.lock().await;
        core.state.is_connected = true;
        core.state.touch_heartbeat();
        info!(
            node = %self.address(),
            leader = core.state.leader().unwrap_or("<unknown>"),
            peers = core.registry.len(),
            entries = core.log.len(),
            "joined network"
        );
    }
}

fn stale(term: u64) -> Response {
    Response::Ack { ok: false, term }
}

/// A running node: its server task plus the node itself.
pub struct NodeHandle {
    node: StoreNode,
    local_addr: SocketAddr,
    server: JoinHandle<Result<()>>,
}

impl NodeHandle {
    /// Serves on `listener`, then bootstraps through `coordinator`.
    pub async fn start(
        config: NodeConfig,
        listener: TcpListener,
        coordinator: Arc<dyn Coordinator>,
    ) -> Result<Self> {
        config.validate()?;
        let node = StoreNode::new(config, coordinator);
        let server = Server::new(listener, node.clone());
        let local_addr = server.local_addr()?;

        let mut shutdown = node.shutdown_signal();
        let server = tokio::spawn(server.run_until(async move {
            let _ = shutdown.wait_for(|stopped| *stopped).await;
        }));

        if let Err(err) = node.bootstrap().await {
            node.shutdown();
            return Err(err);
        }
        Ok(Self {
            node,
            local_addr,
            server,
        })
    }

    pub fn node(&self) -> &StoreNode {
        &self.node
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) -> Result<()> {
        self.node.shutdown();
        self.server.await.context("server task panicked")?
    }
}
