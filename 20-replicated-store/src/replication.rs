//! Leader write path.
//!
//! A write is appended locally, then handed to one task per peer. Each task
//! replicates the entry with bounded retries, reports its ack to the tally and
//! waits for the leader's decision; on commit it propagates `CommitEntry`
//! without holding up the caller.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::log::LogEntry;
use crate::message::{unexpected, Request, Response};
use crate::node::{NodeCore, StoreNode};
use crate::transport::PeerConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Pending,
    Commit,
    Abort,
}

/// Peer acknowledgements needed to commit with `peers` followers.
pub fn quorum(peers: usize) -> usize {
    peers / 2
}

impl StoreNode {
    /// Replicates `key = value` and returns once a quorum has acknowledged it.
    pub async fn write(&self, key: i64, value: String) -> StoreResult<()> {
        let _gate = self.shared.write_gate.lock().await;

        let (entry, term, peers) = {
            let mut core = self.lock().await;
            core.ensure_leader()?;
            let entry = core.log.append(key, value);
            (entry, core.state.term, core.registry.connections())
        };
        self.replicate(entry, term, peers).await
    }

    /// Commits the uncommitted tail a freshly elected leader inherited.
    ///
    /// The previous leader may have acknowledged a write to its caller and
    /// died before broadcasting the commit, so every pending entry goes through
    /// the normal fan-out again, oldest first. The first failure stops the
    /// pass; later writes and heartbeats take over from there.
    pub(crate) async fn commit_inherited(&self) {
        let _gate = self.shared.write_gate.lock().await;

        let (pending, term, peers) = {
            let core = self.lock().await;
            if !core.state.is_leader() {
                return;
            }
            let pending: Vec<LogEntry> = core
                .log
                .entries()
                .iter()
                .filter(|entry| !entry.committed)
                .cloned()
                .collect();
            (pending, core.state.term, core.registry.connections())
        };
        if pending.is_empty() {
            return;
        }

        info!(node = %self.address(), term, count = pending.len(), "committing inherited entries");
        for entry in pending {
            let index = entry.index;
            if let Err(err) = self.replicate(entry, term, peers.clone()).await {
                warn!(node = %self.address(), term, index, error = %err, "inherited entry not committed");
                return;
            }
        }
    }

    /// Fans `entry` out to `peers` and commits it on quorum.
    async fn replicate(
        &self,
        entry: LogEntry,
        term: u64,
        peers: Vec<Arc<PeerConnection>>,
    ) -> StoreResult<()> {
        let index = entry.index;
        let key = entry.key;
        if peers.is_empty() {
            let mut core = self.lock().await;
            still_leading(&core, term)?;
            core.commit(index);
            info!(node = %self.address(), index, key, "write committed locally");
            return Ok(());
        }

        let required = quorum(peers.len());
        debug!(node = %self.address(), index, key, peers = peers.len(), required, "replicating write");

        let (ack_tx, mut ack_rx) = mpsc::channel(peers.len());
        let (decision_tx, decision_rx) = watch::channel(Decision::Pending);
        let replicate = Request::ReplicateEntry {
            term,
            leader: self.address().to_string(),
            entry: entry.clone(),
        };
        let commit = Request::CommitEntry {
            term,
            leader: self.address().to_string(),
            entry: LogEntry {
                committed: true,
                ..entry
            },
        };
        for connection in peers {
            tokio::spawn(replicate_to_peer(
                self.clone(),
                connection,
                replicate.clone(),
                commit.clone(),
                ack_tx.clone(),
                decision_rx.clone(),
            ));
        }
        drop(ack_tx);

        let mut acks = 0;
        let window = self.config().timing.quorum_timeout;
        let reached = tokio::time::timeout(window, collect_acks(&mut ack_rx, &mut acks, required))
            .await
            .unwrap_or(false);

        let mut core = self.lock().await;
        if !reached {
            decision_tx.send_replace(Decision::Abort);
            warn!(node = %self.address(), index, acks, required, "write failed to reach quorum");
            return Err(StoreError::QuorumUnreachable {
                index,
                acks,
                required,
            });
        }
        if let Err(err) = still_leading(&core, term) {
            decision_tx.send_replace(Decision::Abort);
            return Err(err);
        }
        core.commit(index);
        decision_tx.send_replace(Decision::Commit);
        info!(node = %self.address(), index, key, acks, "write committed");
        Ok(())
    }
}

/// Fails with a redirect once the node has stepped down from `term`.
fn still_leading(core: &NodeCore, term: u64) -> StoreResult<()> {
    if core.state.is_leader() && core.state.term == term {
        Ok(())
    } else {
        Err(StoreError::NotLeader {
            leader: core.state.leader_address.clone(),
        })
    }
}

async fn collect_acks(acks_rx: &mut mpsc::Receiver<bool>, acks: &mut usize, required: usize) -> bool {
    while *acks < required {
        match acks_rx.recv().await {
            Some(true) => *acks += 1,
            Some(false) => {}
            // Every peer has answered.
            None => return false,
        }
    }
    true
}

async fn replicate_to_peer(
    node: StoreNode,
    connection: Arc<PeerConnection>,
    replicate: Request,
    commit: Request,
    acks: mpsc::Sender<bool>,
    mut decision: watch::Receiver<Decision>,
) {
    let retry = node.config().retry.clone();
    let acked = match connection.call_with_retry(&replicate, &retry).await {
        Ok(Response::Ack { ok, term }) => {
            node.observe_term(term).await;
            if !ok {
                debug!(peer = %connection.address(), "peer rejected entry");
            }
            ok
        }
        Ok(other) => {
            warn!(peer = %connection.address(), error = %unexpected(&other), "bad replicate reply");
            false
        }
        Err(err) => {
            node.evict(connection.address(), &err).await;
            false
        }
    };
    if acks.send(acked).await.is_err() {
        debug!(peer = %connection.address(), acked, "write already decided, ack dropped");
    }
    drop(acks);
    if !acked {
        return;
    }

    let decided = match decision.wait_for(|d| *d != Decision::Pending).await {
        Ok(decided) => *decided,
        Err(_) => return,
    };
    if decided != Decision::Commit {
        return;
    }

    match connection.call_with_retry(&commit, &retry).await {
        Ok(Response::Ack { ok: true, .. }) => {}
        Ok(Response::Ack { ok: false, term }) => {
            node.observe_term(term).await;
            debug!(peer = %connection.address(), "peer refused commit, heartbeat will reconcile");
        }
        Ok(other) => warn!(peer = %connection.address(), error = %unexpected(&other), "bad commit reply"),
        Err(err) => node.evict(connection.address(), &err).await,
    }
}
