//! Failure detection and leader election.
//!
//! Two background tasks run on every node for its whole life: the heartbeat
//! sender, which only does work while the node leads, and the timeout watcher,
//! which only campaigns while the node follows. Both stop on shutdown.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::select;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::message::{unexpected, Request, Response};
use crate::node::StoreNode;
use crate::transport::PeerConnection;

pub(crate) fn spawn_background(node: &StoreNode) {
    tokio::spawn(heartbeat_loop(node.clone()));
    tokio::spawn(timeout_watcher(node.clone()));
}

async fn heartbeat_loop(node: StoreNode) {
    let mut shutdown = node.shutdown_signal();
    let mut ticker = interval(node.config().timing.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => broadcast_heartbeat(&node).await,
        }
    }
    debug!(node = %node.address(), "heartbeat sender stopped");
}

/// Sends one heartbeat round. Each peer gets its own task so a dead peer's
/// retries never delay the others.
async fn broadcast_heartbeat(node: &StoreNode) {
    let (request, peers) = {
        let core = node.lock().await;
        if !core.state.is_leader() {
            return;
        }
        let request = Request::Heartbeat {
            leader: core.state.self_address.clone(),
            term: core.state.term,
            timestamp_ms: now_ms(),
            log_length: core.log.len(),
            committed_count: core.log.committed_count(),
        };
        (request, core.registry.connections())
    };

    for connection in peers {
        let node = node.clone();
        let request = request.clone();
        tokio::spawn(async move {
            let retry = node.config().retry.clone();
            match connection.call_with_retry(&request, &retry).await {
                Ok(Response::Ack { term, .. }) => node.observe_term(term).await,
                Ok(other) => warn!(peer = %connection.address(), error = %unexpected(&other), "bad heartbeat reply"),
                Err(err) => node.evict(connection.address(), &err).await,
            }
        });
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

async fn timeout_watcher(node: StoreNode) {
    let mut shutdown = node.shutdown_signal();
    let mut ticker = interval(node.config().timing.watch_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let leader_lost = select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => false,
            _ = node.shared.election_trigger.notified() => true,
        };
        if !should_campaign(&node, leader_lost).await {
            continue;
        }
        select! {
            _ = shutdown.changed() => break,
            _ = campaign(&node) => {}
        }
    }
    debug!(node = %node.address(), "timeout watcher stopped");
}

async fn should_campaign(node: &StoreNode, leader_lost: bool) -> bool {
    let core = node.lock().await;
    if !core.state.is_connected || core.state.is_leader() || core.state.is_candidate() {
        return false;
    }
    if leader_lost {
        info!(node = %node.address(), "leader evicted, starting election");
        return true;
    }
    let expired = core
        .state
        .heartbeat_expired(node.config().timing.heartbeat_timeout);
    if expired {
        info!(
            node = %node.address(),
            leader = core.state.leader().unwrap_or("<unknown>"),
            "heartbeat timeout"
        );
    }
    expired
}

/// Runs one election round for a fresh term.
///
/// Peers are asked one at a time with a random pause before each. The count
/// is abandoned as soon as the node is no longer a candidate of this term,
/// which is what happens when a heartbeat or announcement arrives mid-round.
async fn campaign(node: &StoreNode) {
    let timing = &node.config().timing;
    let (term, request, peers, electorate) = {
        let mut core = node.lock().await;
        let term = core.state.become_candidate();
        core.registry.set_leader(None);
        let request = Request::RequestVote {
            candidate: core.state.self_address.clone(),
            term,
            info: core.candidate_info(),
        };
        (term, request, core.registry.connections(), core.registry.len() + 1)
    };

    let mut votes = 1;
    for connection in &peers {
        if has_majority(votes, electorate) {
            break;
        }
        sleep(timing.vote_jitter()).await;
        if !still_candidate(node, term).await {
            debug!(node = %node.address(), term, "election abandoned");
            return;
        }
        match connection.call(&request, node.config().retry.rpc_timeout).await {
            Ok(Response::Vote { granted, term: theirs }) => {
                if theirs > term {
                    node.observe_term(theirs).await;
                    debug!(node = %node.address(), term, theirs, "voter is ahead, election abandoned");
                    return;
                }
                if granted {
                    votes += 1;
                }
                debug!(node = %node.address(), peer = %connection.address(), granted, votes, "vote received");
            }
            Ok(other) => warn!(peer = %connection.address(), error = %unexpected(&other), "bad vote reply"),
            Err(err) => debug!(peer = %connection.address(), error = %err, "vote request failed"),
        }
    }

    let won = has_majority(votes, electorate);
    let mut core = node.lock().await;
    if !core.state.is_candidate() || core.state.term != term {
        debug!(node = %node.address(), term, "election superseded");
        return;
    }
    if !won {
        core.state.become_follower(None);
        // Re-arm with an offset so competing candidates separate.
        core.state.last_leader_heartbeat = Instant::now() + timing.vote_jitter();
        info!(node = %node.address(), term, votes, electorate, "election lost");
        return;
    }

    core.state.become_leader();
    core.registry.set_leader(None);
    let peers = core.registry.connections();
    drop(core);
    info!(node = %node.address(), term, votes, electorate, "election won");
    announce(node, term, peers).await;

    let node = node.clone();
    tokio::spawn(async move { node.commit_inherited().await });
}

fn has_majority(votes: usize, electorate: usize) -> bool {
    votes * 2 > electorate
}

async fn still_candidate(node: &StoreNode, term: u64) -> bool {
    let core = node.lock().await;
    core.state.is_candidate() && core.state.term == term
}

async fn announce(node: &StoreNode, term: u64, peers: Vec<Arc<PeerConnection>>) {
    let request = Request::AnnounceLeader {
        leader: node.address().to_string(),
        term,
    };
    for connection in peers {
        let node = node.clone();
        let request = request.clone();
        tokio::spawn(async move {
            let retry = node.config().retry.clone();
            match connection.call_with_retry(&request, &retry).await {
                Ok(Response::Ack { term, .. }) => node.observe_term(term).await,
                Ok(other) => warn!(peer = %connection.address(), error = %unexpected(&other), "bad announce reply"),
                Err(err) => node.evict(connection.address(), &err).await,
            }
        });
    }

    if let Err(err) = node.shared.coordinator.report_leader(node.address(), term).await {
        warn!(node = %node.address(), term, error = ?err, "failed to report leadership");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::config::NodeConfig;
    use crate::coordinator::CoordinatorService;
    use crate::registry::PeerInfo;
    use crate::server::Server;
    use crate::state::Role;

    fn node_with_jitter(address: &str, jitter: Duration) -> StoreNode {
        let mut config = NodeConfig::new(address);
        config.timing.vote_jitter_min = jitter;
        config.timing.vote_jitter_max = jitter;
        StoreNode::new(config, Arc::new(CoordinatorService::new()))
    }

    /// A node that answers vote requests and nothing else of interest.
    async fn spawn_voter() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        let voter = node_with_jitter(&address, Duration::ZERO);
        tokio::spawn(Server::new(listener, voter).run_until(std::future::pending()));
        address
    }

    #[tokio::test]
    async fn uncontested_campaign_wins() {
        let voter = spawn_voter().await;
        let candidate = node_with_jitter("127.0.0.1:1", Duration::from_millis(10));
        candidate.lock().await.registry.insert(PeerInfo::new(voter, false));

        campaign(&candidate).await;

        let status = candidate.status().await;
        assert_eq!(status.role, Role::Leader);
        assert_eq!(status.term, 1);
    }

    #[tokio::test]
    async fn announcement_mid_campaign_abandons_the_count() {
        let voter = spawn_voter().await;
        let candidate = node_with_jitter("127.0.0.1:1", Duration::from_millis(300));
        candidate.lock().await.registry.insert(PeerInfo::new(voter, false));

        let running = {
            let candidate = candidate.clone();
            tokio::spawn(async move { campaign(&candidate).await })
        };
        // Land inside the pause before the first vote request.
        sleep(Duration::from_millis(50)).await;
        assert!(candidate.lock().await.state.is_candidate());
        let ack = candidate
            .handle(Request::AnnounceLeader {
                leader: "127.0.0.1:2".into(),
                term: 1,
            })
            .await;
        assert_eq!(ack, Response::Ack { ok: true, term: 1 });

        running.await.expect("campaign task");
        let status = candidate.status().await;
        assert_eq!(status.role, Role::Follower);
        assert_eq!(status.leader.as_deref(), Some("127.0.0.1:2"));
        assert_eq!(status.term, 1);
    }

    #[test]
    fn majority_counts_the_candidate() {
        assert!(has_majority(1, 1));
        assert!(!has_majority(1, 2));
        assert!(has_majority(2, 3));
        assert!(!has_majority(2, 4));
        assert!(has_majority(3, 5));
    }

    #[test]
    fn timestamps_are_wall_clock_millis() {
        assert!(now_ms() > 1_600_000_000_000);
    }
}
