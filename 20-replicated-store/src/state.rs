use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;

/// The three roles a store node moves between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    /// Transient: only held while a campaign is counting votes.
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// Log progress a candidate presents when asking for a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInfo {
    pub log_length: usize,
    pub committed_count: usize,
}

/// Leadership and liveness bookkeeping for one node.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub self_address: String,
    pub leader_address: Option<String>,
    pub role: Role,
    /// Set once bootstrap completes. Client calls fail with `Disconnected` before.
    pub is_connected: bool,
    pub last_leader_heartbeat: Instant,
    /// Election epoch. Messages carrying a lower term are rejected.
    pub term: u64,
    /// Candidate granted a vote in `term`, if any.
    pub voted_for: Option<String>,
}

impl NodeState {
    pub fn new(self_address: impl Into<String>) -> Self {
        Self {
            self_address: self_address.into(),
            leader_address: None,
            role: Role::Follower,
            is_connected: false,
            last_leader_heartbeat: Instant::now(),
            term: 0,
            voted_for: None,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn is_candidate(&self) -> bool {
        self.role == Role::Candidate
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader_address.as_deref()
    }

    /// Adopts `term` if it is newer, stepping down to follower. Returns `true`
    /// when the term advanced.
    pub fn observe_term(&mut self, term: u64) -> bool {
        if term <= self.term {
            return false;
        }
        info!(
            node = %self.self_address,
            from = self.term,
            to = term,
            "observed newer term"
        );
        self.term = term;
        self.voted_for = None;
        if self.role != Role::Follower {
            self.role = Role::Follower;
            self.leader_address = None;
        }
        true
    }

    pub fn become_follower(&mut self, leader: Option<String>) {
        if self.role != Role::Follower || self.leader_address != leader {
            info!(
                node = %self.self_address,
                term = self.term,
                leader = leader.as_deref().unwrap_or("<unknown>"),
                "following"
            );
        }
        self.role = Role::Follower;
        self.leader_address = leader;
        self.last_leader_heartbeat = Instant::now();
    }

    /// Starts a new term voting for ourselves. Returns the campaign term.
    pub fn become_candidate(&mut self) -> u64 {
        self.term += 1;
        self.role = Role::Candidate;
        self.leader_address = None;
        self.voted_for = Some(self.self_address.clone());
        info!(node = %self.self_address, term = self.term, "starting election");
        self.term
    }

    pub fn become_leader(&mut self) {
        info!(node = %self.self_address, term = self.term, "became leader");
        self.role = Role::Leader;
        self.leader_address = Some(self.self_address.clone());
    }

    pub fn touch_heartbeat(&mut self) {
        self.last_leader_heartbeat = Instant::now();
    }

    pub fn heartbeat_expired(&self, timeout: Duration) -> bool {
        self.last_leader_heartbeat.elapsed() > timeout
    }

    /// Decides a `RequestVote`.
    ///
    /// At most one grant per term. Within that limit the candidate wins the
    /// vote if either its committed count or its log length is at least ours;
    /// ties grant.
    pub fn consider_vote(
        &mut self,
        candidate: &str,
        term: u64,
        theirs: CandidateInfo,
        ours: CandidateInfo,
    ) -> bool {
        if term < self.term {
            return false;
        }
        self.observe_term(term);

        if let Some(voted) = &self.voted_for {
            if voted != candidate {
                return false;
            }
        }

        let grant = theirs.committed_count >= ours.committed_count
            || theirs.log_length >= ours.log_length;
        if grant {
            self.voted_for = Some(candidate.to_string());
            self.touch_heartbeat();
        }
        grant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(log_length: usize, committed_count: usize) -> CandidateInfo {
        CandidateInfo {
            log_length,
            committed_count,
        }
    }

    #[test]
    fn candidate_increments_term_and_votes_for_itself() {
        let mut state = NodeState::new("a:1");
        state.leader_address = Some("b:1".into());
        let term = state.become_candidate();
        assert_eq!(term, 1);
        assert!(state.is_candidate());
        assert_eq!(state.leader(), None);
        assert_eq!(state.voted_for.as_deref(), Some("a:1"));
    }

    #[test]
    fn equal_progress_grants_vote() {
        let mut state = NodeState::new("c:1");
        assert!(state.consider_vote("b:1", 1, info(3, 2), info(3, 2)));
        assert_eq!(state.voted_for.as_deref(), Some("b:1"));
        assert_eq!(state.term, 1);
    }

    #[test]
    fn either_condition_is_enough() {
        let mut state = NodeState::new("c:1");
        assert!(state.consider_vote("b:1", 1, info(1, 5), info(4, 2)));

        let mut state = NodeState::new("c:1");
        assert!(state.consider_vote("b:1", 1, info(9, 0), info(4, 2)));

        let mut state = NodeState::new("c:1");
        assert!(!state.consider_vote("b:1", 1, info(1, 0), info(4, 2)));
    }

    #[test]
    fn one_vote_per_term() {
        let mut state = NodeState::new("c:1");
        assert!(state.consider_vote("a:1", 2, info(0, 0), info(0, 0)));
        assert!(!state.consider_vote("b:1", 2, info(5, 5), info(0, 0)));
        // Repeated request from the same candidate is granted again.
        assert!(state.consider_vote("a:1", 2, info(0, 0), info(0, 0)));
        // A newer term frees the vote.
        assert!(state.consider_vote("b:1", 3, info(0, 0), info(0, 0)));
    }

    #[test]
    fn stale_term_is_denied() {
        let mut state = NodeState::new("c:1");
        state.term = 5;
        assert!(!state.consider_vote("a:1", 4, info(9, 9), info(0, 0)));
        assert_eq!(state.term, 5);
    }

    #[test]
    fn newer_term_demotes_leader() {
        let mut state = NodeState::new("a:1");
        state.become_leader();
        assert!(state.observe_term(1));
        assert_eq!(state.role, Role::Follower);
        assert!(!state.observe_term(1));
    }
}
