//! The three read levels.
//!
//! `fast_read` answers from the local dictionary on any node. `default_read`
//! does the same but only on the leader. `consistent_read` has the leader poll
//! every peer's dictionary and return the most common answer.

use std::collections::HashMap;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::message::{Request, Response};
use crate::node::StoreNode;

impl StoreNode {
    pub async fn fast_read(&self, key: i64) -> StoreResult<String> {
        let core = self.lock().await;
        core.ensure_connected()?;
        lookup(core.dictionary.get(key), key)
    }

    pub async fn default_read(&self, key: i64) -> StoreResult<String> {
        let core = self.lock().await;
        core.ensure_leader()?;
        lookup(core.dictionary.get(key), key)
    }

    /// Majority answer across the leader and every peer.
    ///
    /// The leader's own value is the first vote; peers follow in registry
    /// order. Peers that lack the key or cannot be reached cast no vote.
    pub async fn consistent_read(&self, key: i64) -> StoreResult<String> {
        let (local, peers) = {
            let core = self.lock().await;
            core.ensure_leader()?;
            let local = lookup(core.dictionary.get(key), key)?;
            (local, core.registry.connections())
        };

        let request = Request::FastRead { key };
        let retry = &self.config().retry;
        let replies = join_all(
            peers
                .iter()
                .map(|connection| connection.call_with_retry(&request, retry)),
        )
        .await;

        let mut votes = vec![local];
        for (connection, reply) in peers.iter().zip(replies) {
            match reply.map(Response::into_value) {
                Ok(Ok(value)) => votes.push(value),
                Ok(Err(StoreError::KeyNotFound { .. })) => {
                    debug!(peer = %connection.address(), key, "peer has no value yet");
                }
                Ok(Err(err)) => warn!(peer = %connection.address(), key, error = %err, "peer read failed"),
                Err(err) => self.evict(connection.address(), &err).await,
            }
        }

        let voters = votes.len();
        let winner = tally(votes).ok_or(StoreError::KeyNotFound { key })?;
        debug!(node = %self.address(), key, voters, "consistent read tallied");
        Ok(winner)
    }
}

fn lookup(value: Option<&str>, key: i64) -> StoreResult<String> {
    value
        .map(str::to_string)
        .ok_or(StoreError::KeyNotFound { key })
}

/// Returns the value seen most often.
///
/// Ties go to the value that reached the winning count first in `votes` order.
pub fn tally<I>(votes: I) -> Option<String>
where
    I: IntoIterator<Item = String>,
{
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut best: Option<(String, usize)> = None;
    for vote in votes {
        let count = counts.entry(vote.clone()).or_insert(0);
        *count += 1;
        let leading = best.as_ref().map_or(0, |(_, top)| *top);
        if *count > leading {
            best = Some((vote, *count));
        }
    }
    best.map(|(value, _)| value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn votes(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn majority_value_wins() {
        assert_eq!(tally(votes(&["a", "b", "b"])), Some("b".into()));
        assert_eq!(tally(votes(&["x"])), Some("x".into()));
        assert_eq!(tally(Vec::new()), None);
    }

    #[test]
    fn ties_go_to_the_first_value_to_reach_the_top_count() {
        assert_eq!(tally(votes(&["a", "b"])), Some("a".into()));
        // "b" reaches 2 before "a" does.
        assert_eq!(tally(votes(&["a", "b", "b", "a"])), Some("b".into()));
    }
}
