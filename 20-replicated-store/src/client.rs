//! Store client that follows leader redirects.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{ensure, Result};
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::debug;

use crate::coordinator::Coordinator;
use crate::error::{StoreError, StoreResult};
use crate::message::{Request, Response};
use crate::transport::{PeerConnection, RetryPolicy};

/// Redirects followed per call. Under a stable leader one is enough.
pub const MAX_REDIRECTS: usize = 2;

pub struct StoreClient {
    stores: Vec<String>,
    retry: RetryPolicy,
    leader: Mutex<Option<String>>,
    connections: Mutex<HashMap<String, Arc<PeerConnection>>>,
}

impl StoreClient {
    pub fn new(stores: Vec<String>) -> Self {
        Self {
            stores,
            retry: RetryPolicy::default(),
            leader: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Builds a client from the coordinator's current peer list.
    pub async fn from_coordinator(coordinator: &dyn Coordinator) -> Result<Self> {
        let peers = coordinator.pull_peer_list().await?;
        ensure!(!peers.is_empty(), "coordinator knows no stores");
        let leader = peers
            .iter()
            .find(|peer| peer.is_leader)
            .map(|peer| peer.address.clone());
        let client = Self::new(peers.into_iter().map(|peer| peer.address).collect());
        *client.leader.lock().await = leader;
        Ok(client)
    }

    pub async fn leader(&self) -> Option<String> {
        self.leader.lock().await.clone()
    }

    pub async fn write(&self, key: i64, value: impl Into<String>) -> StoreResult<()> {
        let request = Request::Write {
            key,
            value: value.into(),
        };
        if self.call_leader(&request).await?.into_ack()? {
            Ok(())
        } else {
            Err(StoreError::rpc("write rejected"))
        }
    }

    /// Reads from any store, without redirects.
    pub async fn fast_read(&self, key: i64) -> StoreResult<String> {
        let target = self.random_store()?;
        self.call(&target, &Request::FastRead { key })
            .await?
            .into_value()
    }

    pub async fn default_read(&self, key: i64) -> StoreResult<String> {
        self.call_leader(&Request::DefaultRead { key })
            .await?
            .into_value()
    }

    pub async fn consistent_read(&self, key: i64) -> StoreResult<String> {
        self.call_leader(&Request::ConsistentRead { key })
            .await?
            .into_value()
    }

    async fn call_leader(&self, request: &Request) -> StoreResult<Response> {
        let mut target = match self.leader().await {
            Some(leader) => leader,
            None => self.random_store()?,
        };
        let mut redirects = 0;
        loop {
            let response = match self.call(&target, request).await {
                Ok(response) => response,
                Err(err) => {
                    // The cached leader may be gone; the next call starts fresh.
                    self.leader.lock().await.take();
                    return Err(err);
                }
            };
            let redirect = match &response {
                Response::Error { error } => error.redirect().map(str::to_string),
                _ => None,
            };
            match redirect {
                Some(leader) if redirects < MAX_REDIRECTS && leader != target => {
                    redirects += 1;
                    debug!(from = %target, to = %leader, call = request.name(), "following redirect");
                    *self.leader.lock().await = Some(leader.clone());
                    target = leader;
                }
                _ => {
                    if !matches!(response, Response::Error { .. }) {
                        *self.leader.lock().await = Some(target);
                    }
                    return Ok(response);
                }
            }
        }
    }

    async fn call(&self, address: &str, request: &Request) -> StoreResult<Response> {
        let connection = {
            let mut connections = self.connections.lock().await;
            Arc::clone(
                connections
                    .entry(address.to_string())
                    .or_insert_with(|| Arc::new(PeerConnection::new(address))),
            )
        };
        connection.call_with_retry(request, &self.retry).await
    }

    fn random_store(&self) -> StoreResult<String> {
        self.stores
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| StoreError::rpc("no stores configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorService;

    #[tokio::test]
    async fn coordinator_list_seeds_the_leader() -> Result<()> {
        let coordinator = CoordinatorService::new();
        coordinator.register_node("a:1").await?;
        coordinator.register_node("b:1").await?;

        let client = StoreClient::from_coordinator(&coordinator).await?;
        assert_eq!(client.leader().await.as_deref(), Some("a:1"));
        assert_eq!(client.stores.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn empty_store_list_is_an_error() {
        let client = StoreClient::new(Vec::new());
        assert!(matches!(client.fast_read(1).await, Err(StoreError::Rpc { .. })));
    }
}
