//! Test harness for clusters of real store nodes on localhost.
//!
//! The coordinator runs in-process; every node listens on an ephemeral port
//! and uses short timers so elections finish in well under a second.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tokio::net::TcpListener;
use tokio::time::sleep;

use replicated_store::config::{NodeConfig, Timing};
use replicated_store::coordinator::CoordinatorService;
use replicated_store::node::{NodeHandle, StoreNode};
use replicated_store::state::Role;
use replicated_store::transport::RetryPolicy;

pub fn fast_config(public_address: String) -> NodeConfig {
    NodeConfig {
        public_address,
        timing: Timing {
            heartbeat_interval: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_millis(400),
            vote_jitter_min: Duration::from_millis(10),
            vote_jitter_max: Duration::from_millis(40),
            quorum_timeout: Duration::from_secs(2),
        },
        retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
            rpc_timeout: Duration::from_millis(300),
        },
    }
}

pub struct TestCluster {
    pub coordinator: Arc<CoordinatorService>,
    /// `None` once a node has been crashed.
    handles: Vec<Option<NodeHandle>>,
}

impl TestCluster {
    /// Starts `n` nodes one after another; the first becomes the initial leader.
    pub async fn start(n: usize) -> Result<Self> {
        let mut cluster = Self {
            coordinator: Arc::new(CoordinatorService::new()),
            handles: Vec::new(),
        };
        for _ in 0..n {
            cluster.add_node().await?;
        }
        Ok(cluster)
    }

    /// Joins one more node and returns its index.
    pub async fn add_node(&mut self) -> Result<usize> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        let coordinator = Arc::clone(&self.coordinator);
        let handle = NodeHandle::start(fast_config(address), listener, coordinator).await?;
        self.handles.push(Some(handle));
        Ok(self.handles.len() - 1)
    }

    pub fn node(&self, i: usize) -> &StoreNode {
        self.handles[i]
            .as_ref()
            .expect("node has been crashed")
            .node()
    }

    pub fn address(&self, i: usize) -> String {
        self.node(i).address().to_string()
    }

    /// Stops a node's server and timers, as if the process died.
    pub async fn crash(&mut self, i: usize) -> Result<()> {
        if let Some(handle) = self.handles[i].take() {
            handle.shutdown().await?;
        }
        Ok(())
    }

    fn live(&self) -> impl Iterator<Item = (usize, &StoreNode)> {
        self.handles
            .iter()
            .enumerate()
            .filter_map(|(i, handle)| handle.as_ref().map(|h| (i, h.node())))
    }

    /// Waits until exactly one live node leads and every live node follows it.
    pub async fn wait_for_single_leader(&self, timeout: Duration) -> Result<usize> {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                bail!("timeout waiting for leader election");
            }

            let mut leaders = Vec::new();
            let mut agreed = true;
            let mut statuses = Vec::new();
            for (i, node) in self.live() {
                let status = node.status().await;
                if status.role == Role::Leader {
                    leaders.push(i);
                }
                statuses.push(status);
            }
            if let [leader] = leaders.as_slice() {
                let address = self.address(*leader);
                for status in &statuses {
                    agreed &= status.leader.as_deref() == Some(address.as_str());
                }
                if agreed {
                    return Ok(*leader);
                }
            }

            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Waits until `fast_read(key)` on node `i` returns `value`.
    pub async fn wait_for_value(&self, i: usize, key: i64, value: &str, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            if let Ok(current) = self.node(i).fast_read(key).await {
                if current == value {
                    return Ok(());
                }
            }
            if start.elapsed() > timeout {
                bail!("timeout waiting for node {i} to read {key} = {value:?}");
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Waits until node `i` knows exactly `peers` other nodes.
    pub async fn wait_for_peers(&self, i: usize, peers: usize, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.node(i).status().await.peers.len() == peers {
                return Ok(());
            }
            if start.elapsed() > timeout {
                bail!("timeout waiting for node {i} to know {peers} peers");
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn shutdown(mut self) -> Result<()> {
        for i in 0..self.handles.len() {
            self.crash(i).await?;
        }
        Ok(())
    }
}
