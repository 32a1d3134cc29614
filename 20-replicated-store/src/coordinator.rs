//! Membership bootstrap.
//!
//! Nodes only see the coordinator through the [`Coordinator`] trait. Two
//! implementations live here: [`RemoteCoordinator`], a TCP client, and
//! [`CoordinatorService`], a small in-memory directory that can be called
//! in-process or served over TCP with the same JSON line framing as the store.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::message::{read_message, write_message};
use crate::registry::PeerInfo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub is_initial_leader: bool,
    /// Every other registered node with its leader flag.
    pub peers: Vec<PeerInfo>,
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn register_node(&self, address: &str) -> Result<Registration>;

    async fn pull_peer_list(&self) -> Result<Vec<PeerInfo>>;

    /// Records a leader elected after bootstrap so later joiners find it.
    async fn report_leader(&self, address: &str, term: u64) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorRequest {
    RegisterNode { address: String },
    PullPeerList,
    ReportLeader { address: String, term: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorResponse {
    Registered { registration: Registration },
    Peers { peers: Vec<PeerInfo> },
    Ack,
    Error { message: String },
}

/// Talks to a coordinator over TCP, one connection per call.
pub struct RemoteCoordinator {
    address: String,
}

impl RemoteCoordinator {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    async fn call(&self, request: CoordinatorRequest) -> Result<CoordinatorResponse> {
        let stream = TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("failed to reach coordinator at {}", self.address))?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        write_message(&mut writer, &request).await?;
        match read_message::<_, CoordinatorResponse>(&mut reader).await? {
            Some(CoordinatorResponse::Error { message }) => bail!("coordinator error: {message}"),
            Some(response) => Ok(response),
            None => bail!("coordinator closed the connection"),
        }
    }
}

#[async_trait]
impl Coordinator for RemoteCoordinator {
    async fn register_node(&self, address: &str) -> Result<Registration> {
        match self
            .call(CoordinatorRequest::RegisterNode {
                address: address.to_string(),
            })
            .await?
        {
            CoordinatorResponse::Registered { registration } => Ok(registration),
            other => Err(anyhow!("unexpected coordinator reply: {other:?}")),
        }
    }

    async fn pull_peer_list(&self) -> Result<Vec<PeerInfo>> {
        match self.call(CoordinatorRequest::PullPeerList).await? {
            CoordinatorResponse::Peers { peers } => Ok(peers),
            other => Err(anyhow!("unexpected coordinator reply: {other:?}")),
        }
    }

    async fn report_leader(&self, address: &str, term: u64) -> Result<()> {
        match self
            .call(CoordinatorRequest::ReportLeader {
                address: address.to_string(),
                term,
            })
            .await?
        {
            CoordinatorResponse::Ack => Ok(()),
            other => Err(anyhow!("unexpected coordinator reply: {other:?}")),
        }
    }
}

/// Registered nodes in join order plus the current leader record.
#[derive(Debug, Default)]
pub struct Directory {
    members: Vec<String>,
    leader: Option<String>,
    leader_term: u64,
}

impl Directory {
    pub fn register(&mut self, address: &str) -> Registration {
        // A returning address restarted with empty state; it cannot keep leading.
        if let Some(position) = self.members.iter().position(|m| m == address) {
            self.members.remove(position);
            if self.leader.as_deref() == Some(address) {
                self.leader = None;
            }
        }

        let is_initial_leader = self.members.is_empty();
        let peers = self.peers_except(address);
        self.members.push(address.to_string());
        if is_initial_leader {
            self.leader = Some(address.to_string());
            self.leader_term = 0;
        }

        Registration {
            is_initial_leader,
            peers,
        }
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.members
            .iter()
            .map(|m| PeerInfo::new(m.clone(), self.leader.as_deref() == Some(m.as_str())))
            .collect()
    }

    fn peers_except(&self, address: &str) -> Vec<PeerInfo> {
        self.peers()
            .into_iter()
            .filter(|peer| peer.address != address)
            .collect()
    }

    /// Returns `false` when `term` is older than the recorded leader's.
    pub fn report_leader(&mut self, address: &str, term: u64) -> bool {
        if term < self.leader_term {
            return false;
        }
        if !self.members.iter().any(|m| m == address) {
            self.members.push(address.to_string());
        }
        self.leader = Some(address.to_string());
        self.leader_term = term;
        true
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }
}

#[derive(Clone, Default)]
pub struct CoordinatorService {
    directory: Arc<Mutex<Directory>>,
}

impl CoordinatorService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn leader(&self) -> Option<String> {
        self.directory.lock().await.leader().map(str::to_string)
    }

    /// Serves coordinator calls on `listener` until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        loop {
            select! {
                _ = &mut shutdown => {
                    info!("coordinator shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let service = self.clone();
                        tokio::spawn(async move {
                            if let Err(err) = service.handle_connection(stream).await {
                                warn!(peer = %peer, error = ?err, "coordinator connection closed with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = ?err, "failed to accept coordinator connection"),
                }
            }
        }
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let peer: Option<SocketAddr> = stream.peer_addr().ok();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        while let Some(request) = read_message::<_, CoordinatorRequest>(&mut reader).await? {
            debug!(?peer, ?request, "coordinator request");
            let response = self.dispatch(request).await;
            write_message(&mut writer, &response).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, request: CoordinatorRequest) -> CoordinatorResponse {
        let mut directory = self.directory.lock().await;
        match request {
            CoordinatorRequest::RegisterNode { address } => {
                let registration = directory.register(&address);
                info!(
                    node = %address,
                    leader = registration.is_initial_leader,
                    peers = registration.peers.len(),
                    "node registered"
                );
                CoordinatorResponse::Registered { registration }
            }
            CoordinatorRequest::PullPeerList => CoordinatorResponse::Peers {
                peers: directory.peers(),
            },
            CoordinatorRequest::ReportLeader { address, term } => {
                if directory.report_leader(&address, term) {
                    info!(leader = %address, term, "leader recorded");
                    CoordinatorResponse::Ack
                } else {
                    CoordinatorResponse::Error {
                        message: format!("stale leader report for term {term}"),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Coordinator for CoordinatorService {
    async fn register_node(&self, address: &str) -> Result<Registration> {
        Ok(self.directory.lock().await.register(address))
    }

    async fn pull_peer_list(&self) -> Result<Vec<PeerInfo>> {
        Ok(self.directory.lock().await.peers())
    }

    async fn report_leader(&self, address: &str, term: u64) -> Result<()> {
        if self.directory.lock().await.report_leader(address, term) {
            Ok(())
        } else {
            bail!("stale leader report for term {term}")
        }
    }
}
