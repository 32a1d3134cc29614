//! Leader-based replicated key-value store.
//!
//! A set of peer nodes agree on one leader. Writes go through the leader,
//! which appends them to its log, replicates them to the other nodes and
//! commits once a quorum has acknowledged. Reads come in three levels: fast
//! (any node, local), default (leader only) and consistent (leader polls every
//! peer and returns the majority value).
//!
//! # Architecture
//!
//! - **Server**: one tokio task per inbound connection, newline-delimited JSON
//! - **Node core**: log, dictionary, peer registry and leadership state behind a
//!   single async mutex; no lock is held across network I/O
//! - **Background tasks**: leader heartbeat sender and follower timeout watcher
//! - **Coordinator**: assigns the initial leader and hands joiners a peer list
//!
//! All state is in memory. A restarted node rejoins empty and catches up from
//! the leader.
//!
//! # Modules
//!
//! - [`log`] / [`dictionary`]: write log and the committed key-value view
//! - [`registry`] / [`transport`]: known peers and their leased connections
//! - [`node`]: shared state, RPC handlers, bootstrap
//! - [`replication`], [`read`], [`election`]: write path, read levels, failover
//! - [`coordinator`], [`server`], [`client`], [`console`]: the edges

pub mod cli;
pub mod client;
pub mod config;
pub mod console;
pub mod coordinator;
pub mod dictionary;
pub mod election;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod read;
pub mod registry;
pub mod replication;
pub mod server;
pub mod state;
pub mod transport;
