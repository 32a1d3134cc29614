use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{NodeConfig, Timing};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a store node and join the network through the coordinator.
    Node(NodeArgs),
    /// Run the membership coordinator.
    Coordinator(CoordinatorArgs),
    /// Open an interactive client shell.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Address of the coordinator.
    #[arg(long, default_value = "127.0.0.1:6000")]
    pub coordinator: String,

    /// Address peers and clients use to reach this node.
    #[arg(long)]
    pub public: String,

    /// Socket address the node binds to.
    #[arg(long)]
    pub listen: SocketAddr,

    /// Leader heartbeat period in seconds.
    #[arg(long, default_value_t = 2)]
    pub heartbeat_secs: u64,

    /// Follower silence in seconds before an election starts.
    #[arg(long, default_value_t = 3)]
    pub timeout_secs: u64,
}

impl NodeArgs {
    pub fn config(&self) -> NodeConfig {
        let mut config = NodeConfig::new(self.public.clone());
        config.timing = Timing {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            heartbeat_timeout: Duration::from_secs(self.timeout_secs),
            ..Timing::default()
        };
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct CoordinatorArgs {
    /// Socket address the coordinator binds to.
    #[arg(long, default_value = "127.0.0.1:6000")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the coordinator used to discover stores.
    #[arg(long, default_value = "127.0.0.1:6000")]
    pub coordinator: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_arguments_build_a_valid_config() {
        let cli = Cli::try_parse_from([
            "store-node",
            "node",
            "--public",
            "10.0.0.2:7001",
            "--listen",
            "0.0.0.0:7001",
        ])
        .expect("parse");
        let Command::Node(args) = cli.command else {
            panic!("expected node subcommand");
        };
        assert_eq!(args.coordinator, "127.0.0.1:6000");
        let config = args.config();
        assert_eq!(config.public_address, "10.0.0.2:7001");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn timeout_not_above_heartbeat_fails_validation() {
        let cli = Cli::try_parse_from([
            "store-node",
            "node",
            "--public",
            "a:1",
            "--listen",
            "127.0.0.1:7001",
            "--heartbeat-secs",
            "3",
            "--timeout-secs",
            "3",
        ])
        .expect("parse");
        let Command::Node(args) = cli.command else {
            panic!("expected node subcommand");
        };
        assert!(args.config().validate().is_err());
    }
}
