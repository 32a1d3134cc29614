use std::future::Future;
use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{debug, info, warn};

use crate::message::{read_message, write_message, Request};
use crate::node::StoreNode;

/// Accepts store connections and hands each one to its own task.
pub struct Server {
    listener: TcpListener,
    node: StoreNode,
}

impl Server {
    pub fn new(listener: TcpListener, node: StoreNode) -> Self {
        Self { listener, node }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, node } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(node = %node.address(), "store server shutting down");
                    node.shutdown();
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &node);
                }
            }
        }

        Ok(())
    }
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, node: &StoreNode) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, node),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, node: &StoreNode) {
    let node = node.clone();
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, node).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

/// Serves requests in order until the peer hangs up or the node stops.
async fn handle_connection(stream: TcpStream, peer: SocketAddr, node: StoreNode) -> Result<()> {
    let mut shutdown = node.shutdown_signal();
    if *shutdown.borrow() {
        return Ok(());
    }
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let request = select! {
            _ = shutdown.changed() => break,
            request = read_message::<_, Request>(&mut reader) => request?,
        };
        let Some(request) = request else {
            break;
        };
        debug!(node = %node.address(), peer = %peer, call = request.name(), "request");
        let response = select! {
            _ = shutdown.changed() => break,
            response = node.handle(request) => response,
        };
        write_message(&mut writer, &response).await?;
    }

    debug!(node = %node.address(), peer = %peer, "connection closed");
    Ok(())
}
