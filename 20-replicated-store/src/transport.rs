//! Outbound peer connections and the bounded retry policy.
//!
//! A [`PeerConnection`] dials lazily on first use and keeps the stream for later
//! calls. Callers lease the stream for one request/response exchange at a time;
//! any failure drops it so the next call redials.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::message::{read_message, write_message, Request, Response};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed by peer")]
    Closed,
}

/// Bounded exponential backoff applied to every peer call that must not be lost.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on a single request/response exchange.
    pub rpc_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(800),
            rpc_timeout: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

struct Stream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

pub struct PeerConnection {
    address: String,
    stream: Mutex<Option<Stream>>,
}

impl PeerConnection {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            stream: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// One exchange, bounded by `timeout`.
    pub async fn call(&self, request: &Request, timeout: Duration) -> Result<Response, TransportError> {
        let mut lease = self.stream.lock().await;
        let outcome = tokio::time::timeout(timeout, exchange(&mut lease, &self.address, request)).await;
        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                *lease = None;
                Err(err)
            }
            Err(_) => {
                *lease = None;
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    /// Calls until a response arrives or `policy.max_attempts` is spent.
    pub async fn call_with_retry(
        &self,
        request: &Request,
        policy: &RetryPolicy,
    ) -> Result<Response, StoreError> {
        let attempts = policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.call(request, policy.rpc_timeout).await {
                Ok(response) => return Ok(response),
                Err(err) if attempt < attempts => {
                    let delay = policy.backoff(attempt);
                    debug!(
                        peer = %self.address,
                        call = request.name(),
                        attempt,
                        ?delay,
                        error = %err,
                        "peer call failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(
                        peer = %self.address,
                        call = request.name(),
                        attempts,
                        error = %err,
                        "peer call failed, giving up"
                    );
                }
            }
        }
        Err(StoreError::PeerUnreachable {
            address: self.address.clone(),
            attempts,
        })
    }

    /// Drops the cached stream, if any.
    pub async fn close(&self) {
        self.stream.lock().await.take();
    }
}

async fn exchange(
    slot: &mut Option<Stream>,
    address: &str,
    request: &Request,
) -> Result<Response, TransportError> {
    if slot.is_none() {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        *slot = Some(Stream {
            reader: BufReader::new(reader),
            writer,
        });
    }
    let Some(stream) = slot.as_mut() else {
        return Err(TransportError::Closed);
    };

    write_message(&mut stream.writer, request).await?;
    match read_message::<_, Response>(&mut stream.reader).await? {
        Some(response) => Ok(response),
        None => Err(TransportError::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(300),
            rpc_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(50));
        assert_eq!(policy.backoff(2), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(300));
        assert_eq!(policy.backoff(40), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn retry_gives_up_with_peer_unreachable() {
        // Bind then drop to get a port nobody is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let conn = PeerConnection::new(addr.to_string());
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            rpc_timeout: Duration::from_millis(200),
        };
        let result = conn
            .call_with_retry(&Request::FastRead { key: 1 }, &policy)
            .await;
        assert_eq!(
            result,
            Err(StoreError::PeerUnreachable {
                address: addr.to_string(),
                attempts: 3
            })
        );
    }

    #[tokio::test]
    async fn stream_is_reused_across_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            // Exactly one accepted connection serves both calls.
            let (stream, _) = listener.accept().await.expect("accept");
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            while let Ok(Some(request)) = read_message::<_, Request>(&mut reader).await {
                let value = match request {
                    Request::FastRead { key } => format!("v{key}"),
                    _ => String::new(),
                };
                write_message(&mut writer, &Response::Value { value })
                    .await
                    .expect("reply");
            }
        });

        let conn = PeerConnection::new(addr.to_string());
        let timeout = Duration::from_secs(1);
        for key in [1, 2] {
            let response = conn
                .call(&Request::FastRead { key }, timeout)
                .await
                .expect("call");
            assert_eq!(response.into_value(), Ok(format!("v{key}")));
        }

        conn.close().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), server).await;
    }
}
