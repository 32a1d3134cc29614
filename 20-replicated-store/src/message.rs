use std::io;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::StoreError;
use crate::log::LogEntry;
use crate::registry::PeerInfo;
use crate::state::CandidateInfo;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Calls accepted by a store node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Write {
        key: i64,
        value: String,
    },
    FastRead {
        key: i64,
    },
    DefaultRead {
        key: i64,
    },
    ConsistentRead {
        key: i64,
    },
    ReplicateEntry {
        term: u64,
        leader: String,
        entry: LogEntry,
    },
    CommitEntry {
        term: u64,
        leader: String,
        entry: LogEntry,
    },
    RegisterPeer {
        peer: PeerInfo,
    },
    PullLog {
        requester: String,
    },
    Heartbeat {
        leader: String,
        term: u64,
        timestamp_ms: u64,
        log_length: usize,
        committed_count: usize,
    },
    RequestVote {
        candidate: String,
        term: u64,
        info: CandidateInfo,
    },
    AnnounceLeader {
        leader: String,
        term: u64,
    },
}

impl Request {
    /// Short name used in log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Write { .. } => "write",
            Request::FastRead { .. } => "fast_read",
            Request::DefaultRead { .. } => "default_read",
            Request::ConsistentRead { .. } => "consistent_read",
            Request::ReplicateEntry { .. } => "replicate_entry",
            Request::CommitEntry { .. } => "commit_entry",
            Request::RegisterPeer { .. } => "register_peer",
            Request::PullLog { .. } => "pull_log",
            Request::Heartbeat { .. } => "heartbeat",
            Request::RequestVote { .. } => "request_vote",
            Request::AnnounceLeader { .. } => "announce_leader",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ack { ok: bool, term: u64 },
    Value { value: String },
    Registered { is_leader: bool },
    Log { entries: Vec<LogEntry> },
    Vote { granted: bool, term: u64 },
    Error { error: StoreError },
}

impl Response {
    /// Unwraps a read reply.
    pub fn into_value(self) -> Result<String, StoreError> {
        match self {
            Response::Value { value } => Ok(value),
            Response::Error { error } => Err(error),
            other => Err(unexpected(&other)),
        }
    }

    /// Unwraps a write reply.
    pub fn into_ack(self) -> Result<bool, StoreError> {
        match self {
            Response::Ack { ok, .. } => Ok(ok),
            Response::Error { error } => Err(error),
            other => Err(unexpected(&other)),
        }
    }
}

impl From<Result<String, StoreError>> for Response {
    fn from(result: Result<String, StoreError>) -> Self {
        match result {
            Ok(value) => Response::Value { value },
            Err(error) => Response::Error { error },
        }
    }
}

pub(crate) fn unexpected(response: &Response) -> StoreError {
    StoreError::rpc(format!("unexpected response: {response:?}"))
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_tagged_by_call_name() {
        let json = serde_json::to_string(&Request::FastRead { key: 42 }).expect("encode");
        assert_eq!(json, r#"{"type":"fast_read","key":42}"#);
    }

    #[test]
    fn error_response_unwraps_to_typed_error() {
        let response = Response::Error {
            error: StoreError::KeyNotFound { key: 7 },
        };
        assert_eq!(
            response.into_value(),
            Err(StoreError::KeyNotFound { key: 7 })
        );
        assert!(matches!(
            Response::Registered { is_leader: true }.into_ack(),
            Err(StoreError::Rpc { .. })
        ));
    }

    #[tokio::test]
    async fn framing_skips_blank_lines() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);

        writer.write_all(b"\r\n\n").await.expect("write blanks");
        let heartbeat = Request::Heartbeat {
            leader: "127.0.0.1:7001".into(),
            term: 3,
            timestamp_ms: 1_000,
            log_length: 2,
            committed_count: 1,
        };
        write_message(&mut writer, &heartbeat)
            .await
            .expect("write message");
        drop(writer);

        let parsed = read_message::<_, Request>(&mut reader)
            .await
            .expect("read message")
            .expect("expected message");
        assert_eq!(parsed, heartbeat);
        assert!(read_message::<_, Request>(&mut reader)
            .await
            .expect("read eof")
            .is_none());
    }
}
