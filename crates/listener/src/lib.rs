//! Roundwork socket transport.
//!
//! Serves node calls over TCP so an orchestrator can drive a long-running
//! process instead of spawning one per call. Each line on a connection is one
//! request; each request gets exactly one reply line.
//!
//! ## Wire format
//!
//! ```text
//! -> {"mode": "local" | "remote", "data": {"input": {...}, "state": {...}, "cache": {...}}}
//! <- {"type": "stdout", "data": {"output": {...}, "success": true, "cache": {...}}, "end": true}
//! <- {"type": "stderr", "data": "<error message>", "end": true}
//! ```
//!
//! A request whose `mode` is not a role is answered with an error and the
//! connection is closed. So is a request line longer than
//! [`MAX_REQUEST_BYTES`].
//!
//! ## Statelessness
//!
//! A fresh [`nodes::Node`] is built through the [`NodeProvider`] for every
//! request and runs on a blocking worker; the process keeps no state between
//! requests, so replies are identical to those of the stdin/stdout transport.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Framing, sockets and task scheduling live here; the
//! [`nodes`] crate sees only [`pipeline::CallRequest`]s.

use std::net::SocketAddr;
use std::sync::Arc;

use nodes::Node;
use pipeline::{CallRequest, PipelineError, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Largest request line accepted, newline excluded.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024 * 1024;

/// Builds the node that handles one request.
pub type NodeProvider = Arc<dyn Fn(Role) -> Result<Node, PipelineError> + Send + Sync>;

/// Errors that stop the listener or a connection.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    mode: String,
    #[serde(default)]
    data: Value,
}

/// One reply line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(rename = "type")]
    pub kind: ReplyKind,
    pub data: Value,
    pub end: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyKind {
    /// `data` is the response envelope.
    Stdout,
    /// `data` is an error message.
    Stderr,
}

impl Reply {
    fn ok(data: Value) -> Self {
        Self {
            kind: ReplyKind::Stdout,
            data,
            end: true,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Stderr,
            data: Value::String(message.into()),
            end: true,
        }
    }
}

/// What a connection should do after replying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    KeepOpen,
    Close,
}

/// Handles one request line synchronously.
///
/// Runs the full call: envelope parsing, node construction, `compute`, and
/// response serialization. Never panics on bad input; every failure becomes a
/// `stderr` reply.
pub fn handle_line(line: &str, provider: &NodeProvider) -> (Reply, Disposition) {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            let err = PipelineError::MalformedRequest {
                message: e.to_string(),
            };
            return (Reply::error(err.to_string()), Disposition::KeepOpen);
        }
    };

    let role: Role = match envelope.mode.parse() {
        Ok(role) => role,
        Err(message) => {
            tracing::warn!(mode = %envelope.mode, "Rejecting request with unknown mode");
            return (Reply::error(message), Disposition::Close);
        }
    };

    let outcome = CallRequest::from_value(envelope.data)
        .and_then(|request| provider(role)?.compute(request))
        .and_then(|response| response.to_value());

    match outcome {
        Ok(data) => (Reply::ok(data), Disposition::KeepOpen),
        Err(e) => {
            tracing::error!(%role, error = %e, retry = ?e.retry_policy(), "Call failed");
            (Reply::error(e.to_string()), Disposition::KeepOpen)
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Binds `addr` and serves until the task is cancelled.
pub async fn serve(addr: &str, provider: NodeProvider) -> Result<(), ListenerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ListenerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    run(listener, provider).await
}

/// Accepts connections on an already-bound listener.
pub async fn run(listener: TcpListener, provider: NodeProvider) -> Result<(), ListenerError> {
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, "Roundwork listener started");

    loop {
        let (stream, peer) = listener.accept().await?;
        let provider = Arc::clone(&provider);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, provider).await {
                tracing::warn!(%peer, error = %e, "Connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    provider: NodeProvider,
) -> Result<(), ListenerError> {
    tracing::debug!(%peer, "Connection accepted");
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let (reply, disposition) = match next_frame(&mut reader, MAX_REQUEST_BYTES).await? {
            Frame::Eof => break,
            Frame::Line(line) if line.trim().is_empty() => continue,
            Frame::Line(line) => {
                let provider = Arc::clone(&provider);
                match tokio::task::spawn_blocking(move || handle_line(&line, &provider)).await {
                    Ok(handled) => handled,
                    Err(e) => (Reply::error(format!("call worker failed: {e}")), Disposition::Close),
                }
            }
            Frame::NotUtf8 => (
                Reply::error("Malformed request: request line is not valid UTF-8"),
                Disposition::KeepOpen,
            ),
            Frame::TooLong => {
                tracing::warn!(%peer, limit = MAX_REQUEST_BYTES, "Rejecting oversized request");
                (
                    Reply::error(format!(
                        "Malformed request: request line exceeds {MAX_REQUEST_BYTES} bytes"
                    )),
                    Disposition::Close,
                )
            }
        };

        let mut encoded = serde_json::to_vec(&reply)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;

        if disposition == Disposition::Close {
            break;
        }
    }

    tracing::debug!(%peer, "Connection closed");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line(String),
    NotUtf8,
    /// The line did not end within the limit; the rest of it is unread.
    TooLong,
    Eof,
}

/// Reads one newline-terminated line of at most `max` bytes.
async fn next_frame<R>(reader: &mut R, max: usize) -> Result<Frame, ListenerError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
    let read = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if read == 0 {
        return Ok(Frame::Eof);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > max {
        return Ok(Frame::TooLong);
    }

    Ok(String::from_utf8(buf).map_or(Frame::NotUtf8, Frame::Line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodes::EndWithSuccess;
    use pipeline::Pipeline;
    use serde_json::json;

    fn build(role: Role) -> Result<Node, PipelineError> {
        Ok(Node::new(
            Pipeline::builder(role).phase("end", || EndWithSuccess).build()?,
        ))
    }

    fn provider() -> NodeProvider {
        Arc::new(build)
    }

    #[test]
    fn test_remote_call_returns_stdout_reply() {
        let line = json!({
            "mode": "remote",
            "data": {"input": {"site1": {}}, "state": {}, "cache": {}}
        })
        .to_string();
        let (reply, disposition) = handle_line(&line, &provider());
        assert_eq!(reply.kind, ReplyKind::Stdout);
        assert!(reply.end);
        assert_eq!(reply.data["success"], json!(true));
        assert_eq!(reply.data["cache"]["next_phase"], json!("end"));
        assert_eq!(disposition, Disposition::KeepOpen);
    }

    #[test]
    fn test_unknown_mode_closes_connection() {
        let line = json!({"mode": "observer", "data": {}}).to_string();
        let (reply, disposition) = handle_line(&line, &provider());
        assert_eq!(reply.kind, ReplyKind::Stderr);
        assert_eq!(disposition, Disposition::Close);
    }

    #[tokio::test]
    async fn test_frames_stop_at_the_size_limit() {
        let mut input: &[u8] = b"{\"a\":1}\r\n0123456789abcdef\n";
        assert_eq!(
            next_frame(&mut input, 8).await.unwrap(),
            Frame::Line("{\"a\":1}".to_string())
        );
        assert_eq!(next_frame(&mut input, 8).await.unwrap(), Frame::TooLong);

        let mut exact: &[u8] = b"12345678\n";
        assert_eq!(
            next_frame(&mut exact, 8).await.unwrap(),
            Frame::Line("12345678".to_string())
        );
        assert_eq!(next_frame(&mut exact, 8).await.unwrap(), Frame::Eof);

        let mut unterminated: &[u8] = b"tail";
        assert_eq!(
            next_frame(&mut unterminated, 8).await.unwrap(),
            Frame::Line("tail".to_string())
        );

        let mut binary: &[u8] = b"\xff\xfe\n";
        assert_eq!(next_frame(&mut binary, 8).await.unwrap(), Frame::NotUtf8);
    }

    #[test]
    fn test_malformed_lines_are_reported() {
        let (reply, disposition) = handle_line("{not json", &provider());
        assert_eq!(reply.kind, ReplyKind::Stderr);
        assert!(reply.data.as_str().unwrap().starts_with("Malformed request"));
        assert_eq!(disposition, Disposition::KeepOpen);

        let missing_input = json!({"mode": "local", "data": {"state": {}}}).to_string();
        let (reply, _) = handle_line(&missing_input, &provider());
        assert_eq!(reply.kind, ReplyKind::Stderr);
    }
}
