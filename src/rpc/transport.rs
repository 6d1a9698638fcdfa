//! Stdio transport for the upstream edge.
//!
//! One message per line: serialise, append `\n`, flush. Reads come from the
//! process's stdin; writes go to stdout — all logging goes to stderr so the
//! protocol channel stays clean.
//!
//! Reading stays with the single server loop, but responses are written by
//! the dispatcher tasks servicing upstream calls, so the writer half is a
//! cloneable handle around a shared lock.

use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio::sync::Mutex;

use crate::rpc::protocol::{JsonRpcError, JsonRpcNotification, JsonRpcResponse};

/// Newline-delimited JSON transport over the process's standard streams.
pub struct StdioTransport {
    reader: BufReader<Stdin>,
    writer: TransportWriter,
}

impl StdioTransport {
    /// Creates a transport over this process's stdin/stdout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            reader: BufReader::new(tokio::io::stdin()),
            writer: TransportWriter {
                inner: Arc::new(Mutex::new(tokio::io::stdout())),
            },
        }
    }

    /// Reads the next line from stdin.
    ///
    /// Returns `None` on EOF (client closed the connection).
    ///
    /// # Errors
    ///
    /// Returns an error if reading from stdin fails.
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }

    /// Returns a cloneable handle for writing messages.
    #[must_use]
    pub fn writer(&self) -> TransportWriter {
        self.writer.clone()
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Write half of the transport; cheap to clone, serialises writers.
#[derive(Clone)]
pub struct TransportWriter {
    inner: Arc<Mutex<Stdout>>,
}

impl TransportWriter {
    /// Writes a success response.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to stdout fails.
    pub async fn write_response(&self, response: &JsonRpcResponse) -> std::io::Result<()> {
        self.write_message(response).await
    }

    /// Writes an error response.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to stdout fails.
    pub async fn write_error(&self, error: &JsonRpcError) -> std::io::Result<()> {
        self.write_message(error).await
    }

    /// Writes a notification.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to stdout fails.
    pub async fn write_notification(
        &self,
        notification: &JsonRpcNotification,
    ) -> std::io::Result<()> {
        self.write_message(notification).await
    }

    async fn write_message(&self, message: &impl Serialize) -> std::io::Result<()> {
        let line = encode_line(message)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut writer = self.inner.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await
    }
}

/// Encodes a message as one protocol line.
///
/// Shared with the downstream edge, where the session writes to a child's
/// stdin under its own lock.
///
/// # Errors
///
/// Returns an error if the message cannot be serialised.
pub fn encode_line(message: &impl Serialize) -> serde_json::Result<Vec<u8>> {
    let mut payload = serde_json::to_vec(message)?;
    payload.push(b'\n');
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::rpc::protocol::{JsonRpcRequest, RequestId};

    #[test]
    fn encode_line_is_newline_terminated() {
        let req = JsonRpcRequest::new(RequestId::Number(1), "ping", None);
        let line = encode_line(&req).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        // Exactly one line
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn encode_line_round_trips() {
        let req = JsonRpcRequest::new(
            RequestId::Number(3),
            "tools/call",
            Some(json!({"name": "hello"})),
        );
        let line = encode_line(&req).unwrap();
        let text = std::str::from_utf8(&line).unwrap().trim_end();
        let parsed: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(parsed["method"], "tools/call");
        assert_eq!(parsed["id"], 3);
    }

    #[test]
    fn writer_handle_is_cloneable() {
        let transport = StdioTransport::new();
        let a = transport.writer();
        let _b = a.clone();
    }
}
