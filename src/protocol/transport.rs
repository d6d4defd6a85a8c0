//! Newline-delimited JSON-RPC transport.

use crate::error::{McpError, ProtocolError, Result};
use crate::protocol::types::{JsonRpcRequest, JsonRpcResponse, Message};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout,
};
use tokio::sync::Mutex;
use tracing::{debug, error, trace};

/// Transport trait for MCP communication.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Next message, or `None` at end of input.
    async fn read_message(&self) -> Result<Option<Message>>;
    async fn write_response(&self, response: &JsonRpcResponse) -> Result<()>;
}

/// One JSON message per line over any async reader/writer pair.
///
/// Responses from concurrently running calls are serialized by the writer lock,
/// so frames never interleave.
pub struct LineTransport<R, W> {
    reader: Mutex<BufReader<R>>,
    writer: Mutex<W>,
}

/// Stdio-based transport for MCP.
pub type StdioTransport = LineTransport<Stdin, Stdout>;

impl StdioTransport {
    pub fn new() -> Self {
        Self::from_parts(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn from_parts(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
        }
    }

    /// Read the next non-blank line.
    async fn read_line(&self) -> Result<Option<String>> {
        let mut reader = self.reader.lock().await;
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        trace!("Received line: {}", line);
                        return Ok(Some(line.to_string()));
                    }
                }
                Err(e) => {
                    error!("Error reading input: {}", e);
                    return Err(McpError::Io(e));
                }
            }
        }
    }

    async fn write_line(&self, content: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        trace!("Sending line: {}", content);
        writer.write_all(content.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<R, W> Transport for LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read_message(&self) -> Result<Option<Message>> {
        let Some(line) = self.read_line().await? else {
            return Ok(None);
        };

        // Try to parse as request first, then as response
        match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(request) => {
                debug!("Received request: method={}", request.method);
                Ok(Some(Message::Request(request)))
            }
            Err(_) => match serde_json::from_str::<JsonRpcResponse>(&line) {
                Ok(response) => {
                    debug!("Received response: id={:?}", response.id);
                    Ok(Some(Message::Response(response)))
                }
                Err(e) => {
                    error!("Failed to parse message: {}", e);
                    Err(McpError::Protocol(ProtocolError::ParseError))
                }
            },
        }
    }

    async fn write_response(&self, response: &JsonRpcResponse) -> Result<()> {
        let json = serde_json::to_string(response)?;
        debug!("Sending response: id={:?}", response.id);
        self.write_line(&json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::RequestId;

    #[test]
    fn test_request_parsing() {
        let json = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#;
        let request: JsonRpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.method, "initialize");
        assert_eq!(request.id, Some(RequestId::Number(1)));
    }

    #[tokio::test]
    async fn test_blank_lines_are_skipped() {
        let input: &[u8] = b"\n\n{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n";
        let transport = LineTransport::from_parts(input, Vec::new());

        match transport.read_message().await.unwrap() {
            Some(Message::Request(request)) => assert_eq!(request.method, "ping"),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(transport.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_garbage_is_parse_error() {
        let input: &[u8] = b"{not json\n";
        let transport = LineTransport::from_parts(input, Vec::new());
        assert!(matches!(
            transport.read_message().await,
            Err(McpError::Protocol(ProtocolError::ParseError))
        ));
    }

    #[tokio::test]
    async fn test_responses_are_newline_terminated() {
        let transport = LineTransport::from_parts(&b""[..], Vec::new());
        let response = JsonRpcResponse::success(Some(3.into()), serde_json::json!({}));
        transport.write_response(&response).await.unwrap();

        let written = transport.writer.into_inner();
        let text = String::from_utf8(written).unwrap();
        assert!(text.ends_with('\n'));
        assert!(text.contains("\"id\":3"));
    }
}
