//! MCP server with lifecycle management.

use crate::error::{McpError, ProtocolError, Result};
use crate::protocol::handler::{Dispatcher, Handler};
use crate::protocol::transport::{StdioTransport, Transport};
use crate::protocol::types::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// How long in-flight tool calls may take to finish once shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Server state enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Server created but not initialized.
    Created,
    /// Initialize request received, awaiting initialized notification.
    Initializing,
    /// Server is fully operational.
    Running,
    /// Shutdown requested.
    ShuttingDown,
    /// Server has stopped.
    Stopped,
}

/// Why the read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfInput,
    ShutdownRequest,
    Signal,
    TransportError,
}

/// MCP Server.
pub struct McpServer<H: Handler> {
    info: ServerInfo,
    capabilities: ServerCapabilities,
    handler: Arc<H>,
    state: Arc<RwLock<ServerState>>,
}

impl<H: Handler + 'static> McpServer<H> {
    /// Create a new MCP server.
    pub fn new(handler: H, info: ServerInfo, capabilities: ServerCapabilities) -> Self {
        Self {
            info,
            capabilities,
            handler: Arc::new(handler),
            state: Arc::new(RwLock::new(ServerState::Created)),
        }
    }

    /// Get current server state.
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Run the server on stdin/stdout until EOF, a `shutdown` request or a termination signal.
    #[instrument(skip(self), fields(server = %self.info.name))]
    pub async fn run(self) -> Result<StopReason> {
        let transport = Arc::new(StdioTransport::new());
        self.run_with_transport(transport, shutdown_signal()).await
    }

    /// Run the server with a custom transport and stop trigger.
    ///
    /// `tools/call` requests run as separate tasks so their database waits
    /// interleave; every other method is answered in arrival order. Once the
    /// loop stops, running calls get [`DRAIN_TIMEOUT`] to finish, then the
    /// handler's `shutdown` runs exactly once.
    pub async fn run_with_transport<T, S>(self, transport: Arc<T>, stop: S) -> Result<StopReason>
    where
        T: Transport + 'static,
        S: std::future::Future<Output = ()>,
    {
        info!(
            "Starting MCP server: {} v{}",
            self.info.name, self.info.version
        );

        let dispatcher =
            Dispatcher::new(Arc::clone(&self.handler)).advertising(self.capabilities.clone());
        let mut in_flight: JoinSet<()> = JoinSet::new();
        tokio::pin!(stop);

        let reason = loop {
            // Reap finished calls so the set does not grow unbounded
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!("Tool call task failed: {}", e);
                }
            }

            let message = tokio::select! {
                _ = &mut stop => {
                    info!("Termination signal received");
                    break StopReason::Signal;
                }
                message = transport.read_message() => message,
            };

            let message = match message {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    debug!("EOF received, shutting down");
                    break StopReason::EndOfInput;
                }
                Err(McpError::Protocol(ProtocolError::ParseError)) => {
                    let response = JsonRpcResponse::error(None, ProtocolError::ParseError);
                    if let Err(e) = transport.write_response(&response).await {
                        error!("Failed to send error response: {}", e);
                    }
                    continue;
                }
                Err(e) => {
                    error!("Transport error: {}", e);
                    break StopReason::TransportError;
                }
            };

            match message {
                Message::Request(request) => {
                    let is_notification = request.is_notification();
                    let method = request.method.clone();
                    self.update_state_for_method(&method).await;

                    if method == "tools/call" {
                        let dispatcher = dispatcher.clone();
                        let transport = Arc::clone(&transport);
                        in_flight.spawn(async move {
                            let response = dispatcher.dispatch(request).await;
                            if !is_notification
                                && let Err(e) = transport.write_response(&response).await
                            {
                                error!("Failed to send response: {}", e);
                            }
                        });
                        continue;
                    }

                    let response = dispatcher.dispatch(request).await;
                    if !is_notification && let Err(e) = transport.write_response(&response).await {
                        error!("Failed to send response: {}", e);
                    }

                    if method == "shutdown" {
                        info!("Shutdown request received");
                        break StopReason::ShutdownRequest;
                    }
                }
                Message::Response(response) => {
                    warn!("Unexpected response received: {:?}", response.id);
                }
            }
        };

        *self.state.write().await = ServerState::ShuttingDown;
        self.drain(&mut in_flight).await;

        if let Err(e) = self.handler.shutdown().await {
            error!("Handler shutdown failed: {}", e);
        }

        *self.state.write().await = ServerState::Stopped;
        info!("Server stopped ({:?})", reason);
        Ok(reason)
    }

    async fn drain(&self, in_flight: &mut JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }
        info!("Waiting for {} in-flight tool call(s)", in_flight.len());
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "Abandoning {} tool call(s) still running after {:?}",
                in_flight.len(),
                DRAIN_TIMEOUT
            );
            in_flight.abort_all();
        }
    }

    /// Update server state based on the method being processed.
    async fn update_state_for_method(&self, method: &str) {
        let mut state = self.state.write().await;
        match method {
            "initialize" => {
                if *state == ServerState::Created {
                    *state = ServerState::Initializing;
                }
            }
            "initialized" | "notifications/initialized" => {
                if *state == ServerState::Initializing {
                    *state = ServerState::Running;
                    info!("Server initialized and running");
                }
            }
            "shutdown" => {
                *state = ServerState::ShuttingDown;
            }
            _ => {}
        }
    }
}

/// Completes on Ctrl-C, or on SIGTERM where available.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Builder for MCP Server.
pub struct McpServerBuilder<H: Handler> {
    handler: Option<H>,
    name: String,
    version: String,
    capabilities: ServerCapabilities,
}

impl<H: Handler + 'static> McpServerBuilder<H> {
    pub fn new() -> Self {
        Self {
            handler: None,
            name: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
            capabilities: ServerCapabilities::default(),
        }
    }

    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Announces the tools capability in `initialize`.
    pub fn with_tools(mut self) -> Self {
        self.capabilities.tools = Some(ToolsCapability {
            list_changed: Some(false),
        });
        self
    }

    pub fn build(self) -> Result<McpServer<H>> {
        let handler = self.handler.ok_or_else(|| McpError::Internal {
            message: "Handler is required".into(),
        })?;

        Ok(McpServer::new(
            handler,
            ServerInfo {
                name: self.name,
                version: self.version,
            },
            self.capabilities,
        ))
    }
}

impl<H: Handler + 'static> Default for McpServerBuilder<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolResult;
    use crate::protocol::transport::LineTransport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TestHandler {
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for TestHandler {
        async fn initialize(&self, _params: InitializeParams) -> ProtocolResult<InitializeResult> {
            Ok(InitializeResult {
                protocol_version: MCP_VERSION.into(),
                capabilities: ServerCapabilities::default(),
                server_info: ServerInfo {
                    name: "test".into(),
                    version: "1.0".into(),
                },
                instructions: None,
            })
        }

        async fn initialized(&self) -> ProtocolResult<()> {
            Ok(())
        }

        async fn shutdown(&self) -> ProtocolResult<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn list_tools(&self) -> ProtocolResult<ListToolsResult> {
            Ok(ListToolsResult {
                tools: vec![],
                next_cursor: None,
            })
        }

        async fn call_tool(&self, params: CallToolParams) -> ProtocolResult<CallToolResult> {
            Ok(CallToolResult::text(params.name))
        }
    }

    #[test]
    fn test_server_builder() {
        let server = McpServerBuilder::new()
            .handler(TestHandler::default())
            .name("test-server")
            .version("0.1.0")
            .with_tools()
            .build()
            .unwrap();

        assert_eq!(server.info.name, "test-server");
        assert_eq!(server.info.version, "0.1.0");
        assert!(server.capabilities.tools.is_some());
    }

    #[tokio::test]
    async fn test_server_state() {
        let server = McpServerBuilder::new()
            .handler(TestHandler::default())
            .build()
            .unwrap();

        assert_eq!(server.state().await, ServerState::Created);
    }

    #[tokio::test]
    async fn test_eof_runs_shutdown_once() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let server = McpServerBuilder::new()
            .handler(TestHandler {
                shutdowns: Arc::clone(&shutdowns),
            })
            .build()
            .unwrap();

        let input: &'static [u8] = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/call\",\"params\":{\"name\":\"a\"}}\n";
        let transport = Arc::new(LineTransport::from_parts(input, Vec::new()));
        let reason = server
            .run_with_transport(transport, std::future::pending())
            .await
            .unwrap();

        assert_eq!(reason, StopReason::EndOfInput);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_request_stops_loop() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let server = McpServerBuilder::new()
            .handler(TestHandler {
                shutdowns: Arc::clone(&shutdowns),
            })
            .build()
            .unwrap();

        let input: &'static [u8] = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"shutdown\"}\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n";
        let transport = Arc::new(LineTransport::from_parts(input, Vec::new()));
        let reason = server
            .run_with_transport(transport, std::future::pending())
            .await
            .unwrap();

        assert_eq!(reason, StopReason::ShutdownRequest);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_trigger_ends_loop() {
        let server = McpServerBuilder::new()
            .handler(TestHandler::default())
            .build()
            .unwrap();

        // A reader that never yields a line keeps the loop waiting on input.
        let (reader, _keep_open) = tokio::io::duplex(64);
        let transport = Arc::new(LineTransport::from_parts(reader, Vec::new()));
        let reason = server
            .run_with_transport(transport, async {})
            .await
            .unwrap();

        assert_eq!(reason, StopReason::Signal);
    }
}
