//! MCP server exposing PostgreSQL administration as callable tools.
//!
//! Fifteen tools cover functions, row level security, indexes, schema, triggers,
//! roles, constraints, query statistics, comments, reads, writes, raw SQL and
//! diagnostics. Each call may name its own connection string; pools are shared
//! per connection string.
//!
//! # Example
//!
//! ```no_run
//! use pg_admin_mcp::{
//!     config::ServerConfig,
//!     protocol::McpServerBuilder,
//!     server::{McpHandler, ServerStateBuilder},
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::builder()
//!         .default_connection_string(Some("postgres://postgres@localhost/postgres".into()))
//!         .build();
//!
//!     let state = Arc::new(ServerStateBuilder::new().config(config).build()?);
//!
//!     let server = McpServerBuilder::new()
//!         .handler(McpHandler::new(state))
//!         .with_tools()
//!         .build()?;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod protocol;
pub mod security;
pub mod server;
pub mod tools;

pub use config::{PoolSettings, ServerConfig, ToolsConfig};
pub use database::{ConnectionHandle, ConnectionManager, ConnectionResolver};
pub use error::{ErrorKind, McpError, Result};
pub use protocol::{McpServer, McpServerBuilder};
pub use server::{McpHandler, ServerState, ServerStateBuilder};
pub use tools::{ToolContext, ToolHandler, ToolRegistry, all_tools};
