//! MCP server binary entry point.

use anyhow::Result;
use clap::Parser;
use pg_admin_mcp::{
    config::{CONNECTION_STRING_ENV, PoolSettings, ServerConfig, TOOLS_CONFIG_ENV},
    database::{ConnectionManager, redact},
    protocol::McpServerBuilder,
    server::{McpHandler, ServerStateBuilder},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

/// MCP server for PostgreSQL administration.
///
/// Communicates via JSON-RPC 2.0 over stdin/stdout; logs go to stderr.
#[derive(Parser, Debug)]
#[command(name = "pg-admin-mcp")]
#[command(version, about, long_about = None)]
struct Args {
    /// Default connection string for calls that do not pass one.
    #[arg(short = 'c', long, value_name = "URL")]
    connection_string: Option<String>,

    /// JSON file listing the tools to enable: {"enabledTools": [...]}.
    #[arg(short = 't', long, value_name = "PATH", env = TOOLS_CONFIG_ENV)]
    tools_config: Option<PathBuf>,

    /// Maximum clients per connection pool.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    pool_size: u32,

    /// Seconds to wait for a new connection.
    #[arg(long, default_value_t = 30)]
    connect_timeout_secs: u64,

    /// Server-side statement_timeout for every connection, in milliseconds.
    #[arg(long)]
    statement_timeout_ms: Option<u64>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let pool = PoolSettings::default()
        .max_size(args.pool_size as usize)
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .statement_timeout(args.statement_timeout_ms.map(Duration::from_millis));

    let config = ServerConfig::builder()
        .pool(pool)
        .default_connection_string(args.connection_string)
        .from_env()
        .tools_config(args.tools_config)
        .build();

    match config
        .default_connection_string
        .as_deref()
        .or(config.env_connection_string.as_deref())
    {
        Some(conn) => info!("Default connection: {}", redact(conn)),
        None => info!(
            "No default connection string; calls must pass connectionString or set {}",
            CONNECTION_STRING_ENV
        ),
    }

    let connections = Arc::new(ConnectionManager::new(config.pool.clone()));
    let state = Arc::new(
        ServerStateBuilder::new()
            .config(config)
            .connections(connections)
            .build()?,
    );

    let server = McpServerBuilder::new()
        .handler(McpHandler::new(state))
        .name(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .with_tools()
        .build()?;

    info!("MCP server ready, waiting for requests...");

    let reason = server.run().await?;

    info!("Server stopped ({:?})", reason);
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "pg_admin_mcp=debug,warn"
    } else {
        "pg_admin_mcp=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // stdout carries protocol frames, so logs go to stderr
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .json()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_size_must_be_positive() {
        assert!(Args::try_parse_from(["pg-admin-mcp", "--pool-size", "0"]).is_err());

        let args = Args::try_parse_from(["pg-admin-mcp", "--pool-size", "1"]).unwrap();
        assert_eq!(args.pool_size, 1);
        assert_eq!(Args::try_parse_from(["pg-admin-mcp"]).unwrap().pool_size, 10);
    }
}
