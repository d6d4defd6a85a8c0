//! Error types for the MCP server.
//!
//! Uses `thiserror` for ergonomic error definitions with automatic `From` conversions.
//! Every error maps onto one [`ErrorKind`], which is what clients see as the
//! prefix of an error envelope.

use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Main error type for the MCP server.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: Cow<'static, str> },
}

impl McpError {
    /// Machine-readable category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) | Self::Internal { .. } | Self::Io(_) => ErrorKind::ExecutionError,
            Self::Database(e) => e.kind(),
            Self::Config(_) => ErrorKind::ConfigurationError,
            Self::Tool(e) => e.kind(),
            Self::Json(_) => ErrorKind::ValidationError,
        }
    }
}

/// Category reported at the start of every error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigurationError,
    ConnectionError,
    ValidationError,
    UnknownOperation,
    MissingArgument,
    ExecutionError,
    ToolNotFound,
    ToolExecutionFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigurationError => "ConfigurationError",
            Self::ConnectionError => "ConnectionError",
            Self::ValidationError => "ValidationError",
            Self::UnknownOperation => "UnknownOperation",
            Self::MissingArgument => "MissingArgument",
            Self::ExecutionError => "ExecutionError",
            Self::ToolNotFound => "ToolNotFound",
            Self::ToolExecutionFailed => "ToolExecutionFailed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON-RPC 2.0 and MCP protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Parse error: invalid JSON")]
    ParseError,

    #[error("Invalid request: {0}")]
    InvalidRequest(Cow<'static, str>),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(Cow<'static, str>),

    #[error("Internal error: {0}")]
    InternalError(Cow<'static, str>),

    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),
}

impl ProtocolError {
    /// Returns the JSON-RPC 2.0 error code.
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest(_) => -32600,
            Self::MethodNotFound(_) => -32601,
            Self::InvalidParams(_) => -32602,
            Self::InternalError(_) => -32603,
            Self::Transport(_) => -32000,
        }
    }
}

/// Why a connection could not be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailureKind {
    /// Network failure, refused connection, unknown host, closed socket.
    Unreachable,
    /// The server rejected the credentials or the role.
    AuthenticationRejected,
    /// Connecting or waiting for a pooled connection took too long.
    Timeout,
}

impl fmt::Display for ConnectionFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unreachable => "cannot reach server",
            Self::AuthenticationRejected => "authentication rejected",
            Self::Timeout => "timed out",
        })
    }
}

/// Database-related errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed ({kind}): {message}")]
    Connection {
        kind: ConnectionFailureKind,
        message: String,
    },

    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Query timeout after {0}ms")]
    Timeout(u64),

    #[error("Statement cancelled: {0}")]
    Cancelled(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Cannot bind parameter: {0}")]
    Bind(String),
}

impl DatabaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::ConnectionError,
            Self::InvalidConnectionString(_) => ErrorKind::ConfigurationError,
            Self::Bind(_) => ErrorKind::ValidationError,
            Self::QueryFailed(_)
            | Self::Timeout(_)
            | Self::Cancelled(_)
            | Self::Transaction(_) => {
                ErrorKind::ExecutionError
            }
        }
    }

    pub fn connection(kind: ConnectionFailureKind, message: impl Into<String>) -> Self {
        Self::Connection {
            kind,
            message: message.into(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "No connection string available. Pass 'connectionString', start the server with \
        --connection-string, or set POSTGRES_CONNECTION_STRING."
    )]
    MissingConnectionString,

    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        field: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    #[error("Duplicate tool name in registry: {0}")]
    DuplicateTool(String),

    #[error("Invalid tools configuration file {path}: {message}")]
    ToolsFile { path: String, message: String },
}

/// Tool execution errors.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool '{name}' does not exist")]
    NotFound { name: String, disabled: bool },

    #[error("Unknown operation '{operation}' for {tool}. Valid operations: {}", valid.join(", "))]
    UnknownOperation {
        tool: &'static str,
        operation: String,
        valid: &'static [&'static str],
    },

    #[error("Missing required argument(s) for '{operation}': {}", fields.join(", "))]
    MissingArgument {
        operation: Cow<'static, str>,
        fields: Vec<&'static str>,
    },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::ToolNotFound,
            Self::UnknownOperation { .. } => ErrorKind::UnknownOperation,
            Self::MissingArgument { .. } => ErrorKind::MissingArgument,
            Self::InvalidArguments(_) => ErrorKind::ValidationError,
            Self::ExecutionFailed(_) => ErrorKind::ToolExecutionFailed,
        }
    }

    /// Message for a lookup miss. Disabled tools are acknowledged as existing.
    pub fn not_found_message(&self) -> Option<String> {
        match self {
            Self::NotFound {
                name,
                disabled: true,
            } => Some(format!(
                "Tool '{}' exists but is disabled by the current tool configuration",
                name
            )),
            Self::NotFound { name, .. } => Some(format!("Tool '{}' does not exist", name)),
            _ => None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }
}

/// Result type alias for McpError.
pub type Result<T> = std::result::Result<T, McpError>;

/// Result type alias for DatabaseError.
pub type DbResult<T> = std::result::Result<T, DatabaseError>;

/// Result type alias for ProtocolError.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
