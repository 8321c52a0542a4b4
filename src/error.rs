//! Error types for FluidMCP

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Bad input: {0}")]
    BadInput(String),

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Server already exists: {0}")]
    Conflict(String),

    #[error("Field is immutable: {0}")]
    ImmutableField(&'static str),

    #[error("Command not on allow-list: {0}")]
    CommandDenied(String),

    #[error("Server is not running: {0}")]
    NotRunning(String),

    #[error("Server is running: {0}")]
    AlreadyRunning(String),

    #[error("Failed to spawn child process: {0}")]
    ChildSpawn(String),

    #[error("Child process exited: {0}")]
    ChildExited(String),

    #[error("Timed out writing to child stdin")]
    ChildWriteTimeout,

    #[error("MCP handshake failed: {0}")]
    McpHandshake(String),

    #[error("Upstream request timed out after {0}ms")]
    McpTimeout(u64),

    #[error("MCP protocol violation: {0}")]
    McpProtocol(String),

    #[error("Child outbound queue is full")]
    Backpressure,

    #[error("Invalid or expired authorization state")]
    InvalidAuthState,

    #[error("Client id environment variable not set: {0}")]
    MissingClientId(String),

    #[error("Credential reference could not be resolved: {0}")]
    MissingCredential(String),

    #[error("OAuth code exchange failed with status {status}")]
    OauthExchange { status: u16, body: String },

    #[error("Pending authorization store is full")]
    AuthOverflow,

    #[error("Gateway is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable kind, propagated to API callers and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::BadInput(_) => "bad-input",
            Error::UnknownServer(_) => "unknown-server",
            Error::UnknownTool(_) => "unknown-tool",
            Error::Conflict(_) => "conflict",
            Error::ImmutableField(_) => "immutable-field",
            Error::CommandDenied(_) => "command-denied",
            Error::NotRunning(_) => "not-running",
            Error::AlreadyRunning(_) => "already-running",
            Error::ChildSpawn(_) => "child-spawn",
            Error::ChildExited(_) => "child-exited",
            Error::ChildWriteTimeout => "child-write-timeout",
            Error::McpHandshake(_) => "mcp-handshake",
            Error::McpTimeout(_) => "mcp-timeout",
            Error::McpProtocol(_) => "mcp-protocol",
            Error::Backpressure => "backpressure",
            Error::InvalidAuthState => "invalid-state",
            Error::MissingClientId(_) => "missing-client-id",
            Error::MissingCredential(_) => "missing-credential",
            Error::OauthExchange { .. } => "oauth-exchange",
            Error::AuthOverflow => "auth-overflow",
            Error::ShuttingDown => "shutting-down",
            Error::Json(_) => "bad-input",
            Error::Io(_) | Error::Http(_) | Error::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadInput(_) | Error::Json(_) | Error::ImmutableField(_) => {
                StatusCode::BAD_REQUEST
            },
            Error::InvalidAuthState => StatusCode::BAD_REQUEST,
            Error::UnknownServer(_) | Error::UnknownTool(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) | Error::AlreadyRunning(_) => StatusCode::CONFLICT,
            Error::CommandDenied(_) => StatusCode::FORBIDDEN,
            Error::NotRunning(_) | Error::ShuttingDown | Error::Backpressure => {
                StatusCode::SERVICE_UNAVAILABLE
            },
            Error::McpTimeout(_) | Error::ChildWriteTimeout => StatusCode::GATEWAY_TIMEOUT,
            Error::OauthExchange { .. } | Error::McpProtocol(_) | Error::ChildExited(_) => {
                StatusCode::BAD_GATEWAY
            },
            Error::McpHandshake(_) | Error::ChildSpawn(_) => StatusCode::BAD_GATEWAY,
            Error::MissingClientId(_) | Error::MissingCredential(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
            Error::AuthOverflow => StatusCode::SERVICE_UNAVAILABLE,
            Error::Io(_) | Error::Http(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::McpTimeout(_) | Error::Http(_) | Error::Backpressure
        )
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Provider bodies are relayed as details; internal error messages stay
        // out of the response body (they go to the logs instead).
        let (message, details) = match &self {
            Error::OauthExchange { body, .. } => {
                (self.to_string(), serde_json::from_str(body).ok())
            },
            Error::Internal(_) | Error::Io(_) => ("internal error".to_string(), None),
            _ => (self.to_string(), None),
        };

        let mut error = json!({
            "kind": self.kind(),
            "message": message,
        });
        if let Some(details) = details {
            error["details"] = details;
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}
