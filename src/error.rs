//! Error types for the MCP gateway.

use thiserror::Error;

use crate::mcp::protocol::error_codes;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway.
#[derive(Error, Debug)]
pub enum Error {
    // ===== Protocol Errors =====
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Session not initialized or has expired")]
    SessionExpired,

    // ===== Registry Errors =====
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Prompt not found: {0}")]
    PromptNotFound(String),

    // ===== Handler / Transport Errors =====
    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Transport error: {0}")]
    Transport(String),

    // ===== I/O Errors =====
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // ===== Internal Errors =====
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error onto the JSON-RPC error code table.
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            Self::Parse(_) => error_codes::PARSE_ERROR,
            Self::InvalidRequest(_) | Self::SessionExpired => error_codes::INVALID_REQUEST,
            Self::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => error_codes::INVALID_PARAMS,
            Self::ToolNotFound(_) => error_codes::TOOL_NOT_FOUND,
            Self::ResourceNotFound(_) => error_codes::RESOURCE_NOT_FOUND,
            Self::PromptNotFound(_) => error_codes::PROMPT_NOT_FOUND,
            _ => error_codes::INTERNAL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ToolNotFound("nope".to_string());
        assert_eq!(err.to_string(), "Tool not found: nope");

        let err = Error::SessionExpired;
        assert_eq!(err.to_string(), "Session not initialized or has expired");

        let err = Error::InvalidParams("missing 'name'".to_string());
        assert_eq!(err.to_string(), "Invalid params: missing 'name'");
    }

    #[test]
    fn test_jsonrpc_code_mapping() {
        assert_eq!(Error::Parse("bad".into()).jsonrpc_code(), -32700);
        assert_eq!(Error::InvalidRequest("x".into()).jsonrpc_code(), -32600);
        assert_eq!(Error::SessionExpired.jsonrpc_code(), -32600);
        assert_eq!(Error::MethodNotFound("x".into()).jsonrpc_code(), -32601);
        assert_eq!(Error::InvalidParams("x".into()).jsonrpc_code(), -32602);
        assert_eq!(Error::ResourceNotFound("x".into()).jsonrpc_code(), -32100);
        assert_eq!(Error::ToolNotFound("x".into()).jsonrpc_code(), -32101);
        assert_eq!(Error::PromptNotFound("x".into()).jsonrpc_code(), -32102);
        assert_eq!(Error::Handler("boom".into()).jsonrpc_code(), -32603);
        assert_eq!(Error::Internal("boom".into()).jsonrpc_code(), -32603);
    }
}
