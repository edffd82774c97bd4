//! MCP Gateway - a session-oriented Model Context Protocol server runtime.
//!
//! Implements the server side of MCP: an AI client discovers and invokes
//! server-registered tools, resources, and prompts over JSON-RPC 2.0. The
//! runtime negotiates sessions, dispatches typed method calls to handler
//! callbacks, streams progress from long-running tool calls, and honors
//! client-initiated cancellation.
//!
//! # Architecture
//!
//! 1. **Protocol layer** (`mcp::protocol`) - Wire types and error taxonomy
//! 2. **Registries** (`mcp::registry`) - Descriptor-to-handler mappings
//! 3. **Runtime** (`mcp::engine`, `mcp::session`, `mcp::operations`) -
//!    Dispatch, session lifecycle, operation bookkeeping
//! 4. **Transports** (`mcp::transport`, `http`) - Stdio and streamable HTTP
//!
//! The streamable HTTP transport multiplexes the whole protocol onto one
//! endpoint: POST for requests (responses stream back as SSE on the same
//! response), GET for the per-session notification stream, DELETE for
//! session teardown, correlated by the `mcp-session-id` header.

pub mod config;
pub mod error;
pub mod http;
pub mod mcp;

pub use error::{Error, Result};

/// Server version advertised in `serverInfo`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
