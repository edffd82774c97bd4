//! Configuration for the gateway binary.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Command-line arguments for the MCP gateway.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-gateway")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Session-oriented MCP server with a streamable HTTP transport")]
pub struct Args {
    /// Transport mode: stdio or http
    #[arg(short, long, default_value = "http", env = "MCP_GATEWAY_TRANSPORT")]
    pub transport: TransportMode,

    /// Bind address (http transport)
    #[arg(long, default_value = "127.0.0.1", env = "MCP_GATEWAY_HOST")]
    pub host: IpAddr,

    /// Bind port (http transport)
    #[arg(short, long, default_value = "3000", env = "MCP_GATEWAY_PORT")]
    pub port: u16,

    /// Endpoint path serving the protocol
    #[arg(long, default_value = "/mcp", env = "MCP_GATEWAY_ENDPOINT")]
    pub endpoint: String,

    /// Static bearer token required on every HTTP request
    #[arg(long, env = "MCP_GATEWAY_TOKEN")]
    pub auth_token: Option<String>,

    /// Resource metadata URL advertised in WWW-Authenticate challenges
    #[arg(long, env = "MCP_GATEWAY_RESOURCE_METADATA")]
    pub resource_metadata: Option<String>,

    /// Enable debug logging
    #[arg(short, long, env = "MCP_GATEWAY_DEBUG")]
    pub debug: bool,
}

/// Transport mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Stdio,
    #[default]
    Http,
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportMode,
    pub host: IpAddr,
    pub port: u16,
    pub endpoint: String,
    pub auth_token: Option<String>,
    pub resource_metadata: Option<String>,
    pub debug: bool,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            transport: args.transport,
            host: args.host,
            port: args.port,
            endpoint: args.endpoint,
            auth_token: args.auth_token,
            resource_metadata: args.resource_metadata,
            debug: args.debug,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportMode::Http,
            host: IpAddr::from([127, 0, 0, 1]),
            port: 3000,
            endpoint: "/mcp".to_string(),
            auth_token: None,
            resource_metadata: None,
            debug: false,
        }
    }
}
