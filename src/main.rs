//! MCP gateway reference server.
//!
//! Serves a small demonstration capability set (a stepped data-processing
//! tool, a server-time resource, and a summarize prompt) over the stdio or
//! streamable HTTP transport.

use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mcp_gateway::config::{Args, Config, TransportMode};
use mcp_gateway::error::Result;
use mcp_gateway::http::{Auth, HttpConfig, HttpTransport};
use mcp_gateway::mcp::protocol::{
    CallToolResult, Content, Prompt, PromptArgument, PromptMessage, PromptResult,
    ReadResourceResult, ResourceContent, ResourceDescriptor, ServerInfo, Tool,
};
use mcp_gateway::mcp::{
    Engine, PromptHandler, RequestContext, ResourceHandler, StdioTransport, ToolHandler,
};
use mcp_gateway::VERSION;

/// Stepped work loop reporting progress and honoring cancellation.
struct ProcessDataTool;

#[async_trait]
impl ToolHandler for ProcessDataTool {
    fn descriptor(&self) -> Tool {
        Tool::new(
            "processData",
            "Process a batch of data in discrete steps, reporting progress",
            json!({
                "type": "object",
                "properties": {
                    "steps": { "type": "integer", "minimum": 1, "default": 3 },
                    "stepMs": { "type": "integer", "minimum": 0, "default": 25 }
                }
            }),
        )
    }

    async fn call(
        &self,
        arguments: Map<String, Value>,
        ctx: RequestContext,
    ) -> Result<CallToolResult> {
        let steps = arguments
            .get("steps")
            .and_then(Value::as_u64)
            .unwrap_or(3)
            .max(1);
        let step_ms = arguments.get("stepMs").and_then(Value::as_u64).unwrap_or(25);

        for step in 1..=steps {
            tokio::time::sleep(Duration::from_millis(step_ms)).await;
            if ctx.cancellation.is_cancelled() {
                return Ok(CallToolResult::text(format!(
                    "processing interrupted after {} of {} steps",
                    step - 1,
                    steps
                )));
            }
            ctx.progress
                .report(
                    step as f64 / steps as f64,
                    Some(&format!("step {step} of {steps}")),
                )
                .await;
        }

        Ok(CallToolResult::text(format!("processed {steps} steps")))
    }
}

/// Current server time as a readable resource.
struct ServerTimeResource;

#[async_trait]
impl ResourceHandler for ServerTimeResource {
    fn descriptor(&self) -> ResourceDescriptor {
        ResourceDescriptor::new("server://time", "time", "Current server time (RFC 3339)")
            .with_mime_type("text/plain")
    }

    async fn read(
        &self,
        uri: &str,
        _params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<ReadResourceResult> {
        Ok(ReadResourceResult {
            contents: vec![ResourceContent {
                uri: uri.to_string(),
                mime_type: Some("text/plain".to_string()),
                text: Some(Utc::now().to_rfc3339()),
                blob: None,
            }],
        })
    }
}

/// Summarization prompt template.
struct SummarizePrompt;

#[async_trait]
impl PromptHandler for SummarizePrompt {
    fn descriptor(&self) -> Prompt {
        Prompt {
            name: "summarize".to_string(),
            description: "Summarize a piece of text".to_string(),
            arguments: vec![
                PromptArgument {
                    name: "text".to_string(),
                    description: "The text to summarize".to_string(),
                    required: true,
                    default: None,
                },
                PromptArgument {
                    name: "style".to_string(),
                    description: "Summary style".to_string(),
                    required: false,
                    default: Some(json!("concise")),
                },
            ],
        }
    }

    async fn get(
        &self,
        arguments: Map<String, Value>,
        _ctx: RequestContext,
    ) -> Result<PromptResult> {
        let text = arguments
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let style = arguments
            .get("style")
            .and_then(Value::as_str)
            .unwrap_or("concise");

        Ok(PromptResult {
            description: Some("Summarize a piece of text".to_string()),
            messages: vec![PromptMessage {
                role: "user".to_string(),
                content: Content::text(format!(
                    "Write a {style} summary of the following text:\n\n{text}"
                )),
            }],
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("failed to set tracing subscriber");

    let config: Config = args.into();
    info!("MCP gateway v{}", VERSION);

    let engine = Arc::new(Engine::new(ServerInfo {
        name: "mcp-gateway".to_string(),
        version: VERSION.to_string(),
    }));

    engine.tools().register(Arc::new(ProcessDataTool)).await;
    engine
        .resources()
        .register(Arc::new(ServerTimeResource))
        .await;
    engine.prompts().register(Arc::new(SummarizePrompt)).await;
    info!(
        tools = engine.tools().len().await,
        resources = engine.resources().len().await,
        prompts = engine.prompts().len().await,
        "capabilities registered"
    );

    match config.transport {
        TransportMode::Stdio => {
            info!("serving on stdio");
            let transport = StdioTransport::start();
            engine.bind(transport).await;
            tokio::signal::ctrl_c().await?;
            engine.shutdown().await;
        }
        TransportMode::Http => {
            let http_config = HttpConfig {
                endpoint: config.endpoint.clone(),
                auth: config
                    .auth_token
                    .clone()
                    .map(Auth::Static)
                    .unwrap_or(Auth::Disabled),
                resource_metadata: config.resource_metadata.clone(),
            };
            let transport = HttpTransport::new(http_config, engine.sessions().clone());
            engine.bind(transport.clone()).await;

            let addr = SocketAddr::new(config.host, config.port);
            transport.serve(addr).await?;
        }
    }

    Ok(())
}
