//! Tool, resource, and prompt registries.
//!
//! Name-keyed mappings from descriptor to handler callback. Registration is
//! last-write-wins; enumeration order is unspecified and clients must not
//! rely on it. Resource lookup is by exact URI; URI templates are not
//! interpreted here.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::mcp::operations::{CancellationToken, ProgressReporter};
use crate::mcp::protocol::{
    CallToolResult, Prompt, PromptResult, ReadResourceResult, ResourceDescriptor, Tool,
};
use crate::mcp::session::Session;

/// Per-invocation context handed to handler callbacks.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub session: Session,
    /// Set for tool calls only; resource reads and prompt gets do not
    /// register operations.
    pub operation_id: Option<Uuid>,
    pub cancellation: CancellationToken,
    pub progress: ProgressReporter,
}

impl RequestContext {
    pub fn new(
        session: Session,
        operation_id: Option<Uuid>,
        cancellation: CancellationToken,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            session,
            operation_id,
            cancellation,
            progress,
        }
    }
}

/// Handler for a registered tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn descriptor(&self) -> Tool;

    async fn call(&self, arguments: Map<String, Value>, ctx: RequestContext)
        -> Result<CallToolResult>;
}

/// Handler for a registered resource.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    fn descriptor(&self) -> ResourceDescriptor;

    async fn read(
        &self,
        uri: &str,
        params: Option<Value>,
        ctx: RequestContext,
    ) -> Result<ReadResourceResult>;
}

/// Handler for a registered prompt.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    fn descriptor(&self) -> Prompt;

    async fn get(&self, arguments: Map<String, Value>, ctx: RequestContext) -> Result<PromptResult>;
}

/// Registry of tool handlers, keyed by tool name.
pub struct ToolRegistry {
    entries: RwLock<HashMap<String, Arc<dyn ToolHandler>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler under its descriptor name, replacing any previous
    /// registration with the same name.
    pub async fn register(&self, handler: Arc<dyn ToolHandler>) {
        let name = handler.descriptor().name;
        self.entries.write().await.insert(name, handler);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.entries.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<Tool> {
        self.entries
            .read()
            .await
            .values()
            .map(|h| h.descriptor())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of resource handlers, keyed by exact URI.
pub struct ResourceRegistry {
    entries: RwLock<HashMap<String, Arc<dyn ResourceHandler>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, handler: Arc<dyn ResourceHandler>) {
        let uri = handler.descriptor().uri;
        self.entries.write().await.insert(uri, handler);
    }

    pub async fn get(&self, uri: &str) -> Option<Arc<dyn ResourceHandler>> {
        self.entries.read().await.get(uri).cloned()
    }

    pub async fn list(&self) -> Vec<ResourceDescriptor> {
        self.entries
            .read()
            .await
            .values()
            .map(|h| h.descriptor())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of prompt handlers, keyed by prompt name.
pub struct PromptRegistry {
    entries: RwLock<HashMap<String, Arc<dyn PromptHandler>>>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, handler: Arc<dyn PromptHandler>) {
        let name = handler.descriptor().name;
        self.entries.write().await.insert(name, handler);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn PromptHandler>> {
        self.entries.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<Prompt> {
        self.entries
            .read()
            .await
            .values()
            .map(|h| h.descriptor())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for PromptRegistry {
    fn default() -> Self {
        Self::new()
    }
}
