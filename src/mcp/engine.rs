//! The dispatch engine.
//!
//! Routes inbound JSON-RPC messages to registered handlers, creates sessions
//! on `initialize`, tracks tool calls as operations, and serializes results
//! back through the bound transport. One dispatcher consumes messages in
//! arrival order; tool handlers run on their own tasks so dispatch never
//! waits on user code.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::mcp::operations::{
    CancellationToken, OperationManager, ProgressReporter, ProgressSink,
};
use crate::mcp::protocol::{
    error_codes, methods, CallToolParams, CancelParams, GetPromptParams, InitializeParams,
    InitializeResult, JsonRpcNotification, JsonRpcResponse, ListPromptsResult,
    ListResourcesResult, ListToolsResult, ProgressParams, ReadResourceParams, RequestId,
    ServerCapabilities, ServerInfo, PROTOCOL_VERSION,
};
use crate::mcp::registry::{PromptRegistry, RequestContext, ResourceRegistry, ToolRegistry};
use crate::mcp::session::{Session, SessionEvent, SessionManager};
use crate::mcp::transport::{Transport, TransportMessage};

/// The protocol runtime. Owns the session manager, the three registries,
/// and the operation manager; binds to exactly one transport.
pub struct Engine {
    server_info: ServerInfo,
    sessions: Arc<SessionManager>,
    operations: Arc<OperationManager>,
    tools: ToolRegistry,
    resources: ResourceRegistry,
    prompts: PromptRegistry,
    transport: OnceLock<Arc<dyn Transport>>,
}

impl Engine {
    pub fn new(server_info: ServerInfo) -> Self {
        Self {
            server_info,
            sessions: Arc::new(SessionManager::new()),
            operations: Arc::new(OperationManager::new()),
            tools: ToolRegistry::new(),
            resources: ResourceRegistry::new(),
            prompts: PromptRegistry::new(),
            transport: OnceLock::new(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn operations(&self) -> &Arc<OperationManager> {
        &self.operations
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    pub fn prompts(&self) -> &PromptRegistry {
        &self.prompts
    }

    /// Bind the engine to its transport, install the progress sink, and
    /// start the dispatch loop and the disconnect cleanup subscriber.
    ///
    /// # Panics
    ///
    /// Panics when called twice; binding two transports is a programmer
    /// error.
    pub async fn bind(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        let mut inbound = transport.subscribe();
        assert!(
            self.transport.set(transport).is_ok(),
            "engine is already bound to a transport"
        );

        let sink_arc: Arc<dyn ProgressSink> = self.clone();
        let sink: Weak<dyn ProgressSink> = Arc::downgrade(&sink_arc);
        self.operations.set_progress_sink(sink).await;

        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(msg) => engine.dispatch(msg).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "inbound stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("dispatch loop stopped");
        });

        let mut events = self.sessions.subscribe();
        let operations = self.operations.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Disconnected(session_id)) => {
                        operations.cleanup_session(session_id).await;
                    }
                    Ok(SessionEvent::Connected(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "session event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// End every session and close the bound transport.
    pub async fn shutdown(&self) {
        for session_id in self.sessions.session_ids().await {
            self.sessions.end(session_id).await;
        }
        if let Some(transport) = self.transport.get() {
            if let Err(e) = transport.close().await {
                warn!("transport close failed: {}", e);
            }
        }
    }

    /// Compose and send a JSON-RPC notification to a session.
    pub async fn send_notification(&self, session_id: Uuid, method: &str, params: Value) {
        let notification = JsonRpcNotification::new(method, Some(params));
        let payload = match serde_json::to_value(&notification) {
            Ok(v) => v,
            Err(e) => {
                error!("failed to serialize notification: {}", e);
                return;
            }
        };
        if let Err(e) = self.transport_ref().send(payload, Some(session_id)).await {
            warn!(%session_id, %method, "notification dropped: {}", e);
        }
    }

    fn transport_ref(&self) -> &Arc<dyn Transport> {
        self.transport
            .get()
            .expect("engine is not bound to a transport")
    }

    async fn emit(&self, session_id: Option<Uuid>, response: JsonRpcResponse) {
        let payload = match serde_json::to_value(&response) {
            Ok(v) => v,
            Err(e) => {
                error!("failed to serialize response: {}", e);
                return;
            }
        };
        if let Err(e) = self.transport_ref().send(payload, session_id).await {
            warn!("response dropped: {}", e);
        }
    }

    /// Emit the outcome of a request. Notifications log failures and stay
    /// silent.
    async fn finish(
        &self,
        session_id: Option<Uuid>,
        id: RequestId,
        has_id: bool,
        result: Result<Value>,
    ) {
        match result {
            Ok(value) => {
                if has_id {
                    self.emit(session_id, JsonRpcResponse::success(id, value)).await;
                }
            }
            Err(e) => {
                error!(code = e.jsonrpc_code(), "request failed: {}", e);
                if has_id {
                    self.emit(
                        session_id,
                        JsonRpcResponse::error(id, e.jsonrpc_code(), e.to_string()),
                    )
                    .await;
                }
            }
        }
    }

    /// Dispatch one inbound message through the routing pipeline.
    pub async fn dispatch(self: &Arc<Self>, msg: TransportMessage) {
        if !msg.payload.is_object() {
            self.emit(
                None,
                JsonRpcResponse::error(
                    RequestId::from_payload(&msg.payload),
                    error_codes::PARSE_ERROR,
                    "Payload is not a JSON-RPC object",
                ),
            )
            .await;
            return;
        }

        let id = RequestId::from_payload(&msg.payload);
        let has_id = !matches!(id, RequestId::Null);
        let params = msg.payload.get("params").cloned();

        let Some(method) = msg
            .payload
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            if has_id {
                self.emit(
                    None,
                    JsonRpcResponse::error(id, error_codes::INVALID_REQUEST, "Missing method"),
                )
                .await;
            } else {
                warn!("dropping payload without a method");
            }
            return;
        };

        debug!(%method, transport_id = %msg.transport_id, "dispatching");

        if method == methods::INITIALIZE {
            let result = self.handle_initialize(&msg, params).await;
            self.finish(None, id, has_id, result).await;
            return;
        }

        // Everything past this point needs a resolvable session.
        let session = match msg.session_id.as_deref() {
            Some(raw) => match Uuid::parse_str(raw) {
                Ok(sid) => self.sessions.get(sid).await,
                Err(_) => None,
            },
            None => self.sessions.get_by_transport(&msg.transport_id).await,
        };
        let Some(session) = session else {
            if has_id {
                self.emit(
                    None,
                    JsonRpcResponse::error(
                        id,
                        error_codes::INVALID_REQUEST,
                        "Session not initialized or has expired",
                    ),
                )
                .await;
            } else {
                warn!(%method, "dropping message without a live session");
            }
            return;
        };

        match method.as_str() {
            methods::PING => {
                self.finish(Some(session.id), id, has_id, Ok(json!({}))).await;
            }
            methods::INITIALIZED => {
                info!(session_id = %session.id, "client confirmed initialization");
            }
            methods::TOOLS_LIST => {
                let result = serde_json::to_value(ListToolsResult {
                    tools: self.tools.list().await,
                })
                .map_err(Error::from);
                self.finish(Some(session.id), id, has_id, result).await;
            }
            methods::TOOLS_CALL => {
                self.handle_tools_call(session, id, has_id, params).await;
            }
            methods::RESOURCES_LIST => {
                let result = serde_json::to_value(ListResourcesResult {
                    resources: self.resources.list().await,
                })
                .map_err(Error::from);
                self.finish(Some(session.id), id, has_id, result).await;
            }
            methods::RESOURCES_READ => {
                let result = self.handle_resources_read(&session, params).await;
                self.finish(Some(session.id), id, has_id, result).await;
            }
            methods::PROMPTS_LIST => {
                let result = serde_json::to_value(ListPromptsResult {
                    prompts: self.prompts.list().await,
                })
                .map_err(Error::from);
                self.finish(Some(session.id), id, has_id, result).await;
            }
            methods::PROMPTS_GET => {
                let result = self.handle_prompts_get(&session, params).await;
                self.finish(Some(session.id), id, has_id, result).await;
            }
            methods::OPERATIONS_CANCEL => {
                let result = self.handle_cancel(params).await;
                // Best-effort request: reply only when the client asked with
                // an id, succeed silently otherwise.
                if has_id {
                    self.finish(Some(session.id), id, true, result).await;
                } else if let Err(e) = result {
                    warn!("cancel request failed: {}", e);
                }
            }
            _ => {
                self.finish(
                    Some(session.id),
                    id,
                    has_id,
                    Err(Error::MethodNotFound(method)),
                )
                .await;
            }
        }
    }

    async fn handle_initialize(
        self: &Arc<Self>,
        msg: &TransportMessage,
        params: Option<Value>,
    ) -> Result<Value> {
        let params: InitializeParams = params
            .map(|v| serde_json::from_value(v).unwrap_or_default())
            .unwrap_or_default();

        let session = self
            .sessions
            .create(
                params.client_info.unwrap_or(Value::Null),
                params
                    .protocol_version
                    .unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
            )
            .await;

        self.sessions.map_transport(&msg.transport_id, session.id).await;
        self.transport_ref()
            .associate_session(&msg.transport_id, session.id)
            .await;

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            server_info: self.server_info.clone(),
            capabilities: ServerCapabilities::current(),
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_tools_call(
        self: &Arc<Self>,
        session: Session,
        id: RequestId,
        has_id: bool,
        params: Option<Value>,
    ) {
        let params: CallToolParams = match params
            .ok_or_else(|| Error::InvalidParams("missing params".to_string()))
            .and_then(|v| {
                serde_json::from_value(v).map_err(|e| Error::InvalidParams(e.to_string()))
            }) {
            Ok(p) => p,
            Err(e) => {
                self.finish(Some(session.id), id, has_id, Err(e)).await;
                return;
            }
        };

        let Some(handler) = self.tools.get(&params.name).await else {
            self.finish(
                Some(session.id),
                id,
                has_id,
                Err(Error::ToolNotFound(params.name)),
            )
            .await;
            return;
        };

        let progress_token = params.meta.and_then(|m| m.progress_token);
        let operation_id = self
            .operations
            .register(session.id, &params.name, progress_token, id.clone())
            .await;

        let token = match self.operations.get(operation_id).await {
            Some(op) => op.cancellation_token(),
            None => CancellationToken::inert(),
        };
        let ctx = RequestContext::new(
            session.clone(),
            Some(operation_id),
            token,
            ProgressReporter::live(operation_id, self.operations.clone()),
        );

        // The handler runs on its own task; dispatch continues immediately
        // and the response is emitted from here with the original id.
        let engine = self.clone();
        tokio::spawn(async move {
            let result = handler
                .call(params.arguments, ctx)
                .await
                .and_then(|r| serde_json::to_value(r).map_err(Error::from));
            engine
                .finish(Some(session.id), id, has_id, result)
                .await;
            engine.operations.unregister(operation_id).await;
        });
    }

    async fn handle_resources_read(
        &self,
        session: &Session,
        params: Option<Value>,
    ) -> Result<Value> {
        let params: ReadResourceParams = params
            .ok_or_else(|| Error::InvalidParams("missing params".to_string()))
            .and_then(|v| {
                serde_json::from_value(v).map_err(|e| Error::InvalidParams(e.to_string()))
            })?;

        let handler = self
            .resources
            .get(&params.uri)
            .await
            .ok_or_else(|| Error::ResourceNotFound(params.uri.clone()))?;

        let ctx = RequestContext::new(
            session.clone(),
            None,
            CancellationToken::inert(),
            ProgressReporter::inert(),
        );
        let result = handler.read(&params.uri, params.params, ctx).await?;
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_prompts_get(&self, session: &Session, params: Option<Value>) -> Result<Value> {
        let params: GetPromptParams = params
            .ok_or_else(|| Error::InvalidParams("missing params".to_string()))
            .and_then(|v| {
                serde_json::from_value(v).map_err(|e| Error::InvalidParams(e.to_string()))
            })?;

        let handler = self
            .prompts
            .get(&params.name)
            .await
            .ok_or_else(|| Error::PromptNotFound(params.name.clone()))?;

        let ctx = RequestContext::new(
            session.clone(),
            None,
            CancellationToken::inert(),
            ProgressReporter::inert(),
        );
        let result = handler.get(params.arguments, ctx).await?;
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_cancel(&self, params: Option<Value>) -> Result<Value> {
        let params: CancelParams = params
            .ok_or_else(|| Error::InvalidParams("missing params".to_string()))
            .and_then(|v| {
                serde_json::from_value(v).map_err(|e| Error::InvalidParams(e.to_string()))
            })?;

        let operation_id = Uuid::parse_str(&params.operation_id)
            .map_err(|_| Error::InvalidParams("operationId is not a UUID".to_string()))?;

        self.operations.cancel(operation_id).await;
        Ok(json!({}))
    }
}

#[async_trait]
impl ProgressSink for Engine {
    async fn send_progress(&self, session_id: Uuid, params: ProgressParams) {
        let params = match serde_json::to_value(&params) {
            Ok(v) => v,
            Err(e) => {
                error!("failed to serialize progress params: {}", e);
                return;
            }
        };
        self.send_notification(session_id, methods::PROGRESS, params)
            .await;
    }
}
