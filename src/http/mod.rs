//! Streamable HTTP transport.
//!
//! One configurable endpoint (default `/mcp`) multiplexes the whole
//! protocol: POST carries JSON-RPC requests whose responses stream back as
//! Server-Sent Events on the same response, GET opens the long-lived
//! per-session notification stream, DELETE terminates a session. Sessions
//! are correlated through the `mcp-session-id` header issued in the
//! `initialize` response.

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::post,
    Router,
};
use futures::stream::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::mcp::protocol::{error_codes, methods, RequestId, JSONRPC_VERSION};
use crate::mcp::session::SessionManager;
use crate::mcp::transport::{Transport, TransportMessage, INBOUND_CAPACITY};

/// Session correlation header.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// How long a POSTed `initialize` waits for the engine before giving up.
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-sink channel capacity.
const SINK_CAPACITY: usize = 64;

/// Validates bearer tokens when static equality is not enough.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> bool;
}

/// Authentication mode for the endpoint.
#[derive(Clone, Default)]
pub enum Auth {
    #[default]
    Disabled,
    /// Static bearer token equality.
    Static(String),
    /// Caller-supplied async validator.
    Validator(Arc<dyn TokenValidator>),
}

/// Transport configuration.
#[derive(Clone)]
pub struct HttpConfig {
    /// Endpoint path serving the protocol.
    pub endpoint: String,
    pub auth: Auth,
    /// Advertised in `WWW-Authenticate` on auth failures, when set.
    pub resource_metadata: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            endpoint: "/mcp".to_string(),
            auth: Auth::Disabled,
            resource_metadata: None,
        }
    }
}

/// The streamable HTTP transport.
pub struct HttpTransport {
    config: HttpConfig,
    sessions: Arc<SessionManager>,
    inbound: broadcast::Sender<TransportMessage>,
    /// POST response sinks keyed by request id.
    pending_posts: RwLock<HashMap<String, mpsc::Sender<Value>>>,
    /// Per-session GET notification sinks, tagged with a generation so a
    /// replaced stream's teardown cannot evict its successor.
    notify_sinks: RwLock<HashMap<Uuid, (u64, mpsc::Sender<Value>)>>,
    /// Session -> request-id key of its active POST stream. Fallback
    /// delivery channel when no GET stream is open.
    post_fallbacks: RwLock<HashMap<Uuid, String>>,
    /// Connection tag -> session, recorded by `associate_session`.
    transport_sessions: RwLock<HashMap<String, Uuid>>,
    sink_seq: AtomicU64,
}

impl HttpTransport {
    pub fn new(config: HttpConfig, sessions: Arc<SessionManager>) -> Arc<Self> {
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        Arc::new(Self {
            config,
            sessions,
            inbound,
            pending_posts: RwLock::new(HashMap::new()),
            notify_sinks: RwLock::new(HashMap::new()),
            post_fallbacks: RwLock::new(HashMap::new()),
            transport_sessions: RwLock::new(HashMap::new()),
            sink_seq: AtomicU64::new(0),
        })
    }

    /// Build the router for this transport. Out-of-band routes (OAuth
    /// discovery and the like) can be merged onto the result; they bypass
    /// MCP routing entirely.
    pub fn router(self: &Arc<Self>) -> Router {
        let session_header = HeaderName::from_static(SESSION_HEADER);
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::POST, Method::GET, Method::DELETE, Method::OPTIONS])
            .allow_headers([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
                session_header.clone(),
            ])
            .expose_headers([session_header]);

        Router::new()
            .route(
                &self.config.endpoint,
                post(handle_post)
                    .get(handle_get)
                    .delete(handle_delete)
                    .options(handle_options),
            )
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Bind the endpoint and serve until the listener fails.
    pub async fn serve(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("MCP endpoint listening on http://{}{}", addr, self.config.endpoint);
        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    fn publish(&self, payload: Value, transport_id: String, session_id: Option<String>) {
        let msg = TransportMessage {
            payload,
            transport_id,
            session_id,
        };
        if self.inbound.send(msg).is_err() {
            warn!("inbound message dropped: no engine bound");
        }
    }

    /// Check the bearer token, producing the 401 response on failure.
    async fn authorize(&self, headers: &HeaderMap) -> std::result::Result<(), Response> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        let ok = match (&self.config.auth, token) {
            (Auth::Disabled, _) => true,
            (Auth::Static(expected), Some(token)) => token == expected,
            (Auth::Validator(validator), Some(token)) => validator.validate(token).await,
            _ => false,
        };
        if ok {
            return Ok(());
        }

        let mut response = StatusCode::UNAUTHORIZED.into_response();
        if let Some(url) = &self.config.resource_metadata {
            let challenge =
                format!("Bearer resource_metadata=\"{url}\", error=\"invalid_token\"");
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, value);
            }
        }
        Err(response)
    }

    /// Drop every stream belonging to a session.
    async fn close_session_streams(&self, session_id: Uuid) {
        self.notify_sinks.write().await.remove(&session_id);
        let fallback = self.post_fallbacks.write().await.remove(&session_id);
        if let Some(key) = fallback {
            self.pending_posts.write().await.remove(&key);
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn subscribe(&self) -> broadcast::Receiver<TransportMessage> {
        self.inbound.subscribe()
    }

    async fn send(&self, payload: Value, session_id: Option<Uuid>) -> Result<()> {
        let is_response = payload.get("id").map(|v| !v.is_null()).unwrap_or(false);

        if is_response {
            let key = RequestId::from_payload(&payload).as_key();
            let sink = self.pending_posts.write().await.remove(&key);
            self.post_fallbacks.write().await.retain(|_, k| *k != key);
            match sink {
                Some(tx) => {
                    if tx.send(payload).await.is_err() {
                        warn!(%key, "POST client disconnected before the response");
                    }
                }
                None => warn!(%key, "no pending POST stream for response, dropping"),
            }
            return Ok(());
        }

        // Notification: prefer the session's GET stream, fall back to its
        // active POST stream, otherwise drop.
        let Some(session_id) = session_id else {
            warn!("notification without a session id, dropping");
            return Ok(());
        };

        let notify = self
            .notify_sinks
            .read()
            .await
            .get(&session_id)
            .map(|(_, tx)| tx.clone());
        if let Some(tx) = notify {
            if tx.send(payload.clone()).await.is_ok() {
                return Ok(());
            }
        }

        let fallback_key = self.post_fallbacks.read().await.get(&session_id).cloned();
        if let Some(key) = fallback_key {
            let sink = self.pending_posts.read().await.get(&key).cloned();
            if let Some(tx) = sink {
                if tx.send(payload).await.is_ok() {
                    return Ok(());
                }
            }
        }

        debug!(%session_id, "no delivery stream for notification, dropping");
        Ok(())
    }

    async fn associate_session(&self, transport_id: &str, session_id: Uuid) {
        self.transport_sessions
            .write()
            .await
            .insert(transport_id.to_string(), session_id);
    }

    async fn close(&self) -> Result<()> {
        self.pending_posts.write().await.clear();
        self.notify_sinks.write().await.clear();
        self.post_fallbacks.write().await.clear();
        self.transport_sessions.write().await.clear();
        Ok(())
    }
}

// ===== Handlers =====

async fn handle_post(
    State(transport): State<Arc<HttpTransport>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(denied) = transport.authorize(&headers).await {
        return denied;
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            debug!("malformed POST body: {}", e);
            return axum::Json(json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": null,
                "error": {"code": error_codes::PARSE_ERROR, "message": "Parse error"}
            }))
            .into_response();
        }
    };

    if payload.is_array() {
        return (StatusCode::BAD_REQUEST, "batch requests are not supported").into_response();
    }

    // Attach the session header only when it names a live session; an
    // unknown id is stripped so the engine rejects the call as unsession'd.
    let mut session_id = None;
    if let Some(raw) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        if transport.sessions.contains_raw(raw).await {
            session_id = Some(raw.to_string());
        }
    }

    let transport_id = format!("post-{}", Uuid::new_v4());
    let id = RequestId::from_payload(&payload);
    let method = payload
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if matches!(id, RequestId::Null) {
        // Notification: acknowledge immediately and forward.
        transport.publish(payload, transport_id, session_id);
        return StatusCode::ACCEPTED.into_response();
    }

    let key = id.as_key();
    let (tx, mut rx) = mpsc::channel::<Value>(SINK_CAPACITY);
    transport.pending_posts.write().await.insert(key.clone(), tx);

    // A tool call on a known session makes this stream the session's
    // notification fallback until the response closes it.
    if method == methods::TOOLS_CALL {
        if let Some(sid) = session_id.as_deref().and_then(|raw| Uuid::parse_str(raw).ok()) {
            transport.post_fallbacks.write().await.insert(sid, key.clone());
        }
    }

    transport.publish(payload, transport_id.clone(), session_id);

    if method == methods::INITIALIZE {
        // Answered synchronously so the freshly issued session id can be
        // echoed in the response headers.
        let reply = tokio::time::timeout(INITIALIZE_TIMEOUT, rx.recv()).await;
        transport.pending_posts.write().await.remove(&key);

        let Ok(Some(reply)) = reply else {
            return (StatusCode::INTERNAL_SERVER_ERROR, "initialize timed out").into_response();
        };

        let session = transport
            .transport_sessions
            .read()
            .await
            .get(&transport_id)
            .copied();

        let stream = futures::stream::iter(vec![Ok::<Event, Infallible>(
            Event::default().data(reply.to_string()),
        )]);
        let mut response = Sse::new(stream).into_response();
        apply_sse_headers(response.headers_mut());
        if let Some(sid) = session {
            if let Ok(value) = HeaderValue::from_str(&sid.to_string()) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(SESSION_HEADER), value);
            }
        }
        return response;
    }

    // The stream ends once the engine's reply has been written and the sink
    // forgotten.
    let stream = ReceiverStream::new(rx)
        .map(|payload| Ok::<Event, Infallible>(Event::default().data(payload.to_string())));
    let mut response = Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    apply_sse_headers(response.headers_mut());
    response
}

async fn handle_get(
    State(transport): State<Arc<HttpTransport>>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = transport.authorize(&headers).await {
        return denied;
    }

    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| Uuid::parse_str(raw).ok());
    let Some(session_id) = session_id else {
        return (StatusCode::BAD_REQUEST, "missing or invalid mcp-session-id").into_response();
    };
    if !transport.sessions.contains(session_id).await {
        return (StatusCode::BAD_REQUEST, "unknown session").into_response();
    }

    let generation = transport.sink_seq.fetch_add(1, Ordering::SeqCst);
    let (tx, rx) = mpsc::channel::<Value>(SINK_CAPACITY);
    // Any prior stream for this session is closed by dropping its sender.
    transport
        .notify_sinks
        .write()
        .await
        .insert(session_id, (generation, tx));

    let guard = StreamGuard {
        transport: transport.clone(),
        session_id,
        generation,
    };
    let stream = NotificationStream {
        inner: ReceiverStream::new(rx),
        _guard: guard,
    }
    .map(|payload| Ok::<Event, Infallible>(Event::default().data(payload.to_string())));

    let mut response = Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    apply_sse_headers(response.headers_mut());
    if let Ok(value) = HeaderValue::from_str(&session_id.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_HEADER), value);
    }
    response
}

async fn handle_delete(
    State(transport): State<Arc<HttpTransport>>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = transport.authorize(&headers).await {
        return denied;
    }

    if let Some(session_id) = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| Uuid::parse_str(raw).ok())
    {
        transport.close_session_streams(session_id).await;
        transport.sessions.end(session_id).await;
    }

    StatusCode::NO_CONTENT.into_response()
}

async fn handle_options() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, GET, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, Mcp-Session-Id"),
    );
    response
}

fn apply_sse_headers(headers: &mut HeaderMap) {
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
}

/// Removes a GET stream's sink and ends its session once the client goes
/// away. The generation check keeps a replaced stream's teardown from
/// evicting the stream that replaced it.
struct StreamGuard {
    transport: Arc<HttpTransport>,
    session_id: Uuid,
    generation: u64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let transport = self.transport.clone();
        let session_id = self.session_id;
        let generation = self.generation;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut sinks = transport.notify_sinks.write().await;
                let current = matches!(sinks.get(&session_id), Some((g, _)) if *g == generation);
                if current {
                    sinks.remove(&session_id);
                    drop(sinks);
                    debug!(%session_id, "notification stream closed by client");
                    transport.sessions.end(session_id).await;
                }
            });
        }
    }
}

/// A notification stream tied to a [`StreamGuard`].
struct NotificationStream {
    inner: ReceiverStream<Value>,
    _guard: StreamGuard,
}

impl Stream for NotificationStream {
    type Item = Value;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}
