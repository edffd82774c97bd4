//! In-flight operation tracking.
//!
//! Every tool call is registered as an operation for the duration of its
//! dispatch, correlating the client's progress token with progress
//! notifications and carrying the cancellation flag that `operations/cancel`
//! sets. Progress is emitted back through the engine via [`ProgressSink`];
//! this module never talks to a transport directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::mcp::protocol::{ProgressParams, ProgressToken, RequestId};

/// Receiver of progress notifications. Implemented by the engine, which
/// composes the `notifications/progress` frame and hands it to the bound
/// transport.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn send_progress(&self, session_id: Uuid, params: ProgressParams);
}

/// Cancellation state handed to handlers.
///
/// The token is a live view: it shares the operation's flag, so a poll after
/// a late cancel observes it. Handlers poll cooperatively; the token is not
/// reactive.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    flag: Option<Arc<AtomicBool>>,
}

impl CancellationToken {
    fn live(flag: Arc<AtomicBool>) -> Self {
        Self { flag: Some(flag) }
    }

    /// A token that never reports cancellation, for contexts that are not
    /// cancellable (resource reads, prompt gets).
    pub fn inert() -> Self {
        Self { flag: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag
            .as_ref()
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

/// One in-flight tool invocation.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Method or tool name that spawned the operation.
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub request_id: RequestId,
    pub progress_token: Option<ProgressToken>,
    cancelled: Arc<AtomicBool>,
}

impl Operation {
    pub fn cancellation_token(&self) -> CancellationToken {
        CancellationToken::live(self.cancelled.clone())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Handle a handler uses to report progress for its operation.
///
/// Reporting is a no-op when the context has no operation (resource reads,
/// prompt gets) or the client supplied no progress token.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Option<(Uuid, Arc<OperationManager>)>,
}

impl ProgressReporter {
    pub(crate) fn live(operation_id: Uuid, manager: Arc<OperationManager>) -> Self {
        Self {
            inner: Some((operation_id, manager)),
        }
    }

    /// A reporter that discards every report.
    pub fn inert() -> Self {
        Self { inner: None }
    }

    /// Report progress in `[0, 1]` with an optional message.
    pub async fn report(&self, progress: f64, message: Option<&str>) {
        if let Some((operation_id, manager)) = &self.inner {
            manager
                .notify_progress(*operation_id, progress, message.map(String::from))
                .await;
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("operation_id", &self.inner.as_ref().map(|(id, _)| id))
            .finish()
    }
}

/// Tracks pending operations and routes their progress notices.
pub struct OperationManager {
    operations: RwLock<HashMap<Uuid, Operation>>,
    sink: RwLock<Option<Weak<dyn ProgressSink>>>,
}

impl OperationManager {
    pub fn new() -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            sink: RwLock::new(None),
        }
    }

    /// Install the progress sink. Called by the engine at bind time.
    pub async fn set_progress_sink(&self, sink: Weak<dyn ProgressSink>) {
        *self.sink.write().await = Some(sink);
    }

    /// Record a new operation and return its id.
    pub async fn register(
        &self,
        session_id: Uuid,
        kind: impl Into<String>,
        progress_token: Option<ProgressToken>,
        request_id: RequestId,
    ) -> Uuid {
        let operation = Operation {
            id: Uuid::new_v4(),
            session_id,
            kind: kind.into(),
            created_at: Utc::now(),
            request_id,
            progress_token,
            cancelled: Arc::new(AtomicBool::new(false)),
        };

        let id = operation.id;
        debug!(operation_id = %id, %session_id, kind = %operation.kind, "operation registered");
        self.operations.write().await.insert(id, operation);
        id
    }

    pub async fn get(&self, operation_id: Uuid) -> Option<Operation> {
        self.operations.read().await.get(&operation_id).cloned()
    }

    /// Find a live operation by its progress token. Linear scan; the table
    /// stays small at expected call rates.
    pub async fn lookup_by_token(&self, token: &ProgressToken) -> Option<Operation> {
        self.operations
            .read()
            .await
            .values()
            .find(|op| op.progress_token.as_ref() == Some(token))
            .cloned()
    }

    /// Set the cancellation flag. Idempotent; unknown ids are ignored.
    pub async fn cancel(&self, operation_id: Uuid) {
        if let Some(op) = self.operations.read().await.get(&operation_id) {
            op.cancelled.store(true, Ordering::SeqCst);
            debug!(%operation_id, "operation cancelled");
        }
    }

    /// Whether the operation has been cancelled. Unknown ids report `true`
    /// so that handlers racing their own completion fail safe.
    pub async fn is_cancelled(&self, operation_id: Uuid) -> bool {
        match self.operations.read().await.get(&operation_id) {
            Some(op) => op.is_cancelled(),
            None => true,
        }
    }

    /// Drop a completed operation. Called from the dispatcher's completion
    /// hook after the result or error has been emitted.
    pub async fn unregister(&self, operation_id: Uuid) {
        self.operations.write().await.remove(&operation_id);
    }

    /// Emit a progress notification for an operation. A no-op when the
    /// operation is gone, was called without a progress token, or no sink
    /// is installed.
    pub async fn notify_progress(
        &self,
        operation_id: Uuid,
        progress: f64,
        message: Option<String>,
    ) {
        let (session_id, params) = {
            let operations = self.operations.read().await;
            let Some(op) = operations.get(&operation_id) else {
                return;
            };
            let Some(token) = op.progress_token.clone() else {
                return;
            };
            (
                op.session_id,
                ProgressParams {
                    progress_token: token,
                    progress: progress.clamp(0.0, 1.0),
                    total: 1.0,
                    message,
                },
            )
        };

        let sink = self.sink.read().await.clone();
        if let Some(sink) = sink.and_then(|weak| weak.upgrade()) {
            sink.send_progress(session_id, params).await;
        }
    }

    /// Cancel and drop every operation owned by a session. Invoked on
    /// disconnect.
    pub async fn cleanup_session(&self, session_id: Uuid) {
        let mut operations = self.operations.write().await;
        operations.retain(|_, op| {
            if op.session_id == session_id {
                op.cancelled.store(true, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
    }

    pub async fn operation_count(&self) -> usize {
        self.operations.read().await.len()
    }
}

impl Default for OperationManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    fn token(s: &str) -> ProgressToken {
        ProgressToken::String(s.to_string())
    }

    #[derive(Default)]
    struct CaptureSink {
        sent: Mutex<Vec<(Uuid, ProgressParams)>>,
    }

    #[async_trait]
    impl ProgressSink for CaptureSink {
        async fn send_progress(&self, session_id: Uuid, params: ProgressParams) {
            self.sent.lock().await.push((session_id, params));
        }
    }

    async fn manager_with_sink() -> (OperationManager, Arc<CaptureSink>) {
        let manager = OperationManager::new();
        let sink = Arc::new(CaptureSink::default());
        let sink_dyn: Arc<dyn ProgressSink> = sink.clone();
        let weak: Weak<dyn ProgressSink> = Arc::downgrade(&sink_dyn);
        manager.set_progress_sink(weak).await;
        (manager, sink)
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let manager = OperationManager::new();
        let session = Uuid::new_v4();

        let id = manager
            .register(session, "processData", None, RequestId::Number(1))
            .await;
        assert_eq!(manager.operation_count().await, 1);
        assert_eq!(manager.get(id).await.unwrap().kind, "processData");

        manager.unregister(id).await;
        assert_eq!(manager.operation_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let manager = OperationManager::new();
        let id = manager
            .register(Uuid::new_v4(), "t", None, RequestId::Number(1))
            .await;

        assert!(!manager.is_cancelled(id).await);
        manager.cancel(id).await;
        manager.cancel(id).await;
        assert!(manager.is_cancelled(id).await);
    }

    #[tokio::test]
    async fn test_unknown_operation_reports_cancelled() {
        let manager = OperationManager::new();
        assert!(manager.is_cancelled(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_cancellation_token_sees_late_cancel() {
        let manager = OperationManager::new();
        let id = manager
            .register(Uuid::new_v4(), "t", None, RequestId::Number(1))
            .await;

        let tok = manager.get(id).await.unwrap().cancellation_token();
        assert!(!tok.is_cancelled());

        manager.cancel(id).await;
        assert!(tok.is_cancelled());
    }

    #[tokio::test]
    async fn test_inert_token_never_cancels() {
        assert!(!CancellationToken::inert().is_cancelled());
    }

    #[tokio::test]
    async fn test_lookup_by_token() {
        let manager = OperationManager::new();
        let id = manager
            .register(Uuid::new_v4(), "t", Some(token("p")), RequestId::Number(1))
            .await;

        let found = manager.lookup_by_token(&token("p")).await.unwrap();
        assert_eq!(found.id, id);
        assert!(manager.lookup_by_token(&token("q")).await.is_none());
    }

    #[tokio::test]
    async fn test_notify_progress_requires_token() {
        let (manager, sink) = manager_with_sink().await;
        let id = manager
            .register(Uuid::new_v4(), "t", None, RequestId::Number(1))
            .await;

        manager.notify_progress(id, 0.5, None).await;
        assert!(sink.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_notify_progress_emits_clamped() {
        let (manager, sink) = manager_with_sink().await;
        let session = Uuid::new_v4();
        let id = manager
            .register(session, "t", Some(token("p")), RequestId::Number(1))
            .await;

        manager
            .notify_progress(id, 1.5, Some("done".to_string()))
            .await;

        let sent = sink.sent.lock().await;
        let (session_id, params) = &sent[0];
        assert_eq!(*session_id, session);
        assert_eq!(params.progress, 1.0);
        assert_eq!(params.total, 1.0);
        assert_eq!(params.progress_token, token("p"));
        assert_eq!(params.message.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_notify_progress_without_sink_is_noop() {
        let manager = OperationManager::new();
        let id = manager
            .register(Uuid::new_v4(), "t", Some(token("p")), RequestId::Number(1))
            .await;
        // Nothing to observe; the call must simply not hang or panic.
        manager.notify_progress(id, 0.5, None).await;
    }

    #[tokio::test]
    async fn test_cleanup_session_cancels_and_drops() {
        let manager = OperationManager::new();
        let session_a = Uuid::new_v4();
        let session_b = Uuid::new_v4();

        let a = manager
            .register(session_a, "t", None, RequestId::Number(1))
            .await;
        let b = manager
            .register(session_b, "t", None, RequestId::Number(2))
            .await;
        let tok_a = manager.get(a).await.unwrap().cancellation_token();

        manager.cleanup_session(session_a).await;

        assert!(manager.get(a).await.is_none());
        assert!(manager.get(b).await.is_some());
        // A handler still running for the dropped session observes the cancel.
        assert!(tok_a.is_cancelled());
    }
}
