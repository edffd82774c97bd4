//! Transport abstraction and the stdio transport.
//!
//! A transport decodes wire messages, tags each with a connection id and the
//! session id it knows about, and publishes them on a broadcast stream the
//! engine consumes. Outbound traffic goes through [`Transport::send`]; the
//! transport picks the delivery stream.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Bounded capacity of the inbound broadcast stream.
pub const INBOUND_CAPACITY: usize = 256;

/// An inbound wire message tagged with its origin.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    /// Decoded JSON-RPC payload.
    pub payload: Value,
    /// Transport-assigned connection tag.
    pub transport_id: String,
    /// Session id attached by the transport, when known.
    pub session_id: Option<String>,
}

/// Contract between the engine and a concrete transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to the inbound broadcast stream.
    fn subscribe(&self) -> broadcast::Receiver<TransportMessage>;

    /// Deliver an outbound payload. A payload carrying an `id` field is a
    /// response; one without is a notification.
    async fn send(&self, payload: Value, session_id: Option<Uuid>) -> Result<()>;

    /// Bind a transport connection to a session. Called by the engine after
    /// session creation.
    async fn associate_session(&self, transport_id: &str, session_id: Uuid);

    /// Release transport resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Connection tag used by the single stdio connection.
const STDIO_TRANSPORT_ID: &str = "stdio";

/// Newline-delimited JSON-RPC over stdin/stdout.
///
/// One implicit connection; the session learned from `initialize` is
/// attached to every later inbound message.
pub struct StdioTransport {
    inbound: broadcast::Sender<TransportMessage>,
    outbound: mpsc::Sender<Value>,
    session: Arc<RwLock<Option<Uuid>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Start the reader and writer tasks and return the transport.
    pub fn start() -> Arc<Self> {
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let (outbound, mut outbound_rx) = mpsc::channel::<Value>(INBOUND_CAPACITY);
        let session = Arc::new(RwLock::new(None::<Uuid>));

        let reader_inbound = inbound.clone();
        let reader_session = session.clone();
        let reader = tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let mut lines = BufReader::new(stdin).lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        trace!("stdin: {}", trimmed);

                        let payload: Value = match serde_json::from_str(trimmed) {
                            Ok(v) => v,
                            Err(e) => {
                                error!("failed to parse inbound message: {}", e);
                                continue;
                            }
                        };

                        let session_id =
                            reader_session.read().await.map(|id| id.to_string());
                        let msg = TransportMessage {
                            payload,
                            transport_id: STDIO_TRANSPORT_ID.to_string(),
                            session_id,
                        };
                        if reader_inbound.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("EOF on stdin, stopping transport");
                        break;
                    }
                    Err(e) => {
                        error!("error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(payload) = outbound_rx.recv().await {
                let line = match serde_json::to_string(&payload) {
                    Ok(s) => s,
                    Err(e) => {
                        error!("failed to serialize outbound message: {}", e);
                        continue;
                    }
                };
                trace!("stdout: {}", line);
                if stdout.write_all(line.as_bytes()).await.is_err()
                    || stdout.write_all(b"\n").await.is_err()
                    || stdout.flush().await.is_err()
                {
                    error!("error writing to stdout");
                    break;
                }
            }
        });

        Arc::new(Self {
            inbound,
            outbound,
            session,
            tasks: Mutex::new(vec![reader, writer]),
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn subscribe(&self) -> broadcast::Receiver<TransportMessage> {
        self.inbound.subscribe()
    }

    async fn send(&self, payload: Value, _session_id: Option<Uuid>) -> Result<()> {
        self.outbound
            .send(payload)
            .await
            .map_err(|_| Error::Transport("stdout writer has stopped".to_string()))
    }

    async fn associate_session(&self, _transport_id: &str, session_id: Uuid) {
        *self.session.write().await = Some(session_id);
    }

    async fn close(&self) -> Result<()> {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        Ok(())
    }
}
