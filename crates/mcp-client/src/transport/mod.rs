//! Message conduits to one tool server.

mod http;
mod stdio;

pub use http::StreamableHttpTransport;
pub use stdio::StdioTransport;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use ai_agent::{ConnectErrorKind, ToolErrorCode};

use crate::config::TransportConfig;
use crate::protocol::{IncomingMessage, RpcError, INVALID_PARAMS};

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("failed to start server process: {0}")]
    Spawn(String),
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("server rejected credentials: {0}")]
    AuthRejected(String),
    #[error("timed out after {} ms", .0.as_millis())]
    Timeout(Duration),
    #[error("connection lost: {0}")]
    Closed(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("server returned error {code}: {message}")]
    Rpc { code: i64, message: String },
}

impl TransportError {
    pub fn connect_kind(&self) -> ConnectErrorKind {
        match self {
            TransportError::Spawn(_) => ConnectErrorKind::SpawnFailed,
            TransportError::Unreachable(_) | TransportError::Closed(_) => {
                ConnectErrorKind::Unreachable
            }
            TransportError::AuthRejected(_) => ConnectErrorKind::AuthRejected,
            TransportError::Timeout(_) => ConnectErrorKind::Timeout,
            TransportError::Protocol(_) | TransportError::Rpc { .. } => ConnectErrorKind::Protocol,
        }
    }

    pub fn tool_code(&self) -> ToolErrorCode {
        match self {
            TransportError::Timeout(_) => ToolErrorCode::Timeout,
            TransportError::Closed(_) | TransportError::Unreachable(_) => {
                ToolErrorCode::TransportLost
            }
            TransportError::Rpc { code, .. } if *code == INVALID_PARAMS => {
                ToolErrorCode::InvalidArguments
            }
            _ => ToolErrorCode::ExecutionFailed,
        }
    }
}

impl From<RpcError> for TransportError {
    fn from(err: RpcError) -> Self {
        TransportError::Rpc {
            code: err.code,
            message: err.message,
        }
    }
}

/// Out-of-band signals a transport reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Notification {
        method: String,
        params: Option<Value>,
    },
    Closed {
        reason: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// One request/response round-trip, bounded by the transport's timeout.
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError>;

    /// Releases the process or stream. Safe to call more than once.
    async fn close(&self);

    fn is_alive(&self) -> bool;
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
        config: &TransportConfig,
        timeout: Duration,
        events: EventSender,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Picks the transport implementation matching the config.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

#[async_trait]
impl TransportConnector for DefaultConnector {
    async fn connect(
        &self,
        config: &TransportConfig,
        timeout: Duration,
        events: EventSender,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        match config {
            TransportConfig::Stdio(stdio) => {
                let transport = StdioTransport::spawn(stdio, timeout, events)?;
                Ok(Arc::new(transport))
            }
            TransportConfig::Http(http) => {
                let transport = StreamableHttpTransport::connect(http, timeout, events)?;
                Ok(Arc::new(transport))
            }
        }
    }
}

/// Requests awaiting their response, keyed by JSON-RPC id. Dropping a sender
/// wakes its waiter with a closed-channel error.
#[derive(Default)]
pub(crate) struct PendingRequests {
    inner: Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>,
}

impl PendingRequests {
    pub(crate) fn register(&self, id: u64) -> oneshot::Receiver<Result<Value, RpcError>> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        rx
    }

    pub(crate) fn forget(&self, id: u64) {
        self.lock().remove(&id);
    }

    pub(crate) fn complete(&self, id: u64, outcome: Result<Value, RpcError>) -> bool {
        match self.lock().remove(&id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub(crate) fn is_waiting(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    pub(crate) fn fail_all(&self) {
        self.lock().clear();
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What the caller should do with a message that was not a routed response.
pub(crate) enum Routed {
    Handled,
    ReplyNeeded(Value),
}

/// Completes pending requests and forwards notifications.
pub(crate) fn route_incoming(
    payload: Value,
    pending: &PendingRequests,
    events: &EventSender,
) -> Routed {
    match IncomingMessage::classify(payload) {
        Some(IncomingMessage::Response { id, outcome }) => {
            if !pending.complete(id, outcome) {
                debug!(target: "mcp_client", id, "dropping response with no waiter");
            }
            Routed::Handled
        }
        Some(IncomingMessage::Notification { method, params }) => {
            let _ = events.send(TransportEvent::Notification { method, params });
            Routed::Handled
        }
        Some(IncomingMessage::Request { id, method }) => {
            debug!(target: "mcp_client", method = %method, "server request");
            Routed::ReplyNeeded(crate::protocol::reply_to_server_request(id, &method))
        }
        None => {
            debug!(target: "mcp_client", "ignoring unrecognised message");
            Routed::Handled
        }
    }
}

/// Waits for a registered response, mapping channel closure to a lost
/// connection.
pub(crate) async fn await_response(
    pending: &PendingRequests,
    id: u64,
    rx: oneshot::Receiver<Result<Value, RpcError>>,
    timeout: Duration,
) -> Result<Value, TransportError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(Ok(result))) => Ok(result),
        Ok(Ok(Err(rpc))) => Err(rpc.into()),
        Ok(Err(_)) => Err(TransportError::Closed(
            "connection closed before the response arrived".into(),
        )),
        Err(_) => {
            pending.forget(id);
            Err(TransportError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn dropped_waiters_surface_as_closed() {
        let pending = PendingRequests::default();
        let rx = pending.register(1);
        pending.fail_all();
        let err = await_response(&pending, 1, rx, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed(_)));
        assert_eq!(err.tool_code(), ToolErrorCode::TransportLost);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_requests_time_out() {
        let pending = PendingRequests::default();
        let rx = pending.register(9);
        let err = await_response(&pending, 9, rx, Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(!pending.complete(9, Ok(json!(null))));
    }

    #[test]
    fn routing_wakes_waiter_and_forwards_notifications() {
        let pending = PendingRequests::default();
        let (events, mut rx_events) = mpsc::unbounded_channel();
        let mut rx = pending.register(2);

        route_incoming(json!({"jsonrpc": "2.0", "id": 2, "result": {"x": 1}}), &pending, &events);
        assert_eq!(rx.try_recv().unwrap(), Ok(json!({"x": 1})));

        route_incoming(
            json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}),
            &pending,
            &events,
        );
        assert!(matches!(
            rx_events.try_recv(),
            Ok(TransportEvent::Notification { method, .. }) if method == "notifications/tools/list_changed"
        ));
    }

    #[test]
    fn error_kinds_map_onto_connect_and_tool_codes() {
        assert_eq!(
            TransportError::Spawn("x".into()).connect_kind(),
            ConnectErrorKind::SpawnFailed
        );
        assert_eq!(
            TransportError::AuthRejected("401".into()).connect_kind(),
            ConnectErrorKind::AuthRejected
        );
        let invalid = TransportError::Rpc {
            code: INVALID_PARAMS,
            message: "bad".into(),
        };
        assert_eq!(invalid.tool_code(), ToolErrorCode::InvalidArguments);
    }
}
