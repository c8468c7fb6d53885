use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    await_response, route_incoming, EventSender, PendingRequests, Routed, Transport,
    TransportError,
};
use crate::config::HttpServerConfig;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, INITIALIZE};

const SESSION_HEADER: &str = "mcp-session-id";
const POST_ACCEPT: &str = "application/json, text/event-stream";
const EVENT_STREAM: &str = "text/event-stream";

/// MCP "streamable HTTP": requests are POSTed, answers come back as JSON or
/// as an SSE stream, and a GET stream carries server-initiated messages.
pub struct StreamableHttpTransport {
    inner: Arc<HttpInner>,
    next_id: AtomicU64,
    timeout: Duration,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct HttpInner {
    client: Client,
    url: Url,
    headers: HeaderMap,
    session_id: RwLock<Option<String>>,
    pending: PendingRequests,
    events: EventSender,
    alive: AtomicBool,
}

impl StreamableHttpTransport {
    /// Prepares the client. Reachability is established by the first request.
    pub fn connect(
        config: &HttpServerConfig,
        timeout: Duration,
        events: EventSender,
    ) -> Result<Self, TransportError> {
        let url = Url::parse(&config.url)
            .map_err(|err| TransportError::Unreachable(format!("invalid url {}: {err}", config.url)))?;

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| TransportError::Protocol(format!("invalid header name `{key}`")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| TransportError::Protocol(format!("invalid value for header `{key}`")))?;
            headers.insert(name, value);
        }
        if let Some(token) = config.auth_token.as_deref() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| TransportError::Protocol("invalid bearer token".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|err| TransportError::Unreachable(format!("building HTTP client: {err}")))?;

        Ok(Self {
            inner: Arc::new(HttpInner {
                client,
                url,
                headers,
                session_id: RwLock::new(None),
                pending: PendingRequests::default(),
                events,
                alive: AtomicBool::new(true),
            }),
            next_id: AtomicU64::new(1),
            timeout,
            listener: std::sync::Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session()
    }

    fn open_event_stream(&self) {
        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *listener = Some(tokio::spawn(async move { inner.listen().await }));
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed("session ended".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let rx = self.inner.pending.register(id);
        let message = JsonRpcRequest::new(id, method, params);

        let exchange = async {
            let response = self.inner.post(&message).await?;
            self.inner.consume(response, id).await
        };
        let outcome = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        };
        if let Err(err) = outcome {
            self.inner.pending.forget(id);
            return Err(err);
        }

        // Answers to 202-accepted requests arrive on the GET stream.
        let result = await_response(&self.inner.pending, id, rx, self.timeout).await;
        if method == INITIALIZE && result.is_ok() {
            self.open_event_stream();
        }
        result
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        let response = self
            .inner
            .post(&JsonRpcNotification::new(method, params))
            .await?;
        debug!(target: "mcp_client", method, status = %response.status(), "notification sent");
        Ok(())
    }

    async fn close(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
        if let Some(session) = self.inner.session() {
            let request = self
                .inner
                .client
                .delete(self.inner.url.clone())
                .headers(self.inner.headers.clone())
                .header(SESSION_HEADER, session)
                .timeout(Duration::from_secs(2));
            if let Err(err) = request.send().await {
                debug!(target: "mcp_client", error = %err, "session delete failed");
            }
        }
        self.inner.pending.fail_all();
    }

    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }
}

impl Drop for StreamableHttpTransport {
    fn drop(&mut self) {
        if let Some(listener) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
    }
}

impl HttpInner {
    fn session(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn capture_session(&self, response: &Response) {
        let Some(value) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        let mut session = self.session_id.write().unwrap_or_else(PoisonError::into_inner);
        if session.as_deref() != Some(value) {
            info!(target: "mcp_client", session_id = %value, "MCP session established");
            *session = Some(value.to_string());
        }
    }

    async fn post<T: Serialize + ?Sized>(&self, message: &T) -> Result<Response, TransportError> {
        let session = self.session();
        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, POST_ACCEPT)
            .json(message);
        if let Some(session) = session.as_deref() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.map_err(map_send_error)?;
        self.capture_session(&response);

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TransportError::AuthRejected(format!("HTTP {status}")));
        }
        if status == StatusCode::NOT_FOUND && session.is_some() {
            self.alive.store(false, Ordering::SeqCst);
            return Err(TransportError::Closed("session expired".into()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Protocol(format!("HTTP {status}: {}", body.trim())));
        }
        Ok(response)
    }

    /// Routes every message in a POST response until request `id` is answered.
    async fn consume(&self, response: Response, id: u64) -> Result<(), TransportError> {
        if response.status() == StatusCode::ACCEPTED {
            return Ok(());
        }
        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |ct| ct.starts_with(EVENT_STREAM));

        if is_stream {
            let mut stream = response.bytes_stream().eventsource();
            while let Some(event) = stream.next().await {
                let event = event
                    .map_err(|err| TransportError::Closed(format!("event stream failed: {err}")))?;
                self.route_event_data(&event.data).await;
                if !self.pending.is_waiting(id) {
                    break;
                }
            }
            return Ok(());
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| TransportError::Closed(format!("reading response: {err}")))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|err| TransportError::Protocol(format!("invalid JSON response: {err}")))?;
        self.route(value).await;
        Ok(())
    }

    async fn route_event_data(&self, data: &str) {
        if data.trim().is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(value) => self.route(value).await,
            Err(err) => warn!(target: "mcp_client", error = %err, "discarding malformed event"),
        }
    }

    async fn route(&self, value: Value) {
        let messages = match value {
            Value::Array(batch) => batch,
            single => vec![single],
        };
        for message in messages {
            if let Routed::ReplyNeeded(reply) = route_incoming(message, &self.pending, &self.events)
            {
                if let Err(err) = self.post(&reply).await {
                    warn!(target: "mcp_client", error = %err, "failed to answer server request");
                }
            }
        }
    }

    /// Long-lived GET stream for server-initiated messages.
    async fn listen(&self) {
        let mut request = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, EVENT_STREAM);
        if let Some(session) = self.session() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(target: "mcp_client", error = %err, "event stream unavailable");
                return;
            }
        };
        if !response.status().is_success() {
            debug!(
                target: "mcp_client",
                status = %response.status(),
                "server offers no event stream"
            );
            return;
        }

        let mut stream = response.bytes_stream().eventsource();
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => self.route_event_data(&event.data).await,
                Err(err) => {
                    debug!(target: "mcp_client", error = %err, "event stream interrupted");
                    break;
                }
            }
        }
        debug!(target: "mcp_client", "event stream ended");
    }
}

fn map_send_error(err: reqwest::Error) -> TransportError {
    if err.is_connect() {
        TransportError::Unreachable(err.to_string())
    } else {
        TransportError::Closed(err.to_string())
    }
}
