use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use ai_agent::{
    ConnectError, ConnectionStatus, ProviderKind, ToolArguments, ToolDescriptor, ToolErrorCode,
    ToolProvider, ToolResult,
};

use crate::config::{McpResolvedServerConfig, TransportConfig};
use crate::protocol::{
    initialize_params, ToolCallResponse, ToolListResponse, INITIALIZE, INITIALIZED, TOOLS_CALL,
    TOOLS_LIST, TOOLS_LIST_CHANGED,
};
use crate::transport::{
    DefaultConnector, Transport, TransportConnector, TransportError, TransportEvent,
};

const MAX_LOG_ENTRIES: usize = 20;
const MAX_TOOL_PAGES: usize = 32;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderLogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderLogEntry {
    pub timestamp_ms: u64,
    pub level: ProviderLogLevel,
    pub message: String,
}

/// Connection state plus call statistics for one tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRuntimeStatus {
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_updated_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<u64>,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub tool_count: usize,
    /// Newest first.
    #[serde(default)]
    pub recent_logs: Vec<ProviderLogEntry>,
}

struct ProviderState {
    status: ConnectionStatus,
    /// Bumped on every connect and disconnect; events and handshakes from
    /// older attempts are ignored.
    generation: u64,
    disconnecting: bool,
    tools: Vec<ToolDescriptor>,
    cache_dirty: bool,
    last_error: Option<String>,
    last_updated_ms: u64,
    last_latency_ms: Option<u64>,
    success_count: u64,
    error_count: u64,
    logs: VecDeque<ProviderLogEntry>,
}

impl ProviderState {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            generation: 0,
            disconnecting: false,
            tools: Vec::new(),
            cache_dirty: false,
            last_error: None,
            last_updated_ms: now_millis(),
            last_latency_ms: None,
            success_count: 0,
            error_count: 0,
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
        }
    }

    fn push_log(&mut self, level: ProviderLogLevel, message: String) {
        if self.logs.len() == MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(ProviderLogEntry {
            timestamp_ms: now_millis(),
            level,
            message,
        });
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
        self.last_updated_ms = now_millis();
    }

    fn record_success(&mut self, method: &str, latency_ms: u64) {
        self.last_latency_ms = Some(latency_ms);
        self.last_updated_ms = now_millis();
        self.success_count = self.success_count.saturating_add(1);
        self.push_log(
            ProviderLogLevel::Info,
            format!("{method} succeeded in {latency_ms} ms"),
        );
    }

    fn record_error(&mut self, method: &str, error: &str) {
        self.last_error = Some(error.to_string());
        self.last_updated_ms = now_millis();
        self.error_count = self.error_count.saturating_add(1);
        self.push_log(
            ProviderLogLevel::Error,
            format!("{method} failed: {}", error.trim()),
        );
    }
}

struct Shared {
    config: McpResolvedServerConfig,
    state: Mutex<ProviderState>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle_event(&self, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::Notification { method, .. } if method == TOOLS_LIST_CHANGED => {
                let mut state = self.state();
                if state.generation == generation {
                    state.cache_dirty = true;
                    state.push_log(ProviderLogLevel::Info, "tool list changed".into());
                }
            }
            TransportEvent::Notification { method, .. } => {
                debug!(target: "mcp_client", server_id = %self.config.id, method = %method, "notification ignored");
            }
            TransportEvent::Closed { reason } => {
                let lost = {
                    let mut state = self.state();
                    let current = state.generation == generation && !state.disconnecting;
                    if current && state.status.is_connected() {
                        let err = ConnectError::new(
                            ai_agent::ConnectErrorKind::Unreachable,
                            format!("transport lost: {reason}"),
                        );
                        state.record_error("transport", &reason);
                        state.set_status(ConnectionStatus::Error(err));
                    }
                    current
                };
                if lost {
                    warn!(
                        target: "mcp_client",
                        server_id = %self.config.id,
                        reason = %reason,
                        "MCP server connection lost"
                    );
                    if let Some(transport) = self.transport.write().await.take() {
                        transport.close().await;
                    }
                }
            }
        }
    }
}

/// A [`ToolProvider`] backed by one MCP server. Reconnection only happens
/// when `connect` is called again.
pub struct McpToolProvider {
    shared: Arc<Shared>,
    connector: Arc<dyn TransportConnector>,
    connect_lock: tokio::sync::Mutex<()>,
    invocations: AtomicU64,
}

impl McpToolProvider {
    pub fn new(config: McpResolvedServerConfig) -> Self {
        Self::with_connector(config, Arc::new(DefaultConnector))
    }

    pub fn with_connector(
        config: McpResolvedServerConfig,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ProviderState::new()),
                transport: RwLock::new(None),
            }),
            connector,
            connect_lock: tokio::sync::Mutex::new(()),
            invocations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &McpResolvedServerConfig {
        &self.shared.config
    }

    pub fn runtime_status(&self) -> ProviderRuntimeStatus {
        let state = self.shared.state();
        ProviderRuntimeStatus {
            status: state.status.clone(),
            last_error: state.last_error.clone(),
            last_updated_ms: state.last_updated_ms,
            last_latency_ms: state.last_latency_ms,
            success_count: state.success_count,
            error_count: state.error_count,
            tool_count: state.tools.len(),
            recent_logs: state.logs.iter().rev().cloned().collect(),
        }
    }

    /// Re-runs discovery and replaces the cached catalog.
    pub async fn refresh_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let transport = self
            .current_transport()
            .await
            .ok_or_else(|| TransportError::Closed("not connected".into()))?;
        let tools = self.discover(transport.as_ref()).await?;
        let mut state = self.shared.state();
        state.tools = tools.clone();
        state.cache_dirty = false;
        Ok(tools)
    }

    async fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.shared.transport.read().await.clone()
    }

    async fn discover(&self, transport: &dyn Transport) -> Result<Vec<ToolDescriptor>, TransportError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let result = self.timed(TOOLS_LIST, transport.request(TOOLS_LIST, params)).await?;
            let page: ToolListResponse = serde_json::from_value(result).map_err(|err| {
                TransportError::Protocol(format!("decoding tool list: {err}"))
            })?;
            tools.extend(page.tools.into_iter().map(ToolDescriptor::from));
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    async fn timed<F>(&self, method: &str, call: F) -> Result<Value, TransportError>
    where
        F: std::future::Future<Output = Result<Value, TransportError>>,
    {
        let start = Instant::now();
        let result = call.await;
        let mut state = self.shared.state();
        match &result {
            Ok(_) => state.record_success(method, start.elapsed().as_millis() as u64),
            Err(err) => state.record_error(method, &err.to_string()),
        }
        result
    }

    async fn handshake(&self, transport: &dyn Transport) -> Result<Vec<ToolDescriptor>, TransportError> {
        let info = self
            .timed(INITIALIZE, transport.request(INITIALIZE, initialize_params()))
            .await?;
        let server_info = info.get("serverInfo").cloned().unwrap_or_default();
        debug!(
            target: "mcp_client",
            server_id = %self.shared.config.id,
            server = %server_info,
            "MCP server initialised"
        );
        transport.notify(INITIALIZED, None).await?;
        self.discover(transport).await
    }

    fn fail_connect(&self, err: &TransportError, generation: u64) -> ConnectError {
        let connect_err = ConnectError::new(err.connect_kind(), err.to_string());
        let mut state = self.shared.state();
        state.record_error("connect", &err.to_string());
        if state.generation == generation {
            state.set_status(ConnectionStatus::Error(connect_err.clone()));
        }
        warn!(
            target: "mcp_client",
            server_id = %self.shared.config.id,
            error = %err,
            "failed to connect MCP server"
        );
        connect_err
    }

    fn lost_or_unavailable(&self, name: &str, err: &TransportError) -> ToolResult {
        let mut state = self.shared.state();
        // A deliberate disconnect raced this call.
        if state.disconnecting || state.status == ConnectionStatus::Disconnected {
            return ToolResult::error(
                ToolErrorCode::ProviderUnavailable,
                format!("server '{}' is not connected", self.shared.config.id),
            );
        }
        if state.status.is_connected() {
            let connect_err = ConnectError::new(
                ai_agent::ConnectErrorKind::Unreachable,
                format!("transport lost during {name}: {err}"),
            );
            state.set_status(ConnectionStatus::Error(connect_err));
        }
        ToolResult::error(ToolErrorCode::TransportLost, err.to_string())
    }
}

#[async_trait]
impl ToolProvider for McpToolProvider {
    fn id(&self) -> &str {
        &self.shared.config.id
    }

    fn display_name(&self) -> &str {
        &self.shared.config.name
    }

    fn kind(&self) -> ProviderKind {
        match self.shared.config.transport {
            TransportConfig::Stdio(_) => ProviderKind::Subprocess,
            TransportConfig::Http(_) => ProviderKind::HttpStream,
        }
    }

    fn status(&self) -> ConnectionStatus {
        self.shared.state().status.clone()
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        let _guard = self.connect_lock.lock().await;
        let generation = {
            let mut state = self.shared.state();
            if state.status.is_connected() {
                return Ok(());
            }
            state.generation += 1;
            state.set_status(ConnectionStatus::Connecting);
            state.generation
        };
        info!(target: "mcp_client", server_id = %self.shared.config.id, "connecting MCP server");

        let (events, mut rx) = mpsc::unbounded_channel();
        let transport = match self
            .connector
            .connect(&self.shared.config.transport, self.shared.config.timeout, events)
            .await
        {
            Ok(transport) => transport,
            Err(err) => return Err(self.fail_connect(&err, generation)),
        };

        let tools = match self.handshake(transport.as_ref()).await {
            Ok(tools) => tools,
            Err(err) => {
                transport.close().await;
                return Err(self.fail_connect(&err, generation));
            }
        };

        let tool_count = tools.len();
        // A disconnect that landed during the handshake wins.
        let abandoned = {
            let mut slot = self.shared.transport.write().await;
            let mut state = self.shared.state();
            if state.generation != generation {
                Some(transport)
            } else {
                *slot = Some(transport);
                state.tools = tools;
                state.cache_dirty = false;
                state.last_error = None;
                state.set_status(ConnectionStatus::Connected);
                state.push_log(
                    ProviderLogLevel::Info,
                    format!("connected with {tool_count} tools"),
                );
                None
            }
        };
        if let Some(transport) = abandoned {
            transport.close().await;
            info!(
                target: "mcp_client",
                server_id = %self.shared.config.id,
                "connect abandoned after disconnect"
            );
            return Err(ConnectError::new(
                ai_agent::ConnectErrorKind::Unreachable,
                "disconnected while connecting",
            ));
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                shared.handle_event(generation, event).await;
            }
        });

        info!(
            target: "mcp_client",
            server_id = %self.shared.config.id,
            tools = tool_count,
            "MCP server connected"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        {
            let mut state = self.shared.state();
            state.generation += 1;
            state.disconnecting = true;
            state.set_status(ConnectionStatus::Disconnected);
            state.tools.clear();
        }
        let transport = self.shared.transport.write().await.take();
        if let Some(transport) = transport {
            transport.close().await;
            info!(target: "mcp_client", server_id = %self.shared.config.id, "MCP server disconnected");
        }
        let mut state = self.shared.state();
        state.disconnecting = false;
        state.push_log(ProviderLogLevel::Info, "disconnected".into());
    }

    async fn tools(&self) -> Vec<ToolDescriptor> {
        let (connected, dirty, cached) = {
            let state = self.shared.state();
            (
                state.status.is_connected(),
                state.cache_dirty,
                state.tools.clone(),
            )
        };
        if !connected {
            warn!(
                target: "mcp_client",
                server_id = %self.shared.config.id,
                "tool list requested while not connected"
            );
            return Vec::new();
        }
        if !dirty {
            return cached;
        }
        match self.refresh_tools().await {
            Ok(tools) => tools,
            Err(err) => {
                warn!(
                    target: "mcp_client",
                    server_id = %self.shared.config.id,
                    error = %err,
                    "tool list refresh failed; using cached list"
                );
                cached
            }
        }
    }

    async fn invoke(&self, name: &str, arguments: ToolArguments) -> ToolResult {
        let transport = if self.status().is_connected() {
            self.current_transport().await
        } else {
            None
        };
        let Some(transport) = transport else {
            return ToolResult::error(
                ToolErrorCode::ProviderUnavailable,
                format!("server '{}' is not connected", self.shared.config.id),
            );
        };

        let call = self.invocations.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(target: "mcp_client", server_id = %self.shared.config.id, tool = %name, call, "invoking tool");
        let params = json!({ "name": name, "arguments": Value::Object(arguments) });
        match self.timed(TOOLS_CALL, transport.request(TOOLS_CALL, params)).await {
            Ok(result) => match serde_json::from_value::<ToolCallResponse>(result) {
                Ok(response) if response.is_error => {
                    ToolResult::error(ToolErrorCode::ExecutionFailed, response.text())
                }
                Ok(response) => ToolResult::success(response.text()),
                Err(err) => ToolResult::error(
                    ToolErrorCode::ExecutionFailed,
                    format!("invalid tool call response: {err}"),
                ),
            },
            Err(err) if err.tool_code() == ToolErrorCode::TransportLost => {
                self.lost_or_unavailable(name, &err)
            }
            Err(err) => ToolResult::error(err.tool_code(), err.to_string()),
        }
    }
}
