//! Model Context Protocol client: reaches tool servers over a subprocess pipe
//! or streamable HTTP and exposes each one as an [`ai_agent::ToolProvider`].

pub mod config;
pub mod protocol;
pub mod provider;
pub mod transport;

use std::sync::Arc;

pub use config::{
    ConfigError, HttpServerConfig, McpManifest, McpResolvedServerConfig, McpServerConfig,
    McpTransportKind, StdioFraming, StdioServerConfig, TransportConfig, DEFAULT_TIMEOUT_MS,
};
pub use provider::{McpToolProvider, ProviderLogEntry, ProviderLogLevel, ProviderRuntimeStatus};
pub use transport::{
    DefaultConnector, EventSender, StdioTransport, StreamableHttpTransport, Transport,
    TransportConnector, TransportError, TransportEvent,
};

/// One provider per enabled server, in manifest order. Nothing is connected.
pub fn providers_from_manifest(
    manifest: &McpManifest,
) -> Result<Vec<Arc<McpToolProvider>>, ConfigError> {
    Ok(manifest
        .resolved_enabled()?
        .into_iter()
        .map(|config| Arc::new(McpToolProvider::new(config)))
        .collect())
}
