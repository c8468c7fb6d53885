use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TIMEOUT_MS: u64 = 20_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing MCP manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("MCP server at position {0} is missing an id")]
    MissingId(usize),
    #[error("duplicate MCP server id `{0}`")]
    DuplicateId(String),
    #[error("MCP server `{server}` requires `{field}` for {transport} transport")]
    MissingField {
        server: String,
        field: &'static str,
        transport: &'static str,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    #[default]
    Stdio,
    Http,
}

/// How JSON-RPC messages are delimited on a subprocess pipe.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StdioFraming {
    #[default]
    Newline,
    ContentLength,
}

/// One tool server as written in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub transport: McpTransportKind,
    #[serde(default, alias = "program")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default, alias = "endpoint")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub framing: StdioFraming,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioServerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: IndexMap<String, String>,
    pub framing: StdioFraming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpServerConfig {
    pub url: String,
    pub headers: IndexMap<String, String>,
    /// Sent as `Authorization: Bearer <token>`.
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    Stdio(StdioServerConfig),
    Http(HttpServerConfig),
}

#[derive(Debug, Clone)]
pub struct McpResolvedServerConfig {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub timeout: Duration,
    pub transport: TransportConfig,
}

impl McpServerConfig {
    pub fn resolve(&self) -> Result<McpResolvedServerConfig, ConfigError> {
        let label = self.name.as_deref().unwrap_or(&self.id).to_string();
        let transport = match self.transport {
            McpTransportKind::Stdio => {
                let command = non_blank(self.command.as_deref()).ok_or_else(|| {
                    ConfigError::MissingField {
                        server: label.clone(),
                        field: "command",
                        transport: "stdio",
                    }
                })?;
                TransportConfig::Stdio(StdioServerConfig {
                    command,
                    args: self.args.clone(),
                    env: self.env.clone(),
                    framing: self.framing,
                })
            }
            McpTransportKind::Http => {
                let url =
                    non_blank(self.url.as_deref()).ok_or_else(|| ConfigError::MissingField {
                        server: label.clone(),
                        field: "url",
                        transport: "http",
                    })?;
                TransportConfig::Http(HttpServerConfig {
                    url,
                    headers: self.headers.clone(),
                    auth_token: non_blank(self.auth_token.as_deref()),
                })
            }
        };

        Ok(McpResolvedServerConfig {
            id: self.id.trim().to_string(),
            name: label,
            enabled: self.enabled,
            timeout: Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)),
            transport,
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpManifest {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

impl McpManifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let manifest: McpManifest = serde_json::from_str(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for (idx, server) in self.servers.iter().enumerate() {
            let id = server.id.trim();
            if id.is_empty() {
                return Err(ConfigError::MissingId(idx + 1));
            }
            if !ids.insert(id.to_string()) {
                return Err(ConfigError::DuplicateId(id.to_string()));
            }
            if server.enabled {
                server.resolve()?;
            }
        }
        Ok(())
    }

    /// Resolved configs of the enabled servers, in manifest order.
    pub fn resolved_enabled(&self) -> Result<Vec<McpResolvedServerConfig>, ConfigError> {
        self.servers
            .iter()
            .filter(|server| server.enabled)
            .map(McpServerConfig::resolve)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_server(id: &str) -> McpServerConfig {
        McpServerConfig {
            id: id.to_string(),
            name: None,
            enabled: true,
            transport: McpTransportKind::Http,
            command: None,
            args: Vec::new(),
            env: IndexMap::new(),
            url: Some("http://127.0.0.1:1234/mcp".to_string()),
            headers: IndexMap::new(),
            auth_token: None,
            timeout_ms: Some(5_000),
            framing: StdioFraming::Newline,
        }
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let manifest = McpManifest {
            servers: vec![base_server("dup"), base_server("dup")],
        };
        let err = manifest.validate().expect_err("should fail");
        assert!(matches!(err, ConfigError::DuplicateId(id) if id == "dup"));
    }

    #[test]
    fn http_requires_url() {
        let server = McpServerConfig {
            url: Some("  ".into()),
            ..base_server("no-url")
        };
        let err = server.resolve().expect_err("should fail");
        assert!(err.to_string().contains("requires `url`"), "{err}");
    }

    #[test]
    fn stdio_requires_command_but_disabled_servers_are_skipped() {
        let server = McpServerConfig {
            transport: McpTransportKind::Stdio,
            url: None,
            ..base_server("stdio")
        };
        assert!(matches!(
            server.resolve(),
            Err(ConfigError::MissingField { field: "command", .. })
        ));

        let manifest = McpManifest {
            servers: vec![McpServerConfig {
                enabled: false,
                ..server
            }],
        };
        manifest.validate().unwrap();
        assert!(manifest.resolved_enabled().unwrap().is_empty());
    }

    #[test]
    fn manifest_parses_camel_case_and_aliases() {
        let raw = r#"{
            "servers": [
                {
                    "id": "fs",
                    "name": "Filesystem",
                    "program": "mcp-fs",
                    "args": ["--root", "/tmp"],
                    "env": {"LOG": "1"},
                    "framing": "content-length"
                },
                {
                    "id": "search",
                    "transport": "http",
                    "endpoint": "https://example.test/mcp",
                    "authToken": "secret",
                    "timeoutMs": 1500
                }
            ]
        }"#;
        let manifest = McpManifest::from_json(raw).unwrap();
        let resolved = manifest.resolved_enabled().unwrap();

        match &resolved[0].transport {
            TransportConfig::Stdio(stdio) => {
                assert_eq!(stdio.command, "mcp-fs");
                assert_eq!(stdio.args, vec!["--root", "/tmp"]);
                assert_eq!(stdio.framing, StdioFraming::ContentLength);
            }
            other => panic!("unexpected transport {other:?}"),
        }
        assert_eq!(resolved[0].name, "Filesystem");
        assert_eq!(resolved[0].timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));

        match &resolved[1].transport {
            TransportConfig::Http(http) => {
                assert_eq!(http.url, "https://example.test/mcp");
                assert_eq!(http.auth_token.as_deref(), Some("secret"));
            }
            other => panic!("unexpected transport {other:?}"),
        }
        assert_eq!(resolved[1].name, "search");
        assert_eq!(resolved[1].timeout, Duration::from_millis(1500));
    }

    #[test]
    fn load_reads_manifest_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"servers":[{{"id":"a","command":"srv"}}]}}"#).unwrap();
        let manifest = McpManifest::load(file.path()).unwrap();
        assert_eq!(manifest.servers.len(), 1);

        let missing = McpManifest::load("/definitely/not/here.json");
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
