use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ai_agent::{
    compose_system_prompt, AgentConfig, ClientCredentialsAuthenticator, ClientCredentialsConfig,
    CredentialManager, InMemoryReminderScheduler, ReminderTools, ToolArguments, ToolOwner,
    ToolProvider, ToolRegistry,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mcp_client::{McpManifest, McpServerConfig, McpToolProvider};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,ai_agent=debug,mcp_client=debug";

#[derive(Parser)]
#[command(author, version, about = "Inspect and exercise the agent's tool providers", long_about = None)]
struct Cli {
    /// Path to the agent manifest
    #[arg(short, long, default_value = "agentctl.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect every enabled server and print the merged tool catalog
    Tools,
    /// Connect every enabled server and print provider states and statistics
    Status,
    /// Dispatch one tool call through the registry and print the result envelope
    Call {
        /// Tool name as it appears in the catalog
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

/// `agentctl.json`: agent settings, tool servers and optional backend auth.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AgentManifest {
    agent: AgentConfig,
    servers: Vec<McpServerConfig>,
    auth: Option<ClientCredentialsConfig>,
}

impl AgentManifest {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(target: "agentctl", path = %path.display(), "manifest not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let manifest: AgentManifest = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        manifest.servers().validate()?;
        Ok(manifest)
    }

    fn servers(&self) -> McpManifest {
        McpManifest {
            servers: self.servers.clone(),
        }
    }
}

struct Runtime {
    registry: Arc<ToolRegistry>,
    providers: Vec<Arc<McpToolProvider>>,
}

impl Runtime {
    async fn start(manifest: &AgentManifest) -> Result<Self> {
        let scheduler = Arc::new(InMemoryReminderScheduler::new());
        let registry = Arc::new(ToolRegistry::with_local(Arc::new(ReminderTools::new(
            scheduler,
        ))));
        let providers = mcp_client::providers_from_manifest(&manifest.servers())?;
        for provider in &providers {
            registry.add_provider(provider.clone()).await;
        }
        for (id, outcome) in registry.connect_all().await {
            match outcome {
                Ok(()) => info!(target: "agentctl", server_id = %id, "connected"),
                Err(err) => warn!(target: "agentctl", server_id = %id, error = %err, "connect failed"),
            }
        }
        Ok(Self {
            registry,
            providers,
        })
    }

    async fn shutdown(&self) {
        self.registry.disconnect_all().await;
    }
}

fn parse_arguments(raw: &str) -> Result<ToolArguments> {
    match serde_json::from_str::<Value>(raw).context("--args must be valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--args must be a JSON object, got {other}"),
    }
}

async fn print_tools(runtime: &Runtime) {
    let catalog = runtime.registry.catalog().await;
    if catalog.is_empty() {
        println!("No tools available");
        return;
    }
    for entry in catalog.iter() {
        let owner = match &entry.owner {
            ToolOwner::Local => "local".to_string(),
            ToolOwner::Provider(id) => id.clone(),
        };
        println!("{:<24} [{}] {}", entry.descriptor.name, owner, entry.descriptor.description);
    }
}

async fn print_status(runtime: &Runtime, manifest: &AgentManifest) -> Result<()> {
    let agent = &manifest.agent;
    let sampling = agent.sampling.validated();
    println!(
        "agent: model={} max_iterations={} temperature={:?} max_tokens={:?}",
        sampling.model, agent.max_iterations, sampling.temperature, sampling.max_tokens
    );

    let categories = runtime.registry.connected_categories().await;
    match compose_system_prompt(agent.system_prompt.as_deref(), &categories) {
        Some(prompt) => println!("system prompt:\n{prompt}\n"),
        None => println!("system prompt: <none>\n"),
    }

    if let Some(auth) = &manifest.auth {
        let authenticator = ClientCredentialsAuthenticator::new(auth.clone())?;
        let credentials = CredentialManager::new(Arc::new(authenticator));
        match credentials.get_token().await {
            Ok(_) => println!("auth: token acquired from {}", auth.auth_url),
            Err(err) => println!("auth: {err}"),
        }
    }

    for provider in &runtime.providers {
        let status = provider.runtime_status();
        println!(
            "{} ({}): {}",
            provider.id(),
            provider.display_name(),
            serde_json::to_string(&status.status)?
        );
        println!(
            "  tools={} ok={} failed={} last_latency_ms={}",
            status.tool_count,
            status.success_count,
            status.error_count,
            status
                .last_latency_ms
                .map_or_else(|| "-".to_string(), |ms| ms.to_string())
        );
        for entry in status.recent_logs.iter().take(5) {
            let age = SystemTime::UNIX_EPOCH + Duration::from_millis(entry.timestamp_ms);
            let secs = SystemTime::now()
                .duration_since(age)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            println!("  {:>4}s ago {:?}: {}", secs, entry.level, entry.message);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let manifest = AgentManifest::load(&cli.config)?;
    // Validate before connecting anything.
    let call = match &cli.command {
        Commands::Call { tool, args } => Some((tool.clone(), parse_arguments(args)?)),
        _ => None,
    };

    let runtime = Runtime::start(&manifest).await?;
    let outcome = match (cli.command, call) {
        (Commands::Tools, _) => {
            print_tools(&runtime).await;
            Ok(())
        }
        (Commands::Status, _) => print_status(&runtime, &manifest).await,
        (Commands::Call { .. }, Some((tool, arguments))) => {
            let result = runtime.registry.dispatch(&tool, arguments).await;
            println!("{}", result.envelope());
            if let Some(code) = result.error_code {
                eprintln!("error code: {code}");
            }
            Ok(())
        }
        (Commands::Call { .. }, None) => Ok(()),
    };
    runtime.shutdown().await;
    outcome
}
