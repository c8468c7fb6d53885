use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::language_model::FunctionDeclaration;
use crate::local_tools::LocalToolHandler;
use crate::tool::{
    ConnectError, ConnectionStatus, ProviderKind, ToolArguments, ToolDescriptor, ToolErrorCode,
    ToolProvider, ToolResult,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ToolOwner {
    Local,
    Provider(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub descriptor: ToolDescriptor,
    pub owner: ToolOwner,
}

/// Point-in-time name -> descriptor snapshot. Names are unique.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    entries: IndexMap<String, CatalogEntry>,
}

impl ToolCatalog {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(name)
    }

    pub fn owner(&self, name: &str) -> Option<&ToolOwner> {
        self.entries.get(name).map(|entry| &entry.owner)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.entries
            .values()
            .map(|entry| FunctionDeclaration::from(&entry.descriptor))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub id: String,
    pub name: String,
    pub kind: ProviderKind,
    pub status: ConnectionStatus,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no provider registered with id '{0}'")]
    UnknownProvider(String),
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Aggregates the local handler and every remote provider behind one catalog
/// and one dispatch entry point. Safe to share across conversations.
pub struct ToolRegistry {
    local: Option<Arc<dyn LocalToolHandler>>,
    providers: RwLock<IndexMap<String, Arc<dyn ToolProvider>>>,
    /// Tool name -> provider id, from the latest catalog build.
    routes: RwLock<HashMap<String, String>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ToolRegistry {
    pub fn new(local: Option<Arc<dyn LocalToolHandler>>) -> Self {
        Self {
            local,
            providers: RwLock::new(IndexMap::new()),
            routes: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_local(local: Arc<dyn LocalToolHandler>) -> Self {
        Self::new(Some(local))
    }

    /// Registers a provider, replacing any previous one with the same id.
    pub async fn add_provider(&self, provider: Arc<dyn ToolProvider>) {
        let id = provider.id().to_string();
        let previous = self.providers.write().await.insert(id.clone(), provider);
        if let Some(previous) = previous {
            warn!(target: "ai_agent::registry", provider_id = %id, "replacing registered provider");
            previous.disconnect().await;
        }
    }

    pub async fn remove_provider(&self, id: &str) -> Option<Arc<dyn ToolProvider>> {
        let removed = self.providers.write().await.shift_remove(id);
        if let Some(provider) = removed.as_ref() {
            provider.disconnect().await;
            self.routes.write().await.retain(|_, owner| owner != id);
        }
        removed
    }

    pub async fn provider(&self, id: &str) -> Option<Arc<dyn ToolProvider>> {
        self.providers.read().await.get(id).cloned()
    }

    pub async fn providers(&self) -> Vec<Arc<dyn ToolProvider>> {
        self.providers.read().await.values().cloned().collect()
    }

    pub async fn summaries(&self) -> Vec<ProviderSummary> {
        self.providers()
            .await
            .into_iter()
            .map(|provider| ProviderSummary {
                id: provider.id().to_string(),
                name: provider.display_name().to_string(),
                kind: provider.kind(),
                status: provider.status(),
            })
            .collect()
    }

    pub async fn connect(&self, id: &str) -> Result<(), RegistryError> {
        let provider = self
            .provider(id)
            .await
            .ok_or_else(|| RegistryError::UnknownProvider(id.to_string()))?;
        provider.connect().await?;
        Ok(())
    }

    /// Connects every registered provider that is not connected yet. One
    /// failure never blocks the others.
    pub async fn connect_all(&self) -> Vec<(String, Result<(), ConnectError>)> {
        let mut outcomes = Vec::new();
        for provider in self.providers().await {
            if provider.status().is_connected() {
                continue;
            }
            let outcome = provider.connect().await;
            if let Err(err) = &outcome {
                warn!(
                    target: "ai_agent::registry",
                    provider_id = %provider.id(),
                    error = %err,
                    "provider failed to connect"
                );
            }
            outcomes.push((provider.id().to_string(), outcome));
        }
        outcomes
    }

    pub async fn disconnect(&self, id: &str) -> Result<(), RegistryError> {
        let provider = self
            .provider(id)
            .await
            .ok_or_else(|| RegistryError::UnknownProvider(id.to_string()))?;
        provider.disconnect().await;
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        for provider in self.providers().await {
            provider.disconnect().await;
        }
    }

    /// Categories to mention in the system prompt: the local handler plus
    /// every connected provider.
    pub async fn connected_categories(&self) -> Vec<String> {
        let mut categories = Vec::new();
        if let Some(local) = &self.local {
            categories.push(local.category().to_string());
        }
        for provider in self.providers().await {
            if provider.status().is_connected() {
                categories.push(provider.display_name().to_string());
            }
        }
        categories
    }

    /// Builds a fresh catalog from the local handler and every connected
    /// provider. Local tools win name collisions; among providers the first
    /// registered wins.
    pub async fn catalog(&self) -> ToolCatalog {
        let mut entries: IndexMap<String, CatalogEntry> = IndexMap::new();
        if let Some(local) = &self.local {
            for descriptor in local.descriptors() {
                entries.insert(
                    descriptor.name.clone(),
                    CatalogEntry {
                        descriptor,
                        owner: ToolOwner::Local,
                    },
                );
            }
        }

        let providers = self.providers().await;
        let mut fresh_routes = HashMap::new();
        for provider in &providers {
            if !provider.status().is_connected() {
                continue;
            }
            for descriptor in provider.tools().await {
                if let Some(existing) = entries.get(&descriptor.name) {
                    warn!(
                        target: "ai_agent::registry",
                        tool = %descriptor.name,
                        provider_id = %provider.id(),
                        winner = ?existing.owner,
                        "tool name collision; keeping earlier owner"
                    );
                    continue;
                }
                fresh_routes.insert(descriptor.name.clone(), provider.id().to_string());
                entries.insert(
                    descriptor.name.clone(),
                    CatalogEntry {
                        descriptor,
                        owner: ToolOwner::Provider(provider.id().to_string()),
                    },
                );
            }
        }

        let mut routes = self.routes.write().await;
        // Routes of registered providers that dropped out keep pointing at
        // them, so a call aimed there reports provider-unavailable.
        for (tool, owner) in routes.drain() {
            let still_registered = providers.iter().any(|p| p.id() == owner);
            let claimed = entries.contains_key(&tool);
            if still_registered && !claimed {
                fresh_routes.entry(tool).or_insert(owner);
            }
        }
        *routes = fresh_routes;
        debug!(target: "ai_agent::registry", tools = entries.len(), "catalog rebuilt");

        ToolCatalog { entries }
    }

    /// Routes a model-issued call to its owner. Never fails as a Rust error:
    /// unknown names and unreachable providers come back as error results.
    pub async fn dispatch(&self, name: &str, arguments: ToolArguments) -> ToolResult {
        if let Some(local) = &self.local {
            if local.handles(name) {
                return local.handle(name, arguments).await;
            }
        }

        let provider = match self.route(name).await {
            Some(provider) => Some(provider),
            None => {
                self.catalog().await;
                self.route(name).await
            }
        };

        match provider {
            Some(provider) => provider.invoke(name, arguments).await,
            None => {
                debug!(target: "ai_agent::registry", tool = %name, "no owner for tool");
                ToolResult::error(
                    ToolErrorCode::UnknownTool,
                    format!("unknown tool '{name}'"),
                )
            }
        }
    }

    async fn route(&self, name: &str) -> Option<Arc<dyn ToolProvider>> {
        let owner = self.routes.read().await.get(name).cloned()?;
        self.provider(&owner).await
    }
}
