//! Conversation runtime for a function-calling language model.
//!
//! The orchestrator runs a bounded loop against a [`LanguageModelClient`],
//! dispatching model-issued calls through a [`ToolRegistry`] that merges the
//! in-process tools with any connected [`ToolProvider`]s.

pub mod conversation;
pub mod credentials;
pub mod error;
pub mod language_model;
pub mod local_tools;
pub mod orchestrator;
pub mod registry;
pub mod tool;

pub use conversation::{ConversationTurn, FunctionCall, Role};
pub use credentials::{
    AuthError, Authenticator, ClientCredentialsAuthenticator, ClientCredentialsConfig, Credential,
    CredentialManager,
};
pub use error::AgentError;
pub use language_model::{
    BackendError, BackendRequest, FinishReason, FunctionDeclaration, LanguageModelClient,
    LanguageModelResponse, LanguageModelUsage, SamplingParams,
};
pub use local_tools::{
    InMemoryReminderScheduler, LocalToolHandler, ReminderInterval, ReminderScheduler,
    ReminderSettings, ReminderTools,
};
pub use orchestrator::{
    compose_system_prompt, AgentConfig, AgentEvent, AgentReply, ConversationOrchestrator,
    OrchestratorCommand, UsageMetrics,
};
pub use registry::{ProviderSummary, RegistryError, ToolCatalog, ToolOwner, ToolRegistry};
pub use tool::{
    ConnectError, ConnectErrorKind, ConnectionStatus, ProviderKind, ToolArguments,
    ToolDescriptor, ToolErrorCode, ToolProvider, ToolResult, UsageExample,
};

pub const DEFAULT_AGENT_MAX_ITERATIONS: usize = 10;
