use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::conversation::{ConversationTurn, FunctionCall};
use crate::credentials::CredentialManager;
use crate::error::AgentError;
use crate::language_model::{
    BackendError, BackendRequest, FinishReason, LanguageModelClient, LanguageModelUsage,
    SamplingParams,
};
use crate::registry::ToolRegistry;
use crate::tool::{ToolErrorCode, ToolResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Upper bound on backend calls per `send_message`.
    pub max_iterations: usize,
    pub system_prompt: Option<String>,
    pub sampling: SamplingParams,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: crate::DEFAULT_AGENT_MAX_ITERATIONS,
            system_prompt: None,
            sampling: SamplingParams::default(),
        }
    }
}

/// Latency and token totals for one `send_message` call, summed across every
/// backend round-trip of its loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub execution_time_ms: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UsageMetrics {
    fn record(&mut self, elapsed: Duration, usage: Option<LanguageModelUsage>) {
        self.execution_time_ms = self
            .execution_time_ms
            .saturating_add(elapsed.as_millis() as u64);
        if let Some(usage) = usage {
            self.prompt_tokens += u64::from(usage.prompt_tokens);
            self.completion_tokens += u64::from(usage.completion_tokens);
            self.total_tokens += u64::from(usage.total_tokens);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentEvent {
    BackendResponse {
        finish_reason: FinishReason,
        content: Option<String>,
    },
    ToolCall {
        name: String,
        arguments: Value,
    },
    ToolResult {
        name: String,
        is_error: bool,
        content: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReply {
    /// Trimmed final answer, or a description of the limit when halted.
    pub content: String,
    #[serde(flatten)]
    pub metrics: UsageMetrics,
    pub events: Vec<AgentEvent>,
    /// Set when the iteration bound was hit without a final answer.
    pub halted: bool,
}

/// Settings changes delivered between calls.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorCommand {
    ClearHistory,
    ResetWithSystemPrompt(Option<String>),
    UpdateSampling(SamplingParams),
    SetMaxIterations(usize),
}

/// Drives one conversation. Only this type mutates the history, and a call's
/// turns land in it only once the call completes.
pub struct ConversationOrchestrator {
    model: Arc<dyn LanguageModelClient>,
    registry: Arc<ToolRegistry>,
    credentials: Option<Arc<CredentialManager>>,
    config: AgentConfig,
    history: Vec<ConversationTurn>,
}

impl ConversationOrchestrator {
    pub fn new(
        model: Arc<dyn LanguageModelClient>,
        registry: Arc<ToolRegistry>,
        config: AgentConfig,
    ) -> Self {
        Self {
            model,
            registry,
            credentials: None,
            config,
            history: Vec::new(),
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<CredentialManager>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn apply(&mut self, command: OrchestratorCommand) {
        debug!(target: "ai_agent::orchestrator", ?command, "applying command");
        match command {
            OrchestratorCommand::ClearHistory => self.clear_history(),
            OrchestratorCommand::ResetWithSystemPrompt(prompt) => {
                self.config.system_prompt = prompt;
                self.clear_history();
            }
            OrchestratorCommand::UpdateSampling(sampling) => {
                self.config.sampling = sampling;
            }
            OrchestratorCommand::SetMaxIterations(max) => {
                self.config.max_iterations = max.max(1);
            }
        }
    }

    pub async fn send_message(&mut self, text: &str) -> Result<AgentReply, AgentError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AgentError::EmptyMessage);
        }

        let mut pending = vec![ConversationTurn::user(text)];
        let mut metrics = UsageMetrics::default();
        let mut events = Vec::new();

        let categories = self.registry.connected_categories().await;
        let system = compose_system_prompt(self.config.system_prompt.as_deref(), &categories)
            .map(ConversationTurn::system);
        let functions = self.registry.catalog().await.declarations();
        let sampling = self.config.sampling.validated();
        let max_iterations = self.config.max_iterations.max(1);

        info!(
            target: "ai_agent::orchestrator",
            tools = functions.len(),
            categories = categories.len(),
            "sending message"
        );

        for iteration in 0..max_iterations {
            let access_token = match &self.credentials {
                Some(credentials) => Some(credentials.get_token().await?),
                None => None,
            };

            let messages = system
                .iter()
                .chain(self.history.iter())
                .chain(pending.iter())
                .cloned()
                .collect();
            let request = BackendRequest {
                messages,
                functions: functions.clone(),
                sampling: sampling.clone(),
                access_token,
            };

            let started = Instant::now();
            let response = match self.model.send(request).await {
                Ok(response) => response,
                Err(err) => {
                    if let (BackendError::Unauthorized(_), Some(credentials)) =
                        (&err, &self.credentials)
                    {
                        credentials.invalidate().await;
                    }
                    warn!(target: "ai_agent::orchestrator", error = %err, "backend call failed");
                    return Err(err.into());
                }
            };
            metrics.record(started.elapsed(), response.usage);

            let choice = response.choices.into_iter().next().ok_or_else(|| {
                AgentError::ContractViolation("no choices returned".to_string())
            })?;
            events.push(AgentEvent::BackendResponse {
                finish_reason: choice.finish_reason.clone(),
                content: choice.message.content.clone(),
            });

            let call = match (choice.message.function_call, &choice.finish_reason) {
                (Some(call), _) => call,
                (None, FinishReason::FunctionCall) => {
                    return Err(AgentError::ContractViolation(
                        "function_call finish reason without a call payload".to_string(),
                    ));
                }
                (None, _) => {
                    let content = choice.message.content.unwrap_or_default();
                    let answer = content.trim().to_string();
                    pending.push(ConversationTurn::assistant(content));
                    self.history.append(&mut pending);
                    debug!(
                        target: "ai_agent::orchestrator",
                        iterations = iteration + 1,
                        total_tokens = metrics.total_tokens,
                        "conversation turn complete"
                    );
                    return Ok(AgentReply {
                        content: answer,
                        metrics,
                        events,
                        halted: false,
                    });
                }
            };

            self.run_tool_call(call, &mut pending, &mut events).await;
        }

        warn!(
            target: "ai_agent::orchestrator",
            max_iterations,
            "iteration limit reached without a final answer"
        );
        self.history.append(&mut pending);
        Ok(AgentReply {
            content: format!(
                "Stopped after {max_iterations} model calls without reaching a final answer."
            ),
            metrics,
            events,
            halted: true,
        })
    }

    async fn run_tool_call(
        &self,
        call: FunctionCall,
        pending: &mut Vec<ConversationTurn>,
        events: &mut Vec<AgentEvent>,
    ) {
        let name = call.name.clone();
        let parsed = call.argument_map();
        events.push(AgentEvent::ToolCall {
            name: name.clone(),
            arguments: match &parsed {
                Ok(arguments) => Value::Object(arguments.clone()),
                Err(_) => call.arguments.clone(),
            },
        });
        pending.push(ConversationTurn::assistant_call(call));

        let result = match parsed {
            Ok(arguments) => self.registry.dispatch(&name, arguments).await,
            Err(reason) => ToolResult::error(ToolErrorCode::InvalidArguments, reason),
        };
        if result.is_error {
            debug!(
                target: "ai_agent::orchestrator",
                tool = %name,
                code = ?result.error_code,
                "tool call returned an error"
            );
        }
        events.push(AgentEvent::ToolResult {
            name: name.clone(),
            is_error: result.is_error,
            content: result.content.clone(),
        });
        pending.push(ConversationTurn::function(name, result.envelope()));
    }
}

/// The system prompt sent with a call: the base prompt followed by the list of
/// tool categories currently reachable. `None` when both are empty.
pub fn compose_system_prompt(base: Option<&str>, categories: &[String]) -> Option<String> {
    let base = base.map(str::trim).filter(|b| !b.is_empty());
    let addendum = (!categories.is_empty()).then(|| {
        format!(
            "You can call functions from these categories: {}. Call a function when it helps \
             answer the user, otherwise reply directly.",
            categories.join(", ")
        )
    });
    match (base, addendum) {
        (Some(base), Some(addendum)) => Some(format!("{base}\n\n{addendum}")),
        (Some(base), None) => Some(base.to_string()),
        (None, addendum) => addendum,
    }
}
