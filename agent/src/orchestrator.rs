//! The agent loop.
//!
//! One [`Orchestrator::respond`] call runs a bounded state machine: ask the
//! model, run whatever tools it asks for, feed the results back, and stop on
//! the first text-only answer. The session's history only changes when that
//! answer arrives.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::conversation::{ToolCallRecord, ToolInvocation, ToolResult, Turn};
use crate::metrics::AgentMetrics;
use crate::model::{ModelClient, ModelRequest, ToolDeclaration};
use crate::quota::QuotaScheduler;
use crate::session::SessionStore;
use crate::tools::ToolDispatcher;

pub const DEFAULT_MAX_TURNS: u32 = 15;
pub const EXHAUSTED_REPLY: &str = "I apologize, but I wasn't able to complete the request.";

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "\
You are Singularity, a friendly coding assistant.

Rules:
1. Answer simple questions (arithmetic, facts, explanations, chat) directly. Do not call tools for them.
2. Use tools only when the user explicitly asks you to write or execute code.
3. To execute Python, always write the code to \"sandbox.py\" with the write tool, then execute \"sandbox.py\" with the run tool. The file is emptied after each run.

If asked which model you are, say you are Singularity and leave it at that.
";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_turns: u32,
    pub system_instruction: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Termination {
    Completed,
    Aborted { reason: String },
    Exhausted,
}

impl Termination {
    pub fn label(&self) -> &'static str {
        match self {
            Termination::Completed => "completed",
            Termination::Aborted { .. } => "aborted",
            Termination::Exhausted => "exhausted",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatOutcome {
    pub reply: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub termination: Termination,
    pub model_calls: u32,
}

enum LoopState {
    AwaitingModelResponse,
    ExecutingTools(Vec<ToolInvocation>),
    Done(String),
    Aborted(String),
    Exhausted,
}

pub struct Orchestrator {
    model: Arc<dyn ModelClient>,
    quota: QuotaScheduler,
    tools: ToolDispatcher,
    sessions: Arc<SessionStore>,
    config: OrchestratorConfig,
    metrics: Option<Arc<AgentMetrics>>,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ModelClient>,
        quota: QuotaScheduler,
        tools: ToolDispatcher,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            model,
            quota,
            tools,
            sessions,
            config: OrchestratorConfig::default(),
            metrics: None,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AgentMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn quota(&self) -> &QuotaScheduler {
        &self.quota
    }

    /// Answers `message` in the context of `session_id`.
    ///
    /// Requests on the same session wait for each other. Only a
    /// [`Termination::Completed`] outcome commits turns to the session.
    pub async fn respond(&self, session_id: &str, message: &str) -> ChatOutcome {
        let started = Instant::now();
        let lease = self.sessions.lease(session_id).await;
        let mut working = lease.history().to_vec();
        let committed_len = working.len();
        working.push(Turn::user(message));

        let declarations = self.tools.declarations();
        let mut records = Vec::new();
        let mut model_calls = 0u32;
        let mut state = LoopState::AwaitingModelResponse;

        let (reply, termination) = loop {
            state = match state {
                LoopState::AwaitingModelResponse if model_calls >= self.config.max_turns => {
                    LoopState::Exhausted
                }
                LoopState::AwaitingModelResponse => {
                    model_calls += 1;
                    self.ask_model(session_id, model_calls, &mut working, &declarations)
                        .await
                }
                LoopState::ExecutingTools(calls) => {
                    let mut results = Vec::with_capacity(calls.len());
                    for call in calls {
                        let outcome = self.tools.dispatch(&call).await;
                        if let Some(metrics) = &self.metrics {
                            metrics.record_tool_call(&call.name, outcome.is_success());
                        }
                        results.push(ToolResult {
                            name: call.name.clone(),
                            outcome: outcome.clone(),
                        });
                        records.push(ToolCallRecord {
                            name: call.name,
                            args: call.args,
                            outcome,
                        });
                    }
                    working.push(Turn::tool_results(results));
                    LoopState::AwaitingModelResponse
                }
                LoopState::Done(reply) => {
                    working.push(Turn::model_text(reply.clone()));
                    lease.commit(working.split_off(committed_len));
                    break (reply, Termination::Completed);
                }
                LoopState::Aborted(reason) => {
                    break (format!("Error: {reason}"), Termination::Aborted { reason });
                }
                LoopState::Exhausted => {
                    warn!(session_id, model_calls, "agent loop hit its turn limit");
                    break (EXHAUSTED_REPLY.to_string(), Termination::Exhausted);
                }
            };
        };

        let elapsed = started.elapsed();
        info!(
            session_id,
            outcome = termination.label(),
            model_calls,
            tool_calls = records.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "chat request finished"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_chat(&termination, elapsed);
        }

        ChatOutcome {
            reply,
            tool_calls: records,
            termination,
            model_calls,
        }
    }

    async fn ask_model(
        &self,
        session_id: &str,
        iteration: u32,
        working: &mut Vec<Turn>,
        declarations: &[ToolDeclaration],
    ) -> LoopState {
        let tier = match self.quota.select().await {
            Ok(tier) => tier,
            Err(error) => return LoopState::Aborted(error.to_string()),
        };
        if let Err(error) = self.quota.increment(tier).await {
            return LoopState::Aborted(error.to_string());
        }
        let model = self.quota.policy().model_for(tier);
        info!(session_id, iteration, %tier, model, "invoking model");
        if let Some(metrics) = &self.metrics {
            metrics.record_model_call(tier);
        }

        let request = ModelRequest {
            model,
            system_instruction: &self.config.system_instruction,
            turns: working.as_slice(),
            tools: declarations,
        };
        let response = match self.model.generate(&request).await {
            Ok(response) => response,
            Err(error) => {
                warn!(session_id, iteration, %error, "model invocation failed");
                return LoopState::Aborted(error.to_string());
            }
        };

        if !response.tool_calls.is_empty() {
            working.push(Turn::tool_calls_with_text(
                response.text.clone(),
                response.tool_calls.clone(),
            ));
            return LoopState::ExecutingTools(response.tool_calls);
        }
        match response.answer() {
            Some(text) => LoopState::Done(text.to_string()),
            None => {
                debug!(session_id, iteration, "model returned neither text nor tool calls");
                LoopState::AwaitingModelResponse
            }
        }
    }
}
