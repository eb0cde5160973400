//! Agent core: the bounded model/tool loop plus the shared quota and rate
//! limiting state it runs against.

pub mod conversation;
pub mod errors;
pub mod identity;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod quota;
pub mod rate_limit;
pub mod session;
pub mod store;
pub mod tools;

pub use conversation::{Role, ToolCallRecord, ToolInvocation, ToolOutcome, ToolResult, Turn};
pub use errors::{AgentError, Result};
pub use identity::{bearer_token, Anonymous, IdentityResolver};
pub use metrics::AgentMetrics;
pub use model::{
    GeminiClient, GeminiConfig, ModelClient, ModelError, ModelRequest, ModelResponse,
    ToolDeclaration,
};
pub use orchestrator::{ChatOutcome, Orchestrator, OrchestratorConfig, Termination};
pub use quota::{ModelTier, QuotaPolicy, QuotaScheduler, QuotaStatus};
pub use rate_limit::{RateDecision, RateLimitPolicy, RateLimiter};
pub use session::{SessionLease, SessionStore};
pub use tools::{ScriptClearPolicy, ToolDispatcher};
