use std::collections::VecDeque;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent::{
    store, ModelClient, ModelError, ModelRequest, ModelResponse, Orchestrator, QuotaPolicy,
    QuotaScheduler, SessionStore, ToolDispatcher, ToolInvocation,
};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use sandbox::{RunConfig, SandboxRoot};
use tempfile::{tempdir, TempDir};

pub fn temp_workspace() -> Result<TempDir> {
    Ok(tempdir()?)
}

pub fn system_path() -> String {
    env::var("PATH").unwrap_or_else(|_| {
        "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()
    })
}

/// Absolute path of `python3` on `PATH`, if any.
pub fn python3() -> Option<PathBuf> {
    env::split_paths(&system_path())
        .map(|dir| dir.join("python3"))
        .find(|candidate| candidate.is_file())
}

/// Dispatcher running `.py` scripts with python3, or `None` when it is not installed.
pub fn python_dispatcher(workspace: &TempDir, timeout: Duration) -> Result<Option<ToolDispatcher>> {
    let Some(python) = python3() else {
        eprintln!("python3 not found on PATH; skipping");
        return Ok(None);
    };
    let root = SandboxRoot::new(workspace.path().join("sandbox"))?;
    let config = RunConfig::new(root, python.to_string_lossy(), "py", timeout)?;
    Ok(Some(ToolDispatcher::new(config)))
}

/// Dispatcher running `.sh` scripts with `/bin/sh`; canonical script is `sandbox.sh`.
pub fn sh_dispatcher(workspace: &TempDir, timeout: Duration) -> Result<ToolDispatcher> {
    let root = SandboxRoot::new(workspace.path().join("sandbox"))?;
    let config = RunConfig::new(root, "/bin/sh", "sh", timeout)?;
    Ok(ToolDispatcher::new(config).with_canonical_script("sandbox.sh"))
}

pub async fn orchestrator(model: Arc<ScriptedModel>, tools: ToolDispatcher) -> Result<Orchestrator> {
    let quota = QuotaScheduler::new(store::in_memory().await?, QuotaPolicy::default());
    Ok(Orchestrator::new(
        model,
        quota,
        tools,
        Arc::new(SessionStore::new()),
    ))
}

pub fn call(name: &str, args: serde_json::Value) -> ToolInvocation {
    ToolInvocation::new(name, args)
}

/// What the model saw on one call.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub model: String,
    pub turns: usize,
    pub tools: Vec<String>,
}

/// Model double that replays queued replies, then repeats a fallback (or fails).
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<ModelResponse, ModelError>>>,
    fallback: Option<ModelResponse>,
    seen: Mutex<Vec<SeenRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ModelResponse>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    pub fn repeating(reply: ModelResponse) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::default()
        }
    }

    pub fn push(&self, reply: Result<ModelResponse, ModelError>) {
        self.replies.lock().push_back(reply);
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn generate(&self, request: &ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
        self.seen.lock().push(SeenRequest {
            model: request.model.to_string(),
            turns: request.turns.len(),
            tools: request.tools.iter().map(|tool| tool.name.clone()).collect(),
        });
        if let Some(reply) = self.replies.lock().pop_front() {
            return reply;
        }
        match &self.fallback {
            Some(reply) => Ok(reply.clone()),
            None => Err(ModelError::Transport("no scripted reply left".to_string())),
        }
    }
}
