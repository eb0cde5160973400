//! Maps model-requested tool calls onto sandbox operations.
//!
//! Every outcome, including faults, comes back as a [`ToolOutcome`]; nothing
//! here can stop the agent loop.

use std::str::FromStr;
use std::time::Duration;

use sandbox::{RunConfig, RunRequest, SandboxError, SandboxFs, ScriptRunner};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::conversation::{ToolInvocation, ToolOutcome};
use crate::errors::AgentError;
use crate::model::ToolDeclaration;

pub const WRITE_TOOL: &str = "write";
pub const RUN_TOOL: &str = "run";
pub const DEFAULT_CANONICAL_SCRIPT: &str = "sandbox.py";

/// When the canonical script is emptied after a `run` dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScriptClearPolicy {
    #[default]
    AfterEveryAttempt,
    AfterSuccess,
    Never,
}

impl FromStr for ScriptClearPolicy {
    type Err = AgentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "every" | "always" => Ok(Self::AfterEveryAttempt),
            "success" => Ok(Self::AfterSuccess),
            "never" => Ok(Self::Never),
            other => Err(AgentError::Config(format!(
                "unknown script clear policy '{other}' (expected every, success or never)"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    file_path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct RunArgs {
    file_path: String,
    #[serde(default)]
    args: Option<Vec<String>>,
}

#[derive(Clone, Debug)]
pub struct ToolDispatcher {
    fs: SandboxFs,
    runner: ScriptRunner,
    canonical_script: String,
    clear_policy: ScriptClearPolicy,
}

impl ToolDispatcher {
    pub fn new(config: RunConfig) -> Self {
        Self {
            fs: SandboxFs::new(config.root().clone()),
            runner: ScriptRunner::new(config),
            canonical_script: DEFAULT_CANONICAL_SCRIPT.to_string(),
            clear_policy: ScriptClearPolicy::default(),
        }
    }

    pub fn with_canonical_script(mut self, script: impl Into<String>) -> Self {
        self.canonical_script = script.into();
        self
    }

    pub fn with_clear_policy(mut self, policy: ScriptClearPolicy) -> Self {
        self.clear_policy = policy;
        self
    }

    pub fn sandbox(&self) -> &SandboxFs {
        &self.fs
    }

    pub fn canonical_script(&self) -> &str {
        &self.canonical_script
    }

    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        vec![
            ToolDeclaration {
                name: WRITE_TOOL.to_string(),
                description: format!(
                    "Write content to a file in the working directory, replacing what is there. \
                     Put code to execute in {}.",
                    self.canonical_script
                ),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "file_path": {
                            "type": "string",
                            "description": "Path of the file, relative to the working directory."
                        },
                        "content": {
                            "type": "string",
                            "description": "Full contents to write."
                        }
                    },
                    "required": ["file_path", "content"]
                }),
            },
            ToolDeclaration {
                name: RUN_TOOL.to_string(),
                description: format!(
                    "Execute a .{} script in the working directory and return its output.",
                    self.runner.config().extension()
                ),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "file_path": {
                            "type": "string",
                            "description": "Path of the script, relative to the working directory."
                        },
                        "args": {
                            "type": "array",
                            "items": { "type": "string" },
                            "description": "Optional command line arguments."
                        }
                    },
                    "required": ["file_path"]
                }),
            },
        ]
    }

    pub async fn dispatch(&self, call: &ToolInvocation) -> ToolOutcome {
        debug!(tool = %call.name, "dispatching tool call");
        match call.name.as_str() {
            WRITE_TOOL => self.write(&call.args),
            RUN_TOOL => self.run(&call.args).await,
            other => ToolOutcome::Error(format!("Unknown function: {other}")),
        }
    }

    fn write(&self, args: &Value) -> ToolOutcome {
        let args: WriteArgs = match parse_args(WRITE_TOOL, args) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        match self.fs.write(&args.file_path, args.content.as_bytes()) {
            Ok(report) => ToolOutcome::Success(format!(
                "Successfully wrote to \"{}\" ({} bytes written)",
                args.file_path, report.bytes_written
            )),
            Err(error) if error.is_containment() => ToolOutcome::Error(format!(
                "Cannot write to \"{}\" as it is outside the permitted working directory",
                args.file_path
            )),
            Err(error) => ToolOutcome::Error(format!(
                "Error writing to \"{}\": {error}",
                args.file_path
            )),
        }
    }

    async fn run(&self, args: &Value) -> ToolOutcome {
        let (outcome, succeeded) = match parse_args::<RunArgs>(RUN_TOOL, args) {
            Ok(args) => {
                let request =
                    RunRequest::new(args.file_path.clone()).with_args(args.args.unwrap_or_default());
                match self.runner.execute(request).await {
                    Ok(output) => {
                        let succeeded = output.succeeded();
                        debug!(
                            script = %args.file_path,
                            exit_code = ?output.exit_code,
                            elapsed_ms = output.duration.as_millis() as u64,
                            "script finished"
                        );
                        (ToolOutcome::Success(output.render()), succeeded)
                    }
                    Err(error) => (self.run_error(&args.file_path, error), false),
                }
            }
            Err(outcome) => (outcome, false),
        };

        let clear = match self.clear_policy {
            ScriptClearPolicy::AfterEveryAttempt => true,
            ScriptClearPolicy::AfterSuccess => succeeded,
            ScriptClearPolicy::Never => false,
        };
        if clear {
            if let Err(error) = self.fs.clear(&self.canonical_script) {
                warn!(script = %self.canonical_script, %error, "failed to clear canonical script");
            }
        }
        outcome
    }

    fn run_error(&self, file_path: &str, error: SandboxError) -> ToolOutcome {
        let message = match error {
            SandboxError::OutsideRoot(_) => format!(
                "Cannot execute \"{file_path}\" as it is outside the permitted working directory"
            ),
            SandboxError::NotFound(_) => format!("File \"{file_path}\" not found."),
            SandboxError::WrongExtension { extension, .. } => {
                format!("\"{file_path}\" is not a {}.", script_label(&extension))
            }
            SandboxError::Timeout(limit) => format!(
                "Execution of \"{file_path}\" timed out after {}",
                format_duration(limit)
            ),
            other => format!("Error executing \"{file_path}\": {other}"),
        };
        ToolOutcome::Error(message)
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, args: &Value) -> Result<T, ToolOutcome> {
    serde_json::from_value(args.clone())
        .map_err(|error| ToolOutcome::Error(format!("Invalid arguments for {tool}: {error}")))
}

fn script_label(extension: &str) -> String {
    match extension {
        "py" => "Python file".to_string(),
        other => format!(".{other} file"),
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
