use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{instrument, warn};

use crate::errors::{Result, SandboxError};
use crate::path::SandboxRoot;

pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct RunConfig {
    root: SandboxRoot,
    interpreter: String,
    extension: String,
    timeout: Duration,
}

impl RunConfig {
    pub fn new(
        root: SandboxRoot,
        interpreter: impl Into<String>,
        extension: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let interpreter = interpreter.into().trim().to_string();
        if interpreter.is_empty() {
            return Err(SandboxError::InvalidOperation(
                "script interpreter must not be empty".to_string(),
            ));
        }
        let extension = extension.into().trim().trim_start_matches('.').to_string();
        if extension.is_empty() {
            return Err(SandboxError::InvalidOperation(
                "script extension must not be empty".to_string(),
            ));
        }
        if timeout.is_zero() {
            return Err(SandboxError::InvalidOperation(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            root,
            interpreter,
            extension,
            timeout,
        })
    }

    /// `python3` scripts with the `.py` extension and a 30s limit.
    pub fn python(root: SandboxRoot) -> Result<Self> {
        Self::new(root, "python3", "py", DEFAULT_RUN_TIMEOUT)
    }

    pub fn root(&self) -> &SandboxRoot {
        &self.root
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn has_script_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == self.extension)
    }
}

#[derive(Clone, Debug)]
pub struct ScriptRunner {
    config: RunConfig,
}

impl ScriptRunner {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    #[instrument(skip(self, request), fields(script = %request.script))]
    pub async fn execute(&self, request: RunRequest) -> Result<RunOutput> {
        let RunRequest { script, args } = request;

        let path = self.config.root.resolve(&script)?;
        if !path.exists() {
            return Err(SandboxError::NotFound(script));
        }
        if !path.is_file() || !self.config.has_script_extension(&path) {
            return Err(SandboxError::WrongExtension {
                path: script,
                extension: self.config.extension.clone(),
            });
        }
        let working_dir = path
            .parent()
            .unwrap_or_else(|| self.config.root.as_path())
            .to_path_buf();

        let mut command = Command::new(&self.config.interpreter);
        command.arg(&path);
        command.args(&args);
        command.current_dir(working_dir);
        // dropping the wait future on timeout kills the child
        command.kill_on_drop(true);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let child = command.spawn()?;

        let start = Instant::now();
        let output = match timeout(self.config.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(script = %script, timeout = ?self.config.timeout, "script killed after timeout");
                return Err(SandboxError::Timeout(self.config.timeout));
            }
        };
        let duration = start.elapsed();

        Ok(RunOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration,
        })
    }
}

#[derive(Debug)]
pub struct RunRequest {
    pub script: String,
    pub args: Vec<String>,
}

impl RunRequest {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[derive(Debug)]
pub struct RunOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl RunOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// The `STDOUT:` / `STDERR:` block handed back to the model.
    pub fn render(&self) -> String {
        let mut sections = vec![
            format!("STDOUT: {}", self.stdout),
            format!("STDERR: {}", self.stderr),
        ];
        match self.exit_code {
            Some(0) => {}
            Some(code) => sections.push(format!("Process exited with code {code}")),
            None => sections.push("Process terminated by signal".to_string()),
        }
        sections.join("\n")
    }
}
