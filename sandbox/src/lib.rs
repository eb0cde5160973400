//! Sandbox executor.
//!
//! Two primitive operations confined to a single root directory: overwrite a
//! file and run a script under a wall-clock timeout. Every operation resolves
//! and containment-checks its own path.

pub mod errors;
pub mod fs;
pub mod path;
pub mod run;

pub use errors::{Result, SandboxError};
pub use fs::{SandboxFs, WriteReport};
pub use path::SandboxRoot;
pub use run::{RunConfig, RunOutput, RunRequest, ScriptRunner, DEFAULT_RUN_TIMEOUT};
