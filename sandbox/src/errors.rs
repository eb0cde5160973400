use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("path '{0}' resolves outside the sandbox root")]
    OutsideRoot(String),
    #[error("file '{0}' not found")]
    NotFound(String),
    #[error("'{path}' is not a .{extension} script")]
    WrongExtension { path: String, extension: String },
    #[error("process execution timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl SandboxError {
    /// True for failures caught before the filesystem or a process was touched.
    pub fn is_containment(&self) -> bool {
        matches!(self, SandboxError::OutsideRoot(_))
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
