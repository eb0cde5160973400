use std::io;
use std::string::FromUtf8Error;

use sandbox::SandboxError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("metrics output was not utf-8: {0}")]
    Encoding(#[from] FromUtf8Error),
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
