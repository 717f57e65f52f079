use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("{0}")]
    Message(String),
    #[error("{0}")]
    Config(ConfigError),
    #[error("{0}")]
    Precondition(String),
    #[error("{program} failed with exit code {code}{}", stderr_suffix(.stderr))]
    Tool {
        program: String,
        code: i32,
        stderr: Option<String>,
    },
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("cancelled")]
    Cancelled,
    #[error("another operation is already running")]
    Busy,
    #[error("{0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parse config: {0}")]
    Parse(String),
    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;

fn stderr_suffix(stderr: &Option<String>) -> String {
    match stderr.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => format!(": {}", text),
        _ => String::new(),
    }
}

impl VaultError {
    pub fn message(msg: impl Into<String>) -> Self {
        VaultError::Message(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        VaultError::Precondition(msg.into())
    }

    pub fn tool(program: impl Into<String>, code: i32, stderr: Option<String>) -> Self {
        VaultError::Tool {
            program: program.into(),
            code,
            stderr,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, VaultError::Cancelled)
    }
}

impl From<ConfigError> for VaultError {
    fn from(err: ConfigError) -> Self {
        VaultError::Config(err)
    }
}
