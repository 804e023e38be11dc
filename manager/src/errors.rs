//! Error types for the botyard manager

use thiserror::Error;

/// Main error type for the botyard manager
#[derive(Error, Debug)]
pub enum BotError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Compose error: {0}")]
    ComposeError(String),

    #[error("{program} exited with {}: {stderr}", exit_label(.code))]
    ToolError {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("Install hook failed: {0}")]
    HookError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BotError {
    /// Whether the error was raised before any side effect took place
    pub fn is_validation(&self) -> bool {
        matches!(self, BotError::ValidationError(_))
    }

    /// Whether the error came from an external tool invocation
    pub fn is_external(&self) -> bool {
        matches!(self, BotError::ToolError { .. } | BotError::Timeout { .. })
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

impl From<anyhow::Error> for BotError {
    fn from(err: anyhow::Error) -> Self {
        BotError::Internal(err.to_string())
    }
}
