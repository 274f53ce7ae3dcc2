use std::io;
use std::time::Duration;

/// Errors from sandbox operations.
///
/// Adapters map vendor failures into these variants. `Unsupported` is the
/// expected return for operations a provider has no facility for (terminals
/// on Modal, suspend over SSH, directory deletion on Daytona).
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("sandbox not connected")]
    NotConnected,

    #[error("invalid sandbox state: {0}")]
    InvalidState(&'static str),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("provision failed: {0}")]
    Provision(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("command failed: code={code:?}, stderr={stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },

    #[error("command timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("template build failed: {0}")]
    Build(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl SandboxError {
    /// True for lifecycle contract violations (operation in the wrong state).
    pub fn is_state_error(&self) -> bool {
        matches!(self, SandboxError::NotConnected | SandboxError::InvalidState(_))
    }

    /// True for errors raised before any remote call was attempted.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SandboxError::Config(_) | SandboxError::ProviderNotFound(_)
        )
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(e: serde_json::Error) -> Self {
        SandboxError::Serde(e.to_string())
    }
}
