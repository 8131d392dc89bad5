use thiserror::Error;

#[derive(Debug, Error)]
pub enum TurnstileError {
    #[error("not a git repository: {0}")]
    NotARepository(String),

    #[error("git executable not found on PATH")]
    GitNotFound,

    #[error("git {args} failed: {stderr}")]
    GitFailed { args: String, stderr: String },

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("checkpoint already exists: {0}")]
    CheckpointExists(String),

    #[error("checkpoint '{id}' references missing object {sha}")]
    CheckpointObjectMissing { id: String, sha: String },

    #[error("invalid checkpoint id '{0}': must be a single ref component of [A-Za-z0-9._-]")]
    InvalidCheckpointId(String),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("invalid checkpoint namespace '{0}'")]
    InvalidNamespace(String),

    #[error("malformed checkpoint message: {0}")]
    MessageParse(String),

    #[error("invalid permission tier '{0}': expected off, low, medium, or high")]
    InvalidTier(String),

    #[error("invalid permission mode '{0}': expected ask or block")]
    InvalidMode(String),

    #[error("home directory not found: set HOME or TURNSTILE_HOME")]
    HomeNotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TurnstileError>;
