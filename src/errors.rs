use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Docker error: {0}")]
    DockerError(String),

    #[error("RCON error: {0}")]
    RconError(String),

    #[error("Backup error: {0}")]
    BackupError(String),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Update error: {0}")]
    UpdateError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::IoError(err.to_string())
    }
}

impl From<bollard::errors::Error> for AgentError {
    fn from(err: bollard::errors::Error) -> Self {
        AgentError::DockerError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AgentError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AgentError::NetworkError(err.to_string())
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::NetworkError(err.to_string())
    }
}
