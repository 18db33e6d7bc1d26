use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Credential error: {0}")]
    Credential(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Remote error: http {status}: {message}")]
    Remote { status: u16, message: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Logging error: {0}")]
    Logging(String),
}

impl InfraError {
    /// Failures that leave the mutation unconfirmed and eligible for queuing.
    /// A response the remote sent with a 2xx status never qualifies.
    pub fn is_remote_failure(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Remote { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_and_status_failures_are_queueable() {
        assert!(InfraError::Transport("offline".to_string()).is_remote_failure());
        assert!(InfraError::Remote {
            status: 503,
            message: "maintenance".to_string(),
        }
        .is_remote_failure());
        assert!(!InfraError::InvalidResponse("no entry".to_string()).is_remote_failure());
        assert!(!InfraError::Validation("empty id".to_string()).is_remote_failure());
    }
}
