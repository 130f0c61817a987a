use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("UPSTREAM_FETCH: {0}")]
    UpstreamFetch(String),
    #[error("INVALID_TRANSITION: cannot {action} alert {alert_id} while {from}")]
    InvalidTransition {
        alert_id: String,
        from: String,
        action: String,
    },
    #[error("NOTIFICATION_DELIVERY: {0}")]
    NotificationDelivery(String),
    #[error("TIMEOUT: {0}")]
    Timeout(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamFetch(_) | Self::Timeout(_))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
