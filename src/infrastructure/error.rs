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
    #[error("Provider error: {0}")]
    Provider(String),
    #[error("sync cursor expired")]
    CursorExpired,
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Malformed input: {0}")]
    MalformedInput(String),
    #[error("Persistence failure: {0}")]
    Persistence(String),
    #[error("Unknown notification channel: {0}")]
    UnknownChannel(String),
}

impl InfraError {
    pub(crate) fn lock_poisoned(name: &str, error: impl std::fmt::Display) -> Self {
        Self::Persistence(format!("{name} lock poisoned: {error}"))
    }
}
