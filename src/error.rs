// error.rs

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Message(String),
    #[error("Settings encoding error: {0}")]
    Encode(#[from] postcard::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Peripheral error: {0}")]
    Peripheral(String),
}

pub type AppResult<T> = Result<T, AppError>;

// EOF
