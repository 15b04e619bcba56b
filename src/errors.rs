// Error types for the chat backend

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Failed to reach Ollama: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API call failed with status: {0}")]
    Status(u16),

    #[error("Invalid response from Ollama: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to cancel stream: {0}")]
    CancelFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
