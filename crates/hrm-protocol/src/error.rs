use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Hierarchy level {level} out of range for height {height}")]
    InvalidLevel { level: u8, height: u8 },

    #[error("Invalid hierarchy height: {0}")]
    InvalidHeight(u8),

    #[error("Level mismatch: expected {expected}, got {got}")]
    LevelMismatch { expected: u8, got: u8 },
}
