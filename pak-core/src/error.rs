use thiserror::Error;

#[derive(Error, Debug)]
pub enum PakError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capacity error: patch size {size} exceeds budget {budget}")]
    Capacity { size: u64, budget: u64 },
}

impl PakError {
    pub fn format(msg: impl Into<String>) -> Self {
        PakError::Format(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        PakError::Crypto(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        PakError::Config(msg.into())
    }
}

impl From<walkdir::Error> for PakError {
    fn from(e: walkdir::Error) -> Self {
        PakError::Io(std::io::Error::other(e))
    }
}

// Convenient crate-wide result type
pub type Result<T> = std::result::Result<T, PakError>;
