use crate::utils::latch::LatchError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Staging failed: {0}")]
    Staging(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Latch(#[from] LatchError),
}
