use crate::config::UploadConfig;
use crate::models::FileRecord;
use thiserror::Error;

/// Reasons a received file is refused before processing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("File is too small")]
    TooSmall,

    #[error("File is too big")]
    TooBig,

    #[error("Filetype not allowed")]
    TypeNotAllowed,
}

/// Checks the confirmed size against the limits, then the name against the
/// accept pattern.
pub fn validate_file(record: &FileRecord, config: &UploadConfig) -> Result<(), ValidationError> {
    let size = record.size();
    if config.min_file_size.is_some_and(|min| min > size) {
        return Err(ValidationError::TooSmall);
    }
    if config.max_file_size.is_some_and(|max| max < size) {
        return Err(ValidationError::TooBig);
    }
    if !config.accept_file_types.is_match(&record.name) {
        return Err(ValidationError::TypeNotAllowed);
    }
    Ok(())
}
