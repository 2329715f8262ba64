//! Error taxonomy shared by every workflow.

use crate::extractor::ExtractError;
use crate::registry::RegistryError;
use crate::source::CaptureError;
use serde::Serialize;
use thiserror::Error;

/// Coarse failure class reported to callers alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Storage,
    Device,
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Storage => "storage",
            ErrorKind::Device => "device",
            ErrorKind::Config => "config",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Bad caller input: empty id, undecodable image, no face, wrong dimension.
    #[error("{0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(#[from] RegistryError),
    #[error("device error: {0}")]
    Device(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Device(_) => ErrorKind::Device,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    pub fn no_face() -> Self {
        Error::Validation("no face detected".into())
    }
}

impl From<ExtractError> for Error {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Dimension { .. } | ExtractError::Encode(_) => {
                Error::Validation(err.to_string())
            }
            // Helper spawn, exit and output failures.
            other => Error::Device(other.to_string()),
        }
    }
}

impl From<CaptureError> for Error {
    fn from(err: CaptureError) -> Self {
        Error::Device(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::no_face().kind(), ErrorKind::Validation);
        assert_eq!(Error::Config("x".into()).kind(), ErrorKind::Config);
        let storage: Error = RegistryError::Corrupt("bad".into()).into();
        assert_eq!(storage.kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_extract_dimension_is_validation() {
        let err: Error = ExtractError::Dimension { expected: 128, actual: 3 }.into();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err: Error = ExtractError::Helper("exit status 2".into()).into();
        assert_eq!(err.kind(), ErrorKind::Device);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::NotFound).unwrap();
        assert_eq!(json, "\"not_found\"");
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
    }
}
