//! Error types for the watcher.

use thiserror::Error;

/// Registry client errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The request never produced a response.
    #[error("registry unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    /// The registry answered with a non-success status.
    #[error("registry returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The requested model, version, alias or run does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The response body did not match the expected shape.
    #[error("unexpected registry response: {0}")]
    Decode(String),

    /// Failure injected or reported by a non-HTTP registry.
    #[error("{0}")]
    Other(String),
}

impl RegistryError {
    /// Returns true if the error means the resource is absent.
    pub fn is_not_found(&self) -> bool {
        match self {
            RegistryError::NotFound(_) => true,
            RegistryError::Status { status, .. } => *status == 404,
            _ => false,
        }
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(RegistryError::NotFound("version 3".to_string()).is_not_found());
        assert!(RegistryError::Status {
            status: 404,
            body: String::new()
        }
        .is_not_found());
        assert!(!RegistryError::Status {
            status: 500,
            body: "boom".to_string()
        }
        .is_not_found());
        assert!(!RegistryError::Other("x".to_string()).is_not_found());
    }
}
