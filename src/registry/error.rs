//! Registry error types

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Shutdown has begun, no new workers are accepted
    Closed,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Closed => write!(f, "Registry is shutting down"),
        }
    }
}

impl std::error::Error for RegistryError {}
