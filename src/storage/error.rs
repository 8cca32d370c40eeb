/// Storage error with not-found classification.
///
/// `NotFound` is a sentinel, never fatal at the storage layer: several
/// scheduler call sites (resource ready flips, mitigation deletes) document
/// it as an acceptable outcome and swallow it. Everything else is surfaced
/// to the caller together with the entity that was being touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The requested entity does not exist.
    NotFound,
    /// A create collided with an existing entity.
    Conflict { message: String },
    /// Any other backend failure.
    Internal { message: String },
}

impl StorageError {
    pub fn conflict(message: impl Into<String>) -> Self {
        StorageError::Conflict {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        StorageError::Internal {
            message: message.into(),
        }
    }

    /// Check for the not-found sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound)
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::NotFound => write!(f, "not found in storage"),
            StorageError::Conflict { message } => write!(f, "{message}"),
            StorageError::Internal { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StorageError {}
