use thiserror::Error;

/// Image pull pipeline error types
#[derive(Error, Debug)]
pub enum PullError {
    /// Referenced name, digest or snapshot key does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Fetched bytes do not hash to the expected digest
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Fetched byte stream is shorter or longer than its descriptor declares
    #[error("Size mismatch for {digest}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        digest: String,
        expected: u64,
        actual: u64,
    },

    /// Manifest and image config disagree about the number of layers
    #[error("Layer mismatch: manifest has {manifest_layers} layers, config has {diff_ids} diff IDs")]
    LayerMismatch {
        manifest_layers: usize,
        diff_ids: usize,
    },

    /// A remote collaborator or local I/O call failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// Cancellation was observed mid-operation
    #[error("Canceled: {0}")]
    Canceled(String),

    /// Snapshot key is already in use
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Snapshot is not in the state the operation requires
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Malformed digest string
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Malformed image reference
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Applying one layer during unpack failed
    #[error("Layer {index} ({chain_id}) failed: {source}")]
    LayerApply {
        index: usize,
        chain_id: String,
        #[source]
        source: Box<PullError>,
    },
}

impl PullError {
    /// Whether a retry of the same call could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PullError::Io(_) | PullError::Registry { .. } => true,
            PullError::LayerApply { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Whether this error is (or wraps) a cancellation.
    pub fn is_canceled(&self) -> bool {
        match self {
            PullError::Canceled(_) => true,
            PullError::LayerApply { source, .. } => source.is_canceled(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            PullError::NotFound(_) => true,
            PullError::LayerApply { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for PullError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => PullError::NotFound(err.to_string()),
            _ => PullError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for PullError {
    fn from(err: serde_json::Error) -> Self {
        PullError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for PullError {
    fn from(err: serde_yaml::Error) -> Self {
        PullError::Serialization(err.to_string())
    }
}

/// Result type alias for pull pipeline operations
pub type Result<T> = std::result::Result<T, PullError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let error = PullError::NotFound("sha256:abc".to_string());
        assert_eq!(error.to_string(), "Not found: sha256:abc");
    }

    #[test]
    fn test_digest_mismatch_display() {
        let error = PullError::DigestMismatch {
            expected: "sha256:aaa".to_string(),
            actual: "sha256:bbb".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Digest mismatch: expected sha256:aaa, got sha256:bbb"
        );
    }

    #[test]
    fn test_layer_mismatch_display() {
        let error = PullError::LayerMismatch {
            manifest_layers: 3,
            diff_ids: 2,
        };
        assert_eq!(
            error.to_string(),
            "Layer mismatch: manifest has 3 layers, config has 2 diff IDs"
        );
    }

    #[test]
    fn test_registry_error_display() {
        let error = PullError::Registry {
            registry: "ghcr.io".to_string(),
            message: "Authentication failed".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Registry error: ghcr.io - Authentication failed"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(PullError::Io("connection reset".to_string()).is_retryable());
        assert!(PullError::Registry {
            registry: "docker.io".to_string(),
            message: "503".to_string(),
        }
        .is_retryable());
        assert!(!PullError::NotFound("x".to_string()).is_retryable());
        assert!(!PullError::Canceled("x".to_string()).is_retryable());
        assert!(!PullError::DigestMismatch {
            expected: "a".to_string(),
            actual: "b".to_string(),
        }
        .is_retryable());
        assert!(!PullError::LayerMismatch {
            manifest_layers: 1,
            diff_ids: 2,
        }
        .is_retryable());
    }

    #[test]
    fn test_layer_apply_looks_through_source() {
        let error = PullError::LayerApply {
            index: 2,
            chain_id: "sha256:ccc".to_string(),
            source: Box::new(PullError::NotFound("blob".to_string())),
        };
        assert!(error.is_not_found());
        assert!(!error.is_canceled());
        assert!(error.to_string().contains("Layer 2"));
        assert!(error.to_string().contains("sha256:ccc"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: PullError = io_error.into();
        assert!(matches!(err, PullError::Io(_)));

        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: PullError = io_error.into();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope");
        let err: PullError = result.unwrap_err().into();
        assert!(matches!(err, PullError::Serialization(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let err: PullError = result.unwrap_err().into();
        assert!(matches!(err, PullError::Serialization(_)));
    }
}
