use thiserror::Error;

/// Engine error types.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Build file could not be parsed
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// A layer, image, or tag was not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage-level failure (checksum, disk, permission)
    #[error("storage error: {0}")]
    Storage(String),

    /// Overlay mount failure
    #[error("mount error: {0}")]
    Mount(String),

    /// A RUN step exited non-zero
    #[error("command failed (exit {exit_code}): {command}: {stderr}")]
    Exec {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Registry transport failure
    #[error("registry error: {registry}: {message}")]
    Registry { registry: String, message: String },

    /// The cache index references state that no longer holds
    #[error("cache inconsistency: {0}")]
    CacheInconsistency(String),

    /// The operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Multiple failures from concurrent workers
    #[error("{} error(s): {}", .0.len(), format_aggregate(.0))]
    Aggregate(Vec<EngineError>),
}

impl EngineError {
    /// Process exit code for this error.
    ///
    /// 0 success, 2 build/parse, 3 storage, 4 registry, 5 cache
    /// inconsistency, 1 unclassified.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Parse { .. } | EngineError::Exec { .. } => 2,
            EngineError::NotFound(_) | EngineError::Storage(_) | EngineError::Mount(_) => 3,
            EngineError::Registry { .. } => 4,
            EngineError::CacheInconsistency(_) => 5,
            EngineError::Aggregate(errs) => {
                errs.first().map(EngineError::exit_code).unwrap_or(1)
            }
            _ => 1,
        }
    }

    /// Collapse a list of worker errors into a single error.
    ///
    /// One error passes through unchanged; several wrap in `Aggregate`.
    pub fn aggregate(mut errors: Vec<EngineError>) -> EngineError {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            EngineError::Aggregate(errors)
        }
    }
}

fn format_aggregate(errors: &[EngineError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let parse = EngineError::Parse {
            line: 3,
            message: "bad".to_string(),
        };
        assert_eq!(parse.exit_code(), 2);
        assert_eq!(EngineError::NotFound("x".to_string()).exit_code(), 3);
        assert_eq!(EngineError::Storage("disk".to_string()).exit_code(), 3);
        assert_eq!(
            EngineError::Registry {
                registry: "r".to_string(),
                message: "m".to_string()
            }
            .exit_code(),
            4
        );
        assert_eq!(
            EngineError::CacheInconsistency("c".to_string()).exit_code(),
            5
        );
        assert_eq!(EngineError::Cancelled.exit_code(), 1);
    }

    #[test]
    fn test_aggregate_single_passes_through() {
        let err = EngineError::aggregate(vec![EngineError::NotFound("a".to_string())]);
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_aggregate_many_wraps() {
        let err = EngineError::aggregate(vec![
            EngineError::NotFound("a".to_string()),
            EngineError::Storage("b".to_string()),
        ]);
        match &err {
            EngineError::Aggregate(inner) => assert_eq!(inner.len(), 2),
            other => panic!("expected Aggregate, got {other:?}"),
        }
        // exit code follows the first inner error
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_aggregate_display_lists_all() {
        let err = EngineError::Aggregate(vec![
            EngineError::NotFound("layer x".to_string()),
            EngineError::Cancelled,
        ]);
        let msg = err.to_string();
        assert!(msg.contains("2 error(s)"));
        assert!(msg.contains("layer x"));
        assert!(msg.contains("cancelled"));
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: EngineError = io.into();
        assert!(matches!(err, EngineError::Storage(_)));
        assert_eq!(err.exit_code(), 3);
    }
}
