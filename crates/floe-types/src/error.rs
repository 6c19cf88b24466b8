use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FloeError>;

#[derive(Debug, Error)]
pub enum FloeError {
    #[error("scan failed at '{}': {reason}", path.display())]
    Scan { path: PathBuf, reason: String },

    #[error("{op}: {message}")]
    Transport {
        op: String,
        message: String,
        transient: bool,
    },

    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("inventory is locked by another process (lock: {0})")]
    Locked(String),

    #[error("decryption failed: wrong passphrase or corrupted data")]
    DecryptionFailed,

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("operation interrupted")]
    Interrupted,

    #[error("{0}")]
    Other(String),
}

impl FloeError {
    /// Build a transport error for a remote operation.
    pub fn transport(op: impl Into<String>, message: impl ToString, transient: bool) -> Self {
        FloeError::Transport {
            op: op.into(),
            message: message.to_string(),
            transient,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FloeError::Transport { transient, .. } => *transient,
            FloeError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(FloeError::transport("PUT a", "503", true).is_transient());
        assert!(!FloeError::transport("PUT a", "403", false).is_transient());
        assert!(FloeError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "t")).is_transient());
        assert!(!FloeError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "t")).is_transient());
        assert!(!FloeError::PolicyViolation("young".into()).is_transient());
    }

    #[test]
    fn scan_error_names_path() {
        let err = FloeError::Scan {
            path: PathBuf::from("/data/a"),
            reason: "permission denied".into(),
        };
        assert_eq!(
            err.to_string(),
            "scan failed at '/data/a': permission denied"
        );
    }
}
