//! Unified error type for the containerv workspace.
//!
//! Every crate returns [`ContainervError`]. The variants follow the failure
//! taxonomy callers act on: a spec problem is the caller's fault, a missing
//! policy backend is a capability signal, and `Internal` means something that
//! should work did not.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum ContainervError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A layer set, spawn request, or policy spec is invalid.
    #[error("invalid spec: {message}")]
    InvalidSpec {
        /// Description of the conflict.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A namespace or mount could not be established for lack of privilege.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// A kernel limit (namespaces, mounts, pids, memory) was reached.
    #[error("resource exhausted: {message}")]
    ResourceExhausted {
        /// Description of the exhausted resource.
        message: String,
    },

    /// The requested capability does not exist on this host.
    #[error("not supported: {message}")]
    NotSupported {
        /// Description of the missing capability.
        message: String,
    },

    /// A resource with the same identifier already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Type of the duplicated resource.
        kind: &'static str,
        /// Identifier of the duplicated resource.
        id: String,
    },

    /// An archive could not be read or is malformed.
    #[error("corrupt archive {path}: {message}")]
    Corrupt {
        /// Archive location.
        path: PathBuf,
        /// Decoder failure.
        message: String,
    },

    /// An OS call or backend failed unexpectedly.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl ContainervError {
    /// Wraps an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Shorthand for [`ContainervError::InvalidSpec`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidSpec {
            message: message.into(),
        }
    }

    /// Shorthand for [`ContainervError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for [`ContainervError::NotSupported`].
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    /// Classifies a failed system call.
    ///
    /// `op` names the operation for the message, e.g. `"overlay mount"`.
    #[cfg(unix)]
    pub fn from_errno(op: &str, errno: nix::errno::Errno) -> Self {
        use nix::errno::Errno;

        let message = format!("{op} failed: {errno}");
        match errno {
            Errno::EPERM | Errno::EACCES => Self::PermissionDenied { message },
            Errno::ENOSPC | Errno::ENOMEM | Errno::EMFILE | Errno::ENFILE | Errno::EUSERS
            | Errno::EAGAIN => Self::ResourceExhausted { message },
            Errno::ENOENT => Self::NotFound {
                kind: "path",
                id: message,
            },
            _ => Self::Internal { message },
        }
    }

    /// Returns `true` for the capability signal raised by absent backends.
    pub const fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ContainervError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn errno_classification_matches_taxonomy() {
        use nix::errno::Errno;

        assert!(matches!(
            ContainervError::from_errno("unshare", Errno::EPERM),
            ContainervError::PermissionDenied { .. }
        ));
        assert!(matches!(
            ContainervError::from_errno("unshare", Errno::EUSERS),
            ContainervError::ResourceExhausted { .. }
        ));
        assert!(matches!(
            ContainervError::from_errno("mount", Errno::ENOENT),
            ContainervError::NotFound { .. }
        ));
        assert!(matches!(
            ContainervError::from_errno("mount", Errno::EINVAL),
            ContainervError::Internal { .. }
        ));
    }

    #[test]
    fn not_supported_is_distinct_from_internal() {
        assert!(ContainervError::not_supported("bpf").is_not_supported());
        assert!(!ContainervError::internal("bpf").is_not_supported());
    }
}
