//! Error types for keyroot.
//!
//! Every variant carries enough context for a human to act on, but never
//! any key material. Variants group into the coarse [`ErrorKind`] classes
//! that callers use to decide whether an operation may be retried.

use std::fmt;

use thiserror::Error;

/// Status codes returned by an external key store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    /// Invalid parameters (`EINVAL`).
    Einval,
    /// Key already loaded (`EEXIST`).
    Eexist,
    /// Dataset busy (`EBUSY`).
    Ebusy,
    /// Incorrect key or key not loaded (`EACCES`).
    Eacces,
    /// No such key or dataset (`ENOENT`).
    Enoent,
    /// Any other errno value.
    Other(i32),
}

impl StoreStatus {
    /// Map a raw errno value onto a status.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EINVAL => Self::Einval,
            libc::EEXIST => Self::Eexist,
            libc::EBUSY => Self::Ebusy,
            libc::EACCES => Self::Eacces,
            libc::ENOENT => Self::Enoent,
            other => Self::Other(other),
        }
    }

    /// The raw errno value for this status.
    pub fn errno(self) -> i32 {
        match self {
            Self::Einval => libc::EINVAL,
            Self::Eexist => libc::EEXIST,
            Self::Ebusy => libc::EBUSY,
            Self::Eacces => libc::EACCES,
            Self::Enoent => libc::ENOENT,
            Self::Other(errno) => errno,
        }
    }
}

impl fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Einval => write!(f, "EINVAL"),
            Self::Eexist => write!(f, "EEXIST"),
            Self::Ebusy => write!(f, "EBUSY"),
            Self::Eacces => write!(f, "EACCES"),
            Self::Enoent => write!(f, "ENOENT"),
            Self::Other(errno) => write!(f, "errno {errno}"),
        }
    }
}

/// Coarse failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed key material.
    InputValidation,
    /// Illegal property combination for the dataset hierarchy.
    PolicyViolation,
    /// Key material could not be read, or confirmation did not match.
    MaterialAcquisition,
    /// The key store rejected the derived key.
    Authentication,
    /// Key already loaded or unloaded, or dataset busy.
    ResourceConflict,
    /// Feature disabled, dataset missing, required key not loaded.
    Environment,
}

/// The single error type for all keyroot operations.
#[derive(Error, Debug)]
pub enum KeyError {
    /// Key material failed format validation.
    #[error("invalid key material: {0}")]
    InputValidation(String),

    /// Requested properties violate the encryption hierarchy rules.
    #[error("{0}")]
    PolicyViolation(String),

    /// Key material could not be acquired.
    #[error("failed to acquire key material: {0}")]
    MaterialAcquisition(String),

    /// Key entry was interrupted by the user.
    #[error("key entry interrupted")]
    Interrupted,

    /// The key store rejected the key as incorrect.
    #[error("{0}")]
    Authentication(String),

    /// Key state conflicts with the request.
    #[error("{context}")]
    ResourceConflict {
        /// Status reported for the conflict.
        status: StoreStatus,
        /// Human-readable description.
        context: String,
    },

    /// Environmental precondition not met.
    #[error("{0}")]
    Environment(String),

    /// A cryptographic primitive or the system RNG failed.
    #[error("cryptographic operation failed: {0}")]
    Crypto(&'static str),

    /// Configuration could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A batch load finished with failures.
    #[error("{} / {attempted} keys successfully loaded", attempted - failed)]
    PartialLoad {
        /// Encryption roots whose key load was attempted.
        attempted: u64,
        /// Attempts that failed.
        failed: u64,
    },
}

impl KeyError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InputValidation(_) => ErrorKind::InputValidation,
            Self::PolicyViolation(_) => ErrorKind::PolicyViolation,
            Self::MaterialAcquisition(_) | Self::Interrupted => ErrorKind::MaterialAcquisition,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::ResourceConflict { .. } => ErrorKind::ResourceConflict,
            Self::Environment(_) | Self::Crypto(_) | Self::Config(_) | Self::PartialLoad { .. } => {
                ErrorKind::Environment
            }
        }
    }

    /// Returns true if re-entering key material could fix this error.
    ///
    /// Only meaningful when the material source is interactive. An
    /// interrupted entry is never correctable: the user asked to stop.
    pub fn is_correctable(&self) -> bool {
        matches!(
            self,
            Self::InputValidation(_) | Self::MaterialAcquisition(_) | Self::Authentication(_)
        )
    }

    /// The key store status behind this error, if any.
    pub fn status(&self) -> Option<StoreStatus> {
        match self {
            Self::ResourceConflict { status, .. } => Some(*status),
            Self::Authentication(_) => Some(StoreStatus::Eacces),
            _ => None,
        }
    }

    pub(crate) fn conflict(status: StoreStatus, context: impl Into<String>) -> Self {
        Self::ResourceConflict {
            status,
            context: context.into(),
        }
    }
}
