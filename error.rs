use std::io;
use thiserror::Error;

/// Error conditions raised by vault operations.
///
/// Cryptographic and sequencing failures are distinct variants so callers can
/// match on them; storage failures pass through as [`VaultError::Io`].
#[derive(Debug, Error)]
pub enum VaultError {
    /// Misconfiguration, e.g. integrity requested without a hash key
    #[error("Security error: {0}")]
    Security(String),

    /// Hash mismatch: the content was tampered with or corrupted
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Sequencer invariant violation (missing, duplicate or revoked sequence)
    #[error("Sequence error: {0}")]
    Sequence(String),

    /// The nonce range assigned to this device is exhausted
    #[error("Range exceeded: {0}")]
    RangeExceeded(String),

    /// Wrong password or an authorization artifact for another drive/device
    #[error("Auth error: {0}")]
    Auth(String),

    /// Malformed headers, config files or artifacts
    #[error("Format error: {0}")]
    Format(String),

    /// Invalid runtime settings
    #[error("Config error: {0}")]
    Config(String),

    /// Errors from the storage backend
    #[error(transparent)]
    Io(io::Error),
}

pub type Result<T, E = VaultError> = std::result::Result<T, E>;

impl VaultError {
    pub fn security(msg: impl Into<String>) -> Self {
        Self::Security(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn sequence(msg: impl Into<String>) -> Self {
        Self::Sequence(msg.into())
    }

    pub fn range_exceeded(msg: impl Into<String>) -> Self {
        Self::RangeExceeded(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for errors that indicate tampering or corruption.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }
}

impl From<io::Error> for VaultError {
    fn from(err: io::Error) -> Self {
        // Errors raised inside io::Read/Write impls come back wrapped
        if err.get_ref().is_some_and(|inner| inner.is::<VaultError>()) {
            return match err.into_inner().map(|inner| inner.downcast::<VaultError>()) {
                Some(Ok(inner)) => *inner,
                Some(Err(inner)) => Self::Io(io::Error::other(inner)),
                None => Self::Io(io::Error::other("empty io error")),
            };
        }
        Self::Io(err)
    }
}

impl From<VaultError> for io::Error {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Io(inner) => inner,
            other => io::Error::other(other),
        }
    }
}
