//! Error taxonomy for the credential vault.
//!
//! Operators see the distinctions below; end users only ever see
//! "please reconnect your account".

use thiserror::Error;

/// Errors raised by the vault.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Key material missing, malformed, or of the wrong length (also covers
    /// nonce length violations). Fatal for encrypt paths.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// AEAD tag verification failed: tampered ciphertext, wrong key or wrong nonce.
    #[error("authentication failure: ciphertext could not be verified")]
    AuthenticationFailure,

    /// No stored credentials for the requested account.
    #[error("no credentials stored for account '{0}'")]
    NotFound(String),

    /// One or more records failed during a batch job.
    #[error("{failed} record(s) failed during batch")]
    PartialBatchFailure { failed: usize },

    /// The record store failed (I/O, constraint violation, poisoned lock).
    #[error("record store error: {0:#}")]
    Store(anyhow::Error),
}

impl VaultError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        VaultError::Configuration(msg.into())
    }

    /// True for errors that are deterministic given the same inputs and
    /// must not be retried.
    pub fn is_deterministic(&self) -> bool {
        matches!(
            self,
            VaultError::Configuration(_) | VaultError::AuthenticationFailure
        )
    }
}

pub type Result<T, E = VaultError> = std::result::Result<T, E>;
