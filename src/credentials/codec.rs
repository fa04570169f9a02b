//! Access/refresh token pair codec.
//!
//! Both tokens of a pair share one stored nonce. The access token is sealed
//! with the stored base nonce, the refresh token with
//! [`derive_secondary_nonce`] of it. This is only safe because a fresh base
//! nonce is drawn on every write; keep the derivation stable, already
//! persisted records depend on it.

use super::encryption::{self, NonceBytes, NONCE_SIZE};
use super::{SealedTokens, TokenPair};
use crate::error::{Result, VaultError};
use crate::keys::KeyProvider;
use std::sync::Arc;
use tracing::debug;

/// Nonce for the second secret of a pair: the base nonce with its last byte
/// incremented modulo 256.
pub fn derive_secondary_nonce(base: &NonceBytes) -> NonceBytes {
    let mut derived = *base;
    derived[NONCE_SIZE - 1] = derived[NONCE_SIZE - 1].wrapping_add(1);
    derived
}

/// Seals and opens token pairs with versioned keys.
#[derive(Debug, Clone)]
pub struct TokenCodec {
    keys: Arc<KeyProvider>,
}

impl TokenCodec {
    pub fn new(keys: Arc<KeyProvider>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &KeyProvider {
        &self.keys
    }

    /// Seals a token pair under the active key with a fresh base nonce.
    ///
    /// Fails with `Configuration` when no usable active key is configured.
    pub fn encrypt_pair(&self, access: &str, refresh: Option<&str>) -> Result<SealedTokens> {
        let key = self.keys.active()?;
        let nonce = encryption::generate_nonce();

        let access_ciphertext = encryption::seal(key.bytes(), &nonce, access.as_bytes())?;
        let refresh_ciphertext = refresh
            .map(|token| {
                let derived = derive_secondary_nonce(&nonce);
                encryption::seal(key.bytes(), &derived, token.as_bytes())
            })
            .transpose()?;

        debug!(key_version = key.version, "Sealed token pair");

        Ok(SealedTokens {
            access_ciphertext,
            refresh_ciphertext,
            nonce,
            key_version: key.version,
        })
    }

    /// Opens a token pair with the key recorded for it.
    ///
    /// # Errors
    /// - `Configuration` if `key_version` does not resolve or `nonce` is not 12 bytes
    /// - `AuthenticationFailure` if either ciphertext fails to verify
    pub fn decrypt_pair(
        &self,
        access_ciphertext: &[u8],
        refresh_ciphertext: Option<&[u8]>,
        nonce: &[u8],
        key_version: u32,
    ) -> Result<TokenPair> {
        let nonce: NonceBytes = nonce.try_into().map_err(|_| {
            VaultError::config(format!(
                "stored nonce must be {} bytes, got {}",
                NONCE_SIZE,
                nonce.len()
            ))
        })?;
        let key = self.keys.resolve(key_version)?;

        let access = encryption::open_string(key.bytes(), &nonce, access_ciphertext)?;
        let refresh = refresh_ciphertext
            .map(|ciphertext| {
                let derived = derive_secondary_nonce(&nonce);
                encryption::open_string(key.bytes(), &derived, ciphertext)
            })
            .transpose()?;

        Ok(TokenPair { access, refresh })
    }

    /// [`decrypt_pair`](Self::decrypt_pair) over a [`SealedTokens`] value.
    pub fn decrypt_sealed(&self, sealed: &SealedTokens) -> Result<TokenPair> {
        self.decrypt_pair(
            &sealed.access_ciphertext,
            sealed.refresh_ciphertext.as_deref(),
            &sealed.nonce,
            sealed.key_version,
        )
    }
}
