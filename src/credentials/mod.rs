//! Encrypted storage for Gmail OAuth tokens.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenVault                         │
//! │  - store / renew / load per account      │
//! └─────────────────────────────────────────┘
//!    (TokenCodec)          (CompatibilityReader)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Encryption Module                  │
//! │  - AES-256-GCM, versioned keys           │
//! │  - One fresh base nonce per write        │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       TokenStore                         │
//! │  - SQLite or in-memory                   │
//! │  - Optimistic compare-and-write          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use chrono::{Duration, Utc};
//! use token_vault::config::VaultConfig;
//! use token_vault::credentials::{SqliteTokenStore, TokenVault};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = VaultConfig::from_env();
//! let store = Arc::new(SqliteTokenStore::new("tokens.db")?);
//! let vault = TokenVault::from_config(store, &config);
//!
//! // OAuth callback
//! vault
//!     .store_tokens("acct-1", "ya29.access", Some("1//refresh"), Utc::now() + Duration::hours(1))
//!     .await?;
//!
//! // Any read path
//! if let Some(tokens) = vault.load_tokens("acct-1").await? {
//!     println!("encrypted at rest: {}", tokens.was_encrypted);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Tokens are sealed at rest with AES-256-GCM; tampering fails closed
//! - A fresh random base nonce is drawn on every write, never reused
//! - Key material comes from injected configuration and is zeroized on drop
//! - Plaintext tokens never appear in logs or `Debug` output

use crate::config::VaultConfig;
use crate::error::{Result, VaultError};
use crate::keys::KeyProvider;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

pub mod codec;
pub mod encryption;
mod memory;
pub mod reader;
pub mod record;
mod storage;
pub mod store;

pub use codec::{derive_secondary_nonce, TokenCodec};
pub use encryption::{NonceBytes, NONCE_SIZE};
pub use memory::MemoryTokenStore;
pub use reader::{CompatibilityReader, FallbackPolicy, ResolvedTokens};
pub use record::{EncryptionState, TokenRecord, VersionStamp};
pub use storage::SqliteTokenStore;
pub use store::{TokenStore, WriteOutcome};

/// Output of [`TokenCodec::encrypt_pair`]: what gets persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedTokens {
    pub access_ciphertext: Vec<u8>,
    pub refresh_ciphertext: Option<Vec<u8>>,
    /// Base nonce; the refresh token uses its derived successor.
    pub nonce: NonceBytes,
    pub key_version: u32,
}

/// A decrypted access/refresh token pair.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access: String,
    pub refresh: Option<String>,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access", &"<redacted>")
            .field("refresh", &self.refresh.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Entry point for the OAuth callback and the token-refresh routine.
///
/// Every token write goes through [`TokenCodec::encrypt_pair`], every read
/// through [`CompatibilityReader::read`]. Plaintext is never persisted.
#[derive(Clone)]
pub struct TokenVault {
    store: Arc<dyn TokenStore>,
    codec: TokenCodec,
    reader: CompatibilityReader,
}

impl TokenVault {
    pub fn new(store: Arc<dyn TokenStore>, codec: TokenCodec, policy: FallbackPolicy) -> Self {
        let reader = CompatibilityReader::new(codec.clone(), policy);
        Self {
            store,
            codec,
            reader,
        }
    }

    /// Builds the key provider and reader policy from configuration.
    pub fn from_config(store: Arc<dyn TokenStore>, config: &VaultConfig) -> Self {
        let keys = Arc::new(KeyProvider::new(&config.keys));
        let policy = if config.reader.strict_decrypt {
            FallbackPolicy::MissingCiphertextOnly
        } else {
            FallbackPolicy::AnyFailure
        };
        Self::new(store, TokenCodec::new(keys), policy)
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn reader(&self) -> &CompatibilityReader {
        &self.reader
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Seals and stores a freshly issued token pair.
    ///
    /// Fails with `Configuration` (before touching the store) when no active
    /// key is configured.
    pub async fn store_tokens(
        &self,
        account_id: &str,
        access: &str,
        refresh: Option<&str>,
        expiry: DateTime<Utc>,
    ) -> Result<()> {
        let sealed = self.codec.encrypt_pair(access, refresh)?;
        self.store
            .upsert_sealed(account_id, &sealed, expiry)
            .await
            .map_err(VaultError::Store)?;

        info!(
            account_id = %account_id,
            key_version = sealed.key_version,
            has_refresh = refresh.is_some(),
            "Stored encrypted tokens"
        );
        Ok(())
    }

    /// Stores a renewed access token, keeping the current refresh token.
    ///
    /// The whole pair is re-sealed under a fresh nonce at the active version.
    pub async fn renew_access_token(
        &self,
        account_id: &str,
        access: &str,
        expiry: DateTime<Utc>,
    ) -> Result<()> {
        let current = self
            .load_tokens(account_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(account_id.to_string()))?;

        debug!(
            account_id = %account_id,
            was_encrypted = current.was_encrypted,
            "Renewing access token"
        );
        self.store_tokens(account_id, access, current.refresh.as_deref(), expiry)
            .await
    }

    /// Loads usable tokens for an account.
    ///
    /// # Returns
    /// * `Ok(Some(tokens))` - decrypted, or read from legacy plaintext
    /// * `Ok(None)` - the record holds no tokens; re-authorization required
    /// * `Err(NotFound)` - no record for the account
    pub async fn load_tokens(&self, account_id: &str) -> Result<Option<ResolvedTokens>> {
        let record = self
            .store
            .get(account_id)
            .await
            .map_err(VaultError::Store)?
            .ok_or_else(|| VaultError::NotFound(account_id.to_string()))?;

        self.reader.read(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyringConfig;
    use chrono::Duration;

    fn vault_with(versions: &[u32], store: Arc<MemoryTokenStore>) -> TokenVault {
        let mut config = VaultConfig::default();
        for version in versions {
            config.keys.set_material(*version, hex::encode([*version as u8; 32]));
        }
        TokenVault::from_config(store, &config)
    }

    fn expiry() -> DateTime<Utc> {
        Utc::now() + Duration::hours(1)
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let store = Arc::new(MemoryTokenStore::new());
        let vault = vault_with(&[1], store.clone());

        vault
            .store_tokens("acct-1", "access-1", Some("refresh-1"), expiry())
            .await
            .unwrap();

        let record = store.get("acct-1").await.unwrap().unwrap();
        assert!(record.is_encrypted());
        assert!(!record.has_legacy_plaintext());

        let tokens = vault.load_tokens("acct-1").await.unwrap().unwrap();
        assert!(tokens.was_encrypted);
        assert_eq!(tokens.access, "access-1");
        assert_eq!(tokens.refresh.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_load_missing_account() {
        let vault = vault_with(&[1], Arc::new(MemoryTokenStore::new()));
        let result = vault.load_tokens("nobody").await;
        assert!(matches!(result, Err(VaultError::NotFound(id)) if id == "nobody"));
    }

    #[tokio::test]
    async fn test_store_without_key_writes_nothing() {
        let store = Arc::new(MemoryTokenStore::new());
        let vault = vault_with(&[], store.clone());

        let result = vault
            .store_tokens("acct-1", "access", None, expiry())
            .await;
        assert!(matches!(result, Err(VaultError::Configuration(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_renew_keeps_refresh_and_changes_nonce() {
        let store = Arc::new(MemoryTokenStore::new());
        let vault = vault_with(&[1], store.clone());

        vault
            .store_tokens("acct-1", "access-1", Some("refresh-1"), expiry())
            .await
            .unwrap();
        let before = store.get("acct-1").await.unwrap().unwrap();

        vault
            .renew_access_token("acct-1", "access-2", expiry())
            .await
            .unwrap();
        let after = store.get("acct-1").await.unwrap().unwrap();

        assert_ne!(before.nonce, after.nonce);
        assert_eq!(after.key_version, Some(1));

        let tokens = vault.load_tokens("acct-1").await.unwrap().unwrap();
        assert_eq!(tokens.access, "access-2");
        assert_eq!(tokens.refresh.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_renew_from_legacy_encrypts() {
        let store = Arc::new(MemoryTokenStore::new());
        store
            .put(&TokenRecord::legacy(
                "acct-1",
                "plain-access",
                Some("plain-refresh".to_string()),
                expiry(),
            ))
            .await
            .unwrap();
        let vault = vault_with(&[1], store.clone());

        vault
            .renew_access_token("acct-1", "access-2", expiry())
            .await
            .unwrap();

        let record = store.get("acct-1").await.unwrap().unwrap();
        assert!(record.is_encrypted());
        assert!(!record.has_legacy_plaintext());
        let tokens = vault.load_tokens("acct-1").await.unwrap().unwrap();
        assert!(tokens.was_encrypted);
        assert_eq!(tokens.refresh.as_deref(), Some("plain-refresh"));
    }

    #[tokio::test]
    async fn test_renew_missing_account() {
        let vault = vault_with(&[1], Arc::new(MemoryTokenStore::new()));
        let result = vault.renew_access_token("nobody", "access", expiry()).await;
        assert!(matches!(result, Err(VaultError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_strict_policy_from_config() {
        let mut config = VaultConfig::default();
        config.keys = KeyringConfig::default();
        config.reader.strict_decrypt = true;
        let vault = TokenVault::from_config(Arc::new(MemoryTokenStore::new()), &config);
        assert_eq!(
            vault.reader().policy(),
            FallbackPolicy::MissingCiphertextOnly
        );
    }

    #[test]
    fn test_token_pair_debug_redacts() {
        let pair = TokenPair {
            access: "ya29.secret".to_string(),
            refresh: Some("1//secret".to_string()),
        };
        assert!(!format!("{:?}", pair).contains("secret"));
    }
}
