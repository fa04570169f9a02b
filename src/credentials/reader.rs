//! Backward-compatible token reads.
//!
//! Prefers the encrypted representation and falls back to the deprecated
//! plaintext fields while records are still being migrated, or while the
//! key a record needs is unavailable.

use super::codec::TokenCodec;
use super::record::{EncryptionState, TokenRecord};
use crate::error::{Result, VaultError};
use std::fmt;
use tracing::warn;

/// When a failing encrypted read may fall back to legacy plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Any decryption or key-resolution failure falls back.
    #[default]
    AnyFailure,
    /// Only records without ciphertext use legacy fields; a stored but
    /// failing ciphertext is a hard error.
    MissingCiphertextOnly,
}

/// Usable plaintext tokens plus where they came from.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedTokens {
    pub access: String,
    pub refresh: Option<String>,
    /// False when the tokens came from legacy plaintext fields.
    pub was_encrypted: bool,
}

impl fmt::Debug for ResolvedTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedTokens")
            .field("access", &"<redacted>")
            .field("refresh", &self.refresh.as_ref().map(|_| "<redacted>"))
            .field("was_encrypted", &self.was_encrypted)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CompatibilityReader {
    codec: TokenCodec,
    policy: FallbackPolicy,
}

impl CompatibilityReader {
    pub fn new(codec: TokenCodec, policy: FallbackPolicy) -> Self {
        Self { codec, policy }
    }

    pub fn policy(&self) -> FallbackPolicy {
        self.policy
    }

    /// Returns usable tokens for `record`.
    ///
    /// `Ok(None)` means the record holds no credentials in either
    /// representation and the account must re-authorize. When decryption
    /// fails and no legacy plaintext exists, the decryption error is
    /// returned unchanged.
    pub fn read(&self, record: &TokenRecord) -> Result<Option<ResolvedTokens>> {
        let state = record.encryption_state();

        if state != EncryptionState::Absent {
            match self.decrypt(record, state) {
                Ok(tokens) => return Ok(Some(tokens)),
                Err(e) if self.policy == FallbackPolicy::MissingCiphertextOnly => {
                    warn!(
                        account_id = %record.account_id,
                        key_version = ?record.key_version,
                        error = %e,
                        "Encrypted token read failed"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        account_id = %record.account_id,
                        key_version = ?record.key_version,
                        error = %e,
                        legacy_available = record.has_legacy_plaintext(),
                        "Encrypted token read failed, trying legacy plaintext"
                    );
                    return match Self::legacy(record) {
                        Some(tokens) => Ok(Some(tokens)),
                        None => Err(e),
                    };
                }
            }
        }

        Ok(Self::legacy(record))
    }

    fn decrypt(&self, record: &TokenRecord, state: EncryptionState) -> Result<ResolvedTokens> {
        let (Some(access), Some(nonce), Some(version), EncryptionState::Complete) = (
            record.access_ciphertext.as_deref(),
            record.nonce.as_deref(),
            record.key_version,
            state,
        ) else {
            return Err(VaultError::config(
                "stored record has incomplete encrypted fields",
            ));
        };

        let pair = self
            .codec
            .decrypt_pair(access, record.refresh_ciphertext.as_deref(), nonce, version)?;

        Ok(ResolvedTokens {
            access: pair.access,
            refresh: pair.refresh,
            was_encrypted: true,
        })
    }

    fn legacy(record: &TokenRecord) -> Option<ResolvedTokens> {
        record
            .legacy_access_plaintext
            .as_ref()
            .map(|access| ResolvedTokens {
                access: access.clone(),
                refresh: record.legacy_refresh_plaintext.clone(),
                was_encrypted: false,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyringConfig;
    use crate::keys::KeyProvider;
    use chrono::Utc;
    use std::sync::Arc;

    fn codec(versions: &[u32]) -> TokenCodec {
        let mut config = KeyringConfig::default();
        for version in versions {
            config.set_material(*version, hex::encode([*version as u8; 32]));
        }
        TokenCodec::new(Arc::new(KeyProvider::new(&config)))
    }

    fn reader(versions: &[u32], policy: FallbackPolicy) -> CompatibilityReader {
        CompatibilityReader::new(codec(versions), policy)
    }

    fn encrypted_record(versions: &[u32]) -> TokenRecord {
        let sealed = codec(versions)
            .encrypt_pair("enc-access", Some("enc-refresh"))
            .unwrap();
        TokenRecord::sealed("acct-1", sealed, Utc::now())
    }

    #[test]
    fn test_encrypted_record() {
        let reader = reader(&[1], FallbackPolicy::AnyFailure);
        let record = encrypted_record(&[1]);

        let tokens = reader.read(&record).unwrap().expect("tokens");
        assert!(tokens.was_encrypted);
        assert_eq!(tokens.access, "enc-access");
        assert_eq!(tokens.refresh.as_deref(), Some("enc-refresh"));
    }

    #[test]
    fn test_legacy_only_record() {
        let reader = reader(&[1], FallbackPolicy::AnyFailure);
        let record = TokenRecord::legacy(
            "acct-1",
            "plain-access",
            Some("plain-refresh".to_string()),
            Utc::now(),
        );

        let tokens = reader.read(&record).unwrap().expect("tokens");
        assert!(!tokens.was_encrypted);
        assert_eq!(tokens.access, "plain-access");
        assert_eq!(tokens.refresh.as_deref(), Some("plain-refresh"));
    }

    #[test]
    fn test_encrypted_preferred_over_legacy() {
        let reader = reader(&[1], FallbackPolicy::AnyFailure);
        let mut record = encrypted_record(&[1]);
        record.legacy_access_plaintext = Some("stale-access".to_string());

        let tokens = reader.read(&record).unwrap().unwrap();
        assert!(tokens.was_encrypted);
        assert_eq!(tokens.access, "enc-access");
    }

    #[test]
    fn test_missing_key_falls_back_to_legacy() {
        // Record sealed under v2, reader only knows v1
        let reader = reader(&[1], FallbackPolicy::AnyFailure);
        let mut record = encrypted_record(&[2]);
        record.legacy_access_plaintext = Some("plain-access".to_string());

        let tokens = reader.read(&record).unwrap().unwrap();
        assert!(!tokens.was_encrypted);
        assert_eq!(tokens.access, "plain-access");
    }

    #[test]
    fn test_tampered_ciphertext_falls_back_to_legacy() {
        let reader = reader(&[1], FallbackPolicy::AnyFailure);
        let mut record = encrypted_record(&[1]);
        if let Some(ct) = record.access_ciphertext.as_mut() {
            ct[0] ^= 0x80;
        }
        record.legacy_access_plaintext = Some("plain-access".to_string());

        let tokens = reader.read(&record).unwrap().unwrap();
        assert!(!tokens.was_encrypted);
    }

    #[test]
    fn test_failure_without_legacy_surfaces_error() {
        let reader = reader(&[1], FallbackPolicy::AnyFailure);

        let mut tampered = encrypted_record(&[1]);
        if let Some(ct) = tampered.access_ciphertext.as_mut() {
            ct[0] ^= 0x80;
        }
        assert!(matches!(
            reader.read(&tampered),
            Err(VaultError::AuthenticationFailure)
        ));

        let unknown_key = encrypted_record(&[3]);
        assert!(matches!(
            reader.read(&unknown_key),
            Err(VaultError::Configuration(_))
        ));
    }

    #[test]
    fn test_partial_encryption_falls_back() {
        let reader = reader(&[1], FallbackPolicy::AnyFailure);
        let mut record = encrypted_record(&[1]);
        record.nonce = None;
        record.legacy_access_plaintext = Some("plain-access".to_string());

        let tokens = reader.read(&record).unwrap().unwrap();
        assert!(!tokens.was_encrypted);
    }

    #[test]
    fn test_empty_record() {
        let reader = reader(&[1], FallbackPolicy::AnyFailure);
        let mut record = TokenRecord::legacy("acct-1", "x", None, Utc::now());
        record.legacy_access_plaintext = None;

        assert!(reader.read(&record).unwrap().is_none());
    }

    #[test]
    fn test_strict_policy_does_not_mask_failures() {
        let reader = reader(&[1], FallbackPolicy::MissingCiphertextOnly);
        let mut record = encrypted_record(&[1]);
        if let Some(ct) = record.access_ciphertext.as_mut() {
            ct[0] ^= 0x80;
        }
        record.legacy_access_plaintext = Some("plain-access".to_string());

        assert!(matches!(
            reader.read(&record),
            Err(VaultError::AuthenticationFailure)
        ));

        // Legacy-only records still read under the strict policy
        let legacy = TokenRecord::legacy("acct-2", "plain", None, Utc::now());
        assert!(!reader.read(&legacy).unwrap().unwrap().was_encrypted);
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let reader = reader(&[1], FallbackPolicy::AnyFailure);
        let tokens = reader.read(&encrypted_record(&[1])).unwrap().unwrap();
        let rendered = format!("{:?}", tokens);
        assert!(!rendered.contains("enc-access"));
        assert!(!rendered.contains("enc-refresh"));
    }
}
