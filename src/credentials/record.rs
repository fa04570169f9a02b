//! Persisted shape of one account's Gmail credentials.

use super::encryption::NONCE_SIZE;
use super::SealedTokens;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One account's stored credentials.
///
/// Byte fields are base64 on the wire. The two `legacy_*` fields are the
/// deprecated plaintext representation, cleared by the same write that
/// stores the encrypted one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub account_id: String,

    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub access_ciphertext: Option<Vec<u8>>,

    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub refresh_ciphertext: Option<Vec<u8>>,

    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub nonce: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_version: Option<u32>,

    #[serde(default, skip_serializing)]
    pub legacy_access_plaintext: Option<String>,

    #[serde(default, skip_serializing)]
    pub legacy_refresh_plaintext: Option<String>,

    pub expiry: DateTime<Utc>,
}

/// How much of the encrypted representation a record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionState {
    /// No ciphertext at all.
    Absent,
    /// Some encrypted fields present, others missing or malformed.
    Partial,
    /// Ciphertext, a 12-byte nonce and a key version are all present.
    Complete,
}

/// Identifies one specific write of a record.
///
/// Every encrypted write draws a fresh nonce, so `(key_version, nonce)`
/// changes on every write and works as an optimistic concurrency stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionStamp {
    pub key_version: Option<u32>,
    pub nonce: Option<Vec<u8>>,
}

impl TokenRecord {
    /// A record holding only the deprecated plaintext representation.
    pub fn legacy(
        account_id: impl Into<String>,
        access: impl Into<String>,
        refresh: Option<String>,
        expiry: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            access_ciphertext: None,
            refresh_ciphertext: None,
            nonce: None,
            key_version: None,
            legacy_access_plaintext: Some(access.into()),
            legacy_refresh_plaintext: refresh,
            expiry,
        }
    }

    /// A record holding only the encrypted representation.
    pub fn sealed(account_id: impl Into<String>, sealed: SealedTokens, expiry: DateTime<Utc>) -> Self {
        let mut record = Self {
            account_id: account_id.into(),
            access_ciphertext: None,
            refresh_ciphertext: None,
            nonce: None,
            key_version: None,
            legacy_access_plaintext: None,
            legacy_refresh_plaintext: None,
            expiry,
        };
        record.apply_sealed(sealed);
        record
    }

    /// Replaces the encrypted fields and clears the legacy ones.
    pub fn apply_sealed(&mut self, sealed: SealedTokens) {
        self.access_ciphertext = Some(sealed.access_ciphertext);
        self.refresh_ciphertext = sealed.refresh_ciphertext;
        self.nonce = Some(sealed.nonce.to_vec());
        self.key_version = Some(sealed.key_version);
        self.legacy_access_plaintext = None;
        self.legacy_refresh_plaintext = None;
    }

    pub fn encryption_state(&self) -> EncryptionState {
        match (&self.access_ciphertext, &self.nonce, self.key_version) {
            (None, None, None) if self.refresh_ciphertext.is_none() => EncryptionState::Absent,
            (Some(_), Some(nonce), Some(_)) if nonce.len() == NONCE_SIZE => {
                EncryptionState::Complete
            }
            _ => EncryptionState::Partial,
        }
    }

    /// True when the encrypted fields are complete and well-formed.
    pub fn is_encrypted(&self) -> bool {
        self.encryption_state() == EncryptionState::Complete
    }

    /// Either deprecated plaintext field is still populated.
    pub fn has_legacy_plaintext(&self) -> bool {
        self.legacy_access_plaintext.is_some() || self.legacy_refresh_plaintext.is_some()
    }

    /// Ciphertext present without nonce or key version.
    pub fn violates_pairing(&self) -> bool {
        self.access_ciphertext.is_some() && (self.nonce.is_none() || self.key_version.is_none())
    }

    pub fn stamp(&self) -> VersionStamp {
        VersionStamp {
            key_version: self.key_version,
            nonce: self.nonce.clone(),
        }
    }

    pub fn matches_stamp(&self, stamp: &VersionStamp) -> bool {
        self.key_version == stamp.key_version && self.nonce == stamp.nonce
    }
}

mod base64_opt {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_str(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| BASE64.decode(s).map_err(D::Error::custom))
            .transpose()
    }
}
