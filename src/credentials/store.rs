//! Record store boundary.
//!
//! The only place the vault suspends. Implementations return `anyhow`
//! errors with context; the vault layer wraps them in `VaultError::Store`.

use super::record::{TokenRecord, VersionStamp};
use super::SealedTokens;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Result of an optimistic compare-and-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The record changed (or vanished) since it was read.
    Conflict,
}

/// Persistence for [`TokenRecord`]s.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Fetches one account's record.
    async fn get(&self, account_id: &str) -> Result<Option<TokenRecord>>;

    /// Writes a record verbatim (insert or replace). Used for importing
    /// legacy data; rejects ciphertext without nonce and key version.
    async fn put(&self, record: &TokenRecord) -> Result<()>;

    /// Collaborator write: stores freshly sealed tokens, clears legacy
    /// plaintext, creates the record if needed. Refuses to lower the
    /// record's key version.
    async fn upsert_sealed(
        &self,
        account_id: &str,
        sealed: &SealedTokens,
        expiry: DateTime<Utc>,
    ) -> Result<()>;

    /// Replaces the encrypted fields (and clears legacy plaintext) only if
    /// the record still matches `expected`. Refuses to lower the key version.
    async fn replace_sealed(
        &self,
        account_id: &str,
        expected: &VersionStamp,
        sealed: &SealedTokens,
    ) -> Result<WriteOutcome>;

    /// Clears leftover legacy plaintext from an encrypted record, only if
    /// the record still matches `expected`. Encrypted fields are untouched.
    /// Errors if `expected` does not describe an encrypted record.
    async fn clear_legacy(&self, account_id: &str, expected: &VersionStamp) -> Result<WriteOutcome>;

    /// Up to `limit` records, those lacking complete encryption or still
    /// carrying legacy plaintext first, then by account id.
    async fn migration_candidates(&self, limit: usize) -> Result<Vec<TokenRecord>>;

    /// Up to `limit` encrypted records sealed under a version below `version`.
    async fn records_below_version(&self, version: u32, limit: usize) -> Result<Vec<TokenRecord>>;

    /// Number of records per stored key version.
    async fn key_version_counts(&self) -> Result<BTreeMap<u32, u64>>;

    /// Number of records that still carry legacy plaintext.
    async fn legacy_count(&self) -> Result<u64>;
}
