//! In-process record store backed by `DashMap`.

use super::record::{TokenRecord, VersionStamp};
use super::store::{TokenStore, WriteOutcome};
use super::SealedTokens;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Token records kept in memory. Per-key locking of `DashMap` serializes
/// writers of the same account.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    records: DashMap<String, TokenRecord>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn sorted(&self) -> Vec<TokenRecord> {
        let mut records: Vec<TokenRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        records
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, account_id: &str) -> Result<Option<TokenRecord>> {
        Ok(self.records.get(account_id).map(|r| r.value().clone()))
    }

    async fn put(&self, record: &TokenRecord) -> Result<()> {
        if record.violates_pairing() {
            bail!(
                "record {} has ciphertext without nonce and key version",
                record.account_id
            );
        }
        self.records
            .insert(record.account_id.clone(), record.clone());
        Ok(())
    }

    async fn upsert_sealed(
        &self,
        account_id: &str,
        sealed: &SealedTokens,
        expiry: DateTime<Utc>,
    ) -> Result<()> {
        match self.records.entry(account_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if let Some(current) = record.key_version {
                    if sealed.key_version < current {
                        bail!(
                            "refusing to lower key version of {} from {} to {}",
                            account_id,
                            current,
                            sealed.key_version
                        );
                    }
                }
                record.apply_sealed(sealed.clone());
                record.expiry = expiry;
            }
            Entry::Vacant(entry) => {
                entry.insert(TokenRecord::sealed(account_id, sealed.clone(), expiry));
            }
        }
        Ok(())
    }

    async fn replace_sealed(
        &self,
        account_id: &str,
        expected: &VersionStamp,
        sealed: &SealedTokens,
    ) -> Result<WriteOutcome> {
        if let Some(current) = expected.key_version {
            if sealed.key_version < current {
                bail!(
                    "refusing to lower key version of {} from {} to {}",
                    account_id,
                    current,
                    sealed.key_version
                );
            }
        }
        let Some(mut record) = self.records.get_mut(account_id) else {
            return Ok(WriteOutcome::Conflict);
        };
        if !record.matches_stamp(expected) {
            return Ok(WriteOutcome::Conflict);
        }
        record.apply_sealed(sealed.clone());
        Ok(WriteOutcome::Applied)
    }

    async fn clear_legacy(&self, account_id: &str, expected: &VersionStamp) -> Result<WriteOutcome> {
        if expected.key_version.is_none() || expected.nonce.is_none() {
            bail!("refusing to clear legacy tokens of {}: not encrypted", account_id);
        }
        let Some(mut record) = self.records.get_mut(account_id) else {
            return Ok(WriteOutcome::Conflict);
        };
        if !record.matches_stamp(expected) || record.access_ciphertext.is_none() {
            return Ok(WriteOutcome::Conflict);
        }
        record.legacy_access_plaintext = None;
        record.legacy_refresh_plaintext = None;
        Ok(WriteOutcome::Applied)
    }

    async fn migration_candidates(&self, limit: usize) -> Result<Vec<TokenRecord>> {
        let mut records = self.sorted();
        // Stable sort keeps account order within each group
        records.sort_by_key(|r| r.is_encrypted() && !r.has_legacy_plaintext());
        records.truncate(limit);
        Ok(records)
    }

    async fn records_below_version(&self, version: u32, limit: usize) -> Result<Vec<TokenRecord>> {
        let mut records: Vec<TokenRecord> = self
            .sorted()
            .into_iter()
            .filter(|r| r.access_ciphertext.is_some())
            .filter(|r| matches!(r.key_version, Some(v) if v < version))
            .collect();
        records.sort_by_key(|r| r.key_version);
        records.truncate(limit);
        Ok(records)
    }

    async fn key_version_counts(&self) -> Result<BTreeMap<u32, u64>> {
        let mut counts = BTreeMap::new();
        for record in self.records.iter() {
            if let (Some(version), Some(_)) = (record.key_version, &record.access_ciphertext) {
                *counts.entry(version).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn legacy_count(&self) -> Result<u64> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.has_legacy_plaintext())
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::super::store::conformance;
    use super::*;

    #[tokio::test]
    async fn test_conformance() {
        conformance::run_all(&MemoryTokenStore::new()).await;
    }

    #[tokio::test]
    async fn test_len() {
        let store = MemoryTokenStore::new();
        assert!(store.is_empty());
        store.put(&conformance::legacy_record("acct-1")).await.unwrap();
        store.put(&conformance::legacy_record("acct-1")).await.unwrap();
        store.put(&conformance::legacy_record("acct-2")).await.unwrap();
        assert_eq!(store.len(), 2);
    }
}
