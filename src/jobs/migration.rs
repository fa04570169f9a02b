//! Converts legacy plaintext records to the encrypted representation.

use super::{with_store_retries, BatchError, JobOptions, Outcome, Processed};
use crate::credentials::{TokenCodec, TokenRecord, TokenStore, WriteOutcome};
use crate::error::{Result, VaultError};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of one migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub total: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub errors: Vec<BatchError>,
    /// Transient store failures that were retried
    pub store_retries: u32,
}

impl MigrationSummary {
    /// `PartialBatchFailure` when any record failed.
    pub fn partial_failure(&self) -> Option<VaultError> {
        (!self.errors.is_empty()).then(|| VaultError::PartialBatchFailure {
            failed: self.errors.len(),
        })
    }
}

/// Encrypts legacy plaintext tokens and clears the plaintext in the same write.
pub struct MigrationJob {
    store: Arc<dyn TokenStore>,
    codec: TokenCodec,
    options: JobOptions,
}

impl MigrationJob {
    pub fn new(store: Arc<dyn TokenStore>, codec: TokenCodec, options: JobOptions) -> Self {
        Self {
            store,
            codec,
            options,
        }
    }

    /// Migrates up to `batch_limit` records.
    ///
    /// Fails with `Configuration` before reading any record when no usable
    /// active key is configured. Record-level failures land in `errors`.
    pub async fn run(&self, batch_limit: usize) -> Result<MigrationSummary> {
        let key = self.codec.keys().active()?;
        info!(key_version = key.version, batch_limit, "Starting token migration");

        let mut summary = MigrationSummary::default();
        let records = with_store_retries(&self.options, &mut summary.store_retries, || {
            self.store.migration_candidates(batch_limit)
        })
        .await
        .map_err(VaultError::Store)?;
        summary.total = records.len();

        let results: Vec<Processed> = stream::iter(records)
            .map(|record| self.migrate_record(record))
            .buffer_unordered(self.options.concurrency)
            .collect()
            .await;

        for processed in results {
            summary.store_retries += processed.store_retries;
            match processed.outcome {
                Outcome::Done => summary.migrated += 1,
                Outcome::Skipped => summary.skipped += 1,
                Outcome::Failed(reason) => summary.errors.push(BatchError {
                    account_id: processed.account_id,
                    reason,
                }),
            }
        }
        summary
            .errors
            .sort_by(|a, b| a.account_id.cmp(&b.account_id));

        if let Some(e) = summary.partial_failure() {
            warn!(error = %e, "Token migration finished with failures");
        }
        info!(
            total = summary.total,
            migrated = summary.migrated,
            skipped = summary.skipped,
            failed = summary.errors.len(),
            "Token migration complete"
        );

        Ok(summary)
    }

    async fn migrate_record(&self, mut record: TokenRecord) -> Processed {
        let mut processed = Processed::new(&record.account_id);
        let store = &self.store;

        for _ in 0..=self.options.store_retries {
            let account_id = record.account_id.as_str();
            let stamp = record.stamp();
            let stamp = &stamp;

            if record.is_encrypted() {
                if !record.has_legacy_plaintext() {
                    return processed.skipped();
                }

                // Already encrypted, but plaintext was never cleared
                let cleared = with_store_retries(&self.options, &mut processed.store_retries, move || {
                    store.clear_legacy(account_id, stamp)
                })
                .await;
                match cleared {
                    Ok(WriteOutcome::Applied) => {
                        debug!(account_id = %account_id, "Cleared leftover legacy plaintext");
                        return processed.skipped();
                    }
                    Ok(WriteOutcome::Conflict) => {
                        debug!(account_id = %account_id, "Record changed during migration, re-reading");
                    }
                    Err(e) => return processed.failed(format!("store write failed: {:#}", e)),
                }
            } else {
                let Some(access) = record.legacy_access_plaintext.as_deref() else {
                    return processed.failed("no legacy access token to migrate");
                };
                let sealed = match self
                    .codec
                    .encrypt_pair(access, record.legacy_refresh_plaintext.as_deref())
                {
                    Ok(sealed) => sealed,
                    Err(e) => return processed.failed(e),
                };
                if let Some(current) = record.key_version {
                    if sealed.key_version < current {
                        return processed.failed(format!(
                            "record references key v{}, newer than active v{}",
                            current, sealed.key_version
                        ));
                    }
                }

                let sealed = &sealed;
                let written = with_store_retries(&self.options, &mut processed.store_retries, move || {
                    store.replace_sealed(account_id, stamp, sealed)
                })
                .await;

                match written {
                    Ok(WriteOutcome::Applied) => {
                        debug!(account_id = %account_id, key_version = sealed.key_version, "Migrated record");
                        return processed.done();
                    }
                    Ok(WriteOutcome::Conflict) => {
                        debug!(account_id = %account_id, "Record changed during migration, re-reading");
                    }
                    Err(e) => return processed.failed(format!("store write failed: {:#}", e)),
                }
            }

            let reread = with_store_retries(&self.options, &mut processed.store_retries, move || {
                store.get(account_id)
            })
            .await;
            record = match reread {
                Ok(Some(current)) => current,
                Ok(None) => return processed.failed("record deleted during migration"),
                Err(e) => return processed.failed(format!("store read failed: {:#}", e)),
            };
        }

        processed.failed("record kept changing during migration")
    }
}
