//! Re-encrypts records sealed under older key versions with the active key.

use super::{with_store_retries, BatchError, JobOptions, Outcome, Processed};
use crate::credentials::{TokenCodec, TokenRecord, TokenStore, WriteOutcome};
use crate::error::{Result, VaultError};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of one rotation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationSummary {
    pub total: usize,
    pub rotated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<BatchError>,
    /// Version every rotated record now carries
    pub target_version: u32,
    pub store_retries: u32,
}

impl RotationSummary {
    pub fn partial_failure(&self) -> Option<VaultError> {
        (self.failed > 0).then(|| VaultError::PartialBatchFailure {
            failed: self.failed,
        })
    }
}

pub struct RotationJob {
    store: Arc<dyn TokenStore>,
    codec: TokenCodec,
    options: JobOptions,
}

impl RotationJob {
    pub fn new(store: Arc<dyn TokenStore>, codec: TokenCodec, options: JobOptions) -> Self {
        Self {
            store,
            codec,
            options,
        }
    }

    /// Rotates up to `batch_limit` records to the active key version.
    ///
    /// # Errors
    /// - `Configuration` if the active key does not resolve, or no record is
    ///   below the active version (nothing newer to rotate to)
    /// - `Store` if the candidate records cannot be listed
    ///
    /// Per-record failures are reported in the summary instead.
    pub async fn run(&self, batch_limit: usize) -> Result<RotationSummary> {
        let target = self.codec.keys().active()?.version;

        let mut summary = RotationSummary {
            target_version: target,
            ..Default::default()
        };

        let counts = with_store_retries(&self.options, &mut summary.store_retries, || {
            self.store.key_version_counts()
        })
        .await
        .map_err(VaultError::Store)?;

        let pending: u64 = counts.range(..target).map(|(_, n)| n).sum();
        if pending == 0 {
            // Most common stored version wins; ties go to the newer one
            if let Some((dominant, _)) = counts.iter().max_by_key(|(v, n)| (**n, **v)) {
                return Err(VaultError::config(format!(
                    "no key version newer than v{} configured, active is v{}",
                    dominant, target
                )));
            }
            info!(target_version = target, "No encrypted records to rotate");
            return Ok(summary);
        }

        info!(target_version = target, pending, batch_limit, "Starting key rotation");

        let records = with_store_retries(&self.options, &mut summary.store_retries, || {
            self.store.records_below_version(target, batch_limit)
        })
        .await
        .map_err(VaultError::Store)?;
        summary.total = records.len();

        let results: Vec<Processed> = stream::iter(records)
            .map(|record| self.rotate_record(record, target))
            .buffer_unordered(self.options.concurrency)
            .collect()
            .await;

        for processed in results {
            summary.store_retries += processed.store_retries;
            match processed.outcome {
                Outcome::Done => summary.rotated += 1,
                Outcome::Skipped => summary.skipped += 1,
                Outcome::Failed(reason) => summary.errors.push(BatchError {
                    account_id: processed.account_id,
                    reason,
                }),
            }
        }
        summary.failed = summary.errors.len();
        summary
            .errors
            .sort_by(|a, b| a.account_id.cmp(&b.account_id));

        if let Some(e) = summary.partial_failure() {
            warn!(error = %e, "Key rotation finished with failures");
        }
        info!(
            target_version = target,
            total = summary.total,
            rotated = summary.rotated,
            skipped = summary.skipped,
            failed = summary.failed,
            "Key rotation complete"
        );

        Ok(summary)
    }

    async fn rotate_record(&self, mut record: TokenRecord, target: u32) -> Processed {
        let mut processed = Processed::new(&record.account_id);
        let store = &self.store;

        for _ in 0..=self.options.store_retries {
            let (Some(access), Some(nonce), Some(version)) = (
                record.access_ciphertext.as_deref(),
                record.nonce.as_deref(),
                record.key_version,
            ) else {
                return processed.failed("record has no encrypted tokens to rotate");
            };
            if version >= target {
                return processed.skipped();
            }

            let pair = match self.codec.decrypt_pair(
                access,
                record.refresh_ciphertext.as_deref(),
                nonce,
                version,
            ) {
                Ok(pair) => pair,
                Err(e) => return processed.failed(format!("decrypt under v{} failed: {}", version, e)),
            };
            let sealed = match self.codec.encrypt_pair(&pair.access, pair.refresh.as_deref()) {
                Ok(sealed) => sealed,
                Err(e) => return processed.failed(e),
            };
            if sealed.key_version != target {
                return processed.failed(format!(
                    "active key changed from v{} to v{} during rotation",
                    target, sealed.key_version
                ));
            }

            let account_id = record.account_id.as_str();
            let stamp = record.stamp();
            let (stamp, sealed) = (&stamp, &sealed);
            let written = with_store_retries(&self.options, &mut processed.store_retries, move || {
                store.replace_sealed(account_id, stamp, sealed)
            })
            .await;

            match written {
                Ok(WriteOutcome::Applied) => {
                    debug!(account_id = %account_id, from = version, to = target, "Rotated record");
                    return processed.done();
                }
                Ok(WriteOutcome::Conflict) => {
                    debug!(account_id = %account_id, "Record changed during rotation, re-reading");
                }
                Err(e) => return processed.failed(format!("store write failed: {:#}", e)),
            }

            let reread = with_store_retries(&self.options, &mut processed.store_retries, move || {
                store.get(account_id)
            })
            .await;
            record = match reread {
                Ok(Some(current)) => current,
                Ok(None) => return processed.failed("record deleted during rotation"),
                Err(e) => return processed.failed(format!("store read failed: {:#}", e)),
            };
        }

        processed.failed("record kept changing during rotation")
    }
}
