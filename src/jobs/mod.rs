//! Administrative batch jobs over the record store.
//!
//! Both jobs run out-of-band, process distinct records with bounded
//! parallelism, and collect per-record failures instead of aborting.
//! Reruns skip converged records, so an interrupted run is resumed by
//! running it again.

use crate::config::JobConfig;
use crate::credentials::TokenStore;
use crate::error::{Result, VaultError};
use crate::keys::{KeyProvider, KeyStatus};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub mod migration;
pub mod rotation;

pub use migration::{MigrationJob, MigrationSummary};
pub use rotation::{RotationJob, RotationSummary};

/// Batch tuning shared by both jobs.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub concurrency: usize,
    pub store_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::from(&JobConfig::default())
    }
}

impl From<&JobConfig> for JobOptions {
    fn from(config: &JobConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            store_retries: config.store_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// One record that failed during a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchError {
    pub account_id: String,
    pub reason: String,
}

/// What happened to one record.
#[derive(Debug)]
pub(crate) enum Outcome {
    Done,
    Skipped,
    Failed(String),
}

#[derive(Debug)]
pub(crate) struct Processed {
    pub account_id: String,
    pub outcome: Outcome,
    pub store_retries: u32,
}

impl Processed {
    pub fn new(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            outcome: Outcome::Skipped,
            store_retries: 0,
        }
    }

    pub fn done(mut self) -> Self {
        self.outcome = Outcome::Done;
        self
    }

    pub fn skipped(mut self) -> Self {
        self.outcome = Outcome::Skipped;
        self
    }

    pub fn failed(mut self, reason: impl Display) -> Self {
        let reason = reason.to_string();
        warn!(account_id = %self.account_id, reason = %reason, "Record failed during batch");
        self.outcome = Outcome::Failed(reason);
        self
    }
}

/// Runs a store operation, retrying transient failures with linear backoff.
///
/// `retries` is incremented once per retry so the batch can report it.
pub(crate) async fn with_store_retries<T, F, Fut>(
    options: &JobOptions,
    retries: &mut u32,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < options.store_retries => {
                attempt += 1;
                *retries += 1;
                warn!(attempt, error = %format!("{:#}", e), "Store operation failed, retrying");
                tokio::time::sleep(options.retry_backoff * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Per key version view of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyVersionReport {
    pub version: u32,
    /// None when records reference a version with no configured material.
    pub status: Option<KeyStatus>,
    pub records: u64,
    /// No record still needs this version, and it is not the active one.
    pub safe_to_retire: bool,
}

/// Encryption status of the whole store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VaultStatus {
    pub active_version: Option<u32>,
    pub legacy_records: u64,
    pub key_versions: Vec<KeyVersionReport>,
}

/// Summarizes which key versions records depend on.
pub async fn vault_status(store: &dyn TokenStore, keys: &KeyProvider) -> Result<VaultStatus> {
    let counts = store.key_version_counts().await.map_err(VaultError::Store)?;
    let legacy_records = store.legacy_count().await.map_err(VaultError::Store)?;

    let versions: BTreeSet<u32> = keys
        .versions()
        .into_iter()
        .map(|(v, _)| v)
        .chain(counts.keys().copied())
        .collect();

    let key_versions = versions
        .into_iter()
        .map(|version| {
            let status = keys.status(version);
            let records = counts.get(&version).copied().unwrap_or(0);
            KeyVersionReport {
                version,
                status,
                records,
                safe_to_retire: records == 0 && status != Some(KeyStatus::Active),
            }
        })
        .collect();

    Ok(VaultStatus {
        active_version: keys.active_version().ok(),
        legacy_records,
        key_versions,
    })
}
