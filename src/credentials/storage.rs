//! Token record storage using SQLite.
//!
//! Stores one row per account. Encrypted fields are BLOBs; the deprecated
//! plaintext columns stay until every row is migrated.

use super::record::{TokenRecord, VersionStamp};
use super::store::{TokenStore, WriteOutcome};
use super::SealedTokens;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SELECT_COLUMNS: &str = "account_id, access_ciphertext, refresh_ciphertext, nonce, \
     key_version, legacy_access_token, legacy_refresh_token, expiry";

/// Token records backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE gmail_tokens (
///     account_id TEXT PRIMARY KEY,
///     access_ciphertext BLOB,          -- AES-256-GCM, base nonce
///     refresh_ciphertext BLOB,         -- AES-256-GCM, derived nonce (optional)
///     nonce BLOB,                      -- 12 bytes, fresh on every write
///     key_version INTEGER,
///     legacy_access_token TEXT,        -- Deprecated plaintext
///     legacy_refresh_token TEXT,       -- Deprecated plaintext
///     expiry TEXT NOT NULL,            -- ISO 8601 timestamp
///     updated_at TEXT NOT NULL,        -- ISO 8601 timestamp
///     CHECK (access_ciphertext IS NULL OR (nonce IS NOT NULL AND key_version IS NOT NULL))
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in a Mutex, so writes to one account are serialized
pub struct SqliteTokenStore {
    conn: Mutex<Connection>,
}

impl SqliteTokenStore {
    /// Creates or opens a token store.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open token database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS gmail_tokens (
                account_id TEXT PRIMARY KEY,
                access_ciphertext BLOB,
                refresh_ciphertext BLOB,
                nonce BLOB,
                key_version INTEGER,
                legacy_access_token TEXT,
                legacy_refresh_token TEXT,
                expiry TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (access_ciphertext IS NULL
                       OR (nonce IS NOT NULL AND key_version IS NOT NULL))
            );
            CREATE INDEX IF NOT EXISTS idx_gmail_tokens_key_version
                ON gmail_tokens(key_version);
            "#,
        )
        .context("Failed to create gmail_tokens table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("token database lock poisoned"))
    }

    fn query_records(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<TokenRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).context("Failed to prepare query")?;
        let rows = stmt
            .query_map(params, read_row)
            .context("Failed to execute query")?;

        let records = rows
            .collect::<rusqlite::Result<Vec<TokenRecord>>>()
            .context("Failed to read token rows")?;
        Ok(records)
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<TokenRecord> {
    let expiry: String = row.get(7)?;
    let expiry = DateTime::parse_from_rfc3339(&expiry)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;

    Ok(TokenRecord {
        account_id: row.get(0)?,
        access_ciphertext: row.get(1)?,
        refresh_ciphertext: row.get(2)?,
        nonce: row.get(3)?,
        key_version: row.get(4)?,
        legacy_access_plaintext: row.get(5)?,
        legacy_refresh_plaintext: row.get(6)?,
        expiry,
    })
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn get(&self, account_id: &str) -> Result<Option<TokenRecord>> {
        let sql = format!("SELECT {} FROM gmail_tokens WHERE account_id = ?1", SELECT_COLUMNS);
        Ok(self
            .query_records(&sql, params![account_id])?
            .into_iter()
            .next())
    }

    async fn put(&self, record: &TokenRecord) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn()?
            .execute(
                r#"
                INSERT INTO gmail_tokens (
                    account_id, access_ciphertext, refresh_ciphertext, nonce, key_version,
                    legacy_access_token, legacy_refresh_token, expiry, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(account_id) DO UPDATE SET
                    access_ciphertext = excluded.access_ciphertext,
                    refresh_ciphertext = excluded.refresh_ciphertext,
                    nonce = excluded.nonce,
                    key_version = excluded.key_version,
                    legacy_access_token = excluded.legacy_access_token,
                    legacy_refresh_token = excluded.legacy_refresh_token,
                    expiry = excluded.expiry,
                    updated_at = excluded.updated_at
                "#,
                params![
                    record.account_id,
                    record.access_ciphertext,
                    record.refresh_ciphertext,
                    record.nonce,
                    record.key_version,
                    record.legacy_access_plaintext,
                    record.legacy_refresh_plaintext,
                    record.expiry.to_rfc3339(),
                    now,
                ],
            )
            .with_context(|| format!("Failed to store token record {}", record.account_id))?;
        Ok(())
    }

    async fn upsert_sealed(
        &self,
        account_id: &str,
        sealed: &SealedTokens,
        expiry: DateTime<Utc>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let rows = self
            .conn()?
            .execute(
                r#"
                INSERT INTO gmail_tokens (
                    account_id, access_ciphertext, refresh_ciphertext, nonce, key_version,
                    legacy_access_token, legacy_refresh_token, expiry, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, ?6, ?7)
                ON CONFLICT(account_id) DO UPDATE SET
                    access_ciphertext = excluded.access_ciphertext,
                    refresh_ciphertext = excluded.refresh_ciphertext,
                    nonce = excluded.nonce,
                    key_version = excluded.key_version,
                    legacy_access_token = NULL,
                    legacy_refresh_token = NULL,
                    expiry = excluded.expiry,
                    updated_at = excluded.updated_at
                WHERE gmail_tokens.key_version IS NULL
                   OR gmail_tokens.key_version <= excluded.key_version
                "#,
                params![
                    account_id,
                    sealed.access_ciphertext,
                    sealed.refresh_ciphertext,
                    &sealed.nonce[..],
                    sealed.key_version,
                    expiry.to_rfc3339(),
                    now,
                ],
            )
            .with_context(|| format!("Failed to store sealed tokens for {}", account_id))?;

        if rows == 0 {
            bail!(
                "refusing to lower key version of {} to {}",
                account_id,
                sealed.key_version
            );
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

        let rows = self
            .conn()?
            .execute(
                r#"
                UPDATE gmail_tokens SET
                    access_ciphertext = ?1,
                    refresh_ciphertext = ?2,
                    nonce = ?3,
                    key_version = ?4,
                    legacy_access_token = NULL,
                    legacy_refresh_token = NULL,
                    updated_at = ?5
                WHERE account_id = ?6 AND key_version IS ?7 AND nonce IS ?8
                "#,
                params![
                    sealed.access_ciphertext,
                    sealed.refresh_ciphertext,
                    &sealed.nonce[..],
                    sealed.key_version,
                    Utc::now().to_rfc3339(),
                    account_id,
                    expected.key_version,
                    expected.nonce,
                ],
            )
            .with_context(|| format!("Failed to replace sealed tokens for {}", account_id))?;

        Ok(if rows == 1 {
            WriteOutcome::Applied
        } else {
            WriteOutcome::Conflict
        })
    }

    async fn clear_legacy(&self, account_id: &str, expected: &VersionStamp) -> Result<WriteOutcome> {
        if expected.key_version.is_none() || expected.nonce.is_none() {
            bail!("refusing to clear legacy tokens of {}: not encrypted", account_id);
        }

        let rows = self
            .conn()?
            .execute(
                r#"
                UPDATE gmail_tokens SET
                    legacy_access_token = NULL,
                    legacy_refresh_token = NULL,
                    updated_at = ?1
                WHERE account_id = ?2 AND key_version IS ?3 AND nonce IS ?4
                  AND access_ciphertext IS NOT NULL
                "#,
                params![
                    Utc::now().to_rfc3339(),
                    account_id,
                    expected.key_version,
                    expected.nonce,
                ],
            )
            .with_context(|| format!("Failed to clear legacy tokens for {}", account_id))?;

        Ok(if rows == 1 {
            WriteOutcome::Applied
        } else {
            WriteOutcome::Conflict
        })
    }

    async fn migration_candidates(&self, limit: usize) -> Result<Vec<TokenRecord>> {
        let sql = format!(
            "SELECT {} FROM gmail_tokens \
             ORDER BY (access_ciphertext IS NOT NULL AND length(nonce) = 12 \
                       AND key_version IS NOT NULL \
                       AND legacy_access_token IS NULL \
                       AND legacy_refresh_token IS NULL), account_id \
             LIMIT ?1",
            SELECT_COLUMNS
        );
        self.query_records(&sql, params![limit as i64])
    }

    async fn records_below_version(&self, version: u32, limit: usize) -> Result<Vec<TokenRecord>> {
        let sql = format!(
            "SELECT {} FROM gmail_tokens \
             WHERE access_ciphertext IS NOT NULL AND key_version < ?1 \
             ORDER BY key_version, account_id \
             LIMIT ?2",
            SELECT_COLUMNS
        );
        self.query_records(&sql, params![version, limit as i64])
    }

    async fn key_version_counts(&self) -> Result<BTreeMap<u32, u64>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT key_version, COUNT(*) FROM gmail_tokens \
                 WHERE access_ciphertext IS NOT NULL GROUP BY key_version",
            )
            .context("Failed to prepare query")?;

        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)? as u64)))
            .context("Failed to execute query")?
            .collect::<Result<BTreeMap<u32, u64>, _>>()
            .context("Failed to read results")?;

        Ok(counts)
    }

    async fn legacy_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn()?
            .query_row(
                "SELECT COUNT(*) FROM gmail_tokens WHERE legacy_access_token IS NOT NULL \
                 OR legacy_refresh_token IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .context("Failed to count legacy records")?;
        Ok(count as u64)
    }
}
