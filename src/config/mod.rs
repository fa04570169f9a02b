//! Vault configuration: a TOML file overlaid by `VAULT_*` environment variables.
//!
//! Configuration is read once at startup and injected into the components
//! that need it. Nothing below the binary reads the environment.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use tracing::warn;

/// Prefix for per-version key material, e.g. `VAULT_KEY_V2`.
pub const KEY_ENV_PREFIX: &str = "VAULT_KEY_V";

/// Complete vault configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub keys: KeyringConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub jobs: JobConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
}

/// Versioned key material.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyringConfig {
    /// Explicit active version. Defaults to the highest non-retired version.
    #[serde(default)]
    pub active_version: Option<u32>,
    #[serde(default)]
    pub versions: Vec<KeyEntry>,
}

impl KeyringConfig {
    /// Adds or replaces the material for `version`, keeping its retired flag.
    pub fn set_material(&mut self, version: u32, material: impl Into<String>) {
        let material = material.into();
        match self.versions.iter_mut().find(|e| e.version == version) {
            Some(entry) => entry.material = material,
            None => self.versions.push(KeyEntry {
                version,
                material,
                retired: false,
            }),
        }
    }

    /// Drops all material for `version`.
    pub fn remove(&mut self, version: u32) {
        self.versions.retain(|e| e.version != version);
    }

    pub fn entry(&self, version: u32) -> Option<&KeyEntry> {
        self.versions.iter().find(|e| e.version == version)
    }
}

/// One configured key version. `material` is 64 hex characters.
#[derive(Clone, Deserialize)]
pub struct KeyEntry {
    pub version: u32,
    pub material: String,
    #[serde(default)]
    pub retired: bool,
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEntry")
            .field("version", &self.version)
            .field("material", &"<redacted>")
            .field("retired", &self.retired)
            .finish()
    }
}

/// Record store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "tokens.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Batch job tuning
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    /// Records processed in parallel (always distinct records)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retries for transient store I/O errors, per record
    #[serde(default = "default_store_retries")]
    pub store_retries: u32,
    /// Linear backoff step between store retries (milliseconds)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Batch size used when the caller does not pass one
    #[serde(default = "default_batch_limit")]
    pub default_batch_limit: usize,
}

fn default_concurrency() -> usize {
    4
}

fn default_store_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_batch_limit() -> usize {
    500
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            store_retries: default_store_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            default_batch_limit: default_batch_limit(),
        }
    }
}

/// Administrative surface
#[derive(Clone, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Shared internal secret. None = every admin call is rejected.
    #[serde(default)]
    pub internal_secret: Option<String>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8090".to_string()
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            internal_secret: None,
        }
    }
}

impl fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminConfig")
            .field("bind_addr", &self.bind_addr)
            .field(
                "internal_secret",
                &self.internal_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Read-path behavior
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReaderConfig {
    /// Only fall back to legacy plaintext when no ciphertext is stored.
    #[serde(default)]
    pub strict_decrypt: bool,
}

impl VaultConfig {
    /// Build from the process environment on top of defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env(std::env::vars());
        cfg
    }

    /// Overlay `VAULT_*` variables. Unparseable values are logged and ignored.
    pub fn apply_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            if let Some(version) = name.strip_prefix(KEY_ENV_PREFIX) {
                match version.parse::<u32>() {
                    Ok(v) if v > 0 => self.keys.set_material(v, value.trim()),
                    _ => warn!(variable = %name, "Ignoring key variable with invalid version"),
                }
                continue;
            }

            match name.as_str() {
                "VAULT_ACTIVE_KEY_VERSION" => match value.trim().parse::<u32>() {
                    Ok(v) => self.keys.active_version = Some(v),
                    Err(_) => warn!(variable = %name, "Ignoring invalid active key version"),
                },
                "VAULT_RETIRED_KEY_VERSIONS" => {
                    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                        match part.parse::<u32>() {
                            Ok(v) => {
                                if let Some(entry) =
                                    self.keys.versions.iter_mut().find(|e| e.version == v)
                                {
                                    entry.retired = true;
                                } else {
                                    self.keys.versions.push(KeyEntry {
                                        version: v,
                                        material: String::new(),
                                        retired: true,
                                    });
                                }
                            }
                            Err(_) => {
                                warn!(variable = %name, value = %part, "Ignoring invalid retired version")
                            }
                        }
                    }
                }
                "VAULT_INTERNAL_SECRET" => {
                    let secret = value.trim();
                    if !secret.is_empty() {
                        self.admin.internal_secret = Some(secret.to_string());
                    }
                }
                "VAULT_DB_PATH" => self.storage.db_path = value,
                "VAULT_BIND_ADDR" => self.admin.bind_addr = value,
                "VAULT_JOB_CONCURRENCY" => match value.trim().parse::<usize>() {
                    Ok(n) => self.jobs.concurrency = n.max(1),
                    Err(_) => warn!(variable = %name, "Ignoring invalid job concurrency"),
                },
                "VAULT_STORE_RETRIES" => match value.trim().parse::<u32>() {
                    Ok(n) => self.jobs.store_retries = n,
                    Err(_) => warn!(variable = %name, "Ignoring invalid store retry count"),
                },
                "VAULT_DEFAULT_BATCH_LIMIT" => match value.trim().parse::<usize>() {
                    Ok(n) => self.jobs.default_batch_limit = n,
                    Err(_) => warn!(variable = %name, "Ignoring invalid default batch limit"),
                },
                "VAULT_STRICT_DECRYPT" => match value.trim().parse::<bool>() {
                    Ok(b) => self.reader.strict_decrypt = b,
                    Err(_) => warn!(variable = %name, "Ignoring invalid strict decrypt flag"),
                },
                _ => {}
            }
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &str) -> Result<VaultConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: VaultConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path))?;
    Ok(config)
}
