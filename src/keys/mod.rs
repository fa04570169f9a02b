//! Versioned key material.
//!
//! `KeyProvider` is a pure lookup over an injected [`KeyringConfig`]. Key
//! bytes are decoded and length-checked on every `resolve`, so one malformed
//! entry only fails the paths that actually need that version.

use crate::config::KeyringConfig;
use crate::credentials::encryption::decode_key_hex;
use crate::error::{Result, VaultError};
use serde::Serialize;
use std::fmt;
use zeroize::Zeroizing;


/// Lifecycle status of a key version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Seals every new write. Exactly one version is active.
    Active,
    /// Still decrypts records that have not been rotated yet.
    Retiring,
    /// Never used again. Must not be referenced by any stored record.
    Retired,
}

/// Resolved 256-bit key for one version.
pub struct KeyMaterial {
    pub version: u32,
    pub status: KeyStatus,
    bytes: Zeroizing<[u8; 32]>,
}

impl KeyMaterial {
    pub fn bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("version", &self.version)
            .field("status", &self.status)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

/// Resolves key material by version.
#[derive(Debug, Clone)]
pub struct KeyProvider {
    config: KeyringConfig,
}

impl KeyProvider {
    pub fn new(config: &KeyringConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// The version every new write is sealed under.
    ///
    /// Either the explicitly configured active version, or the highest
    /// configured version that is not retired.
    pub fn active_version(&self) -> Result<u32> {
        if let Some(version) = self.config.active_version {
            return match self.config.entry(version) {
                Some(entry) if entry.retired => Err(VaultError::config(format!(
                    "active key version {} is marked retired",
                    version
                ))),
                Some(_) => Ok(version),
                None => Err(VaultError::config(format!(
                    "active key version {} has no configured material",
                    version
                ))),
            };
        }

        self.config
            .versions
            .iter()
            .filter(|e| !e.retired)
            .map(|e| e.version)
            .max()
            .ok_or_else(|| VaultError::config("no active encryption key configured"))
    }

    /// Status of a configured version, or None when it is not configured.
    pub fn status(&self, version: u32) -> Option<KeyStatus> {
        let entry = self.config.entry(version)?;
        if entry.retired {
            return Some(KeyStatus::Retired);
        }
        match self.active_version() {
            Ok(active) if active == version => Some(KeyStatus::Active),
            _ => Some(KeyStatus::Retiring),
        }
    }

    /// Looks up and validates the material for `version`.
    ///
    /// Fails with `Configuration` when the version is unknown, retired, or its
    /// material is not exactly 32 bytes of hex.
    pub fn resolve(&self, version: u32) -> Result<KeyMaterial> {
        let entry = self.config.entry(version).ok_or_else(|| {
            VaultError::config(format!("no key material configured for version {}", version))
        })?;

        if entry.retired {
            return Err(VaultError::config(format!(
                "key version {} is retired",
                version
            )));
        }

        let bytes = decode_key_hex(&entry.material)
            .map_err(|e| VaultError::config(format!("key version {}: {:#}", version, e)))?;

        let status = match self.active_version() {
            Ok(active) if active == version => KeyStatus::Active,
            _ => KeyStatus::Retiring,
        };

        Ok(KeyMaterial {
            version,
            status,
            bytes,
        })
    }

    /// Resolves the active key.
    pub fn active(&self) -> Result<KeyMaterial> {
        let version = self.active_version()?;
        self.resolve(version)
    }

    /// All configured versions with their status, ascending.
    pub fn versions(&self) -> Vec<(u32, KeyStatus)> {
        let mut versions: Vec<(u32, KeyStatus)> = self
            .config
            .versions
            .iter()
            .filter_map(|e| self.status(e.version).map(|s| (e.version, s)))
            .collect();
        versions.sort_by_key(|(v, _)| *v);
        versions
    }
}
