// Error taxonomy
pub mod error;

// Configuration (TOML + VAULT_* environment)
pub mod config;

// Versioned key material
pub mod keys;

// Encryption, record shape, stores and the read/write facade
pub mod credentials;

// Migration and rotation batch jobs
pub mod jobs;

// Internal-caller authentication
pub mod auth;

// Admin HTTP API
pub mod api;

pub use error::VaultError;
