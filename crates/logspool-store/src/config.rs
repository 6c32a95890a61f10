// ABOUTME: Construction-time configuration for a persistence queue.
// ABOUTME: Reads LOGSPOOL_* environment variables with defaults and validates the result.

use std::path::PathBuf;

use thiserror::Error;

use crate::crypto::{Crypto, CryptoError};

/// Default ceiling on stored rows across all groups.
pub const DEFAULT_CAPACITY: usize = 300;

/// Bodies at or above this size (in bytes, token included) are offloaded to files.
pub const DEFAULT_INLINE_THRESHOLD: usize = 1_992_294;

/// Records larger than this are refused outright.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

pub const DEFAULT_DATABASE_NAME: &str = "logspool.db";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is not a valid number: {value}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("LOGSPOOL_CAPACITY must be at least 1")]
    ZeroCapacity,

    #[error("LOGSPOOL_INLINE_THRESHOLD ({inline}) must not exceed the maximum payload size ({max})")]
    ThresholdAboveMax { inline: usize, max: usize },

    #[error("LOGSPOOL_KEY is invalid: {0}")]
    InvalidKey(#[from] CryptoError),
}

/// Store configuration. Immutable once the queue is opened.
#[derive(Clone)]
pub struct StoreConfig {
    pub home: PathBuf,
    pub database_name: String,
    pub capacity: usize,
    pub inline_threshold: usize,
    pub max_payload_size: usize,
    pub encryption_enabled: bool,
    /// Base64 keyring (comma separated, oldest first). When unset and
    /// encryption is enabled, a keyring file under `home` is used.
    pub key: Option<String>,
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("home", &self.home)
            .field("database_name", &self.database_name)
            .field("capacity", &self.capacity)
            .field("inline_threshold", &self.inline_threshold)
            .field("max_payload_size", &self.max_payload_size)
            .field("encryption_enabled", &self.encryption_enabled)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl StoreConfig {
    /// Defaults rooted at the given home directory.
    pub fn new(home: PathBuf) -> Self {
        Self {
            home,
            database_name: DEFAULT_DATABASE_NAME.to_string(),
            capacity: DEFAULT_CAPACITY,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            encryption_enabled: true,
            key: None,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_inline_threshold(mut self, inline_threshold: usize) -> Self {
        self.inline_threshold = inline_threshold;
        self
    }

    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - LOGSPOOL_HOME: data directory (default: ~/.logspool)
    /// - LOGSPOOL_DATABASE: database file name (default: logspool.db)
    /// - LOGSPOOL_CAPACITY: maximum stored rows (default: 300)
    /// - LOGSPOOL_INLINE_THRESHOLD: offload threshold in bytes (default: 1.9 MiB)
    /// - LOGSPOOL_MAX_PAYLOAD: largest accepted record in bytes (default: 4 MiB)
    /// - LOGSPOOL_ENCRYPTION: encrypt target tokens at rest (default: true)
    /// - LOGSPOOL_KEY: base64 keyring, comma separated, oldest first (optional)
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = std::env::var("LOGSPOOL_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("/tmp"))
                    .join(".logspool")
            });

        let mut config = Self::new(home);

        if let Ok(name) = std::env::var("LOGSPOOL_DATABASE")
            && !name.is_empty()
        {
            config.database_name = name;
        }
        if let Some(capacity) = number_var("LOGSPOOL_CAPACITY")? {
            config.capacity = capacity;
        }
        if let Some(threshold) = number_var("LOGSPOOL_INLINE_THRESHOLD")? {
            config.inline_threshold = threshold;
        }
        if let Some(max) = number_var("LOGSPOOL_MAX_PAYLOAD")? {
            config.max_payload_size = max;
        }

        config.encryption_enabled = std::env::var("LOGSPOOL_ENCRYPTION")
            .map(|v| !(v == "false" || v == "0" || v == "no"))
            .unwrap_or(true);

        config.key = std::env::var("LOGSPOOL_KEY").ok().filter(|k| !k.is_empty());

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the queue relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.inline_threshold > self.max_payload_size {
            return Err(ConfigError::ThresholdAboveMax {
                inline: self.inline_threshold,
                max: self.max_payload_size,
            });
        }
        if let Some(key) = &self.key {
            Crypto::from_encoded(key)?;
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.home.join(&self.database_name)
    }

    pub fn payload_root(&self) -> PathBuf {
        self.home.join("payloads")
    }

    pub fn keyring_path(&self) -> PathBuf {
        self.home.join("token.key")
    }

    /// Build the token cipher this configuration asks for.
    ///
    /// With encryption disabled, an existing keyring is still loaded read-only
    /// so tokens written while it was enabled stay readable.
    pub fn crypto(&self) -> Result<Crypto, CryptoError> {
        let keyring = self.keyring_path();
        let crypto = match &self.key {
            Some(key) => Crypto::from_encoded(key)?,
            None if self.encryption_enabled => Crypto::load_or_create(&keyring)?,
            None if keyring.exists() => Crypto::load_or_create(&keyring)?,
            None => return Ok(Crypto::disabled()),
        };
        if self.encryption_enabled {
            Ok(crypto)
        } else {
            Ok(crypto.read_only())
        }
    }
}

fn number_var(name: &'static str) -> Result<Option<usize>, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        _ => Ok(None),
    }
}
