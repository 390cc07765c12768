//! Store configuration
//!
//! Everything the store would otherwise pull from process-wide state (the
//! hash function used for tokens, the salt length, the random source and
//! the backing-store deadline) is carried here and handed to the store at
//! construction.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::error::StoreError;

/// Hash function used for change tokens and the aggregate declarations token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenHash {
    #[default]
    Sha256,
    Sha512,
}

impl TokenHash {
    /// Hash the concatenation of `parts` and return lowercase hex.
    pub fn hex_digest(&self, parts: &[&[u8]]) -> String {
        match self {
            TokenHash::Sha256 => {
                let mut hasher = Sha256::new();
                for part in parts {
                    hasher.update(part);
                }
                hex::encode(hasher.finalize())
            }
            TokenHash::Sha512 => {
                let mut hasher = Sha512::new();
                for part in parts {
                    hasher.update(part);
                }
                hex::encode(hasher.finalize())
            }
        }
    }
}

/// Configuration for a [`crate::DdmStore`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Length in bytes of the creation salt drawn for new declarations
    pub salt_len: usize,

    /// Hash used for change tokens
    pub token_hash: TokenHash,

    /// Deadline for each backing-store call, in milliseconds
    pub op_timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            salt_len: 32,
            token_hash: TokenHash::Sha256,
            op_timeout_ms: Some(10_000),
        }
    }
}

impl StoreConfig {
    /// Load a configuration from a JSON file. Missing fields take their
    /// default values.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let data = std::fs::read(path).map_err(|e| StoreError::Validation {
            context: format!("config {}", path.display()),
            reason: e.to_string(),
        })?;
        let config: StoreConfig =
            serde_json::from_slice(&data).map_err(|e| StoreError::Validation {
                context: format!("config {}", path.display()),
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.salt_len == 0 {
            return Err(StoreError::Validation {
                context: "config".to_string(),
                reason: "salt_len must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn op_timeout(&self) -> Option<Duration> {
        self.op_timeout_ms.map(Duration::from_millis)
    }
}

/// Source of creation salts
pub trait SaltSource: Send + Sync {
    fn fill(&self, salt: &mut [u8]) -> Result<(), rand::Error>;
}

/// Draws salts from the operating system's CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSaltSource;

impl SaltSource for OsSaltSource {
    fn fill(&self, salt: &mut [u8]) -> Result<(), rand::Error> {
        OsRng.try_fill_bytes(salt)
    }
}

/// Deterministic salts from a seeded generator, for reproducible tests
pub struct SeededSaltSource {
    rng: Mutex<StdRng>,
}

impl SeededSaltSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl SaltSource for SeededSaltSource {
    fn fill(&self, salt: &mut [u8]) -> Result<(), rand::Error> {
        match self.rng.lock() {
            Ok(mut rng) => rng.try_fill_bytes(salt),
            Err(_) => Err(rand::Error::new("salt generator lock poisoned")),
        }
    }
}

pub fn default_salt_source() -> Arc<dyn SaltSource> {
    Arc::new(OsSaltSource)
}
