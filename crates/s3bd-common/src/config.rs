//! Configuration for the s3bd store stack
//!
//! One `StoreConfig` describes the whole stack. The zero cache, the
//! eventual-consistency protection layer, and the block cache are each
//! optional; the HTTP layer is always present.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Root configuration for one store instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Block size in bytes. Power of two. Zero means "adopt the value
    /// persisted in the bucket parameter object".
    pub block_size: u32,
    /// Number of blocks. Zero means "adopt the persisted value".
    pub num_blocks: u64,
    /// Reject all writes locally, before any network contact
    pub read_only: bool,
    /// HTTP / object-store layer
    pub http: HttpConfig,
    /// Block cache layer; `None` disables caching entirely
    pub block_cache: Option<BlockCacheConfig>,
    /// Zero-block cache layer
    pub zero_cache: Option<ZeroCacheConfig>,
    /// Eventual-consistency protection layer
    pub ec_protect: Option<EcProtectConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            num_blocks: 0,
            read_only: false,
            http: HttpConfig::default(),
            block_cache: Some(BlockCacheConfig::default()),
            zero_cache: Some(ZeroCacheConfig::default()),
            ec_protect: Some(EcProtectConfig::default()),
        }
    }
}

impl StoreConfig {
    /// Validate the configuration before building a stack.
    pub fn validate(&self) -> Result<()> {
        if self.block_size != 0 {
            if !self.block_size.is_power_of_two() {
                return Err(Error::config(format!(
                    "block_size {} is not a power of two",
                    self.block_size
                )));
            }
            if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
                return Err(Error::config(format!(
                    "block_size {} outside supported range [{MIN_BLOCK_SIZE}, {MAX_BLOCK_SIZE}]",
                    self.block_size
                )));
            }
        }
        if self.http.bucket.is_empty() {
            return Err(Error::config("bucket name is required"));
        }
        if let Some(cache) = &self.block_cache {
            cache.validate()?;
        }
        if let Some(ec) = &self.ec_protect {
            ec.validate()?;
        }
        Ok(())
    }
}

/// HTTP / object-store layer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    /// AWS region used for request signing and the default endpoint
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Key prefix for block objects (may be empty)
    pub prefix: String,
    /// Endpoint override, e.g. `http://127.0.0.1:9000`. When unset the
    /// region-scoped AWS endpoint is used.
    pub endpoint: Option<String>,
    /// Static access key; ignored when `iam_role` is set
    pub access_key: Option<String>,
    /// Static secret key
    pub secret_key: Option<String>,
    /// Optional session token for temporary credentials
    pub session_token: Option<String>,
    /// IAM role name to fetch credentials for from instance metadata
    pub iam_role: Option<String>,
    /// Hard timeout per HTTP request, milliseconds
    pub timeout_ms: u64,
    /// First retry pause, milliseconds
    pub initial_retry_pause_ms: u64,
    /// Total retry budget per operation, milliseconds
    pub max_retry_pause_ms: u64,
    /// Deflate compression level (1-9); `None` stores blocks raw
    pub compress: Option<u32>,
    /// Block encryption; `None` stores blocks in the clear
    pub encryption: Option<EncryptionConfig>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            bucket: String::new(),
            prefix: String::new(),
            endpoint: None,
            access_key: None,
            secret_key: None,
            session_token: None,
            iam_role: None,
            timeout_ms: 30_000,
            initial_retry_pause_ms: 200,
            max_retry_pause_ms: 30_000,
            compress: None,
            encryption: None,
        }
    }
}

/// Cipher key length
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyLength {
    /// AES-128-CBC
    Aes128,
    /// AES-256-CBC
    Aes256,
}

impl Default for KeyLength {
    fn default() -> Self {
        Self::Aes128
    }
}

/// Block encryption configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Passphrase; the data key is derived from it with PBKDF2 and the
    /// per-bucket salt persisted in the parameter object
    pub password: String,
    /// Cipher key length
    pub key_length: KeyLength,
}

/// Block cache layer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockCacheConfig {
    /// Maximum number of cached entries
    pub cache_size: usize,
    /// Worker threads draining reads and write-backs
    pub num_threads: usize,
    /// Minimum age of a dirty entry before write-back, milliseconds.
    /// Gives coalescing a window.
    pub write_delay_ms: u64,
    /// Maximum number of dirty entries; writers block at the bound
    pub max_dirty: usize,
    /// Blocks to prefetch on a sequential access pattern
    pub read_ahead: usize,
    /// Consecutive sequential reads before read-ahead starts
    pub read_ahead_trigger: usize,
    /// Write-through instead of write-back
    pub synchronous: bool,
    /// Disable re-read verification of evicted block hashes
    pub no_verify: bool,
    /// Bound on the evicted-hash verification map
    pub md5_cache_size: usize,
    /// Replay the dirty journal at start and flush recovered entries
    pub recover_dirty_blocks: bool,
    /// Dirty journal file; `None` disables journaling
    pub journal_path: Option<PathBuf>,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            cache_size: 1000,
            num_threads: 20,
            write_delay_ms: 250,
            max_dirty: 500,
            read_ahead: 4,
            read_ahead_trigger: 2,
            synchronous: false,
            no_verify: false,
            md5_cache_size: 10_000,
            recover_dirty_blocks: false,
            journal_path: None,
        }
    }
}

impl BlockCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cache_size == 0 {
            return Err(Error::config("block cache cache_size must be nonzero"));
        }
        if self.num_threads == 0 {
            return Err(Error::config("block cache num_threads must be nonzero"));
        }
        if self.max_dirty == 0 || self.max_dirty > self.cache_size {
            return Err(Error::config(format!(
                "max_dirty {} must be in [1, cache_size {}]",
                self.max_dirty, self.cache_size
            )));
        }
        // recover_dirty_blocks without a journal is tolerated; the cache
        // logs a warning and ignores the flag.
        Ok(())
    }
}

/// Zero cache layer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZeroCacheConfig {
    /// Largest block count the bitmap will be allocated for. Beyond this
    /// the layer constructs as a pass-through no-op.
    pub max_blocks: u64,
}

impl Default for ZeroCacheConfig {
    fn default() -> Self {
        Self {
            // 1 GiB of bitmap at most
            max_blocks: 8 * 1024 * 1024 * 1024,
        }
    }
}

/// Eventual-consistency protection layer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EcProtectConfig {
    /// Minimum delay between a write/delete of a block and a raw read of
    /// the same block, milliseconds
    pub min_write_delay_ms: u64,
    /// Maximum outstanding write entries; callers block at the bound
    pub cache_size: usize,
    /// Bound on recently-read content hashes retained for staleness checks
    pub md5_cache_size: usize,
}

impl Default for EcProtectConfig {
    fn default() -> Self {
        Self {
            min_write_delay_ms: 500,
            cache_size: 1000,
            md5_cache_size: 10_000,
        }
    }
}

impl EcProtectConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cache_size == 0 {
            return Err(Error::config("ec_protect cache_size must be nonzero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> StoreConfig {
        StoreConfig {
            num_blocks: 1024,
            http: HttpConfig {
                bucket: "blocks".to_string(),
                ..HttpConfig::default()
            },
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_default_config_validates() {
        base_config().validate().unwrap();
    }

    #[test]
    fn test_rejects_non_power_of_two_block_size() {
        let mut cfg = base_config();
        cfg.block_size = 4097;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_missing_bucket() {
        let mut cfg = base_config();
        cfg.http.bucket.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_max_dirty_above_cache_size() {
        let mut cfg = base_config();
        let cache = cfg.block_cache.as_mut().unwrap();
        cache.cache_size = 10;
        cache.max_dirty = 11;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_geometry_means_adopt() {
        let mut cfg = base_config();
        cfg.block_size = 0;
        cfg.num_blocks = 0;
        cfg.validate().unwrap();
    }
}
