//! s3bd: a remote object-storage bucket as a local block device
//!
//! This crate assembles the layered store the other crates provide:
//!
//! ```text
//! create_store(config)
//!   └─ ReadOnlyGuard (only when read_only)
//!       └─ BlockCache          s3bd-store
//!           └─ ZeroCache       s3bd-store
//!               └─ EcProtect   s3bd-store
//!                   └─ HttpStore   s3bd-http
//! ```
//!
//! Each middle layer is omitted when its configuration section is `None`.
//! The device bridge on top (NBD, FUSE, whatever) talks only to the
//! returned [`BlockStore`] trait object.

use std::sync::Arc;

use s3bd_common::{Clock, Error, Result, StoreConfig, SystemClock};
use s3bd_http::{CredentialsProvider, HttpStore, IamRoleProvider, StaticCredentials};
use s3bd_store::{BlockCache, BlockStore, EcProtect, ZeroCache};

pub use s3bd_common as common;
pub use s3bd_http as http;
pub use s3bd_store as store;

pub use s3bd_common::{BlockHash, StoreConfig as Config};
pub use s3bd_store::{BlockIndex, ReadOutcome};

/// Build the full stack against the configured bucket.
///
/// Credentials come from the configuration: static keys, or an IAM role
/// polled from instance metadata. The wall clock drives the write-back
/// and consistency-window timers.
pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn BlockStore>> {
    config.validate()?;
    let creds: Arc<dyn CredentialsProvider> = if let Some(role) = &config.http.iam_role {
        let provider = IamRoleProvider::new(role.clone(), None)?;
        provider
    } else {
        match (&config.http.access_key, &config.http.secret_key) {
            (Some(access), Some(secret)) => {
                let provider = Arc::new(StaticCredentials::new(
                    access.clone(),
                    secret.clone(),
                    config.http.session_token.clone(),
                ));
                provider
            }
            _ => {
                return Err(Error::config(
                    "either access_key/secret_key or iam_role must be configured",
                ));
            }
        }
    };
    create_store_with(config, creds, Arc::new(SystemClock::new()))
}

/// [`create_store`] with an injected credential provider and clock.
pub fn create_store_with(
    config: &StoreConfig,
    creds: Arc<dyn CredentialsProvider>,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn BlockStore>> {
    config.validate()?;
    let bottom = HttpStore::open(
        &config.http,
        config.block_size,
        config.num_blocks,
        config.read_only,
        creds,
    )?;
    let block_size = bottom.block_size();
    let num_blocks = bottom.num_blocks();
    build_stack(bottom, config, block_size, num_blocks, clock)
}

/// Stack the configured upper layers over an arbitrary bottom layer.
///
/// Exposed so tests (and alternative backends) can assemble the same
/// stack over something other than the HTTP store.
pub fn build_stack(
    bottom: Arc<dyn BlockStore>,
    config: &StoreConfig,
    block_size: usize,
    num_blocks: u64,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn BlockStore>> {
    let mut stack: Arc<dyn BlockStore> = bottom;
    if let Some(ec_cfg) = &config.ec_protect {
        let layer: Arc<dyn BlockStore> = EcProtect::new(stack, ec_cfg.clone(), Arc::clone(&clock))?;
        stack = layer;
    }
    if let Some(zc_cfg) = &config.zero_cache {
        stack = Arc::new(ZeroCache::new(stack, zc_cfg, block_size, num_blocks)?);
    }
    if let Some(bc_cfg) = &config.block_cache {
        stack = Arc::new(BlockCache::new(
            stack,
            bc_cfg.clone(),
            block_size,
            num_blocks,
            clock,
        )?);
    }
    if config.read_only {
        stack = Arc::new(ReadOnlyGuard { inner: stack });
    }
    Ok(stack)
}

/// Rejects mutations before they reach the stack, so a read-only store
/// never buffers a write or contacts the network for one.
struct ReadOnlyGuard {
    inner: Arc<dyn BlockStore>,
}

impl BlockStore for ReadOnlyGuard {
    fn read_block(
        &self,
        idx: BlockIndex,
        buf: &mut [u8],
        expect: Option<&BlockHash>,
    ) -> Result<ReadOutcome> {
        self.inner.read_block(idx, buf, expect)
    }

    fn write_block(&self, _idx: BlockIndex, _data: Option<&[u8]>) -> Result<Option<BlockHash>> {
        Err(Error::ReadOnly)
    }

    fn list_blocks(&self, sink: &mut dyn FnMut(BlockIndex)) -> Result<()> {
        self.inner.list_blocks(sink)
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    fn survey_non_zero(&self, sink: &mut dyn FnMut(BlockIndex)) -> Result<()> {
        self.inner.survey_non_zero(sink)
    }

    fn shutdown(&self) -> Result<()> {
        self.inner.shutdown()
    }
}
