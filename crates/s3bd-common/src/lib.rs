//! Shared types for s3bd
//!
//! s3bd presents a remote object-storage bucket as a fixed-size local block
//! device. This crate holds the pieces every layer of that stack needs:
//! the common error type, configuration structures, MD5 content hashes,
//! the injected clock, and a dense bitmap.

pub mod bitmap;
pub mod clock;
pub mod config;
pub mod error;
pub mod hash;

pub use bitmap::Bitmap;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BlockCacheConfig, EcProtectConfig, EncryptionConfig, HttpConfig, KeyLength, StoreConfig,
    ZeroCacheConfig,
};
pub use error::{Error, Result};
pub use hash::BlockHash;

/// Smallest supported block size in bytes.
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Largest supported block size in bytes (16 MiB).
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024 * 1024;

/// Returns true when every byte of `data` is zero.
///
/// Hot path for the zero cache; compare by u64 words first.
pub fn is_all_zero(data: &[u8]) -> bool {
    let mut words = data.chunks_exact(8);
    let tail = words.remainder();
    words.all(|w| u64::from_ne_bytes(w.try_into().unwrap()) == 0)
        && tail.iter().all(|&b| b == 0)
}
