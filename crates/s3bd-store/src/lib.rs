//! s3bd layered block store
//!
//! The store is a stack of layers, each implementing the same
//! [`BlockStore`] contract. From the device surface down to the network:
//!
//! ```text
//! ┌────────────────┐
//! │  Block Cache   │  write-back, read-ahead, single-flight
//! ├────────────────┤
//! │  Zero Cache    │  bitmap of known all-zero blocks
//! ├────────────────┤
//! │  EC Protect    │  read-after-write window, write serialization
//! ├────────────────┤
//! │  HTTP I/O      │  signed GET/PUT/DELETE (s3bd-http)
//! └────────────────┘
//! ```
//!
//! Each layer owns the next one down and is independently omissible.
//! This crate holds the three upper layers plus the dirty journal and an
//! in-memory backend used as the bottom layer in tests.

pub mod block_cache;
pub mod ec_protect;
pub mod journal;
pub mod mem;
pub mod store;
pub mod zero_cache;

pub use block_cache::{BlockCache, CacheStats};
pub use ec_protect::EcProtect;
pub use journal::DirtyJournal;
pub use mem::MemStore;
pub use store::{BlockIndex, BlockStore, ReadOutcome};
pub use zero_cache::ZeroCache;
