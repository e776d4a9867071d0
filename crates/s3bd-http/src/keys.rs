//! Object key layout
//!
//! Block `i` lives at `{prefix}{i:0Xx}` where `X` is the smallest number
//! of hex digits that can encode `num_blocks - 1`. A reserved key next to
//! the blocks holds the store parameters.
//!
//! ```text
//! Store (prefix "blk/", 1024 blocks → 3 hex digits)
//! ├── blk/000
//! ├── blk/001
//! │   ...
//! ├── blk/3ff
//! └── blk/meta.json
//! ```

use s3bd_common::{Error, Result};

/// Reserved suffix of the store parameter object
const META_SUFFIX: &str = "meta.json";

/// Maps block indices to object keys and back
#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: String,
    width: usize,
    num_blocks: u64,
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>, num_blocks: u64) -> Result<Self> {
        if num_blocks == 0 {
            return Err(Error::config("num_blocks must be nonzero"));
        }
        Ok(Self {
            prefix: prefix.into(),
            width: hex_width(num_blocks),
            num_blocks,
        })
    }

    /// Key prefix shared by every object of this store
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Hex digits per block key
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Object key for block `idx`
    #[must_use]
    pub fn block_key(&self, idx: u64) -> String {
        format!("{}{:0width$x}", self.prefix, idx, width = self.width)
    }

    /// Key of the store parameter object
    #[must_use]
    pub fn meta_key(&self) -> String {
        Self::meta_key_for(&self.prefix)
    }

    /// Parameter object key for a prefix, usable before the block count
    /// is known.
    #[must_use]
    pub fn meta_key_for(prefix: &str) -> String {
        format!("{prefix}{META_SUFFIX}")
    }

    /// Parse a listed key back into a block index. Returns `None` for the
    /// parameter object and for keys that do not name a valid block.
    #[must_use]
    pub fn parse_block_key(&self, key: &str) -> Option<u64> {
        let rest = key.strip_prefix(&self.prefix)?;
        if rest == META_SUFFIX {
            return None;
        }
        if rest.len() != self.width {
            return None;
        }
        let idx = u64::from_str_radix(rest, 16).ok()?;
        if idx >= self.num_blocks {
            return None;
        }
        Some(idx)
    }
}

/// Smallest hex-digit count encoding `num_blocks - 1`
fn hex_width(num_blocks: u64) -> usize {
    let max = num_blocks - 1;
    let mut width = 1;
    let mut value = max >> 4;
    while value != 0 {
        width += 1;
        value >>= 4;
    }
    width
}
