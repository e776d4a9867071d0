//! The uniform block-store contract
//!
//! Every layer of the stack satisfies this trait. Blocks are fixed-size;
//! a block is identified by its index in `[0, num_blocks)`.

use s3bd_common::{BlockHash, Result};

/// Block index within the store
pub type BlockIndex = u64;

/// Outcome of a successful read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The buffer was filled with the block's payload
    Data,
    /// The caller's expected hash matched; the buffer was not touched
    Unchanged,
}

/// One layer of the block store stack.
///
/// Layers own the layer below them; dropping the top of a stack tears the
/// whole stack down.
pub trait BlockStore: Send + Sync {
    /// Read block `idx` into `buf` (which must be exactly one block long).
    ///
    /// When `expect` is given and the block's current content hash matches,
    /// the layer may return [`ReadOutcome::Unchanged`] without filling the
    /// buffer. Reading a never-written block fails with
    /// [`s3bd_common::Error::NotFound`]; layers above the zero cache never
    /// observe that error.
    fn read_block(
        &self,
        idx: BlockIndex,
        buf: &mut [u8],
        expect: Option<&BlockHash>,
    ) -> Result<ReadOutcome>;

    /// Write block `idx`. `None` means all-zero, which the bottom layers
    /// represent by deleting the object. On success the block is durable
    /// at the next layer down, or queued such that [`BlockStore::flush`]
    /// will make it so.
    ///
    /// Returns the content hash of the stored payload when the layer has
    /// it at hand; write-back layers return `None`.
    fn write_block(&self, idx: BlockIndex, data: Option<&[u8]>) -> Result<Option<BlockHash>>;

    /// Enumerate blocks known to be present (allocated, non-zero), in no
    /// particular order. The bottom layer scans the bucket.
    fn list_blocks(&self, sink: &mut dyn FnMut(BlockIndex)) -> Result<()>;

    /// Fence: on return, every write acknowledged before the call has been
    /// propagated all the way down.
    fn flush(&self) -> Result<()>;

    /// Report blocks currently known not to be all-zero.
    fn survey_non_zero(&self, sink: &mut dyn FnMut(BlockIndex)) -> Result<()>;

    /// Quiesce: drain in-flight work, flush dirty state, reject new
    /// submissions. Idempotent. Release of resources happens on drop.
    fn shutdown(&self) -> Result<()>;
}
