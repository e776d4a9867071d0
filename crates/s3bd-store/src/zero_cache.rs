//! Zero-block cache
//!
//! Keeps one bit per block recording "this block is known to be all-zero"
//! and uses it to elide I/O: reads of known-zero blocks are served locally,
//! writes of all-zero payloads become downstream deletions (or nothing at
//! all when the block is already known zero). The bitmap is seeded at
//! startup from a listing of the bucket; above a configured size the layer
//! degrades to a pass-through so the bitmap cannot eat unbounded memory.
//!
//! A bit is only mutated after the corresponding downstream call has
//! succeeded, so the bitmap never claims more than the bucket can back up.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use s3bd_common::{is_all_zero, Bitmap, BlockHash, Error, Result, ZeroCacheConfig};

use crate::store::{BlockIndex, BlockStore, ReadOutcome};

/// Bitmap layer over known all-zero blocks
pub struct ZeroCache {
    lower: Arc<dyn BlockStore>,
    /// `None` when the store is too large for a bitmap; everything passes
    /// straight through in that case.
    bits: Option<Mutex<Bitmap>>,
    block_size: usize,
    num_blocks: u64,
    zero_hash: BlockHash,
}

impl ZeroCache {
    /// Build the layer, seeding the bitmap from `list_blocks` below:
    /// every listed block is marked non-zero, the rest start out zero.
    pub fn new(
        lower: Arc<dyn BlockStore>,
        cfg: &ZeroCacheConfig,
        block_size: usize,
        num_blocks: u64,
    ) -> Result<Self> {
        let bits = if num_blocks > cfg.max_blocks {
            warn!(
                num_blocks,
                max = cfg.max_blocks,
                "store too large for a zero bitmap, zero cache disabled"
            );
            None
        } else {
            let mut bitmap = Bitmap::new(num_blocks, true);
            lower.list_blocks(&mut |idx| {
                if idx < num_blocks {
                    bitmap.clear(idx);
                }
            })?;
            info!(
                zero = bitmap.set_count(),
                total = num_blocks,
                "zero bitmap seeded from bucket listing"
            );
            Some(Mutex::new(bitmap))
        };

        Ok(Self {
            lower,
            bits,
            block_size,
            num_blocks,
            zero_hash: BlockHash::compute(&vec![0u8; block_size]),
        })
    }

    fn check_bounds(&self, idx: BlockIndex) -> Result<()> {
        if idx >= self.num_blocks {
            return Err(Error::invalid_argument(format!(
                "block index {idx} out of range [0, {})",
                self.num_blocks
            )));
        }
        Ok(())
    }
}

impl BlockStore for ZeroCache {
    fn read_block(
        &self,
        idx: BlockIndex,
        buf: &mut [u8],
        expect: Option<&BlockHash>,
    ) -> Result<ReadOutcome> {
        self.check_bounds(idx)?;
        if buf.len() != self.block_size {
            return Err(Error::invalid_argument(format!(
                "buffer is {} bytes, block size is {}",
                buf.len(),
                self.block_size
            )));
        }

        if let Some(bits) = &self.bits {
            if bits.lock().get(idx) {
                if expect == Some(&self.zero_hash) {
                    return Ok(ReadOutcome::Unchanged);
                }
                buf.fill(0);
                return Ok(ReadOutcome::Data);
            }
        }

        match self.lower.read_block(idx, buf, expect) {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_not_found() => {
                // Learned something: the object is absent, so the block is
                // zero. Record it and serve zeros. Without a bitmap the
                // layer is a pure pass-through and the error propagates.
                let Some(bits) = &self.bits else {
                    return Err(e);
                };
                bits.lock().set(idx);
                if expect == Some(&self.zero_hash) {
                    return Ok(ReadOutcome::Unchanged);
                }
                buf.fill(0);
                Ok(ReadOutcome::Data)
            }
            Err(e) => Err(e),
        }
    }

    fn write_block(&self, idx: BlockIndex, data: Option<&[u8]>) -> Result<Option<BlockHash>> {
        self.check_bounds(idx)?;
        let zero = match data {
            Some(d) => {
                if d.len() != self.block_size {
                    return Err(Error::invalid_argument(format!(
                        "payload is {} bytes, block size is {}",
                        d.len(),
                        self.block_size
                    )));
                }
                is_all_zero(d)
            }
            None => true,
        };

        if zero {
            if let Some(bits) = &self.bits {
                if bits.lock().get(idx) {
                    // Already known zero; nothing to do downstream.
                    debug!(idx, "elided zero write of known-zero block");
                    return Ok(None);
                }
            }
            self.lower.write_block(idx, None)?;
            if let Some(bits) = &self.bits {
                bits.lock().set(idx);
            }
            Ok(None)
        } else {
            let hash = self.lower.write_block(idx, data)?;
            if let Some(bits) = &self.bits {
                bits.lock().clear(idx);
            }
            Ok(hash)
        }
    }

    fn list_blocks(&self, sink: &mut dyn FnMut(BlockIndex)) -> Result<()> {
        self.lower.list_blocks(sink)
    }

    fn flush(&self) -> Result<()> {
        self.lower.flush()
    }

    fn survey_non_zero(&self, sink: &mut dyn FnMut(BlockIndex)) -> Result<()> {
        match &self.bits {
            Some(bits) => {
                bits.lock().for_each_clear(|idx| sink(idx));
                Ok(())
            }
            None => self.lower.survey_non_zero(sink),
        }
    }

    fn shutdown(&self) -> Result<()> {
        self.lower.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStore;

    const BS: usize = 512;

    fn zero_cache_over(mem: &Arc<MemStore>) -> ZeroCache {
        ZeroCache::new(
            Arc::clone(mem) as Arc<dyn BlockStore>,
            &ZeroCacheConfig::default(),
            BS,
            64,
        )
        .unwrap()
    }

    #[test]
    fn test_known_zero_read_skips_downstream() {
        let mem = Arc::new(MemStore::new(BS));
        let zc = zero_cache_over(&mem);

        let mut buf = vec![0xffu8; BS];
        assert_eq!(zc.read_block(3, &mut buf, None).unwrap(), ReadOutcome::Data);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(mem.gets(), 0);
    }

    #[test]
    fn test_seeding_marks_present_blocks_non_zero() {
        let mem = Arc::new(MemStore::new(BS));
        mem.insert(7, &[1u8; BS]);
        let zc = zero_cache_over(&mem);

        let mut buf = vec![0u8; BS];
        zc.read_block(7, &mut buf, None).unwrap();
        assert_eq!(buf[0], 1);
        assert_eq!(mem.gets(), 1);
    }

    #[test]
    fn test_zero_write_deletes_and_sets_bit() {
        let mem = Arc::new(MemStore::new(BS));
        mem.insert(2, &[1u8; BS]);
        let zc = zero_cache_over(&mem);

        zc.write_block(2, Some(&[0u8; BS])).unwrap();
        assert_eq!(mem.deletes(), 1);
        assert_eq!(mem.block_count(), 0);

        // Now served locally.
        let mut buf = vec![0xffu8; BS];
        zc.read_block(2, &mut buf, None).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(mem.gets(), 0);
    }

    #[test]
    fn test_repeated_zero_write_is_elided() {
        let mem = Arc::new(MemStore::new(BS));
        let zc = zero_cache_over(&mem);

        // Bit is already set from seeding; no DELETE goes out.
        zc.write_block(5, None).unwrap();
        zc.write_block(5, Some(&[0u8; BS])).unwrap();
        assert_eq!(mem.deletes(), 0);
    }

    #[test]
    fn test_non_zero_write_clears_bit() {
        let mem = Arc::new(MemStore::new(BS));
        let zc = zero_cache_over(&mem);

        zc.write_block(4, Some(&[9u8; BS])).unwrap();
        let mut buf = vec![0u8; BS];
        zc.read_block(4, &mut buf, None).unwrap();
        assert_eq!(buf[0], 9);
        assert_eq!(mem.gets(), 1);
    }

    #[test]
    fn test_bit_not_set_when_delete_fails() {
        let mem = Arc::new(MemStore::new(BS));
        mem.insert(1, &[1u8; BS]);
        let zc = zero_cache_over(&mem);

        mem.fail_next(crate::mem::FaultOp::Write, Error::Io("down".into()), 1);
        assert!(zc.write_block(1, None).is_err());

        // Still treated as non-zero; the read goes downstream.
        let mut buf = vec![0u8; BS];
        zc.read_block(1, &mut buf, None).unwrap();
        assert_eq!(buf[0], 1);
    }

    #[test]
    fn test_not_found_learned_as_zero() {
        let mem = Arc::new(MemStore::new(BS));
        mem.insert(6, &[1u8; BS]);
        let zc = zero_cache_over(&mem);

        // Object vanishes behind our back; bit for 6 is clear.
        mem.write_block(6, None).unwrap();

        let mut buf = vec![0xffu8; BS];
        zc.read_block(6, &mut buf, None).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        // Second read is local.
        let gets = mem.gets();
        zc.read_block(6, &mut buf, None).unwrap();
        assert_eq!(mem.gets(), gets);
    }

    #[test]
    fn test_survey_reports_complement() {
        let mem = Arc::new(MemStore::new(BS));
        mem.insert(1, &[1u8; BS]);
        mem.insert(3, &[1u8; BS]);
        let zc = zero_cache_over(&mem);

        let mut seen = Vec::new();
        zc.survey_non_zero(&mut |i| seen.push(i)).unwrap();
        assert_eq!(seen, vec![1, 3]);
    }

    #[test]
    fn test_oversized_store_passes_through() {
        let mem = Arc::new(MemStore::new(BS));
        let cfg = ZeroCacheConfig { max_blocks: 16 };
        let zc = ZeroCache::new(Arc::clone(&mem) as Arc<dyn BlockStore>, &cfg, BS, 64).unwrap();

        // No bitmap: absent blocks surface NotFound from below.
        let mut buf = vec![0u8; BS];
        assert!(zc.read_block(0, &mut buf, None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_conditional_read_of_zero_block() {
        let mem = Arc::new(MemStore::new(BS));
        let zc = zero_cache_over(&mem);

        let zero_hash = BlockHash::compute(&[0u8; BS]);
        let mut buf = vec![0xffu8; BS];
        assert_eq!(
            zc.read_block(0, &mut buf, Some(&zero_hash)).unwrap(),
            ReadOutcome::Unchanged
        );
        assert_eq!(buf[0], 0xff);
    }
}
