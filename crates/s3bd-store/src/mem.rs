//! In-memory bottom layer
//!
//! Stands in for the HTTP layer in tests: a map of present blocks plus
//! operation counters and a scripted fault queue. Semantics mirror the
//! real bottom layer: absent blocks read as `NotFound`, zero writes
//! delete, `flush` is a no-op because writes through it are synchronous.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use s3bd_common::{is_all_zero, BlockHash, Error, Result};

use crate::store::{BlockIndex, BlockStore, ReadOutcome};

/// Which operations a scripted fault applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    Read,
    Write,
}

/// In-memory block store for tests
pub struct MemStore {
    block_size: usize,
    blocks: Mutex<BTreeMap<BlockIndex, Bytes>>,
    faults: Mutex<VecDeque<(FaultOp, Error)>>,
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    flushes: AtomicU64,
}

impl MemStore {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            blocks: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(VecDeque::new()),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Queue `count` failures for subsequent operations of kind `op`.
    pub fn fail_next(&self, op: FaultOp, error: Error, count: usize) {
        let mut faults = self.faults.lock();
        for _ in 0..count {
            faults.push_back((op, error.clone()));
        }
    }

    fn take_fault(&self, op: FaultOp) -> Option<Error> {
        let mut faults = self.faults.lock();
        if faults.front().map(|(o, _)| *o) == Some(op) {
            return faults.pop_front().map(|(_, e)| e);
        }
        None
    }

    /// Current payload of a block, if present.
    #[must_use]
    pub fn get(&self, idx: BlockIndex) -> Option<Bytes> {
        self.blocks.lock().get(&idx).cloned()
    }

    /// Directly place a block, bypassing counters. Test setup only.
    pub fn insert(&self, idx: BlockIndex, data: &[u8]) {
        self.blocks
            .lock()
            .insert(idx, Bytes::copy_from_slice(data));
    }

    /// Number of present blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }

    #[must_use]
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl BlockStore for MemStore {
    fn read_block(
        &self,
        idx: BlockIndex,
        buf: &mut [u8],
        expect: Option<&BlockHash>,
    ) -> Result<ReadOutcome> {
        if buf.len() != self.block_size {
            return Err(Error::invalid_argument(format!(
                "read buffer is {} bytes, block size is {}",
                buf.len(),
                self.block_size
            )));
        }
        self.gets.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.take_fault(FaultOp::Read) {
            return Err(e);
        }
        let blocks = self.blocks.lock();
        match blocks.get(&idx) {
            Some(data) => {
                if let Some(h) = expect {
                    if h.matches(data) {
                        return Ok(ReadOutcome::Unchanged);
                    }
                }
                buf.copy_from_slice(data);
                Ok(ReadOutcome::Data)
            }
            None => Err(Error::not_found_block(idx)),
        }
    }

    fn write_block(&self, idx: BlockIndex, data: Option<&[u8]>) -> Result<Option<BlockHash>> {
        match data {
            Some(d) if !is_all_zero(d) => {
                if d.len() != self.block_size {
                    return Err(Error::invalid_argument(format!(
                        "write payload is {} bytes, block size is {}",
                        d.len(),
                        self.block_size
                    )));
                }
                self.puts.fetch_add(1, Ordering::SeqCst);
                if let Some(e) = self.take_fault(FaultOp::Write) {
                    return Err(e);
                }
                let hash = BlockHash::compute(d);
                self.blocks.lock().insert(idx, Bytes::copy_from_slice(d));
                Ok(Some(hash))
            }
            _ => {
                self.deletes.fetch_add(1, Ordering::SeqCst);
                if let Some(e) = self.take_fault(FaultOp::Write) {
                    return Err(e);
                }
                self.blocks.lock().remove(&idx);
                Ok(None)
            }
        }
    }

    fn list_blocks(&self, sink: &mut dyn FnMut(BlockIndex)) -> Result<()> {
        for idx in self.blocks.lock().keys() {
            sink(*idx);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn survey_non_zero(&self, sink: &mut dyn FnMut(BlockIndex)) -> Result<()> {
        self.list_blocks(sink)
    }

    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_block_reads_not_found() {
        let store = MemStore::new(512);
        let mut buf = vec![0u8; 512];
        let err = store.read_block(3, &mut buf, None).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_write_read_round_trip() {
        let store = MemStore::new(512);
        let payload = vec![0xa5u8; 512];
        let hash = store.write_block(3, Some(&payload)).unwrap().unwrap();
        assert_eq!(hash, BlockHash::compute(&payload));

        let mut buf = vec![0u8; 512];
        assert_eq!(
            store.read_block(3, &mut buf, None).unwrap(),
            ReadOutcome::Data
        );
        assert_eq!(buf, payload);
    }

    #[test]
    fn test_conditional_read() {
        let store = MemStore::new(512);
        let payload = vec![7u8; 512];
        let hash = store.write_block(0, Some(&payload)).unwrap().unwrap();

        let mut buf = vec![0u8; 512];
        assert_eq!(
            store.read_block(0, &mut buf, Some(&hash)).unwrap(),
            ReadOutcome::Unchanged
        );
        // Buffer untouched
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_write_deletes() {
        let store = MemStore::new(512);
        store.write_block(9, Some(&[1u8; 512])).unwrap();
        assert_eq!(store.block_count(), 1);

        store.write_block(9, Some(&[0u8; 512])).unwrap();
        assert_eq!(store.block_count(), 0);
        assert_eq!(store.deletes(), 1);

        // Explicit zero payload
        store.write_block(9, None).unwrap();
        assert_eq!(store.deletes(), 2);
    }

    #[test]
    fn test_scripted_faults_in_order() {
        let store = MemStore::new(512);
        store.fail_next(FaultOp::Write, Error::transient("503"), 2);

        assert!(store.write_block(0, Some(&[1u8; 512])).is_err());
        assert!(store.write_block(0, Some(&[1u8; 512])).is_err());
        assert!(store.write_block(0, Some(&[1u8; 512])).is_ok());
        assert_eq!(store.puts(), 3);
    }

    #[test]
    fn test_list_blocks() {
        let store = MemStore::new(512);
        store.insert(2, &[1u8; 512]);
        store.insert(5, &[2u8; 512]);
        let mut seen = Vec::new();
        store.list_blocks(&mut |i| seen.push(i)).unwrap();
        assert_eq!(seen, vec![2, 5]);
    }
}
