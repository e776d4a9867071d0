//! Write-back block cache
//!
//! Top layer of the stack. Caches recently accessed blocks in memory,
//! acknowledges writes before they reach the layer below, and dedups
//! concurrent requests for the same block so at most one downstream
//! operation is in flight per index.
//!
//! Entry life cycle:
//!
//! ```text
//!          read miss                 write miss
//!             │                          │
//!             ▼                          ▼
//!          READING ──write──▶ READING2   DIRTY ◀──────────────┐
//!             │                  │         │                  │
//!         fetch done         fetch done  worker takes     write during
//!             │              (discard)     │              write-back
//!             ▼                  │         ▼                  │
//!           CLEAN ◀─write-back── │      WRITING ──write──▶ WRITING2
//!             │                  ▼         │
//!           evict              DIRTY   write-back done ──▶ CLEAN
//! ```
//!
//! A worker pool drains dirty entries in FIFO order once they are at least
//! `write_delay` old, which gives rewrites of hot blocks a window to
//! coalesce. Only clean entries are evicted; the least recently used goes
//! first. Locks are never held across the layer below: workers clone the
//! entry's `Bytes` handle under the lock and do network I/O outside it.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use s3bd_common::{is_all_zero, BlockCacheConfig, BlockHash, Clock, Error, Result};

use crate::journal::DirtyJournal;
use crate::store::{BlockIndex, BlockStore, ReadOutcome};

/// Pause after a failed write-back before the entry is retried
const WRITE_RETRY_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    /// Data present and matches downstream
    Clean,
    /// Data present, write-back pending
    Dirty,
    /// A worker is propagating the entry downward
    Writing,
    /// Newer data superseded the in-flight write
    Writing2,
    /// A worker is fetching the block
    Reading,
    /// A write arrived while the fetch was in flight
    Reading2,
    /// A fetch failed; waiters collect the error, then the entry goes away
    Failed,
}

struct Entry {
    state: EntryState,
    /// Full block payload. `None` only while `Reading` or `Failed`.
    data: Option<Bytes>,
    /// Content hash, when known (fetch result or write-back result)
    hash: Option<BlockHash>,
    /// Clock reading when the entry last became dirty
    dirty_since: u64,
    /// Position in the clean LRU order; valid only while `Clean`
    lru_seq: u64,
    /// Callers blocked on this entry's state
    waiters: u32,
    /// Set when `Failed`
    error: Option<Error>,
}

impl Entry {
    fn pending(&self) -> bool {
        matches!(
            self.state,
            EntryState::Dirty | EntryState::Writing | EntryState::Writing2 | EntryState::Reading2
        )
    }
}

/// Counters exposed by [`BlockCache::stats`]
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub read_aheads: u64,
    pub evictions: u64,
    pub write_backs: u64,
    pub verify_failures: u64,
    pub clean_entries: usize,
    pub dirty_entries: usize,
    pub total_entries: usize,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    read_aheads: u64,
    evictions: u64,
    write_backs: u64,
    verify_failures: u64,
}

struct CacheState {
    entries: HashMap<BlockIndex, Entry>,
    /// Clean entries ordered oldest-first as `(lru_seq, index)`
    clean_lru: BTreeSet<(u64, BlockIndex)>,
    lru_counter: u64,
    /// Dirty entries in write-back order
    dirty_fifo: VecDeque<BlockIndex>,
    /// Entries currently in state `Dirty`
    num_dirty: usize,
    /// Entries holding unpropagated data (`Dirty`/`Writing`/`Writing2`/`Reading2`)
    num_pending: usize,
    /// Fetches queued for workers (misses and read-ahead)
    read_queue: VecDeque<BlockIndex>,
    /// Hashes of evicted clean blocks, for staleness detection on re-read
    verify: HashMap<BlockIndex, BlockHash>,
    verify_order: VecDeque<BlockIndex>,
    last_read: Option<BlockIndex>,
    seq_run: usize,
    ra_next: BlockIndex,
    /// While nonzero, `write_delay` aging is ignored
    force_flush: u32,
    stopping: bool,
    counters: Counters,
}

struct Inner {
    lower: Arc<dyn BlockStore>,
    cfg: BlockCacheConfig,
    block_size: usize,
    num_blocks: u64,
    zero_block: Bytes,
    zero_hash: BlockHash,
    clock: Arc<dyn Clock>,
    journal: Option<DirtyJournal>,
    state: Mutex<CacheState>,
    /// Entry state transitions (read waiters, flush waiters)
    entry_cond: Condvar,
    /// Slot availability: evictable entry appeared or a dirty slot freed
    space_cond: Condvar,
    /// Work available for the pool
    work_cond: Condvar,
}

/// Write-back cache layer
pub struct BlockCache {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockCache {
    /// Build the cache on top of `lower` and start the worker pool.
    ///
    /// When a journal is configured and `recover_dirty_blocks` is set,
    /// blocks recorded dirty by a previous instance are re-queued as dirty
    /// before the first operation is accepted.
    pub fn new(
        lower: Arc<dyn BlockStore>,
        cfg: BlockCacheConfig,
        block_size: usize,
        num_blocks: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        cfg.validate()?;

        let journal = match &cfg.journal_path {
            Some(path) => Some(DirtyJournal::open(path, block_size)?),
            None => {
                if cfg.recover_dirty_blocks {
                    warn!("recover_dirty_blocks set but no journal configured, ignoring");
                }
                None
            }
        };

        let zero_block = Bytes::from(vec![0u8; block_size]);
        let zero_hash = BlockHash::compute(&zero_block);

        let mut state = CacheState {
            entries: HashMap::new(),
            clean_lru: BTreeSet::new(),
            lru_counter: 0,
            dirty_fifo: VecDeque::new(),
            num_dirty: 0,
            num_pending: 0,
            read_queue: VecDeque::new(),
            verify: HashMap::new(),
            verify_order: VecDeque::new(),
            last_read: None,
            seq_run: 0,
            ra_next: 0,
            force_flush: 0,
            stopping: false,
            counters: Counters::default(),
        };

        if cfg.recover_dirty_blocks {
            if let Some(journal) = &journal {
                let now = clock.now_millis();
                for (idx, payload) in journal.recover()? {
                    if idx >= num_blocks {
                        warn!(idx, "journaled block index out of range, dropping");
                        continue;
                    }
                    let data = payload.unwrap_or_else(|| zero_block.clone());
                    state.entries.insert(
                        idx,
                        Entry {
                            state: EntryState::Dirty,
                            data: Some(data),
                            hash: None,
                            dirty_since: now,
                            lru_seq: 0,
                            waiters: 0,
                            error: None,
                        },
                    );
                    state.dirty_fifo.push_back(idx);
                    state.num_dirty += 1;
                    state.num_pending += 1;
                }
                if state.num_dirty > 0 {
                    info!(count = state.num_dirty, "flushing recovered dirty blocks");
                }
            }
        }

        let inner = Arc::new(Inner {
            lower,
            cfg,
            block_size,
            num_blocks,
            zero_block,
            zero_hash,
            clock,
            journal,
            state: Mutex::new(state),
            entry_cond: Condvar::new(),
            space_cond: Condvar::new(),
            work_cond: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(inner.cfg.num_threads);
        for n in 0..inner.cfg.num_threads {
            let inner = Arc::clone(&inner);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("s3bd-cache-{n}"))
                    .spawn(move || inner.worker_loop())
                    .map_err(|e| Error::Io(format!("spawn cache worker: {e}")))?,
            );
        }

        Ok(Self {
            inner,
            workers: Mutex::new(workers),
        })
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        let st = self.inner.state.lock();
        CacheStats {
            hits: st.counters.hits,
            misses: st.counters.misses,
            read_aheads: st.counters.read_aheads,
            evictions: st.counters.evictions,
            write_backs: st.counters.write_backs,
            verify_failures: st.counters.verify_failures,
            clean_entries: st.clean_lru.len(),
            dirty_entries: st.num_dirty,
            total_entries: st.entries.len(),
        }
    }

    fn check_bounds(&self, idx: BlockIndex, buf_len: Option<usize>) -> Result<()> {
        if idx >= self.inner.num_blocks {
            return Err(Error::invalid_argument(format!(
                "block index {idx} out of range [0, {})",
                self.inner.num_blocks
            )));
        }
        if let Some(len) = buf_len {
            if len != self.inner.block_size {
                return Err(Error::invalid_argument(format!(
                    "buffer is {len} bytes, block size is {}",
                    self.inner.block_size
                )));
            }
        }
        Ok(())
    }

    /// Write-through path used in synchronous mode.
    fn write_through(&self, idx: BlockIndex, payload: Bytes) -> Result<Option<BlockHash>> {
        let inner = &self.inner;
        {
            let st = inner.state.lock();
            if st.stopping {
                return Err(Error::Shutdown);
            }
        }
        let arg = if is_all_zero(&payload) {
            None
        } else {
            Some(&payload[..])
        };
        let hash = inner.lower.write_block(idx, arg)?;

        // Reconcile the cache with what is now downstream.
        let mut st = inner.state.lock();
        match st.entries.get(&idx).map(|e| e.state) {
            None => {
                if st.entries.len() < inner.cfg.cache_size {
                    inner.insert_clean(&mut st, idx, payload, hash);
                }
            }
            Some(EntryState::Clean) => {
                let e = st.entries.get_mut(&idx).unwrap();
                e.data = Some(payload);
                e.hash = hash;
                inner.touch_lru(&mut st, idx);
            }
            Some(EntryState::Reading) => {
                // The in-flight fetch would clobber this write; mark the
                // entry so its result is discarded.
                let e = st.entries.get_mut(&idx).unwrap();
                e.state = EntryState::Reading2;
                e.data = Some(payload);
                e.hash = hash;
                st.num_pending += 1;
            }
            // Buffered data is newer than ours; leave it alone.
            _ => {}
        }
        Ok(hash)
    }
}

impl BlockStore for BlockCache {
    fn read_block(
        &self,
        idx: BlockIndex,
        buf: &mut [u8],
        expect: Option<&BlockHash>,
    ) -> Result<ReadOutcome> {
        self.check_bounds(idx, Some(buf.len()))?;
        let inner = &self.inner;
        let mut missed = false;
        let mut st = inner.state.lock();
        loop {
            if st.stopping {
                return Err(Error::Shutdown);
            }
            match st.entries.get(&idx).map(|e| e.state) {
                Some(
                    EntryState::Clean
                    | EntryState::Dirty
                    | EntryState::Writing
                    | EntryState::Writing2,
                ) => {
                    if !missed {
                        st.counters.hits += 1;
                    }
                    let (data, hash, is_clean) = {
                        let e = st.entries.get(&idx).unwrap();
                        (
                            e.data.clone().expect("readable entry has data"),
                            e.hash,
                            e.state == EntryState::Clean,
                        )
                    };
                    if is_clean {
                        inner.touch_lru(&mut st, idx);
                    }
                    inner.note_sequential(&mut st, idx);
                    drop(st);

                    if let Some(exp) = expect {
                        let matched = match hash {
                            Some(h) => h == *exp,
                            None => exp.matches(&data),
                        };
                        if matched {
                            return Ok(ReadOutcome::Unchanged);
                        }
                    }
                    buf.copy_from_slice(&data);
                    return Ok(ReadOutcome::Data);
                }
                Some(EntryState::Reading | EntryState::Reading2) => {
                    st.entries.get_mut(&idx).unwrap().waiters += 1;
                    inner.entry_cond.wait(&mut st);
                    if let Some(e) = st.entries.get_mut(&idx) {
                        e.waiters -= 1;
                    }
                }
                Some(EntryState::Failed) => {
                    let (err, lone) = {
                        let e = st.entries.get(&idx).unwrap();
                        (
                            e.error
                                .clone()
                                .unwrap_or_else(|| Error::Io("block fetch failed".into())),
                            e.waiters == 0,
                        )
                    };
                    if lone {
                        st.entries.remove(&idx);
                        inner.space_cond.notify_all();
                        inner.entry_cond.notify_all();
                    }
                    return Err(err);
                }
                None => {
                    if !inner.ensure_slot(&mut st) {
                        continue;
                    }
                    missed = true;
                    st.counters.misses += 1;
                    inner.insert_reading(&mut st, idx);
                    st.read_queue.push_back(idx);
                    inner.work_cond.notify_one();
                    inner.note_sequential(&mut st, idx);
                    // Loop around and wait for the fetch.
                }
            }
        }
    }

    fn write_block(&self, idx: BlockIndex, data: Option<&[u8]>) -> Result<Option<BlockHash>> {
        self.check_bounds(idx, data.map(<[u8]>::len))?;
        let inner = &self.inner;
        let payload = match data {
            Some(d) if !is_all_zero(d) => Bytes::copy_from_slice(d),
            _ => inner.zero_block.clone(),
        };

        if inner.cfg.synchronous {
            return self.write_through(idx, payload);
        }

        let now = inner.clock.now_millis();
        let mut st = inner.state.lock();
        loop {
            if st.stopping {
                return Err(Error::Shutdown);
            }
            match st.entries.get(&idx).map(|e| e.state) {
                None => {
                    if st.num_dirty >= inner.cfg.max_dirty {
                        inner.space_cond.wait(&mut st);
                        continue;
                    }
                    if !inner.ensure_slot(&mut st) {
                        continue;
                    }
                    inner.log_write(idx, &payload)?;
                    st.entries.insert(
                        idx,
                        Entry {
                            state: EntryState::Dirty,
                            data: Some(payload),
                            hash: None,
                            dirty_since: now,
                            lru_seq: 0,
                            waiters: 0,
                            error: None,
                        },
                    );
                    st.dirty_fifo.push_back(idx);
                    st.num_dirty += 1;
                    st.num_pending += 1;
                    inner.work_cond.notify_one();
                    return Ok(None);
                }
                Some(EntryState::Clean) => {
                    if st.num_dirty >= inner.cfg.max_dirty {
                        inner.space_cond.wait(&mut st);
                        continue;
                    }
                    inner.log_write(idx, &payload)?;
                    inner.unlink_lru(&mut st, idx);
                    let e = st.entries.get_mut(&idx).unwrap();
                    e.state = EntryState::Dirty;
                    e.data = Some(payload);
                    e.hash = None;
                    e.dirty_since = now;
                    st.dirty_fifo.push_back(idx);
                    st.num_dirty += 1;
                    st.num_pending += 1;
                    inner.work_cond.notify_one();
                    return Ok(None);
                }
                Some(EntryState::Dirty) => {
                    // Coalesce in place; FIFO position and age are kept so
                    // a constantly rewritten block still gets written out.
                    inner.log_write(idx, &payload)?;
                    let e = st.entries.get_mut(&idx).unwrap();
                    e.data = Some(payload);
                    e.hash = None;
                    return Ok(None);
                }
                Some(EntryState::Writing) => {
                    inner.log_write(idx, &payload)?;
                    let e = st.entries.get_mut(&idx).unwrap();
                    e.state = EntryState::Writing2;
                    e.data = Some(payload);
                    e.hash = None;
                    e.dirty_since = now;
                    return Ok(None);
                }
                Some(EntryState::Writing2 | EntryState::Reading2) => {
                    inner.log_write(idx, &payload)?;
                    let e = st.entries.get_mut(&idx).unwrap();
                    e.data = Some(payload);
                    e.hash = None;
                    return Ok(None);
                }
                Some(EntryState::Reading) => {
                    inner.log_write(idx, &payload)?;
                    let e = st.entries.get_mut(&idx).unwrap();
                    e.state = EntryState::Reading2;
                    e.data = Some(payload);
                    e.hash = None;
                    st.num_pending += 1;
                    return Ok(None);
                }
                Some(EntryState::Failed) => {
                    let lone = st.entries.get(&idx).map(|e| e.waiters == 0).unwrap_or(true);
                    if lone {
                        st.entries.remove(&idx);
                        inner.space_cond.notify_all();
                        inner.entry_cond.notify_all();
                    } else {
                        inner.entry_cond.wait(&mut st);
                    }
                }
            }
        }
    }

    fn list_blocks(&self, sink: &mut dyn FnMut(BlockIndex)) -> Result<()> {
        let (mut present, zero_pending) = self.inner.pending_split();
        self.inner.lower.list_blocks(&mut |i| {
            present.insert(i);
        })?;
        for idx in &present {
            if !zero_pending.contains(idx) {
                sink(*idx);
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        if st.stopping {
            return Err(Error::Shutdown);
        }
        st.force_flush += 1;
        inner.work_cond.notify_all();
        while st.num_pending > 0 {
            inner.entry_cond.wait(&mut st);
        }
        st.force_flush -= 1;
        if let Some(journal) = &inner.journal {
            journal.checkpoint()?;
        }
        drop(st);
        inner.lower.flush()
    }

    fn survey_non_zero(&self, sink: &mut dyn FnMut(BlockIndex)) -> Result<()> {
        let (mut present, zero_pending) = self.inner.pending_split();
        self.inner.lower.survey_non_zero(&mut |i| {
            present.insert(i);
        })?;
        for idx in &present {
            if !zero_pending.contains(idx) {
                sink(*idx);
            }
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        {
            let st = self.inner.state.lock();
            if st.stopping {
                return Ok(());
            }
        }
        self.flush()?;
        {
            let mut st = self.inner.state.lock();
            st.stopping = true;
            self.inner.work_cond.notify_all();
            self.inner.entry_cond.notify_all();
            self.inner.space_cond.notify_all();
        }
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.join();
        }
        self.inner.lower.shutdown()
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("block cache shutdown on drop failed: {e}");
        }
    }
}

type Guard<'a> = MutexGuard<'a, CacheState>;

impl Inner {
    fn log_write(&self, idx: BlockIndex, payload: &Bytes) -> Result<()> {
        if let Some(journal) = &self.journal {
            let arg = if is_all_zero(payload) {
                None
            } else {
                Some(&payload[..])
            };
            journal.log_write(idx, arg)?;
        }
        Ok(())
    }

    fn insert_reading(&self, st: &mut Guard<'_>, idx: BlockIndex) {
        st.entries.insert(
            idx,
            Entry {
                state: EntryState::Reading,
                data: None,
                hash: None,
                dirty_since: 0,
                lru_seq: 0,
                waiters: 0,
                error: None,
            },
        );
    }

    fn insert_clean(
        &self,
        st: &mut Guard<'_>,
        idx: BlockIndex,
        data: Bytes,
        hash: Option<BlockHash>,
    ) {
        st.lru_counter += 1;
        let seq = st.lru_counter;
        st.entries.insert(
            idx,
            Entry {
                state: EntryState::Clean,
                data: Some(data),
                hash,
                dirty_since: 0,
                lru_seq: seq,
                waiters: 0,
                error: None,
            },
        );
        st.clean_lru.insert((seq, idx));
        self.space_cond.notify_all();
    }

    /// Move a clean entry to the most-recently-used position.
    fn touch_lru(&self, st: &mut Guard<'_>, idx: BlockIndex) {
        let old_seq = match st.entries.get(&idx) {
            Some(e) if e.state == EntryState::Clean => e.lru_seq,
            _ => return,
        };
        st.clean_lru.remove(&(old_seq, idx));
        st.lru_counter += 1;
        let seq = st.lru_counter;
        st.entries.get_mut(&idx).unwrap().lru_seq = seq;
        st.clean_lru.insert((seq, idx));
    }

    /// Remove a clean entry from the LRU order before it changes state.
    fn unlink_lru(&self, st: &mut Guard<'_>, idx: BlockIndex) {
        if let Some(e) = st.entries.get(&idx) {
            let pair = (e.lru_seq, idx);
            st.clean_lru.remove(&pair);
        }
    }

    /// Make room for one more entry: free slot, evict the LRU clean entry,
    /// or wait. Returns false after waiting so the caller revalidates.
    fn ensure_slot(&self, st: &mut Guard<'_>) -> bool {
        if st.entries.len() < self.cfg.cache_size {
            return true;
        }
        // Oldest clean entry nobody is still waking up on.
        let victim = st.clean_lru.iter().copied().find(|(_, idx)| {
            st.entries.get(idx).map(|e| e.waiters == 0).unwrap_or(true)
        });
        if let Some((seq, idx)) = victim {
            st.clean_lru.remove(&(seq, idx));
            if let Some(e) = st.entries.remove(&idx) {
                debug_assert_eq!(e.state, EntryState::Clean);
                if !self.cfg.no_verify {
                    if let Some(hash) = e.hash {
                        self.remember_hash(st, idx, hash);
                    }
                }
                st.counters.evictions += 1;
            }
            return true;
        }
        self.space_cond.wait(st);
        false
    }

    fn remember_hash(&self, st: &mut Guard<'_>, idx: BlockIndex, hash: BlockHash) {
        if self.cfg.md5_cache_size == 0 {
            return;
        }
        while st.verify.len() >= self.cfg.md5_cache_size {
            match st.verify_order.pop_front() {
                Some(old) => {
                    st.verify.remove(&old);
                }
                None => break,
            }
        }
        if st.verify.insert(idx, hash).is_none() {
            st.verify_order.push_back(idx);
        }
    }

    /// Track the sequential-read heuristic and queue read-ahead fetches.
    fn note_sequential(&self, st: &mut Guard<'_>, idx: BlockIndex) {
        if self.cfg.read_ahead == 0 {
            return;
        }
        match st.last_read {
            Some(last) if idx == last.wrapping_add(1) => st.seq_run += 1,
            _ => {
                st.seq_run = 1;
                st.ra_next = idx + 1;
            }
        }
        st.last_read = Some(idx);
        if st.seq_run < self.cfg.read_ahead_trigger.max(1) {
            return;
        }
        let limit = (idx + 1 + self.cfg.read_ahead as u64).min(self.num_blocks);
        let start = st.ra_next.max(idx + 1);
        let mut queued = false;
        for next in start..limit {
            if st.entries.contains_key(&next) {
                continue;
            }
            // Read-ahead only uses free slots; it never evicts.
            if st.entries.len() >= self.cfg.cache_size {
                break;
            }
            self.insert_reading(st, next);
            st.read_queue.push_back(next);
            st.counters.read_aheads += 1;
            queued = true;
        }
        if limit > st.ra_next {
            st.ra_next = limit;
        }
        if queued {
            self.work_cond.notify_all();
        }
    }

    /// Indices holding unpropagated data, split into non-zero and zero
    /// payloads. Zero payloads become deletions downstream, so listings
    /// must hide them.
    fn pending_split(&self) -> (BTreeSet<BlockIndex>, BTreeSet<BlockIndex>) {
        let st = self.state.lock();
        let mut present = BTreeSet::new();
        let mut zero = BTreeSet::new();
        for (idx, e) in &st.entries {
            if e.pending() {
                match &e.data {
                    Some(d) if !is_all_zero(d) => {
                        present.insert(*idx);
                    }
                    _ => {
                        zero.insert(*idx);
                    }
                }
            }
        }
        (present, zero)
    }

    // ── worker pool ───────────────────────────────────────────────────────

    fn worker_loop(&self) {
        let mut st = self.state.lock();
        loop {
            if let Some(idx) = st.read_queue.pop_front() {
                drop(st);
                self.do_fetch(idx);
                st = self.state.lock();
                continue;
            }
            if let Some(idx) = self.take_eligible_dirty(&mut st) {
                let data = st
                    .entries
                    .get(&idx)
                    .and_then(|e| e.data.clone())
                    .expect("writing entry has data");
                drop(st);
                self.do_store(idx, data);
                st = self.state.lock();
                continue;
            }
            if st.stopping {
                break;
            }
            match self.millis_until_eligible(&st) {
                Some(0) => {} // became eligible; loop
                Some(ms) => {
                    let _ = self.work_cond.wait_for(&mut st, Duration::from_millis(ms));
                }
                None => self.work_cond.wait(&mut st),
            }
        }
    }

    /// Pop the oldest dirty entry if it has aged past `write_delay`
    /// (or a flush is forcing the issue) and mark it `Writing`.
    fn take_eligible_dirty(&self, st: &mut Guard<'_>) -> Option<BlockIndex> {
        let now = self.clock.now_millis();
        loop {
            let idx = *st.dirty_fifo.front()?;
            let (state, since) = match st.entries.get(&idx) {
                Some(e) => (e.state, e.dirty_since),
                None => {
                    st.dirty_fifo.pop_front();
                    continue;
                }
            };
            if state != EntryState::Dirty {
                st.dirty_fifo.pop_front();
                continue;
            }
            let eligible = st.force_flush > 0
                || st.stopping
                || now.saturating_sub(since) >= self.cfg.write_delay_ms;
            if !eligible {
                return None;
            }
            st.dirty_fifo.pop_front();
            st.entries.get_mut(&idx).unwrap().state = EntryState::Writing;
            st.num_dirty -= 1;
            self.space_cond.notify_all();
            return Some(idx);
        }
    }

    /// Time until the oldest dirty entry becomes eligible, or `None` when
    /// there is nothing to wait for.
    fn millis_until_eligible(&self, st: &Guard<'_>) -> Option<u64> {
        let idx = *st.dirty_fifo.front()?;
        let since = st.entries.get(&idx)?.dirty_since;
        if st.force_flush > 0 {
            return Some(0);
        }
        let age = self.clock.now_millis().saturating_sub(since);
        Some(self.cfg.write_delay_ms.saturating_sub(age))
    }

    fn do_fetch(&self, idx: BlockIndex) {
        let mut buf = vec![0u8; self.block_size];
        let outcome = match self.lower.read_block(idx, &mut buf, None) {
            Ok(_) => {
                let data = Bytes::from(buf);
                let hash = if self.cfg.no_verify {
                    None
                } else {
                    Some(BlockHash::compute(&data))
                };
                Ok((data, hash))
            }
            Err(e) if e.is_not_found() => {
                // Absent object means an all-zero block.
                Ok((self.zero_block.clone(), Some(self.zero_hash)))
            }
            Err(e) => Err(e),
        };

        let mut st = self.state.lock();
        let remembered = if self.cfg.no_verify {
            None
        } else {
            let taken = st.verify.remove(&idx);
            if taken.is_some() {
                st.verify_order.retain(|i| *i != idx);
            }
            taken
        };
        let state = match st.entries.get(&idx) {
            Some(e) => e.state,
            None => return,
        };
        match state {
            EntryState::Reading => match outcome {
                Ok((data, hash)) => {
                    if let (Some(expected), Some(actual)) = (remembered, hash) {
                        if expected != actual {
                            st.counters.verify_failures += 1;
                            self.fail_entry(
                                &mut st,
                                idx,
                                Error::integrity(format!(
                                    "block {idx} content changed since eviction \
                                     (expected {expected}, got {actual})"
                                )),
                            );
                            return;
                        }
                    }
                    let e = st.entries.get_mut(&idx).unwrap();
                    e.state = EntryState::Clean;
                    e.data = Some(data);
                    e.hash = hash;
                    st.lru_counter += 1;
                    let seq = st.lru_counter;
                    st.entries.get_mut(&idx).unwrap().lru_seq = seq;
                    st.clean_lru.insert((seq, idx));
                    self.entry_cond.notify_all();
                    self.space_cond.notify_all();
                }
                Err(e) => {
                    self.fail_entry(&mut st, idx, e);
                }
            },
            EntryState::Reading2 => {
                // A write landed during the fetch; the fetched bytes are
                // stale and are discarded regardless of the outcome.
                let now = self.clock.now_millis();
                let e = st.entries.get_mut(&idx).unwrap();
                e.state = EntryState::Dirty;
                e.dirty_since = now;
                st.dirty_fifo.push_back(idx);
                st.num_dirty += 1;
                self.work_cond.notify_one();
                self.entry_cond.notify_all();
            }
            other => debug!(?other, idx, "fetch completed for entry in odd state"),
        }
    }

    fn fail_entry(&self, st: &mut Guard<'_>, idx: BlockIndex, error: Error) {
        let waiters = {
            let e = st.entries.get_mut(&idx).unwrap();
            e.state = EntryState::Failed;
            e.data = None;
            e.error = Some(error.clone());
            e.waiters
        };
        if waiters == 0 {
            // Nobody to hand the error to (read-ahead fetch).
            warn!("background fetch of block {idx} failed: {error}");
            st.entries.remove(&idx);
        }
        self.entry_cond.notify_all();
        self.space_cond.notify_all();
    }

    fn do_store(&self, idx: BlockIndex, data: Bytes) {
        let arg = if is_all_zero(&data) {
            None
        } else {
            Some(&data[..])
        };
        let result = self.lower.write_block(idx, arg);

        let mut st = self.state.lock();
        let state = match st.entries.get(&idx) {
            Some(e) => e.state,
            None => return,
        };
        match result {
            Ok(hash) => {
                match state {
                    EntryState::Writing => {
                        if let Some(journal) = &self.journal {
                            if let Err(e) = journal.log_flushed(idx) {
                                warn!("journal flush record failed: {e}");
                            }
                        }
                        let zero_hash = self.zero_hash;
                        let e = st.entries.get_mut(&idx).unwrap();
                        e.state = EntryState::Clean;
                        e.hash = hash.or(if arg.is_none() { Some(zero_hash) } else { None });
                        st.lru_counter += 1;
                        let seq = st.lru_counter;
                        st.entries.get_mut(&idx).unwrap().lru_seq = seq;
                        st.clean_lru.insert((seq, idx));
                        st.num_pending -= 1;
                        st.counters.write_backs += 1;
                        self.entry_cond.notify_all();
                        self.space_cond.notify_all();
                    }
                    EntryState::Writing2 => {
                        // Newer data arrived mid-flight; back to dirty.
                        let e = st.entries.get_mut(&idx).unwrap();
                        e.state = EntryState::Dirty;
                        st.dirty_fifo.push_back(idx);
                        st.num_dirty += 1;
                        st.counters.write_backs += 1;
                        self.work_cond.notify_one();
                    }
                    other => debug!(?other, idx, "write-back completed for entry in odd state"),
                }
            }
            Err(err) => {
                if st.stopping {
                    error!("dropping block {idx} on shutdown after failed write-back: {err}");
                    self.unlink_lru(&mut st, idx);
                    st.entries.remove(&idx);
                    st.num_pending -= 1;
                    self.entry_cond.notify_all();
                    self.space_cond.notify_all();
                } else {
                    warn!("write-back of block {idx} failed, will retry: {err}");
                    let now = self.clock.now_millis();
                    let e = st.entries.get_mut(&idx).unwrap();
                    e.state = EntryState::Dirty;
                    e.dirty_since = now;
                    st.dirty_fifo.push_back(idx);
                    st.num_dirty += 1;
                    self.work_cond.notify_one();
                    drop(st);
                    // Throttle retries of a persistently failing block.
                    std::thread::sleep(WRITE_RETRY_PAUSE);
                }
            }
        }
    }
}
