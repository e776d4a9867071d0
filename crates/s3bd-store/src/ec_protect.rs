//! Eventual-consistency protection
//!
//! The object store only promises eventual consistency: a read right after
//! a write may return stale data, and rapid repeated PUTs to one key can
//! land out of order. This layer compensates with two rules:
//!
//! 1. For `min_write_delay` after a block is written or deleted, reads of
//!    that block are served from a locally held copy of the written bytes
//!    instead of the network.
//! 2. Writes to one block are serialized. While one is in flight, newer
//!    payloads replace a single pending slot; when the in-flight write
//!    finishes, only the newest pending payload is written. Superseded
//!    payloads are acknowledged without ever touching the wire.
//!
//! After a raw read completes, the observed content hash is remembered for
//! the window so a stale re-read can at least be detected and logged.
//! Entries expire once they have been quiet for `min_write_delay`; a
//! background sweeper reclaims them and wakes callers blocked on the entry
//! bound.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use s3bd_common::{is_all_zero, BlockHash, Clock, EcProtectConfig, Error, Result};

use crate::store::{BlockIndex, BlockStore, ReadOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpState {
    /// Recently read; `hash` records what the content looked like
    Clean,
    /// A write for this block is on the wire
    Writing,
    /// A write finished less than `min_write_delay` ago
    Written,
}

/// The newest payload accepted for a block. `data: None` means all-zero
/// (a deletion downstream).
struct Held {
    data: Option<Bytes>,
    hash: Option<BlockHash>,
}

struct EpEntry {
    state: EpState,
    /// Clock reading of the last activity (read, or write completion)
    stamp: u64,
    /// Present while `Writing`/`Written`; reads in the window use it
    held: Option<Held>,
    /// Content hash last observed by a raw read (`Clean` entries)
    hash: Option<BlockHash>,
    /// Payload queued behind the in-flight write, tagged with its owner
    pending: Option<(u64, Option<Bytes>)>,
}

struct EpMap {
    entries: HashMap<BlockIndex, EpEntry>,
    /// Entries in `Writing`/`Written` state, bounded by `cache_size`
    write_count: usize,
    /// `Clean` entries, bounded by `md5_cache_size`
    clean_count: usize,
    clean_order: VecDeque<BlockIndex>,
    next_token: u64,
    stopping: bool,
}

/// Eventual-consistency protection layer
pub struct EcProtect {
    lower: Arc<dyn BlockStore>,
    cfg: EcProtectConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<EpMap>,
    cond: Condvar,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

type Guard<'a> = MutexGuard<'a, EpMap>;

impl EcProtect {
    pub fn new(
        lower: Arc<dyn BlockStore>,
        cfg: EcProtectConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;
        let layer = Arc::new(Self {
            lower,
            cfg,
            clock,
            state: Mutex::new(EpMap {
                entries: HashMap::new(),
                write_count: 0,
                clean_count: 0,
                clean_order: VecDeque::new(),
                next_token: 0,
                stopping: false,
            }),
            cond: Condvar::new(),
            sweeper: Mutex::new(None),
        });

        let sweeper = {
            let layer = Arc::clone(&layer);
            std::thread::Builder::new()
                .name("s3bd-ec-sweep".to_string())
                .spawn(move || layer.sweeper_loop())
                .map_err(|e| Error::Io(format!("spawn ec sweeper: {e}")))?
        };
        *layer.sweeper.lock() = Some(sweeper);
        Ok(layer)
    }

    fn sweeper_loop(&self) {
        let tick = Duration::from_millis(self.cfg.min_write_delay_ms.clamp(10, 1000) / 2 + 5);
        let mut st = self.state.lock();
        loop {
            if st.stopping {
                return;
            }
            self.sweep_expired(&mut st);
            let _ = self.cond.wait_for(&mut st, tick);
        }
    }

    /// Drop entries quiet for longer than the window. In-flight writes and
    /// entries with a queued payload are never reclaimed.
    fn sweep_expired(&self, st: &mut Guard<'_>) {
        let now = self.clock.now_millis();
        let delay = self.cfg.min_write_delay_ms;
        let expired: Vec<BlockIndex> = st
            .entries
            .iter()
            .filter(|(_, e)| {
                e.state != EpState::Writing
                    && e.pending.is_none()
                    && now.saturating_sub(e.stamp) >= delay
            })
            .map(|(idx, _)| *idx)
            .collect();
        if expired.is_empty() {
            return;
        }
        for idx in expired {
            if let Some(e) = st.entries.remove(&idx) {
                match e.state {
                    EpState::Clean => st.clean_count -= 1,
                    EpState::Written => st.write_count -= 1,
                    EpState::Writing => unreachable!("writing entries are not swept"),
                }
            }
        }
        self.cond.notify_all();
    }

    /// Remember the hash a raw read observed, bounded by `md5_cache_size`.
    fn record_clean(&self, st: &mut Guard<'_>, idx: BlockIndex, hash: BlockHash) {
        let now = self.clock.now_millis();
        if let Some(e) = st.entries.get_mut(&idx) {
            if e.state == EpState::Clean {
                e.hash = Some(hash);
                e.stamp = now;
            }
            // A write raced in; its window owns the entry now.
            return;
        }
        if self.cfg.md5_cache_size == 0 {
            return;
        }
        while st.clean_count >= self.cfg.md5_cache_size {
            let Some(old) = st.clean_order.pop_front() else {
                break;
            };
            if st.entries.get(&old).map(|e| e.state) == Some(EpState::Clean) {
                st.entries.remove(&old);
                st.clean_count -= 1;
            }
        }
        st.entries.insert(
            idx,
            EpEntry {
                state: EpState::Clean,
                stamp: now,
                held: None,
                hash: Some(hash),
                pending: None,
            },
        );
        st.clean_count += 1;
        st.clean_order.push_back(idx);
    }

    /// Try to take the write slot for `idx`, waiting at the entry bound.
    /// On success the entry is in `Writing` state holding `payload`.
    /// Returns false when another writer took the slot while this caller
    /// waited; the caller must dispatch again and serialize behind it.
    fn begin_write(&self, st: &mut Guard<'_>, idx: BlockIndex, payload: &Option<Bytes>) -> bool {
        loop {
            match st.entries.get(&idx).map(|e| e.state) {
                Some(EpState::Clean) => {
                    if st.write_count >= self.cfg.cache_size {
                        self.sweep_expired(st);
                        if st.write_count >= self.cfg.cache_size {
                            self.cond.wait(st);
                            continue;
                        }
                    }
                    let e = st.entries.get_mut(&idx).unwrap();
                    e.state = EpState::Writing;
                    e.held = Some(Held {
                        data: payload.clone(),
                        hash: None,
                    });
                    e.hash = None;
                    st.clean_count -= 1;
                    st.write_count += 1;
                    return true;
                }
                Some(EpState::Written) => {
                    let e = st.entries.get_mut(&idx).unwrap();
                    e.state = EpState::Writing;
                    e.held = Some(Held {
                        data: payload.clone(),
                        hash: None,
                    });
                    return true;
                }
                Some(EpState::Writing) => return false,
                None => {
                    if st.write_count >= self.cfg.cache_size {
                        self.sweep_expired(st);
                        if st.write_count >= self.cfg.cache_size {
                            self.cond.wait(st);
                            continue;
                        }
                    }
                    st.entries.insert(
                        idx,
                        EpEntry {
                            state: EpState::Writing,
                            stamp: self.clock.now_millis(),
                            held: Some(Held {
                                data: payload.clone(),
                                hash: None,
                            }),
                            hash: None,
                            pending: None,
                        },
                    );
                    st.write_count += 1;
                    return true;
                }
            }
        }
    }

    /// Perform the downstream write for `idx` with `payload`, having
    /// already marked the entry `Writing`.
    fn perform_write(&self, idx: BlockIndex, payload: Option<Bytes>) -> Result<Option<BlockHash>> {
        let result = self.lower.write_block(idx, payload.as_deref());

        let mut st = self.state.lock();
        let now = self.clock.now_millis();
        match &result {
            Ok(hash) => {
                let pending_empty = {
                    let e = st.entries.get_mut(&idx).expect("writing entry exists");
                    e.state = EpState::Written;
                    e.stamp = now;
                    if e.pending.is_none() {
                        if let Some(held) = &mut e.held {
                            held.hash = *hash;
                        }
                        true
                    } else {
                        false
                    }
                };
                if !pending_empty {
                    debug!(idx, "newer payload queued behind completed write");
                }
            }
            Err(e) => {
                warn!("write of block {idx} failed: {e}");
                let has_pending = st
                    .entries
                    .get(&idx)
                    .map(|e| e.pending.is_some())
                    .unwrap_or(false);
                if has_pending {
                    // Let the queued writer proceed; downstream content is
                    // whatever it was before us.
                    let e = st.entries.get_mut(&idx).unwrap();
                    e.state = EpState::Written;
                    e.stamp = now;
                } else {
                    st.entries.remove(&idx);
                    st.write_count -= 1;
                }
            }
        }
        self.cond.notify_all();
        result
    }
}

impl BlockStore for EcProtect {
    fn read_block(
        &self,
        idx: BlockIndex,
        buf: &mut [u8],
        expect: Option<&BlockHash>,
    ) -> Result<ReadOutcome> {
        let mut remembered: Option<BlockHash> = None;
        {
            let mut st = self.state.lock();
            if st.stopping {
                return Err(Error::Shutdown);
            }
            let now = self.clock.now_millis();
            let in_window = st.entries.get(&idx).map(|e| {
                (
                    e.state,
                    e.state == EpState::Writing
                        || e.pending.is_some()
                        || now.saturating_sub(e.stamp) < self.cfg.min_write_delay_ms,
                )
            });
            match in_window {
                Some((EpState::Writing | EpState::Written, true)) => {
                    // Serve the held copy; the window is still open.
                    let (data, hash) = {
                        let held = st
                            .entries
                            .get(&idx)
                            .and_then(|e| e.held.as_ref())
                            .expect("write entry holds payload");
                        (held.data.clone(), held.hash)
                    };
                    drop(st);
                    if let Some(exp) = expect {
                        let matched = match (&data, hash) {
                            (_, Some(h)) => h == *exp,
                            (Some(d), None) => exp.matches(d),
                            (None, None) => is_all_zero_hash(exp, buf.len()),
                        };
                        if matched {
                            return Ok(ReadOutcome::Unchanged);
                        }
                    }
                    match data {
                        Some(d) => {
                            if d.len() != buf.len() {
                                return Err(Error::invalid_argument(format!(
                                    "buffer is {} bytes, block size is {}",
                                    buf.len(),
                                    d.len()
                                )));
                            }
                            buf.copy_from_slice(&d);
                        }
                        None => buf.fill(0),
                    }
                    return Ok(ReadOutcome::Data);
                }
                Some((EpState::Written, false)) => {
                    // Window elapsed; demote so raw reads flow again.
                    let e = st.entries.get_mut(&idx).unwrap();
                    e.state = EpState::Clean;
                    e.hash = e.held.as_ref().and_then(|h| h.hash);
                    e.held = None;
                    e.stamp = now;
                    st.write_count -= 1;
                    st.clean_count += 1;
                    st.clean_order.push_back(idx);
                    remembered = st.entries.get(&idx).and_then(|e| e.hash);
                }
                Some((EpState::Clean, _)) => {
                    remembered = st.entries.get(&idx).and_then(|e| e.hash);
                }
                _ => {}
            }
        }

        let outcome = self.lower.read_block(idx, buf, expect)?;
        if outcome == ReadOutcome::Data {
            let hash = BlockHash::compute(buf);
            if let Some(rem) = remembered {
                if rem != hash {
                    // Content changed without a write through this layer;
                    // either another client or a stale replica.
                    warn!(idx, "read observed content differing from the recorded hash");
                }
            }
            let mut st = self.state.lock();
            self.record_clean(&mut st, idx, hash);
        }
        Ok(outcome)
    }

    fn write_block(&self, idx: BlockIndex, data: Option<&[u8]>) -> Result<Option<BlockHash>> {
        let payload: Option<Bytes> = match data {
            Some(d) if !is_all_zero(d) => Some(Bytes::copy_from_slice(d)),
            _ => None,
        };

        let mut st = self.state.lock();
        loop {
            if st.stopping {
                return Err(Error::Shutdown);
            }

            if st.entries.get(&idx).map(|e| e.state) == Some(EpState::Writing) {
                // Serialize behind the in-flight write. Our payload goes
                // into the single pending slot; a newer write may replace
                // it there.
                st.next_token += 1;
                let token = st.next_token;
                {
                    let e = st.entries.get_mut(&idx).unwrap();
                    e.pending = Some((token, payload.clone()));
                    e.held = Some(Held {
                        data: payload.clone(),
                        hash: None,
                    });
                }
                loop {
                    self.cond.wait(&mut st);
                    if st.stopping {
                        return Err(Error::Shutdown);
                    }
                    let Some(e) = st.entries.get_mut(&idx) else {
                        // Entry vanished (failed write, nothing pending
                        // kept); start over from scratch.
                        break;
                    };
                    if e.state == EpState::Writing {
                        continue;
                    }
                    let is_mine = e.pending.as_ref().map(|(t, _)| *t == token).unwrap_or(false);
                    if is_mine {
                        // Our turn: take the slot and write it.
                        let (_, queued) = e.pending.take().unwrap();
                        e.state = EpState::Writing;
                        drop(st);
                        return self.perform_write(idx, queued);
                    }
                    // A newer payload superseded ours; it subsumes this
                    // write, so acknowledge without touching the wire.
                    return Ok(None);
                }
                // Entry vanished; dispatch again from the top.
                continue;
            }

            if self.begin_write(&mut st, idx, &payload) {
                drop(st);
                return self.perform_write(idx, payload);
            }
            // Another writer claimed the slot while we waited for room;
            // dispatch again and serialize behind it.
        }
    }

    fn list_blocks(&self, sink: &mut dyn FnMut(BlockIndex)) -> Result<()> {
        let (mut present, zero) = self.recent_split();
        self.lower.list_blocks(&mut |i| {
            present.insert(i);
        })?;
        for idx in &present {
            if !zero.contains(idx) {
                sink(*idx);
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut st = self.state.lock();
        loop {
            let unsettled = st
                .entries
                .values()
                .any(|e| e.state == EpState::Writing || e.pending.is_some());
            if !unsettled {
                break;
            }
            self.cond.wait(&mut st);
        }
        drop(st);
        self.lower.flush()
    }

    fn survey_non_zero(&self, sink: &mut dyn FnMut(BlockIndex)) -> Result<()> {
        let (mut present, zero) = self.recent_split();
        self.lower.survey_non_zero(&mut |i| {
            present.insert(i);
        })?;
        for idx in &present {
            if !zero.contains(idx) {
                sink(*idx);
            }
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.flush()?;
        {
            let mut st = self.state.lock();
            if st.stopping {
                return Ok(());
            }
            st.stopping = true;
            self.cond.notify_all();
        }
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
        self.lower.shutdown()
    }
}

impl EcProtect {
    /// Recently written blocks split by payload: non-zero ones must appear
    /// in listings even if the bucket index lags; zero ones must not.
    fn recent_split(&self) -> (BTreeSet<BlockIndex>, BTreeSet<BlockIndex>) {
        let st = self.state.lock();
        let mut present = BTreeSet::new();
        let mut zero = BTreeSet::new();
        for (idx, e) in &st.entries {
            if let Some(held) = &e.held {
                match &held.data {
                    Some(_) => {
                        present.insert(*idx);
                    }
                    None => {
                        zero.insert(*idx);
                    }
                }
            }
        }
        (present, zero)
    }
}

/// Does `expect` equal the hash of `len` zero bytes?
fn is_all_zero_hash(expect: &BlockHash, len: usize) -> bool {
    BlockHash::compute(&vec![0u8; len]) == *expect
}
