//! End-to-end scenarios over the assembled stack with an in-memory
//! bottom layer standing in for the bucket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;

use s3bd::common::{
    BlockCacheConfig, EcProtectConfig, Error, StoreConfig, SystemClock, ZeroCacheConfig,
};
use s3bd::store::{BlockStore, MemStore};
use s3bd::ReadOutcome;
use s3bd_store::mem::FaultOp;

const BS: usize = 4096;
const N: u64 = 1024;

fn test_config() -> StoreConfig {
    StoreConfig {
        block_size: BS as u32,
        num_blocks: N,
        read_only: false,
        http: Default::default(),
        block_cache: Some(BlockCacheConfig {
            cache_size: 16,
            num_threads: 1,
            write_delay_ms: 100,
            max_dirty: 8,
            read_ahead: 0,
            read_ahead_trigger: 2,
            synchronous: false,
            no_verify: false,
            md5_cache_size: 100,
            recover_dirty_blocks: false,
            journal_path: None,
        }),
        zero_cache: Some(ZeroCacheConfig::default()),
        ec_protect: Some(EcProtectConfig {
            min_write_delay_ms: 200,
            cache_size: 100,
            md5_cache_size: 100,
        }),
    }
}

fn stack_over(mem: &Arc<MemStore>, config: &StoreConfig) -> Arc<dyn BlockStore> {
    s3bd::build_stack(
        Arc::clone(mem) as Arc<dyn BlockStore>,
        config,
        BS,
        N,
        Arc::new(SystemClock::new()),
    )
    .unwrap()
}

fn random_block() -> Vec<u8> {
    let mut data = vec![0u8; BS];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// S1: one write, one immediate read, at most one PUT, zero GETs.
#[test]
fn scenario_write_then_read_immediately() {
    let mem = Arc::new(MemStore::new(BS));
    let store = stack_over(&mem, &test_config());

    let payload = random_block();
    store.write_block(5, Some(&payload)).unwrap();

    let mut buf = vec![0u8; BS];
    assert_eq!(
        store.read_block(5, &mut buf, None).unwrap(),
        ReadOutcome::Data
    );
    assert_eq!(buf, payload);
    assert_eq!(mem.gets(), 0);

    wait_until(|| mem.puts() == 1);
    store.shutdown().unwrap();
    assert_eq!(mem.puts(), 1);
    assert_eq!(mem.gets(), 0);
}

/// S2: two quick writes coalesce into exactly one PUT of the newer data.
#[test]
fn scenario_rewrites_coalesce() {
    let mem = Arc::new(MemStore::new(BS));
    let store = stack_over(&mem, &test_config());

    let p1 = random_block();
    let p2 = random_block();
    store.write_block(5, Some(&p1)).unwrap();
    std::thread::sleep(Duration::from_millis(10));
    store.write_block(5, Some(&p2)).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let mut buf = vec![0u8; BS];
    store.read_block(5, &mut buf, None).unwrap();
    assert_eq!(buf, p2);

    store.flush().unwrap();
    assert_eq!(mem.puts(), 1);
    assert_eq!(&mem.get(5).unwrap()[..], &p2[..]);
}

/// S3: an all-zero write reads back as zeros and deletes the object.
#[test]
fn scenario_zero_write_becomes_delete() {
    let mem = Arc::new(MemStore::new(BS));
    mem.insert(5, &random_block());
    let store = stack_over(&mem, &test_config());

    store.write_block(5, Some(&vec![0u8; BS])).unwrap();

    let mut buf = vec![0xffu8; BS];
    store.read_block(5, &mut buf, None).unwrap();
    assert!(buf.iter().all(|&b| b == 0));

    store.flush().unwrap();
    assert_eq!(mem.deletes(), 1);
    assert_eq!(mem.block_count(), 0);

    // The zero bitmap now answers for block 5.
    let mut survey = Vec::new();
    store.survey_non_zero(&mut |i| survey.push(i)).unwrap();
    assert!(!survey.contains(&5));
}

/// S5: writers block at the dirty bound until a flush makes progress.
#[test]
fn scenario_dirty_bound_blocks_writers() {
    let mem = Arc::new(MemStore::new(BS));
    let mut config = test_config();
    {
        let cache = config.block_cache.as_mut().unwrap();
        cache.max_dirty = 4;
        cache.write_delay_ms = 60_000;
    }
    let store = stack_over(&mem, &config);

    for i in 0..4u64 {
        store.write_block(i, Some(&random_block())).unwrap();
    }

    let blocked = Arc::clone(&store);
    let writer = std::thread::spawn(move || {
        blocked.write_block(4, Some(&vec![1u8; BS])).unwrap();
    });
    std::thread::sleep(Duration::from_millis(100));
    assert!(!writer.is_finished());

    store.flush().unwrap();
    writer.join().unwrap();
    store.flush().unwrap();
    assert_eq!(mem.puts(), 5);
}

/// Invariant 1: read-after-write returns the written bytes through every
/// cache state.
#[test]
fn invariant_read_sees_last_write() {
    let mem = Arc::new(MemStore::new(BS));
    let store = stack_over(&mem, &test_config());

    let mut buf = vec![0u8; BS];
    for round in 0..5u8 {
        let payload = vec![round + 1; BS];
        store.write_block(9, Some(&payload)).unwrap();
        store.read_block(9, &mut buf, None).unwrap();
        assert_eq!(buf, payload, "round {round}");
    }
    store.flush().unwrap();
    store.read_block(9, &mut buf, None).unwrap();
    assert_eq!(buf, vec![5u8; BS]);
}

/// Invariant 2: concurrent traffic on distinct blocks does not interfere.
#[test]
fn invariant_distinct_blocks_do_not_interfere() {
    let mem = Arc::new(MemStore::new(BS));
    let store = stack_over(&mem, &test_config());

    let mut handles = Vec::new();
    for t in 0..8u64 {
        let store = Arc::clone(&store);
        handles.push(std::thread::spawn(move || {
            let payload = vec![t as u8 + 1; BS];
            let mut buf = vec![0u8; BS];
            for _ in 0..20 {
                store.write_block(t, Some(&payload)).unwrap();
                store.read_block(t, &mut buf, None).unwrap();
                assert_eq!(buf, payload);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    store.flush().unwrap();
    for t in 0..8u64 {
        assert_eq!(mem.get(t).unwrap()[0], t as u8 + 1);
    }
}

/// Invariant 4: a second flush is idempotent and causes no new traffic.
#[test]
fn invariant_flush_idempotent() {
    let mem = Arc::new(MemStore::new(BS));
    let store = stack_over(&mem, &test_config());

    store.write_block(1, Some(&random_block())).unwrap();
    store.flush().unwrap();
    let (puts, deletes) = (mem.puts(), mem.deletes());
    store.flush().unwrap();
    assert_eq!((mem.puts(), mem.deletes()), (puts, deletes));
}

/// Invariant 5: a read-only store rejects writes without any traffic.
#[test]
fn invariant_read_only_rejects_writes_locally() {
    let mem = Arc::new(MemStore::new(BS));
    mem.insert(3, &[7u8; BS]);
    let mut config = test_config();
    config.read_only = true;
    let store = stack_over(&mem, &config);

    assert!(matches!(
        store.write_block(3, Some(&[1u8; BS])),
        Err(Error::ReadOnly)
    ));
    assert_eq!(mem.puts() + mem.deletes(), 0);

    // Reads still work.
    let mut buf = vec![0u8; BS];
    store.read_block(3, &mut buf, None).unwrap();
    assert_eq!(buf[0], 7);
}

/// Invariant 7: within min_write_delay a read is served without the
/// downstream needing to have propagated anything. Exercised without the
/// block cache so the consistency layer itself answers.
#[test]
fn invariant_read_within_window_needs_no_downstream() {
    let mem = Arc::new(MemStore::new(BS));
    let mut config = test_config();
    config.block_cache = None;
    let store = stack_over(&mem, &config);

    let payload = random_block();
    store.write_block(2, Some(&payload)).unwrap();

    let mut buf = vec![0u8; BS];
    store.read_block(2, &mut buf, None).unwrap();
    assert_eq!(buf, payload);
    assert_eq!(mem.gets(), 0);
}

/// Invariant 8: after transient downstream failures recover, every
/// acknowledged write lands in the bucket.
#[test]
fn invariant_acknowledged_writes_survive_transient_failures() {
    let mem = Arc::new(MemStore::new(BS));
    mem.fail_next(FaultOp::Write, Error::transient("503"), 3);
    let store = stack_over(&mem, &test_config());

    let payload = random_block();
    store.write_block(11, Some(&payload)).unwrap();
    store.write_block(12, Some(&random_block())).unwrap();

    store.flush().unwrap();
    assert_eq!(&mem.get(11).unwrap()[..], &payload[..]);
    assert!(mem.get(12).is_some());
}

/// list_blocks reflects acknowledged state across all layers.
#[test]
fn list_blocks_sees_through_the_stack() {
    let mem = Arc::new(MemStore::new(BS));
    mem.insert(1, &[1u8; BS]);
    mem.insert(2, &[2u8; BS]);
    let store = stack_over(&mem, &test_config());

    store.write_block(7, Some(&[7u8; BS])).unwrap();
    store.write_block(1, None).unwrap();

    let mut seen = Vec::new();
    store.list_blocks(&mut |i| seen.push(i)).unwrap();
    seen.sort_unstable();
    assert_eq!(seen, vec![2, 7]);
}

/// Synchronous mode writes through the whole stack immediately.
#[test]
fn synchronous_mode_is_write_through() {
    let mem = Arc::new(MemStore::new(BS));
    let mut config = test_config();
    config.block_cache.as_mut().unwrap().synchronous = true;
    let store = stack_over(&mem, &config);

    store.write_block(0, Some(&[9u8; BS])).unwrap();
    assert_eq!(mem.puts(), 1);
    assert_eq!(mem.get(0).unwrap()[0], 9);
}

/// A stack without the optional layers still honors the contract.
#[test]
fn minimal_stack_works() {
    let mem = Arc::new(MemStore::new(BS));
    let config = StoreConfig {
        block_size: BS as u32,
        num_blocks: N,
        read_only: false,
        http: Default::default(),
        block_cache: None,
        zero_cache: None,
        ec_protect: None,
    };
    let store = stack_over(&mem, &config);

    let payload = random_block();
    store.write_block(0, Some(&payload)).unwrap();
    let mut buf = vec![0u8; BS];
    store.read_block(0, &mut buf, None).unwrap();
    assert_eq!(buf, payload);

    // Without the zero cache, absent blocks surface NotFound.
    assert!(store
        .read_block(1, &mut buf, None)
        .unwrap_err()
        .is_not_found());
}
