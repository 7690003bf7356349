use std::panic::{catch_unwind, AssertUnwindSafe};

use pmheap::*;

mod common;

const MIB: u64 = 1024 * 1024;
const CHUNK: u64 = 256 * 1024;

fn with_instance<F: FnOnce(&Config, Pool)>(config: Config, f: F) {
    common::setup_logger();

    let _ = std::fs::remove_file(&config.path);

    let pool = config.open_or_create().unwrap();

    f(&config, pool);

    std::fs::remove_file(&config.path).unwrap();
}

fn with_default_instance<F: FnOnce(&Config, Pool)>(f: F) {
    let config = Config {
        path: common::unique_pool_path("regressions"),
        classes: vec![(128, HeaderKind::None)],
        ..Default::default()
    };

    with_instance(config, f)
}

fn restart(config: &Config, pool: Pool) -> Pool {
    drop(pool);
    config.open().unwrap()
}

fn read_all(pool: &Pool, block: Handle) -> Vec<u8> {
    let mut buf = vec![0; pool.usable_size(block).unwrap() as usize];
    pool.read(block, 0, &mut buf).unwrap();
    buf
}

#[test]
fn custom_class_block_commits() {
    with_default_instance(|config, mut pool| {
        let class = pool.register_class(128, HeaderKind::None).unwrap();
        assert_eq!(class, ClassId::new(32));

        let block = pool.allocate(100, class, false).unwrap();
        assert_eq!(pool.usable_size(block).unwrap(), 128);

        let mut tx = pool.begin().unwrap();
        tx.add_range(block, 0, 128).unwrap();
        pool.fill(block, 0, 128, 0xaa).unwrap();
        tx.commit().unwrap();
        drop(tx);

        assert_eq!(read_all(&pool, block), vec![0xaa; 128]);

        let offset = block.offset();
        pool = restart(config, pool);
        let block = pool.handle(offset).unwrap();
        assert_eq!(read_all(&pool, block), vec![0xaa; 128]);
    });
}

#[test]
fn crash_before_commit_restores_pre_image() {
    with_default_instance(|config, mut pool| {
        let block = pool.allocate(128, ClassId::DEFAULT, false).unwrap();
        assert_eq!(read_all(&pool, block), vec![0; 128]);

        let mut tx = pool.begin().unwrap();
        tx.fill(block, 0, 128, 0xbb).unwrap();
        assert_eq!(read_all(&pool, block), vec![0xbb; 128]);

        // the process dies without committing or aborting
        std::mem::forget(tx);

        let offset = block.offset();
        pool = restart(config, pool);

        assert_eq!(pool.tx_state(), TxState::None);
        let block = pool.handle(offset).unwrap();
        assert_eq!(read_all(&pool, block), vec![0; 128]);
    });
}

#[test]
fn crash_after_commit_keeps_everything() {
    with_default_instance(|config, mut pool| {
        let before = pool.stats().live_allocations;

        let mut tx = pool.begin().unwrap();
        let block = tx.allocate(40, ClassId::DEFAULT, true).unwrap();
        tx.write(block, 0, b"persistent").unwrap();
        tx.set_root(block.offset()).unwrap();
        tx.commit().unwrap();
        std::mem::forget(tx);

        pool = restart(config, pool);

        assert_eq!(pool.stats().live_allocations, before + 1);
        let block = pool.handle(pool.root()).unwrap();
        let mut buf = [0; 10];
        pool.read(block, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"persistent");
    });
}

#[test]
fn crash_with_pending_allocation_leaks_nothing() {
    with_default_instance(|config, mut pool| {
        let before = pool.stats();

        let mut tx = pool.begin().unwrap();
        let block = tx.allocate(1000, ClassId::DEFAULT, false).unwrap();
        let run = tx.allocate(2 * CHUNK, ClassId::DEFAULT, false).unwrap();
        tx.set_root(run.offset()).unwrap();
        std::mem::forget(tx);

        pool = restart(config, pool);

        let after = pool.stats();
        assert_eq!(after.live_allocations, before.live_allocations);
        assert_eq!(after.live_bytes, before.live_bytes);
        assert_eq!(pool.root(), 0);
        assert!(pool.handle(block.offset()).is_err());
        assert!(pool.handle(run.offset()).is_err());
    });
}

#[test]
fn crash_with_pending_free_keeps_the_block() {
    with_default_instance(|config, mut pool| {
        let block = pool.allocate(64, ClassId::DEFAULT, true).unwrap();
        pool.write_u64(block, 0, 77).unwrap();
        pool.flush(block, 0, 8).unwrap();

        let mut tx = pool.begin().unwrap();
        tx.free(block).unwrap();
        std::mem::forget(tx);

        pool = restart(config, pool);

        let block = pool.handle(block.offset()).unwrap();
        assert_eq!(pool.read_u64(block, 0).unwrap(), 77);
        assert_eq!(pool.stats().live_allocations, 1);
    });
}

#[test]
fn nested_begin_is_a_protocol_violation() {
    with_default_instance(|_config, pool| {
        let mut tx = pool.begin().unwrap();
        assert_eq!(pool.tx_state(), TxState::Work);

        assert!(matches!(
            pool.begin(),
            Err(Error::TransactionProtocolViolation(_))
        ));
        assert_eq!(pool.tx_state(), TxState::Work);

        tx.commit().unwrap();
        assert_eq!(pool.tx_state(), TxState::None);
    });
}

#[test]
fn foreign_handles_are_rejected() {
    let config_b = Config {
        path: common::unique_pool_path("regressions"),
        ..Default::default()
    };
    let _ = std::fs::remove_file(&config_b.path);
    let pool_b = config_b.create().unwrap();

    with_default_instance(|_config, pool_a| {
        assert_ne!(pool_a.id(), pool_b.id());

        let a = pool_a.allocate(64, ClassId::DEFAULT, true).unwrap();
        let b = pool_b.allocate(64, ClassId::DEFAULT, true).unwrap();

        let stats_a = pool_a.stats();
        let stats_b = pool_b.stats();

        assert!(matches!(
            pool_b.free(a),
            Err(Error::InvalidOffsetOrAddress { .. })
        ));
        assert!(matches!(
            pool_b.write(a, 0, &[1]),
            Err(Error::InvalidOffsetOrAddress { .. })
        ));
        assert!(matches!(
            pool_b.usable_size(a),
            Err(Error::InvalidOffsetOrAddress { .. })
        ));

        let mut tx = pool_b.begin().unwrap();
        assert!(matches!(
            tx.free(a),
            Err(Error::InvalidOffsetOrAddress { .. })
        ));
        tx.abort();

        assert_eq!(pool_a.stats().live_allocations, stats_a.live_allocations);
        assert_eq!(pool_b.stats().live_allocations, stats_b.live_allocations);
        assert_eq!(pool_a.usable_size(a).unwrap(), 64);
        assert_eq!(pool_b.usable_size(b).unwrap(), 64);
    });

    drop(pool_b);
    remove(&config_b.path).unwrap();
}

#[test]
fn abort_twice_is_a_no_op() {
    with_default_instance(|_config, pool| {
        let block = pool.allocate(32, ClassId::DEFAULT, true).unwrap();

        let mut tx = pool.begin().unwrap();
        tx.write_u64(block, 8, 5).unwrap();
        tx.abort();
        tx.abort();

        assert_eq!(pool.tx_state(), TxState::None);
        assert_eq!(pool.read_u64(block, 8).unwrap(), 0);
        assert_eq!(pool.stats().transactions_aborted, 1);
        assert!(matches!(tx.commit(), Err(Error::TransactionAborted)));
        assert!(matches!(
            tx.write_u64(block, 8, 5),
            Err(Error::TransactionAborted)
        ));
    });
}

#[test]
fn addresses_translate_back_to_handles() {
    with_default_instance(|_config, pool| {
        let sizes = [1, 8, 100, 4096, 100_000, 3 * CHUNK];
        for size in sizes {
            let block = pool.allocate(size, ClassId::DEFAULT, false).unwrap();
            let address = pool.direct_address(block).unwrap();

            unsafe {
                address.as_ptr().write(0x5a);
            }
            assert_eq!(pool.read_u8(block, 0).unwrap(), 0x5a);

            assert_eq!(pool.to_handle(address.as_ptr()).unwrap(), block);
            assert!(pool
                .to_handle(unsafe { address.as_ptr().add(1) })
                .is_err());
        }

        let local = 0_u8;
        assert!(matches!(
            pool.to_handle(&local),
            Err(Error::InvalidOffsetOrAddress { .. })
        ));
        assert!(pool.to_handle(std::ptr::null()).is_err());
    });
}

#[test]
fn live_allocations_never_overlap() {
    use rand::Rng;

    with_default_instance(|_config, pool| {
        let mut rng = rand::thread_rng();
        let mut live: Vec<Handle> = vec![];

        for _ in 0..2000 {
            if !live.is_empty() && rng.gen_bool(0.3) {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                pool.free(victim).unwrap();
            } else {
                let size = if rng.gen_ratio(1, 50) {
                    rng.gen_range(CHUNK..3 * CHUNK)
                } else {
                    rng.gen_range(1..5000)
                };
                let block = pool.allocate(size, ClassId::DEFAULT, false).unwrap();
                assert!(pool.usable_size(block).unwrap() >= size);
                live.push(block);
            }
        }

        let mut extents: Vec<(u64, u64)> = live
            .iter()
            .map(|block| (block.offset(), pool.usable_size(*block).unwrap()))
            .collect();
        extents.sort_unstable();

        for pair in extents.windows(2) {
            let (offset, len) = pair[0];
            assert!(offset + len <= pair[1].0, "{:?} overlaps", pair);
        }

        assert_eq!(pool.stats().live_allocations, live.len() as u64);
    });
}

#[test]
fn double_free_is_rejected() {
    with_default_instance(|_config, pool| {
        let block = pool.allocate(64, ClassId::DEFAULT, false).unwrap();
        pool.free(block).unwrap();
        assert!(matches!(
            pool.free(block),
            Err(Error::InvalidOffsetOrAddress { .. })
        ));
        assert!(pool.handle(block.offset()).is_err());
    });
}

#[test]
fn free_inside_transaction_happens_at_commit() {
    with_default_instance(|config, mut pool| {
        let keep = pool.allocate(64, ClassId::DEFAULT, true).unwrap();
        let gone = pool.allocate(64, ClassId::DEFAULT, true).unwrap();

        let mut tx = pool.begin().unwrap();
        tx.free(gone).unwrap();
        assert!(matches!(
            tx.free(gone),
            Err(Error::InvalidOffsetOrAddress { .. })
        ));
        // still readable until the free commits
        assert_eq!(pool.usable_size(gone).unwrap(), 64);
        tx.commit().unwrap();
        drop(tx);

        assert!(pool.usable_size(gone).is_err());
        assert_eq!(pool.usable_size(keep).unwrap(), 64);

        pool = restart(config, pool);
        assert!(pool.handle(gone.offset()).is_err());
        assert!(pool.handle(keep.offset()).is_ok());
        assert_eq!(pool.stats().live_allocations, 1);
    });
}

#[test]
fn root_survives_restart() {
    with_default_instance(|config, mut pool| {
        assert_eq!(pool.root(), 0);
        pool.set_root(0xfeed).unwrap();
        assert_eq!(pool.root(), 0xfeed);

        pool = restart(config, pool);
        assert_eq!(pool.root(), 0xfeed);

        pool.with_transaction(|tx| tx.set_root(0xbeef)).unwrap();
        pool = restart(config, pool);
        assert_eq!(pool.root(), 0xbeef);
    });
}

#[test]
fn identity_survives_restart() {
    with_default_instance(|config, mut pool| {
        let id = pool.id();
        let created_at = pool.created_at();
        let block = pool.allocate(24, ClassId::DEFAULT, false).unwrap();

        pool = restart(config, pool);
        assert_eq!(pool.id(), id);
        assert_eq!(pool.created_at(), created_at);
        assert_eq!(pool.handle(block.offset()).unwrap(), block);

        let reopened = {
            drop(pool);
            config.open_or_create().unwrap()
        };
        assert_eq!(reopened.id(), id);
        reopened.close().unwrap();
    });
}

#[test]
fn layout_mismatch_fails_to_open() {
    let config = Config {
        path: common::unique_pool_path("regressions"),
        layout: "alpha".into(),
        ..Default::default()
    };

    with_instance(config, |config, pool| {
        assert_eq!(pool.layout(), "alpha");
        drop(pool);

        let other = Config {
            layout: "beta".into(),
            ..config.clone()
        };
        assert!(matches!(
            other.open(),
            Err(Error::HeapCreateOrOpen { .. })
        ));
        assert!(matches!(
            other.open_or_create(),
            Err(Error::HeapCreateOrOpen { .. })
        ));

        // the mismatched attempts left the pool intact
        config.open().unwrap();
    });
}

#[test]
fn missing_and_invalid_pools_fail_to_open() {
    let path = common::unique_pool_path("regressions");
    let _ = std::fs::remove_file(&path);

    assert!(matches!(open(&path), Err(Error::HeapCreateOrOpen { .. })));
    assert!(!exists(&path));

    std::fs::write(&path, vec![7; 16 * 1024]).unwrap();
    assert!(matches!(open(&path), Err(Error::HeapCreateOrOpen { .. })));
    assert!(!exists(&path));
    assert!(remove(&path).is_err());
    assert!(path.exists());

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn invalid_configs_are_rejected() {
    let path = common::unique_pool_path("regressions");

    let too_small = Config {
        path: path.clone(),
        size: MIB,
        ..Default::default()
    };
    assert!(matches!(too_small.create(), Err(Error::InvalidConfig(_))));

    let odd_log = Config {
        path: path.clone(),
        undo_log_size: MIN_UNDO_LOG_SIZE + 1,
        ..Default::default()
    };
    assert!(matches!(odd_log.create(), Err(Error::InvalidConfig(_))));

    let long_layout = Config {
        path: path.clone(),
        layout: "x".repeat(MAX_LAYOUT_LEN + 1),
        ..Default::default()
    };
    assert!(matches!(long_layout.create(), Err(Error::InvalidConfig(_))));

    let bad_class = Config {
        path: path.clone(),
        classes: vec![(MAX_UNIT_SIZE + 8, HeaderKind::None)],
        ..Default::default()
    };
    assert!(matches!(bad_class.create(), Err(Error::InvalidConfig(_))));

    assert!(!path.exists());
}

#[test]
fn exists_and_remove() {
    let path = common::unique_pool_path("regressions");
    let _ = std::fs::remove_file(&path);

    let pool = open_or_create(&path, MIN_POOL_SIZE).unwrap();
    assert!(exists(&path));
    assert_eq!(pool.size(), MIN_POOL_SIZE);

    // open pools are locked
    assert!(remove(&path).is_err());
    assert!(matches!(open(&path), Err(Error::HeapCreateOrOpen { .. })));

    drop(pool);
    remove(&path).unwrap();
    assert!(!exists(&path));
    assert!(!path.exists());
}

#[test]
fn create_refuses_to_overwrite() {
    with_default_instance(|config, pool| {
        drop(pool);
        assert!(matches!(
            config.create(),
            Err(Error::HeapCreateOrOpen { .. })
        ));
        assert!(exists(&config.path));
    });
}

#[test]
fn registered_classes_keep_their_ids() {
    let config = Config {
        path: common::unique_pool_path("regressions"),
        classes: vec![(128, HeaderKind::None), (256, HeaderKind::Size)],
        ..Default::default()
    };

    with_instance(config, |config, mut pool| {
        assert_eq!(pool.register_class(128, HeaderKind::None).unwrap(), ClassId::new(32));
        assert_eq!(pool.register_class(256, HeaderKind::Size).unwrap(), ClassId::new(33));

        let extra = pool.register_class(512, HeaderKind::None).unwrap();
        assert_eq!(extra, ClassId::new(34));
        let block = pool.allocate(500, extra, false).unwrap();

        pool = restart(config, pool);

        let class = pool.allocation_class(extra).unwrap();
        assert_eq!(class.unit_size, 512);
        assert_eq!(class.header, HeaderKind::None);
        assert_eq!(pool.usable_size(block).unwrap(), 512);
        assert_eq!(pool.register_class(512, HeaderKind::None).unwrap(), extra);

        // a different order on reopen maps to the same ids
        drop(pool);
        let reordered = Config {
            classes: vec![(256, HeaderKind::Size), (128, HeaderKind::None)],
            ..config.clone()
        };
        let pool = reordered.open().unwrap();
        assert_eq!(pool.register_class(128, HeaderKind::None).unwrap(), ClassId::new(32));
        assert_eq!(pool.register_class(256, HeaderKind::Size).unwrap(), ClassId::new(33));
        assert_eq!(pool.stats().classes, 26 + 3);
    });
}

#[test]
fn class_registration_errors() {
    with_default_instance(|_config, pool| {
        assert!(matches!(
            pool.register_class(4, HeaderKind::None),
            Err(Error::AllocationClass(_))
        ));
        assert!(matches!(
            pool.register_class(MAX_UNIT_SIZE + 1, HeaderKind::None),
            Err(Error::AllocationClass(_))
        ));
        assert!(matches!(
            pool.register_class(8, HeaderKind::Size),
            Err(Error::AllocationClass(_))
        ));
        assert!(pool.allocation_class(ClassId::new(99)).is_none());
    });
}

#[test]
fn invalid_allocation_sizes() {
    with_default_instance(|_config, pool| {
        let class = pool.register_class(128, HeaderKind::None).unwrap();

        assert!(matches!(
            pool.allocate(0, ClassId::DEFAULT, false),
            Err(Error::InvalidAllocationSize { .. })
        ));
        assert!(matches!(
            pool.allocate(129, class, false),
            Err(Error::InvalidAllocationSize { .. })
        ));
        assert!(matches!(
            pool.allocate(8, ClassId::new(99), false),
            Err(Error::AllocationClass(_))
        ));
        assert_eq!(pool.stats().live_allocations, 0);
    });
}

#[test]
fn size_headers_record_the_request() {
    with_default_instance(|_config, pool| {
        let class = pool.register_class(64, HeaderKind::Size).unwrap();

        let block = pool.allocate(20, class, true).unwrap();
        assert_eq!(pool.usable_size(block).unwrap(), 56);
        assert_eq!(pool.allocated_size(block).unwrap(), 20);

        // the header is not part of the usable bytes
        pool.fill(block, 0, 56, 0xff).unwrap();
        assert_eq!(pool.allocated_size(block).unwrap(), 20);

        let plain = pool.allocate(20, ClassId::DEFAULT, false).unwrap();
        assert_eq!(pool.allocated_size(plain).unwrap(), 24);
    });
}

#[test]
fn default_class_selection_and_zeroing() {
    with_default_instance(|_config, pool| {
        // an exact match on the custom class beats the built-ins
        let block = pool.allocate(128, ClassId::DEFAULT, false).unwrap();
        assert_eq!(pool.usable_size(block).unwrap(), 128);

        pool.fill(block, 0, 128, 0xee).unwrap();
        pool.free(block).unwrap();

        let again = pool.allocate(128, ClassId::DEFAULT, false).unwrap();
        assert_eq!(again, block);
        assert_eq!(read_all(&pool, again), vec![0; 128]);

        assert_eq!(
            pool.usable_size(pool.allocate(5, ClassId::DEFAULT, false).unwrap())
                .unwrap(),
            8
        );
        assert_eq!(
            pool.usable_size(pool.allocate(129, ClassId::DEFAULT, false).unwrap())
                .unwrap(),
            256
        );
    });
}

#[test]
fn runs_cover_whole_chunks() {
    with_default_instance(|config, mut pool| {
        let before = pool.stats();

        let run = pool.allocate(2 * CHUNK + 1, ClassId::DEFAULT, true).unwrap();
        assert_eq!(pool.usable_size(run).unwrap(), 3 * CHUNK);
        assert_eq!(pool.stats().free_chunks, before.free_chunks - 3);

        pool.write_u64(run, 3 * CHUNK - 8, 11).unwrap();
        pool.flush(run, 3 * CHUNK - 8, 8).unwrap();

        pool = restart(config, pool);
        assert_eq!(pool.read_u64(run, 3 * CHUNK - 8).unwrap(), 11);
        assert_eq!(pool.stats().free_chunks, before.free_chunks - 3);

        pool.free(run).unwrap();
        assert_eq!(pool.stats().free_chunks, before.free_chunks);

        pool = restart(config, pool);
        assert_eq!(pool.stats().free_chunks, before.free_chunks);
        assert!(pool.handle(run.offset()).is_err());
    });
}

#[test]
fn running_out_of_space() {
    let config = Config {
        path: common::unique_pool_path("regressions"),
        size: MIN_POOL_SIZE,
        ..Default::default()
    };

    with_instance(config, |_config, pool| {
        let mut runs = vec![];
        loop {
            match pool.allocate(CHUNK, ClassId::DEFAULT, false) {
                Ok(run) => runs.push(run),
                Err(Error::OutOfSpace { requested }) => {
                    assert_eq!(requested, CHUNK);
                    break;
                }
                Err(other) => panic!("unexpected error {:?}", other),
            }
        }

        assert_eq!(pool.stats().free_chunks, 0);
        assert!(matches!(
            pool.allocate(8, ClassId::DEFAULT, false),
            Err(Error::OutOfSpace { .. })
        ));

        pool.free(runs.pop().unwrap()).unwrap();
        pool.allocate(8, ClassId::DEFAULT, false).unwrap();
    });
}

#[test]
fn out_of_range_access_is_rejected() {
    with_default_instance(|_config, pool| {
        let block = pool.allocate(16, ClassId::DEFAULT, false).unwrap();
        let mut buf = [0; 8];

        assert!(pool.read(block, 8, &mut buf).is_ok());
        assert!(matches!(
            pool.read(block, 12, &mut buf),
            Err(Error::InvalidOffsetOrAddress { .. })
        ));
        assert!(matches!(
            pool.write_u64(block, u64::MAX, 1),
            Err(Error::InvalidOffsetOrAddress { .. })
        ));

        let mut tx = pool.begin().unwrap();
        assert!(matches!(
            tx.add_range(block, 0, 17),
            Err(Error::InvalidOffsetOrAddress { .. })
        ));
        tx.commit().unwrap();
    });
}

#[test]
fn undo_log_exhaustion() {
    let config = Config {
        path: common::unique_pool_path("regressions"),
        undo_log_size: MIN_UNDO_LOG_SIZE,
        ..Default::default()
    };

    with_instance(config, |_config, pool| {
        let big = pool.allocate(128 * 1024, ClassId::DEFAULT, true).unwrap();

        let mut tx = pool.begin().unwrap();
        tx.write_u64(big, 0, 1).unwrap();
        assert!(matches!(
            tx.add_range(big, 0, 128 * 1024),
            Err(Error::LogExhausted { log: "undo", .. })
        ));
        assert_eq!(tx.state(), TxState::Work);
        tx.abort();

        assert_eq!(pool.read_u64(big, 0).unwrap(), 0);
    });
}

#[test]
fn with_transaction_outcomes() {
    with_default_instance(|_config, pool| {
        let block = pool.allocate(32, ClassId::DEFAULT, true).unwrap();

        let value = pool
            .with_transaction(|tx| {
                tx.write_u64(block, 0, 1)?;
                Ok(7)
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(pool.read_u64(block, 0).unwrap(), 1);

        let failed: Result<()> = pool.with_transaction(|tx| {
            tx.write_u64(block, 0, 2)?;
            Err(Error::AllocationClass("caller gave up".into()))
        });
        assert!(matches!(failed, Err(Error::AllocationClass(_))));
        assert_eq!(pool.read_u64(block, 0).unwrap(), 1);

        let aborted = pool.with_transaction(|tx| {
            tx.write_u64(block, 0, 3)?;
            tx.abort();
            Ok(())
        });
        assert!(matches!(aborted, Err(Error::TransactionAborted)));
        assert_eq!(pool.read_u64(block, 0).unwrap(), 1);

        let panicked = catch_unwind(AssertUnwindSafe(|| {
            pool.with_transaction(|tx| -> Result<()> {
                tx.write_u64(block, 0, 4)?;
                panic!("boom");
            })
        }));
        assert!(panicked.is_err());
        assert_eq!(pool.read_u64(block, 0).unwrap(), 1);
        assert_eq!(pool.tx_state(), TxState::None);

        let stats = pool.stats();
        assert_eq!(stats.transactions_committed, 1);
        assert_eq!(stats.transactions_aborted, 3);
    });
}

#[test]
fn mutate_atomically_commits_the_closure() {
    with_default_instance(|config, mut pool| {
        let block = pool.allocate(64, ClassId::DEFAULT, true).unwrap();

        let sum = pool
            .mutate_atomically(block, 8, 16, |bytes| {
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = i as u8;
                }
                bytes.iter().map(|b| u64::from(*b)).sum::<u64>()
            })
            .unwrap();
        assert_eq!(sum, 120);

        pool = restart(config, pool);
        let mut buf = [0; 16];
        pool.read(block, 8, &mut buf).unwrap();
        assert_eq!(buf.to_vec(), (0..16).collect::<Vec<u8>>());
        assert_eq!(pool.read_u64(block, 0).unwrap(), 0);
    });
}

#[test]
fn copy_between_blocks() {
    with_default_instance(|_config, pool| {
        let a = pool.allocate(32, ClassId::DEFAULT, true).unwrap();
        let b = pool.allocate(32, ClassId::DEFAULT, true).unwrap();

        pool.write(a, 0, b"abcdefgh").unwrap();
        pool.copy(a, 0, b, 4, 8).unwrap();
        let mut buf = [0; 12];
        pool.read(b, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"\0\0\0\0abcdefgh");

        // overlapping, within one block
        pool.copy(a, 0, a, 2, 8).unwrap();
        let mut buf = [0; 10];
        pool.read(a, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"ababcdefgh");

        assert!(pool.copy(a, 30, b, 0, 8).is_err());
    });
}

#[test]
fn probe_finds_the_pool_size() {
    with_default_instance(|_config, pool| {
        assert_eq!(pool.probe_size(0), pool.size());
        assert_eq!(pool.probe_size(4096), pool.size());
        assert_eq!(pool.size(), 64 * MIB);
        assert!(!pool.has_auto_flush());
        assert!(!has_auto_flush());
    });
}

#[test]
fn stats_track_activity() {
    with_default_instance(|_config, pool| {
        let empty = pool.stats();
        assert_eq!(empty.pool_size, 64 * MIB);
        assert_eq!(empty.free_chunks, empty.chunks);
        assert_eq!(empty.live_allocations, 0);
        assert!(empty.heap_size < empty.pool_size);

        let block = pool.allocate(100, ClassId::DEFAULT, false).unwrap();
        pool.with_transaction(|tx| tx.write(block, 0, &[1; 50])).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.live_allocations, 1);
        assert_eq!(stats.live_bytes, 104);
        assert_eq!(stats.free_chunks, empty.chunks - 1);
        assert_eq!(stats.transactions_committed, 1);
        assert_eq!(stats.undo_bytes_logged, 50);
        assert!(stats.flushes > empty.flushes);
    });
}
