#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate arbitrary;
extern crate pmheap;
extern crate uuid;

use arbitrary::Arbitrary;

use pmheap::{ClassId, Config as PoolConfig, HeaderKind, Pool};

const TEST_DIR: &str = "testing_data_directories";
const MAX_ALLOCATION: u64 = 300_000;
const MAX_WRITES: u8 = 8;
const WRITE_MAX_SZ: usize = 64;

#[derive(Debug)]
struct Config(PoolConfig);

impl<'a> Arbitrary<'a> for Config {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let path = std::path::Path::new(TEST_DIR)
            .join("fuzz")
            .join(uuid::Uuid::new_v4().to_string());

        let classes = if Arbitrary::arbitrary(u).unwrap_or(false) {
            vec![
                (u.int_in_range(8..=4096).unwrap_or(128), HeaderKind::None),
                (u.int_in_range(16..=4096).unwrap_or(64), HeaderKind::Size),
            ]
        } else {
            vec![]
        };

        Ok(Config(PoolConfig {
            path,
            size: pmheap::MIN_POOL_SIZE * u.int_in_range(1..=4).unwrap_or(1),
            undo_log_size: pmheap::MIN_UNDO_LOG_SIZE,
            classes,
            ..Default::default()
        }))
    }
}

#[derive(Debug)]
struct Write<'a> {
    block: usize,
    at: u64,
    bytes: &'a [u8],
}

impl<'a> Arbitrary<'a> for Write<'a> {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let len = u.int_in_range(1..=WRITE_MAX_SZ).unwrap_or(1);
        Ok(Write {
            block: Arbitrary::arbitrary(u).unwrap_or(0),
            at: Arbitrary::arbitrary(u).unwrap_or(0),
            bytes: u.bytes(len).unwrap_or(&[1, 2, 3, 4, 5, 6, 7, 8]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Arbitrary)]
enum Ending {
    Commit,
    Abort,
    Crash,
}

#[derive(Debug)]
enum Op<'a> {
    Allocate(u64),
    Free(usize),
    Transaction(Vec<Write<'a>>, Ending),
    Restart,
}

impl<'a> Arbitrary<'a> for Op<'a> {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let choice = u.int_in_range(0..=3).unwrap_or(0);
        Ok(match choice {
            0 => Op::Allocate(u.int_in_range(1..=MAX_ALLOCATION).unwrap_or(8)),
            1 => Op::Free(Arbitrary::arbitrary(u).unwrap_or(0)),
            2 => {
                let writes = u.int_in_range(0..=MAX_WRITES).unwrap_or(0);
                let writes = (0..writes)
                    .map(|_| Write::arbitrary(u).expect("Write::arbitrary should never fail"))
                    .collect();
                let ending = Ending::arbitrary(u).unwrap_or(Ending::Commit);
                Op::Transaction(writes, ending)
            }
            3 => Op::Restart,
            _ => unreachable!(),
        })
    }
}

fn restart(config: &PoolConfig, pool: Pool) -> Pool {
    drop(pool);
    config.open().unwrap()
}

fuzz_target!(|args: (Config, [Op<'_>; 8])| {
    let (config, ops) = args;
    let config = config.0;

    std::fs::create_dir_all(config.path.parent().unwrap()).unwrap();

    let mut pool = config.create().unwrap();

    // offset and expected contents of every live block
    let mut model: Vec<(u64, Vec<u8>)> = vec![];

    for op in ops {
        match op {
            Op::Allocate(size) => match pool.allocate(size, ClassId::DEFAULT, false) {
                Ok(block) => {
                    let usable = pool.usable_size(block).unwrap();
                    assert!(usable >= size);
                    model.push((block.offset(), vec![0; usable as usize]));
                }
                Err(pmheap::Error::OutOfSpace { .. }) => {}
                Err(other) => panic!("unexpected allocation failure: {:?}", other),
            },
            Op::Free(index) => {
                if model.is_empty() {
                    continue;
                }
                let (offset, _) = model.swap_remove(index % model.len());
                let block = pool.handle(offset).unwrap();
                pool.free(block).unwrap();
                assert!(pool.handle(offset).is_err());
            }
            Op::Transaction(writes, ending) => {
                let mut shadow = model.clone();
                let mut tx = pool.begin().unwrap();

                for write in writes {
                    if shadow.is_empty() {
                        break;
                    }
                    let index = write.block % shadow.len();
                    let (offset, contents) = &mut shadow[index];
                    let len = write.bytes.len().min(contents.len());
                    let at = (write.at % (contents.len() - len + 1) as u64) as usize;

                    let block = pool.handle(*offset).unwrap();
                    tx.write(block, at as u64, &write.bytes[..len]).unwrap();
                    contents[at..at + len].copy_from_slice(&write.bytes[..len]);
                }

                match ending {
                    Ending::Commit => {
                        tx.commit().unwrap();
                        drop(tx);
                        model = shadow;
                    }
                    Ending::Abort => tx.abort(),
                    Ending::Crash => {
                        std::mem::forget(tx);
                        pool = restart(&config, pool);
                    }
                }
            }
            Op::Restart => {
                pool = restart(&config, pool);
            }
        }

        assert_eq!(pool.stats().live_allocations, model.len() as u64);
        for (offset, expected) in &model {
            let block = pool.handle(*offset).unwrap();
            let mut actual = vec![0; expected.len()];
            pool.read(block, 0, &mut actual).unwrap();
            assert_eq!(&actual, expected);
        }
    }

    drop(pool);

    pmheap::remove(&config.path).unwrap();
});
