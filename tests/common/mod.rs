#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

mod alloc {
    use std::alloc::{Layout, System};

    #[global_allocator]
    static ALLOCATOR: Alloc = Alloc;

    #[derive(Default, Debug, Clone, Copy)]
    struct Alloc;

    // poison fresh and freed heap memory so that reads of
    // uninitialized buffers handed to the pool stand out
    unsafe impl std::alloc::GlobalAlloc for Alloc {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let ret = unsafe { System.alloc(layout) };
            assert_ne!(ret, std::ptr::null_mut());
            unsafe {
                std::ptr::write_bytes(ret, 0xa1, layout.size());
            }
            ret
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            unsafe {
                std::ptr::write_bytes(ptr, 0xde, layout.size());
                System.dealloc(ptr, layout)
            }
        }
    }
}

pub const TEST_DIR: &str = "testing_data_directories";

static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A fresh pool path that no other test in this process uses.
pub fn unique_pool_path(prefix: &str) -> PathBuf {
    let dir = PathBuf::from(TEST_DIR).join(format!("{}_{}", prefix, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(format!("pool_{}", TEST_COUNTER.fetch_add(1, SeqCst)))
}

pub fn setup_logger() {
    use std::io::Write;

    fn tn() -> String {
        std::thread::current()
            .name()
            .unwrap_or("unknown")
            .to_owned()
    }

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{:05} {:20} {:10} {}",
                record.level(),
                tn(),
                record
                    .module_path()
                    .and_then(|path| path.split("::").last())
                    .unwrap_or("?"),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info);

    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }

    let _r = builder.try_init();
}
