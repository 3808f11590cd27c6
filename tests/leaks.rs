//! Heap-balance test for raw-mode shells. Uses a counting global
//! allocator, so it lives in its own binary with a single test; other
//! tests running in the same process would skew the counter.

use std::alloc::{GlobalAlloc, Layout, System};
use std::mem::offset_of;
use std::sync::atomic::{AtomicIsize, Ordering};

use mitosis::{ShapeBuilder, clone_graph, grant_raw_access};

struct CountingAlloc;

static LIVE_BYTES: AtomicIsize = AtomicIsize::new(0);

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        LIVE_BYTES.fetch_add(layout.size() as isize, Ordering::SeqCst);
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        LIVE_BYTES.fetch_sub(layout.size() as isize, Ordering::SeqCst);
        unsafe { System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static ALLOC: CountingAlloc = CountingAlloc;

#[derive(Debug, PartialEq)]
struct Reading {
    sensor: u64,
    value: f64,
}

#[test]
fn test_raw_shell_clones_release_all_bookkeeping() {
    assert!(grant_raw_access());
    ShapeBuilder::<Reading>::new()
        .raw_field::<u64>("sensor", offset_of!(Reading, sensor))
        .raw_field::<f64>("value", offset_of!(Reading, value))
        .register();

    let source = Reading {
        sensor: 7,
        value: 0.25,
    };
    // Warm up registries and any lazily allocated process state.
    for _ in 0..16 {
        let copy = clone_graph(&source).unwrap();
        assert_eq!(copy, source);
    }

    let before = LIVE_BYTES.load(Ordering::SeqCst);
    for _ in 0..1000 {
        let copy = clone_graph(&source).unwrap();
        assert_eq!(copy, source);
    }
    let grown = LIVE_BYTES.load(Ordering::SeqCst) - before;
    assert_eq!(grown, 0, "{grown} bytes of heap left live by 1000 clones");
}
