use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::block_table::BlockState;
use crate::globals::{BYTES_PER_BLOCK, WORDS_PER_BLOCK};
use crate::heap::AllocFlags;
use crate::{Config, Heap};

fn new_heap() -> Heap {
    Heap::with_capacity(4096, Config::default()).unwrap()
}

/// Every tail must sit directly behind a head, marked head or another tail.
fn check_tail_invariant(heap: &Heap) {
    for block in 0..heap.layout.total_blocks() {
        if heap.atb.get(block) == BlockState::Tail {
            assert!(block > 0, "tail at block 0");
            let prev = heap.atb.get(block - 1);
            assert!(
                prev != BlockState::Free,
                "tail at block {} follows a free block",
                block
            );
        }
    }
}

fn check_no_marks(heap: &Heap) {
    for block in 0..heap.layout.total_blocks() {
        assert!(heap.atb.get(block) != BlockState::Mark, "mark left behind");
    }
}

unsafe fn write_child(parent: *mut u8, slot: usize, child: *mut u8) {
    (parent as *mut usize).add(slot).write(child as usize);
}

#[test]
fn alloc_free_round_trip() {
    let mut heap = new_heap();
    let total = heap.info().total;

    let p = heap.alloc(40, AllocFlags::empty(), false);
    assert!(!p.is_null());
    assert_eq!(heap.nbytes(p), 48);

    unsafe { heap.free(p) };
    let info = heap.info();
    assert_eq!(info.used, 0);
    assert_eq!(info.free, total);
    assert_eq!(info.free, info.total);
}

#[test]
fn alloc_rounds_up_to_whole_blocks() {
    let mut heap = new_heap();
    for n in 1..=4 * BYTES_PER_BLOCK {
        let p = heap.alloc(n, AllocFlags::empty(), false);
        assert!(!p.is_null());
        assert!(heap.nbytes(p) >= n);
        assert!(heap.nbytes(p) < n + BYTES_PER_BLOCK);
        unsafe { heap.free(p) };
    }
}

#[test]
fn zero_byte_alloc_yields_null() {
    let mut heap = new_heap();
    assert!(heap.alloc(0, AllocFlags::empty(), false).is_null());
}

#[test]
fn alloc_then_free_restores_table_exactly() {
    let mut heap = new_heap();
    let before = heap.alloc_table_bytes();
    let p = heap.alloc(40, AllocFlags::empty(), false);
    assert!(!p.is_null());
    unsafe { heap.free(p) };
    assert_eq!(heap.alloc_table_bytes(), before);
}

#[test]
fn collect_preserves_cycles_reachable_from_roots() {
    let mut heap = new_heap();
    let a = heap.alloc(32, AllocFlags::empty(), false);
    let b = heap.alloc(32, AllocFlags::empty(), false);
    unsafe {
        write_child(a, 0, b);
        write_child(b, 0, a);
    }

    heap.collect_start();
    heap.collect_ptr(a);
    heap.collect_end();
    check_no_marks(&heap);
    assert_eq!(heap.nbytes(a), 32);
    assert_eq!(heap.nbytes(b), 32);

    // no roots at all: the cycle does not keep itself alive
    heap.collect_start();
    heap.collect_end();
    assert_eq!(heap.nbytes(a), 0);
    assert_eq!(heap.nbytes(b), 0);
    assert_eq!(heap.info().used, 0);
}

#[test]
fn linked_chain_survives_with_tiny_mark_stack() {
    let config = Config {
        mark_stack_size: 4,
        ..Config::default()
    };
    let mut heap = Heap::with_capacity(4096, config).unwrap();

    let mut nodes = Vec::new();
    for _ in 0..20 {
        nodes.push(heap.alloc(16, AllocFlags::empty(), false));
    }
    for i in 0..19 {
        unsafe { write_child(nodes[i], 0, nodes[i + 1]) };
    }

    heap.collect_start();
    heap.collect_ptr(nodes[0]);
    heap.collect_end();

    assert!(!heap.mark_stack_overflow);
    for node in &nodes {
        assert_eq!(heap.nbytes(*node), 16);
    }
    check_tail_invariant(&heap);
}

#[test]
fn mark_stack_overflow_recovers_by_rescanning() {
    let config = Config {
        mark_stack_size: 4,
        ..Config::default()
    };
    let mut heap = Heap::with_capacity(4096, config).unwrap();

    // a single fan-out wider than the mark stack, with a second level to
    // prove the dropped children still get traced
    let root = heap.alloc(3 * BYTES_PER_BLOCK, AllocFlags::empty(), false);
    let fan_out = 3 * WORDS_PER_BLOCK;
    let mut children = Vec::new();
    let mut grandchildren = Vec::new();
    for slot in 0..fan_out {
        let child = heap.alloc(16, AllocFlags::empty(), false);
        let grandchild = heap.alloc(16, AllocFlags::empty(), false);
        unsafe {
            write_child(root, slot, child);
            write_child(child, 0, grandchild);
        }
        children.push(child);
        grandchildren.push(grandchild);
    }

    heap.collect_start();
    heap.collect_ptr(root);
    heap.collect_end();

    assert!(!heap.mark_stack_overflow);
    check_no_marks(&heap);
    assert_eq!(heap.nbytes(root), 3 * BYTES_PER_BLOCK);
    for ptr in children.iter().chain(grandchildren.iter()) {
        assert_eq!(heap.nbytes(*ptr), 16);
    }
}

#[test]
fn realloc_grows_in_place_into_freed_neighbour() {
    let mut heap = new_heap();
    let p = heap.alloc(16, AllocFlags::empty(), false);
    let q = heap.alloc(16, AllocFlags::empty(), false);
    unsafe {
        std::ptr::write_bytes(p, 0xab, 16);
        heap.free(q);
    }

    let r = unsafe { heap.realloc(p, 48, false) };
    assert_eq!(r, p);
    assert_eq!(heap.nbytes(r), 48);
    for i in 0..16 {
        assert_eq!(unsafe { *r.add(i) }, 0xab);
    }
    check_tail_invariant(&heap);
}

#[test]
fn realloc_shrink_returns_blocks() {
    let mut heap = new_heap();
    let p = heap.alloc(48, AllocFlags::empty(), false);
    let r = unsafe { heap.realloc(p, 16, false) };
    assert_eq!(r, p);
    assert_eq!(heap.nbytes(p), 16);

    // the shrunk-off blocks are immediately reusable
    let q = heap.alloc(32, AllocFlags::empty(), false);
    assert_eq!(q as usize, p as usize + BYTES_PER_BLOCK);
}

#[test]
fn realloc_moves_only_when_allowed() {
    let mut heap = new_heap();
    let p = heap.alloc(16, AllocFlags::empty(), false);
    let blocker = heap.alloc(16, AllocFlags::empty(), false);
    unsafe { std::ptr::write_bytes(p, 0x5c, 16) };

    assert!(unsafe { heap.realloc(p, 128, false) }.is_null());
    assert_eq!(heap.nbytes(p), 16);

    let r = unsafe { heap.realloc(p, 128, true) };
    assert!(!r.is_null());
    assert_ne!(r, p);
    assert_eq!(heap.nbytes(r), 128);
    assert_eq!(heap.nbytes(p), 0);
    assert_eq!(heap.nbytes(blocker), 16);
    for i in 0..16 {
        assert_eq!(unsafe { *r.add(i) }, 0x5c);
    }
}

#[test]
fn realloc_of_null_allocates_and_zero_frees() {
    let mut heap = new_heap();
    let p = unsafe { heap.realloc(std::ptr::null_mut(), 24, false) };
    assert!(!p.is_null());
    assert_eq!(heap.nbytes(p), 32);
    assert!(unsafe { heap.realloc(p, 0, false) }.is_null());
    assert_eq!(heap.nbytes(p), 0);
}

#[test]
fn long_lived_lane_sits_at_the_top() {
    let mut heap = new_heap();
    let short = heap.alloc(16, AllocFlags::empty(), false);
    let long = heap.alloc(16, AllocFlags::empty(), true);

    assert!((long as usize) > short as usize);
    let pool_mid =
        heap.layout.pool_start + (heap.layout.pool_end - heap.layout.pool_start) / 2;
    assert!(long as usize >= pool_mid);

    // later long-lived allocations stack downward from the first
    let long2 = heap.alloc(16, AllocFlags::empty(), true);
    assert!((long2 as usize) < long as usize);
    assert!(long2 as usize >= pool_mid);
}

#[test]
fn make_long_lived_copies_up_and_leaves_old_until_collect() {
    let mut heap = new_heap();
    let old = heap.alloc(32, AllocFlags::empty(), false);
    unsafe { std::ptr::write_bytes(old, 0x7e, 32) };

    let new = unsafe { heap.make_long_lived(old) };
    assert_ne!(new, old);
    assert!(new as usize > old as usize);
    for i in 0..32 {
        assert_eq!(unsafe { *new.add(i) }, 0x7e);
    }
    // the old copy is reclaimed by the next collection, not before
    assert_eq!(heap.nbytes(old), 32);
    heap.collect_start();
    heap.collect_ptr(new);
    heap.collect_end();
    assert_eq!(heap.nbytes(old), 0);
    assert_eq!(heap.nbytes(new), 32);

    // a pointer already in the long lane comes back unchanged
    assert_eq!(unsafe { heap.make_long_lived(new) }, new);
}

#[test]
fn never_free_pins_across_collections() {
    let mut heap = new_heap();
    let pinned_a = heap.alloc(16, AllocFlags::empty(), false);
    let pinned_b = heap.alloc(16, AllocFlags::empty(), false);
    let doomed = heap.alloc(16, AllocFlags::empty(), false);

    assert!(unsafe { heap.never_free(pinned_a) });
    assert!(unsafe { heap.never_free(pinned_b) });
    assert!(!unsafe { heap.never_free(std::ptr::null_mut()) });

    heap.collect_start();
    heap.collect_end();

    assert_eq!(heap.nbytes(pinned_a), 16);
    assert_eq!(heap.nbytes(pinned_b), 16);
    assert_eq!(heap.nbytes(doomed), 0);
}

#[cfg(feature = "finaliser")]
#[test]
fn finaliser_fires_on_sweep_only() {
    let calls = Rc::new(Cell::new(0usize));
    let calls2 = calls.clone();
    let config = Config {
        finaliser: Some(Box::new(move |_ptr| calls2.set(calls2.get() + 1))),
        ..Config::default()
    };
    let mut heap = Heap::with_capacity(4096, config).unwrap();

    let obj = heap.alloc(32, AllocFlags::FINALISER, false);
    assert!(heap.has_finaliser(obj));
    // the first word is the host type slot; a null slot suppresses dispatch
    unsafe { (obj as *mut usize).write(0x1) };

    heap.collect_start();
    heap.collect_end();
    assert_eq!(calls.get(), 1);
    assert_eq!(heap.nbytes(obj), 0);

    // an explicit free never dispatches
    let obj2 = heap.alloc(32, AllocFlags::FINALISER, false);
    unsafe { (obj2 as *mut usize).write(0x1) };
    unsafe { heap.free(obj2) };
    assert_eq!(calls.get(), 1);
    heap.collect_start();
    heap.collect_end();
    assert_eq!(calls.get(), 1);
}

#[cfg(feature = "finaliser")]
#[test]
fn finaliser_skipped_while_type_slot_null() {
    let calls = Rc::new(Cell::new(0usize));
    let calls2 = calls.clone();
    let config = Config {
        finaliser: Some(Box::new(move |_ptr| calls2.set(calls2.get() + 1))),
        ..Config::default()
    };
    let mut heap = Heap::with_capacity(4096, config).unwrap();

    let obj = heap.alloc(32, AllocFlags::FINALISER, false);
    assert!(heap.has_finaliser(obj));
    heap.collect_start();
    heap.collect_end();
    assert_eq!(calls.get(), 0);
    assert_eq!(heap.nbytes(obj), 0);
}

#[cfg(feature = "finaliser")]
#[test]
fn deinit_runs_finalisers() {
    let calls = Rc::new(Cell::new(0usize));
    let calls2 = calls.clone();
    let config = Config {
        finaliser: Some(Box::new(move |_ptr| calls2.set(calls2.get() + 1))),
        ..Config::default()
    };
    let mut heap = Heap::with_capacity(4096, config).unwrap();
    let obj = heap.alloc(32, AllocFlags::FINALISER, false);
    unsafe { (obj as *mut usize).write(0x1) };

    heap.deinit();
    assert_eq!(calls.get(), 1);
    assert!(!heap.alloc_possible());
    assert_eq!(heap.nbytes(obj), 0);
}

#[test]
fn registered_root_sources_drive_collect() {
    let roots: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
    let roots2 = roots.clone();

    let mut heap = new_heap();
    heap.add_root_source(move |heap: &mut Heap| {
        for &root in roots2.borrow().iter() {
            heap.collect_ptr(root as *const u8);
        }
    });

    let kept = heap.alloc(32, AllocFlags::empty(), false);
    let dropped = heap.alloc(32, AllocFlags::empty(), false);
    roots.borrow_mut().push(kept as usize);

    heap.collect();
    assert_eq!(heap.nbytes(kept), 32);
    assert_eq!(heap.nbytes(dropped), 0);

    roots.borrow_mut().clear();
    heap.collect();
    assert_eq!(heap.nbytes(kept), 0);
    assert_eq!(heap.total_collections(), 2);
}

#[test]
fn threshold_triggers_collection() {
    let config = Config {
        alloc_threshold: Some(4),
        ..Config::default()
    };
    let mut heap = Heap::with_capacity(4096, config).unwrap();

    // nothing is rooted, so the threshold collection reclaims everything
    for _ in 0..8 {
        assert!(!heap.alloc(16, AllocFlags::empty(), false).is_null());
    }
    assert!(heap.total_collections() > 0);
    let info = heap.info();
    assert!(info.used < 8 * BYTES_PER_BLOCK);
}

#[test]
fn full_heap_without_auto_collect_returns_null() {
    let config = Config {
        auto_collect: false,
        ..Config::default()
    };
    let mut heap = Heap::with_capacity(4096, config).unwrap();

    let total_blocks = heap.layout.total_blocks();
    for _ in 0..total_blocks {
        assert!(!heap.alloc(16, AllocFlags::empty(), false).is_null());
    }
    assert!(heap.alloc(16, AllocFlags::empty(), false).is_null());
    assert_eq!(heap.total_collections(), 0);
    assert_eq!(heap.info().free, 0);
}

#[test]
fn exhausted_heap_collects_unreachable_and_retries() {
    let mut heap = new_heap();
    let total_blocks = heap.layout.total_blocks();
    for _ in 0..total_blocks {
        assert!(!heap.alloc(16, AllocFlags::empty(), false).is_null());
    }
    // no root sources are registered, so the forced collection frees the
    // whole pool and the retry succeeds
    let p = heap.alloc(16, AllocFlags::empty(), false);
    assert!(!p.is_null());
    assert_eq!(heap.total_collections(), 1);
}

#[test]
fn locked_heap_refuses_work() {
    let mut heap = new_heap();
    let p = heap.alloc(16, AllocFlags::empty(), false);

    heap.lock();
    assert!(heap.is_locked());
    assert!(heap.alloc(16, AllocFlags::empty(), false).is_null());
    assert!(unsafe { heap.realloc(p, 64, true) }.is_null());
    unsafe { heap.free(p) };
    assert_eq!(heap.nbytes(p), 16);

    heap.unlock();
    assert!(!heap.is_locked());
    unsafe { heap.free(p) };
    assert_eq!(heap.nbytes(p), 0);
}

#[test]
fn nbytes_rejects_foreign_and_interior_pointers() {
    let mut heap = new_heap();
    let p = heap.alloc(48, AllocFlags::empty(), false);
    assert_eq!(heap.nbytes(p), 48);
    // interior block pointers are tails, not heads
    assert_eq!(heap.nbytes(unsafe { p.add(BYTES_PER_BLOCK) }), 0);
    assert_eq!(heap.nbytes(unsafe { p.add(1) }), 0);
    let foreign = 0x10usize as *const u8;
    assert_eq!(heap.nbytes(foreign), 0);
    assert!(!heap.has_finaliser(foreign));
}

#[test]
fn info_counts_runs() {
    let mut heap = new_heap();
    let one = heap.alloc(16, AllocFlags::empty(), false);
    let _two = heap.alloc(32, AllocFlags::empty(), false);
    let _three = heap.alloc(48, AllocFlags::empty(), false);

    let info = heap.info();
    assert_eq!(info.used, 6 * BYTES_PER_BLOCK);
    assert_eq!(info.num_1block, 1);
    assert_eq!(info.num_2block, 1);
    assert_eq!(info.max_block, 3);
    assert_eq!(info.free, info.total - info.used);

    unsafe { heap.free(one) };
    let info = heap.info();
    assert_eq!(info.num_1block, 0);
    assert_eq!(info.max_free, heap.layout.total_blocks() - 6);
}

#[test]
fn dump_renders_block_map() {
    let mut heap = new_heap();
    let _p = heap.alloc(48, AllocFlags::empty(), false);
    let dump = heap.dump_alloc_table();
    assert!(dump.starts_with("GC memory layout; from "));
    assert!(dump.contains("h=="));
    assert!(dump.contains("lines all free"));
}

#[test]
fn collection_resets_scan_hints() {
    let mut heap = new_heap();
    let keep = heap.alloc(16, AllocFlags::empty(), false);
    for _ in 0..10 {
        heap.alloc(16, AllocFlags::empty(), false);
    }
    heap.collect_start();
    heap.collect_ptr(keep);
    heap.collect_end();

    // the freed space right after `keep` must be findable again
    let p = heap.alloc(16, AllocFlags::empty(), false);
    assert_eq!(p as usize, keep as usize + BYTES_PER_BLOCK);
    check_tail_invariant(&heap);
    check_no_marks(&heap);
}
