//! Conservative mark-and-sweep over the block pool.
//!
//! Tracing treats every machine word inside a live chain as a potential
//! pointer: anything block-aligned inside the pool marks its target. The
//! mark stack is bounded; when it fills, the overflow flag is raised and
//! recovery rescans the whole table for marked heads whose children were
//! dropped. The host drives a collection either through the
//! `collect_start` / `collect_root` / `collect_end` envelope or by
//! registering [`MarkRoots`] sources and calling [`Heap::collect`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use log::{debug, trace};

use crate::block_table::BlockState;
use crate::globals::{ENABLE_FINALISER, WORDS_PER_BLOCK};
use crate::heap::Heap;

/// A provider of GC roots, run between `collect_start` and `collect_end`
/// whenever the heap itself starts a collection. Implementations call
/// [`Heap::collect_ptr`] or [`Heap::collect_root`] for everything they
/// want kept alive.
pub trait MarkRoots {
    fn mark_roots(&mut self, heap: &mut Heap);
}

impl<F: FnMut(&mut Heap)> MarkRoots for F {
    fn mark_roots(&mut self, heap: &mut Heap) {
        self(heap);
    }
}

impl Heap {
    pub fn add_root_source(&mut self, source: impl MarkRoots + 'static) {
        self.gate.enter();
        self.root_sources.push(Box::new(source));
        self.gate.exit();
    }

    /// Run a full collection: envelope plus every registered root source.
    pub fn collect(&mut self) {
        let start = Instant::now();
        self.collect_start();
        let mut sources = std::mem::take(&mut self.root_sources);
        for source in sources.iter_mut() {
            source.mark_roots(self);
        }
        self.root_sources = sources;
        self.collect_end();
        debug!(
            "GC({}) pause {:.3}ms, collected {} heads",
            self.total_collections,
            start.elapsed().as_micros() as f64 / 1000.0,
            self.collected
        );
    }

    /// Open a collection window. Takes the gate and keeps it until
    /// `collect_end`; the raised lock depth makes any allocation attempt
    /// from inside the window return null.
    pub fn collect_start(&mut self) {
        self.gate.enter();
        self.lock_depth += 1;
        self.alloc_amount = 0;
        self.mark_stack_overflow = false;
        // the pinned-pointer pages root themselves and everything they hold
        let permanent = self.permanent_pointers;
        self.mark(permanent);
    }

    /// Mark a single candidate root.
    pub fn collect_ptr(&mut self, ptr: *const u8) {
        self.mark(ptr as usize);
    }

    /// Mark an array of candidate roots.
    ///
    /// # Safety
    ///
    /// `ptrs` must point to `len` readable words.
    pub unsafe fn collect_root(&mut self, ptrs: *const *const u8, len: usize) {
        for i in 0..len {
            let ptr = *ptrs.add(i);
            self.mark(ptr as usize);
        }
    }

    /// Close the collection window: recover from mark-stack overflow,
    /// sweep, reset the scan hints and release the gate.
    pub fn collect_end(&mut self) {
        self.deal_with_stack_overflow();
        self.sweep();
        // Free space is scattered arbitrarily after a sweep; the cheapest
        // correct hints are the widest ones, tightened by later allocs.
        self.free_index.reset(self.layout.alloc_table_byte_len);
        self.total_collections += 1;
        self.lock_depth -= 1;
        self.gate.exit();
    }

    /// Collect without marking anything: finalise and reclaim every
    /// allocation. Used on shutdown.
    pub fn sweep_all(&mut self) {
        self.gate.enter();
        self.lock_depth += 1;
        self.mark_stack_overflow = false;
        self.collect_end();
    }

    /// Marking is safe to hand arbitrary values; anything that is not a
    /// block-aligned pool address of a live head is ignored.
    pub(crate) fn mark(&mut self, addr: usize) {
        if self.layout.verify_ptr(addr) {
            let block = self.layout.block_from_ptr(addr);
            if self.atb.get(block) == BlockState::Head {
                // an unmarked head: mark it and everything it reaches
                trace!("mark({:#x})", addr);
                self.atb.head_to_mark(block);
                self.mark_subtree(block);
            }
        }
    }

    /// Depth-first trace from one marked head using the bounded stack.
    /// Children that do not fit on the stack stay marked and raise the
    /// overflow flag, so no reachable object is ever lost, only revisited.
    fn mark_subtree(&mut self, root_block: usize) {
        let mut block = root_block;
        let mut sp = 0usize;
        loop {
            let n_blocks = self.chain_len(block);

            // every word of the chain is a potential child pointer
            let base = self.layout.ptr_from_block(block) as *const usize;
            for i in 0..n_blocks * WORDS_PER_BLOCK {
                let word = unsafe { base.add(i).read() };
                if self.layout.verify_ptr(word) {
                    let child_block = self.layout.block_from_ptr(word);
                    if self.atb.get(child_block) == BlockState::Head {
                        trace!("mark child({:#x})", word);
                        self.atb.head_to_mark(child_block);
                        if sp < self.mark_stack.len() {
                            self.mark_stack[sp] = child_block;
                            sp += 1;
                        } else {
                            self.mark_stack_overflow = true;
                        }
                    }
                }
            }

            if sp == 0 {
                break;
            }
            sp -= 1;
            block = self.mark_stack[sp];
        }
    }

    /// Whole-table rescan for marked heads whose children were dropped.
    /// Each pass can only add marks, so the loop terminates once a pass
    /// fits every push on the stack.
    fn deal_with_stack_overflow(&mut self) {
        while self.mark_stack_overflow {
            self.mark_stack_overflow = false;
            for block in 0..self.layout.total_blocks() {
                if self.atb.get(block) == BlockState::Mark {
                    self.mark_subtree(block);
                }
            }
        }
    }

    /// Single linear pass: unmarked heads and their tails go back to free
    /// (dispatching finalisers first), marked heads drop their mark bit.
    fn sweep(&mut self) {
        self.collected = 0;
        // the hook is parked here so the sweep can borrow the tables freely
        let mut finaliser = self.finaliser_hook.take();
        let mut free_tail = false;
        for block in 0..self.layout.total_blocks() {
            match self.atb.get(block) {
                BlockState::Head => {
                    if ENABLE_FINALISER && self.ftb.get(block) {
                        let obj = self.layout.ptr_from_block(block) as *mut u8;
                        // a null type slot means the object was never set up
                        let type_slot = unsafe { (obj as *const usize).read() };
                        if type_slot != 0 {
                            if let Some(hook) = finaliser.as_mut() {
                                // a panicking finaliser must not unwind
                                // through the sweep
                                let _ = catch_unwind(AssertUnwindSafe(|| hook(obj)));
                            }
                        }
                        self.ftb.clear(block);
                    }
                    free_tail = true;
                    self.atb.any_to_free(block);
                    trace!("sweep({:#x})", self.layout.ptr_from_block(block));
                    self.collected += 1;
                }
                BlockState::Tail => {
                    if free_tail {
                        self.atb.any_to_free(block);
                    }
                }
                BlockState::Mark => {
                    self.atb.mark_to_head(block);
                    free_tail = false;
                }
                // A free slot leaves free_tail untouched. That is sound
                // because a tail can never directly follow a free block:
                // whatever free_tail still holds will only be consulted
                // again after the next head or marked head rewrites it.
                BlockState::Free => {}
            }
        }
        self.finaliser_hook = finaliser;
    }
}
