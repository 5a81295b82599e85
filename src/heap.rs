//! The heap proper: a statically sized region carved into fixed-size
//! blocks, an allocator over it, and the state shared with the collector.
//!
//! Long-lived allocations are placed at the end of the pool rather than
//! the start. That localizes the heap churn to one portion of memory (the
//! start of the pool) and keeps fragmentation down.

use std::ptr::null_mut;

use log::{debug, trace};

use crate::arena::Arena;
use crate::block_table::{AllocTable, BlockState, FinaliserTable};
use crate::collector::MarkRoots;
use crate::config::{Config, FatalHook, FinaliserHook};
use crate::error::{FatalError, HeapError};
use crate::free_index::FreeIndex;
use crate::globals::{
    BLOCKS_PER_ATB, BYTES_PER_BLOCK, CONSERVATIVE_CLEAR, ENABLE_FINALISER, WORDS_PER_BLOCK,
};
use crate::layout::HeapLayout;
use crate::lock::LockGate;

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct AllocFlags: u32 {
        /// The object carries a finaliser; the sweep will dispatch the
        /// host hook before reclaiming it.
        const FINALISER = 1 << 0;
    }
}

pub struct Heap {
    pub(crate) gate: LockGate,
    /// Re-entrancy counter. While positive, `alloc` and `realloc` return
    /// null and `free` is a no-op; a collection holds it for its whole
    /// window so finalisers and root hooks cannot allocate.
    pub(crate) lock_depth: usize,
    pub(crate) layout: HeapLayout,
    pub(crate) atb: AllocTable,
    pub(crate) ftb: FinaliserTable,
    pub(crate) free_index: FreeIndex,
    /// Lowest pool address currently holding a long-lived allocation.
    /// Starts at the pool end and only moves down as the long lane grows.
    pub(crate) lowest_long_lived: usize,
    /// Head of the chained pages of pinned pointers, or 0. Each page is
    /// one block of words; slot 0 links the next page.
    pub(crate) permanent_pointers: usize,
    pub(crate) mark_stack: Box<[usize]>,
    pub(crate) mark_stack_overflow: bool,
    pub(crate) auto_collect: bool,
    /// Blocks handed out since the last collection, and the amount that
    /// forces one. `usize::MAX` disables the threshold.
    pub(crate) alloc_amount: usize,
    pub(crate) alloc_threshold: usize,
    pub(crate) collected: usize,
    pub(crate) total_collections: usize,
    pub(crate) root_sources: Vec<Box<dyn MarkRoots>>,
    pub(crate) finaliser_hook: Option<FinaliserHook>,
    pub(crate) fatal_hook: FatalHook,
    /// Keeps the backing mapping of `with_capacity` alive.
    #[allow(dead_code)]
    arena: Option<Arena>,
}

// The heap owns its tables and pool region outright; a host that shares it
// between threads must hand out access through its own synchronization.
unsafe impl Send for Heap {}

impl Heap {
    /// An uninitialised heap. Nothing can be allocated until [`Heap::init`]
    /// hands it a region.
    pub fn new(config: Config) -> Self {
        Self {
            gate: LockGate::new(),
            lock_depth: 0,
            layout: HeapLayout::EMPTY,
            atb: AllocTable::empty(),
            ftb: FinaliserTable::empty(),
            free_index: FreeIndex::new(),
            lowest_long_lived: 0,
            permanent_pointers: 0,
            mark_stack: vec![0; config.mark_stack_size].into_boxed_slice(),
            mark_stack_overflow: false,
            auto_collect: config.auto_collect,
            alloc_amount: 0,
            alloc_threshold: config.alloc_threshold.unwrap_or(usize::MAX),
            collected: 0,
            total_collections: 0,
            root_sources: Vec::new(),
            finaliser_hook: config.finaliser,
            fatal_hook: config.fatal,
            arena: None,
        }
    }

    /// Heap over a fresh anonymous mapping of `size` bytes.
    pub fn with_capacity(size: usize, config: Config) -> Result<Self, HeapError> {
        let arena = Arena::new(size);
        let mut heap = Heap::new(config);
        unsafe { heap.init(arena.aligned(), arena.end())? };
        heap.arena = Some(arena);
        Ok(heap)
    }

    /// Takes ownership of `[start, end)` and carves it into tables and
    /// pool. May be called again only after [`Heap::deinit`].
    ///
    /// # Safety
    ///
    /// The region must be valid, writable and unaliased for as long as the
    /// heap is live.
    pub unsafe fn init(&mut self, start: *mut u8, end: *mut u8) -> Result<(), HeapError> {
        debug_assert!(!self.alloc_possible(), "init on a live heap");
        debug!(
            "initializing heap: {:p}..{:p} = {} bytes",
            start,
            end,
            end as usize - start as usize
        );
        let layout = HeapLayout::compute(start as usize, end as usize)?;

        // clear the tables; pool bytes are cleared per allocation instead
        std::ptr::write_bytes(
            layout.alloc_table_start as *mut u8,
            0,
            layout.alloc_table_byte_len + layout.finaliser_table_byte_len,
        );
        self.atb = AllocTable::from_raw(
            layout.alloc_table_start as *mut u8,
            layout.alloc_table_byte_len,
        );
        self.ftb = FinaliserTable::from_raw(
            layout.finaliser_table_start as *mut u8,
            layout.finaliser_table_byte_len,
        );
        self.free_index.reset(layout.alloc_table_byte_len);

        // lowered as long-lived objects land
        self.lowest_long_lived = layout.pool_end;
        self.permanent_pointers = 0;
        self.lock_depth = 0;
        self.alloc_amount = 0;
        self.mark_stack_overflow = false;
        self.layout = layout;

        debug!(
            "  alloc table at {:#x}, {} bytes, {} blocks",
            layout.alloc_table_start,
            layout.alloc_table_byte_len,
            layout.total_blocks()
        );
        if ENABLE_FINALISER {
            debug!(
                "  finaliser table at {:#x}, {} bytes",
                layout.finaliser_table_start, layout.finaliser_table_byte_len
            );
        }
        debug!(
            "  pool at {:#x}, {} bytes",
            layout.pool_start,
            layout.pool_end - layout.pool_start
        );
        Ok(())
    }

    /// Finalises and reclaims everything, then marks the heap dead. Any
    /// later `alloc`/`free` trips the fatal hook.
    pub fn deinit(&mut self) {
        if !self.alloc_possible() {
            return;
        }
        self.sweep_all();
        self.layout = HeapLayout::EMPTY;
        self.atb = AllocTable::empty();
        self.ftb = FinaliserTable::empty();
        self.permanent_pointers = 0;
    }

    /// False before `init` and after `deinit`.
    #[inline]
    pub fn alloc_possible(&self) -> bool {
        self.layout.pool_start != 0
    }

    pub fn lock(&mut self) {
        self.gate.enter();
        self.lock_depth += 1;
        self.gate.exit();
    }

    pub fn unlock(&mut self) {
        self.gate.enter();
        self.lock_depth -= 1;
        self.gate.exit();
    }

    pub fn is_locked(&self) -> bool {
        self.lock_depth != 0
    }

    /// Forces a collection once this many blocks have been allocated since
    /// the previous one. `None` turns the trigger off.
    pub fn set_alloc_threshold(&mut self, threshold: Option<usize>) {
        self.gate.enter();
        self.alloc_threshold = threshold.unwrap_or(usize::MAX);
        self.gate.exit();
    }

    /// When disabled, a full heap yields null instead of collecting.
    pub fn set_auto_collect(&mut self, enabled: bool) {
        self.gate.enter();
        self.auto_collect = enabled;
        self.gate.exit();
    }

    /// Heads reclaimed by the most recent collection.
    pub fn last_collected(&self) -> usize {
        self.collected
    }

    pub fn total_collections(&self) -> usize {
        self.total_collections
    }

    /// Allocate `n_bytes`, rounded up to whole blocks. Returns null when
    /// the size is zero, the heap is locked, or no run can be found even
    /// after a collection. Long-lived allocations are placed from the top
    /// of the pool downward.
    pub fn alloc(&mut self, n_bytes: usize, flags: AllocFlags, long_lived: bool) -> *mut u8 {
        let has_finaliser = flags.contains(AllocFlags::FINALISER);
        let n_blocks = (n_bytes + BYTES_PER_BLOCK - 1) / BYTES_PER_BLOCK;
        trace!("alloc({} bytes -> {} blocks)", n_bytes, n_blocks);

        if n_blocks == 0 {
            return null_mut();
        }
        if !self.alloc_possible() {
            (self.fatal_hook)(FatalError::AllocOutsideVm);
        }

        self.gate.enter();
        if self.lock_depth > 0 {
            self.gate.exit();
            return null_mut();
        }

        let mut collected = !self.auto_collect;
        if !collected && self.alloc_amount >= self.alloc_threshold {
            self.gate.exit();
            self.collect();
            collected = true;
            self.gate.enter();
        }

        // Once the scan runs past the crossover block it has left its own
        // lane; collecting first gives it the closest free run inside the
        // lane instead.
        let crossover_block = self.layout.block_from_ptr(self.lowest_long_lived);
        let mut found_block = usize::MAX;
        let mut n_free: usize;
        let mut keep_looking = true;
        loop {
            let bucket = FreeIndex::bucket(n_blocks);
            let first_free = self.free_index.first_free(bucket) as isize;
            let last_free = self.free_index.last_free() as isize;
            let (direction, start): (isize, isize) = if long_lived {
                (-1, last_free)
            } else {
                (1, first_free)
            };

            // look for a run of n_blocks available blocks
            n_free = 0;
            let mut i = start;
            while keep_looking && first_free <= i && i <= last_free {
                let a = self.atb.raw_byte(i as usize);
                // four block states are packed into this byte
                let mut j: isize = if direction < 0 { 3 } else { 0 };
                while keep_looking && (0..=3).contains(&j) {
                    if (a >> (2 * j as u32)) & 0x3 == 0 {
                        n_free += 1;
                        if n_free >= n_blocks {
                            found_block = i as usize * BLOCKS_PER_ATB + j as usize;
                            keep_looking = false;
                        }
                    } else {
                        if !collected {
                            let block = i as usize * BLOCKS_PER_ATB + j as usize;
                            if (direction > 0 && block >= crossover_block)
                                || (direction < 0 && block < crossover_block)
                            {
                                keep_looking = false;
                            }
                        }
                        n_free = 0;
                    }
                    j += direction;
                }
                i += direction;
            }
            if n_free >= n_blocks {
                break;
            }

            self.gate.exit();
            if collected {
                return null_mut();
            }
            debug!("alloc({}): no free mem, triggering GC", n_bytes);
            self.collect();
            collected = true;
            keep_looking = true;
            self.gate.enter();
        }
        debug_assert!(found_block != usize::MAX);

        // The found run ends at found_block for a forward scan and starts
        // there for a reverse one.
        let (start_block, end_block) = if long_lived {
            let start = found_block;
            let end = found_block + n_free - 1;
            // the long lane is contiguous, so everything below this run is
            // the new upper bound for free space
            self.free_index
                .note_claim_long(start.saturating_sub(1) / BLOCKS_PER_ATB);
            (start, end)
        } else {
            let end = found_block;
            let start = found_block + 1 - n_free;
            self.free_index
                .note_claim_short(n_blocks, (end + 1) / BLOCKS_PER_ATB);
            (start, end)
        };

        // mark first block as used head, rest as used tail
        self.atb.free_to_head(start_block);
        for bl in start_block + 1..=end_block {
            self.atb.free_to_tail(bl);
        }

        let ret_ptr = self.layout.ptr_from_block(start_block) as *mut u8;

        // An earlier long-lived placement moves the crossover down; the
        // boundary is also what lets make_long_lived skip pointers that
        // already live in the long lane.
        if long_lived && (ret_ptr as usize) < self.lowest_long_lived {
            self.lowest_long_lived = ret_ptr as usize;
        }

        self.alloc_amount += n_blocks;
        self.gate.exit();

        unsafe {
            if CONSERVATIVE_CLEAR {
                // zero the whole run so stale words cannot pin anything
                std::ptr::write_bytes(ret_ptr, 0, (end_block - start_block + 1) * BYTES_PER_BLOCK);
            } else {
                // Zero only the slack past n_bytes. Those bytes may still
                // hold old heap pointers, and if the caller never writes
                // them they would keep dead objects alive through the next
                // trace.
                std::ptr::write_bytes(
                    ret_ptr.add(n_bytes),
                    0,
                    (end_block - start_block + 1) * BYTES_PER_BLOCK - n_bytes,
                );
            }
        }

        if ENABLE_FINALISER && has_finaliser {
            // clear the type slot in case it is never set
            unsafe { (ret_ptr as *mut usize).write(0) };
            self.gate.enter();
            self.ftb.set(start_block);
            self.gate.exit();
        }

        trace!("alloc -> {:p}", ret_ptr);
        ret_ptr
    }

    /// Force-free one allocation. Finalisers do not run here; that is the
    /// sweep's job. A locked heap makes this a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a head pointer previously returned by this
    /// heap and not freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        self.gate.enter();
        if self.lock_depth > 0 {
            self.gate.exit();
            return;
        }
        trace!("free({:p})", ptr);
        if ptr.is_null() {
            self.gate.exit();
            return;
        }
        if !self.alloc_possible() {
            (self.fatal_hook)(FatalError::AllocOutsideVm);
        }
        debug_assert!(self.layout.verify_ptr(ptr as usize));
        let start_block = self.layout.block_from_ptr(ptr as usize);
        debug_assert!(self.atb.get(start_block) == BlockState::Head);

        if ENABLE_FINALISER {
            self.ftb.clear(start_block);
        }

        // free the head and all of its tail blocks
        let total_blocks = self.layout.total_blocks();
        let mut block = start_block;
        loop {
            self.atb.any_to_free(block);
            block += 1;
            if block >= total_blocks || self.atb.get(block) != BlockState::Tail {
                break;
            }
        }

        self.free_index
            .note_free(block - start_block, start_block / BLOCKS_PER_ATB);
        self.gate.exit();
    }

    /// Size in bytes of the allocation behind `ptr`, or 0 for anything
    /// that is not a live head pointer.
    pub fn nbytes(&self, ptr: *const u8) -> usize {
        self.gate.enter();
        if self.layout.verify_ptr(ptr as usize) {
            let block = self.layout.block_from_ptr(ptr as usize);
            if self.atb.get(block) == BlockState::Head {
                let n_blocks = self.chain_len(block);
                self.gate.exit();
                return n_blocks * BYTES_PER_BLOCK;
            }
        }
        self.gate.exit();
        0
    }

    pub fn has_finaliser(&self, ptr: *const u8) -> bool {
        if !ENABLE_FINALISER {
            return false;
        }
        self.gate.enter();
        let result = self.layout.verify_ptr(ptr as usize)
            && self.ftb.get(self.layout.block_from_ptr(ptr as usize));
        self.gate.exit();
        result
    }

    /// Resize in place when the neighbouring blocks allow it, otherwise
    /// move if `allow_move` permits. Null in, plain alloc; zero bytes,
    /// plain free.
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::free`] for a non-null `ptr`.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, n_bytes: usize, allow_move: bool) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(n_bytes, AllocFlags::empty(), false);
        }
        if n_bytes == 0 {
            self.free(ptr);
            return null_mut();
        }

        self.gate.enter();
        if self.lock_depth > 0 {
            self.gate.exit();
            return null_mut();
        }

        debug_assert!(self.layout.verify_ptr(ptr as usize));
        let block = self.layout.block_from_ptr(ptr as usize);
        debug_assert!(self.atb.get(block) == BlockState::Head);

        let new_blocks = (n_bytes + BYTES_PER_BLOCK - 1) / BYTES_PER_BLOCK;

        // Walk the existing chain to size it, then keep counting through
        // the free blocks after it until either enough space for the new
        // size is in sight or something else is in the way. The chain
        // length is needed in full so a shrink knows what to drop.
        let max_block = self.layout.total_blocks();
        let mut n_blocks = 1usize;
        let mut n_free = 0usize;
        let mut bl = block + 1;
        while bl < max_block {
            match self.atb.get(bl) {
                BlockState::Tail => n_blocks += 1,
                BlockState::Free => {
                    n_free += 1;
                    if n_blocks + n_free >= new_blocks {
                        break;
                    }
                }
                _ => break,
            }
            bl += 1;
        }

        if new_blocks == n_blocks {
            self.gate.exit();
            return ptr;
        }

        if new_blocks < n_blocks {
            // free the unneeded tail blocks
            for bl in block + new_blocks..block + n_blocks {
                self.atb.any_to_free(bl);
            }
            self.free_index
                .note_free(n_blocks - new_blocks, (block + new_blocks) / BLOCKS_PER_ATB);
            self.gate.exit();
            trace!("realloc {:p}: shrink to {} blocks", ptr, new_blocks);
            return ptr;
        }

        if new_blocks <= n_blocks + n_free {
            // grow into the adjacent free run
            for bl in block + n_blocks..block + new_blocks {
                debug_assert!(self.atb.get(bl) == BlockState::Free);
                self.atb.free_to_tail(bl);
            }
            self.gate.exit();

            if CONSERVATIVE_CLEAR {
                std::ptr::write_bytes(
                    ptr.add(n_blocks * BYTES_PER_BLOCK),
                    0,
                    (new_blocks - n_blocks) * BYTES_PER_BLOCK,
                );
            } else {
                std::ptr::write_bytes(ptr.add(n_bytes), 0, new_blocks * BYTES_PER_BLOCK - n_bytes);
            }
            trace!("realloc {:p}: grow in place to {} blocks", ptr, new_blocks);
            return ptr;
        }

        let ftb_state = ENABLE_FINALISER && self.ftb.get(block);
        self.gate.exit();

        if !allow_move {
            // not allowed to move the block, report failure
            return null_mut();
        }

        let flags = if ftb_state {
            AllocFlags::FINALISER
        } else {
            AllocFlags::empty()
        };
        let ptr_out = self.alloc(n_bytes, flags, false);
        if ptr_out.is_null() {
            return ptr_out;
        }

        trace!("realloc {:p} -> {:p}", ptr, ptr_out);
        std::ptr::copy_nonoverlapping(ptr, ptr_out, n_blocks * BYTES_PER_BLOCK);
        self.free(ptr);
        ptr_out
    }

    /// Migrate an allocation into the long-lived lane. Never fails: on any
    /// obstacle the original pointer comes back unchanged. After a
    /// successful migration the old copy stays readable until the next
    /// collection reclaims it, but must not be mutated; other references
    /// to it keep working until that collection.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this heap.
    pub unsafe fn make_long_lived(&mut self, old_ptr: *mut u8) -> *mut u8 {
        // already in the long-lived section, not worth moving
        if old_ptr as usize >= self.lowest_long_lived {
            return old_ptr;
        }
        let n_bytes = self.nbytes(old_ptr);
        if n_bytes == 0 {
            return old_ptr;
        }
        let flags = if self.has_finaliser(old_ptr) {
            AllocFlags::FINALISER
        } else {
            AllocFlags::empty()
        };

        let new_ptr = self.alloc(n_bytes, flags, true);
        if new_ptr.is_null() {
            return old_ptr;
        }
        if old_ptr as usize > new_ptr as usize {
            // the new spot is lower in the heap than the old one, give it back
            self.free(new_ptr);
            return old_ptr;
        }
        // Copy and let the next collection delete the old copy; freeing it
        // here would invalidate second references that may still exist.
        std::ptr::copy_nonoverlapping(old_ptr, new_ptr, n_bytes);
        new_ptr
    }

    /// Pin `ptr` for the lifetime of the heap by parking it in the
    /// permanent-page roster. Returns false for foreign pointers or when
    /// the page allocation fails.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this heap.
    pub unsafe fn never_free(&mut self, ptr: *mut u8) -> bool {
        if self.nbytes(ptr) == 0 {
            return false;
        }
        // Each page is one block of pointer slots; slot 0 chains the next
        // page and the rest hold pinned pointers.
        let mut page = self.permanent_pointers as *mut *mut u8;
        let mut last_page = page;
        while !page.is_null() {
            for slot in 1..WORDS_PER_BLOCK {
                if (*page.add(slot)).is_null() {
                    *page.add(slot) = ptr;
                    return true;
                }
            }
            last_page = page;
            page = (*page).cast();
        }

        let next_page = self.alloc(BYTES_PER_BLOCK, AllocFlags::empty(), true) as *mut *mut u8;
        if next_page.is_null() {
            return false;
        }
        std::ptr::write_bytes(next_page.cast::<u8>(), 0, BYTES_PER_BLOCK);
        if self.permanent_pointers == 0 {
            self.permanent_pointers = next_page as usize;
        } else {
            *last_page = next_page.cast();
        }
        *next_page.add(1) = ptr;
        true
    }

    /// Number of blocks in the chain starting at `block`, which must be a
    /// head or marked head.
    #[inline]
    pub(crate) fn chain_len(&self, block: usize) -> usize {
        let total_blocks = self.layout.total_blocks();
        let mut n_blocks = 0;
        loop {
            n_blocks += 1;
            if block + n_blocks >= total_blocks
                || self.atb.get(block + n_blocks) != BlockState::Tail
            {
                return n_blocks;
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.deinit();
    }
}
