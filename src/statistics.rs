//! Heap introspection: aggregate statistics and the block-map dump.

use std::fmt::Write as _;

use crate::block_table::BlockState;
use crate::globals::BYTES_PER_BLOCK;
use crate::heap::Heap;

/// One walk over the allocation table. `total`, `used` and `free` are in
/// bytes; the run statistics are in blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapInfo {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    /// Longest free run.
    pub max_free: usize,
    /// Longest allocation.
    pub max_block: usize,
    pub num_1block: usize,
    pub num_2block: usize,
}

struct FormattedSize {
    size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;
        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }
        let msize = ksize / 1024f64;
        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }
        write!(f, "{:.1}M", msize)
    }
}

fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for HeapInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "GC: total: {}, used: {}, free: {}",
            formatted_size(self.total),
            formatted_size(self.used),
            formatted_size(self.free)
        )?;
        write!(
            f,
            " No. of 1-blocks: {}, 2-blocks: {}, max blk sz: {}, max free sz: {}",
            self.num_1block, self.num_2block, self.max_block, self.max_free
        )
    }
}

impl Heap {
    /// Aggregate usage statistics from a single table walk.
    pub fn info(&self) -> HeapInfo {
        self.gate.enter();
        let mut info = HeapInfo {
            total: self.layout.pool_end - self.layout.pool_start,
            ..HeapInfo::default()
        };

        let total_blocks = self.layout.total_blocks();
        let mut len = 0usize;
        let mut len_free = 0usize;
        let mut block = 0usize;
        let mut finish = block == total_blocks;
        // Run lengths are closed out by looking at the next block's state:
        // a free or head block ends an allocation, a head or the table end
        // ends a free run.
        while !finish {
            match self.atb.get(block) {
                BlockState::Free => {
                    info.free += 1;
                    len_free += 1;
                    len = 0;
                }
                BlockState::Head => {
                    info.used += 1;
                    len = 1;
                }
                BlockState::Tail => {
                    info.used += 1;
                    len += 1;
                }
                // outside a collection no block is marked
                BlockState::Mark => {}
            }

            block += 1;
            finish = block == total_blocks;
            let next = if finish { None } else { Some(self.atb.get(block)) };

            if finish || next == Some(BlockState::Free) || next == Some(BlockState::Head) {
                if len == 1 {
                    info.num_1block += 1;
                } else if len == 2 {
                    info.num_2block += 1;
                }
                if len > info.max_block {
                    info.max_block = len;
                }
                if finish || next == Some(BlockState::Head) {
                    if len_free > info.max_free {
                        info.max_free = len_free;
                    }
                    len_free = 0;
                }
            }
        }

        info.used *= BYTES_PER_BLOCK;
        info.free *= BYTES_PER_BLOCK;
        self.gate.exit();
        info
    }

    /// Render one character per block: `.` free, `h` head, `=` tail, `m`
    /// marked head. Lines that are entirely free are collapsed. Debugging
    /// aid only.
    pub fn dump_alloc_table(&self) -> String {
        const BLOCKS_PER_LINE: usize = 64;
        self.gate.enter();
        let mut out = String::new();
        let _ = write!(out, "GC memory layout; from {:#x}:", self.layout.pool_start);
        let total_blocks = self.layout.total_blocks();
        let mut bl = 0usize;
        while bl < total_blocks {
            if bl % BLOCKS_PER_LINE == 0 {
                // check whether the coming lines contain only free blocks
                let mut bl2 = bl;
                while bl2 < total_blocks && self.atb.get(bl2) == BlockState::Free {
                    bl2 += 1;
                }
                if bl2 - bl >= 2 * BLOCKS_PER_LINE {
                    let _ = write!(
                        out,
                        "\n       ({} lines all free)",
                        (bl2 - bl) / BLOCKS_PER_LINE
                    );
                    bl = bl2 & !(BLOCKS_PER_LINE - 1);
                    if bl >= total_blocks {
                        break;
                    }
                }
                let _ = write!(out, "\n{:05x}: ", (bl * BYTES_PER_BLOCK) & 0xfffff);
            }
            out.push(match self.atb.get(bl) {
                BlockState::Free => '.',
                BlockState::Head => 'h',
                BlockState::Tail => '=',
                BlockState::Mark => 'm',
            });
            bl += 1;
        }
        out.push('\n');
        self.gate.exit();
        out
    }

    /// Snapshot of the raw allocation table bytes, mainly for state
    /// comparison in tests.
    pub fn alloc_table_bytes(&self) -> Vec<u8> {
        self.gate.enter();
        let bytes = (0..self.layout.alloc_table_byte_len)
            .map(|i| self.atb.raw_byte(i))
            .collect();
        self.gate.exit();
        bytes
    }

    /// Log the aggregate statistics at debug level.
    pub fn dump_info(&self) {
        log::debug!("{}", self.info());
    }
}
