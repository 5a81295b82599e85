/// Granule of the pool. Every pointer handed out by the heap is aligned to
/// this and covers a whole number of blocks.
pub const BYTES_PER_BLOCK: usize = 16;
pub const WORDS_PER_BLOCK: usize = BYTES_PER_BLOCK / core::mem::size_of::<usize>();

/// Four 2-bit block states are packed into one allocation table byte.
pub const BLOCKS_PER_ATB: usize = 4;
/// Eight 1-bit finaliser flags are packed into one finaliser table byte.
pub const BLOCKS_PER_FTB: usize = 8;

/// Number of per-size first-free buckets kept by the free index. Runs of
/// `ATB_INDICES` blocks or more all share the last bucket.
pub const ATB_INDICES: usize = 8;

pub const DEFAULT_MARK_STACK_SIZE: usize = 64;

pub const ENABLE_FINALISER: bool = cfg!(feature = "finaliser");
pub const CONSERVATIVE_CLEAR: bool = cfg!(feature = "conservative-clear");

pub(crate) const BITS_PER_BYTE: usize = 8;
