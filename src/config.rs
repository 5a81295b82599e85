use crate::error::FatalError;
use crate::globals::DEFAULT_MARK_STACK_SIZE;

/// Invoked by the sweep for every dying object whose finaliser flag is set
/// and whose first word (the host type slot) is non-null. Runs with the
/// heap locked; it must not call back into the allocator.
pub type FinaliserHook = Box<dyn FnMut(*mut u8)>;

/// Invoked on fatal misuse. Must not return.
pub type FatalHook = fn(FatalError) -> !;

pub struct Config {
    /// Capacity of the bounded mark stack, in block indices. Overflow is
    /// recovered by whole-table rescans, so small values only cost time.
    pub mark_stack_size: usize,
    /// When set, a collection is forced once `alloc_threshold` blocks have
    /// been handed out since the last one.
    pub alloc_threshold: Option<usize>,
    /// When false, allocation never triggers a collection on its own and
    /// a full heap simply yields null.
    pub auto_collect: bool,
    pub finaliser: Option<FinaliserHook>,
    pub fatal: FatalHook,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mark_stack_size: DEFAULT_MARK_STACK_SIZE,
            alloc_threshold: None,
            auto_collect: true,
            finaliser: None,
            fatal: fatal_abort,
        }
    }
}

pub fn fatal_abort(err: FatalError) -> ! {
    eprintln!("{}", err);
    std::process::abort();
}
