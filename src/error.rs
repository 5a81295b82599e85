use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeapError {
    /// The region handed to `init` cannot hold even one allocation table
    /// byte together with its pool blocks.
    #[error("heap region of {0} bytes is too small for the allocation table and pool")]
    HeapTooSmall(usize),
}

/// Misuse that the heap cannot report in-band. Routed through the fatal
/// hook, which must not return.
#[derive(Debug, Clone, Copy, Error)]
pub enum FatalError {
    #[error("heap used outside the VM lifetime (alloc or free before init)")]
    AllocOutsideVm,
}
