//! # Ember
//!
//! Ember is a mark-and-sweep garbage-collected heap for small managed
//! runtimes, the kind embedded scripting systems run on. It manages one
//! statically sized region, carves it into fixed-size blocks and tracks
//! them through a packed side table, so the whole collector state lives
//! inside the buffer the host hands over.
//!
//! # Features
//! - Conservative tracing: any block-aligned machine word inside the pool
//!   keeps its target alive, so the host needs no type maps.
//! - Bounded mark stack with overflow recovery by rescanning.
//! - A long-lived allocation lane at the top of the pool that keeps churn
//!   at the bottom and fragmentation down.
//! - In-place `realloc`, per-object finalisers, and a pinned-pointer
//!   roster for objects that must never be collected.
//!
//! The host drives collections: it opens the window with
//! [`Heap::collect_start`], feeds roots with [`Heap::collect_root`] and
//! [`Heap::collect_ptr`], and closes it with [`Heap::collect_end`], or it
//! registers [`MarkRoots`] sources and lets [`Heap::collect`] do the same.

pub mod arena;
pub mod block_table;
pub mod collector;
pub mod config;
pub mod error;
pub mod free_index;
pub mod globals;
pub mod heap;
pub mod layout;
pub mod lock;
pub mod statistics;

#[cfg(test)]
mod tests;

pub use collector::MarkRoots;
pub use config::Config;
pub use error::{FatalError, HeapError};
pub use heap::{AllocFlags, Heap};
pub use statistics::HeapInfo;
