#![allow(clippy::missing_safety_doc)]

//! Segregated-fit allocator over a contiguous, monotonically growing heap.
//!
//! Blocks carry boundary tags (header and footer words holding size and an
//! allocated bit). Free blocks sit on four explicit doubly linked lists, one
//! per size class, whose heads live in a reserved area at the start of the
//! heap. Placement is best fit within the lowest adequate class; freeing
//! coalesces with neighbours, randomly leaving some cross-class merges undone.

mod check;
mod coalesce;
mod config;
mod error;
mod free_list;
mod heap;
mod layout;
mod place;
mod source;
mod trace;

#[cfg(feature = "c_api")]
pub mod c_api;

pub use check::HeapStats;
pub use config::{
  CLASS_COUNT, DEFAULT_CLASS_LIMITS, DEFAULT_MERGE_SKIP_ONE_IN, DEFAULT_REALLOC_SLACK,
  DEFAULT_SEED, DEFAULT_SMALL_RESERVE_BLOCKS, DEFAULT_SPLIT_RATIO, FreeCheck, HeapConfig,
};
pub use error::{AllocError, ConfigError, HeapCorruption};
pub use free_list::SizeClasses;
pub use heap::{BlockInfo, Heap, HeapPtr};
pub use layout::{ALIGNMENT, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
pub use source::{DEFAULT_HEAP_LIMIT, HeapSource, MmapHeap, VecHeap};
pub use trace::{Op, ReplayError, ReplayOptions, ReplayReport, Trace, TraceError, replay};
