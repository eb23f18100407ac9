use thiserror::Error;

/// Failure of a public heap operation. The heap is left in its prior valid
/// state whenever one of these is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  #[error("zero-sized request")]
  ZeroSize,

  #[error("request of {size} bytes overflows the block size range")]
  TooLarge { size: usize },

  #[error("heap source exhausted while growing by {requested} bytes")]
  Exhausted { requested: usize },

  #[error("free of {offset:#x}, which was never handed out by this heap")]
  InvalidFree { offset: usize },

  #[error("double free of {offset:#x}")]
  DoubleFree { offset: usize },

  #[error("heap source already holds {len} bytes")]
  SourceInUse { len: usize },

  #[error(transparent)]
  Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
  #[error("size-class limits must be strictly ascending, got {0:?}")]
  ClassLimitsNotAscending([usize; 3]),

  #[error("smallest size-class limit {0} leaves no room for a minimum block")]
  ClassLimitTooSmall(usize),

  #[error("split ratio {0}/{1} must be a non-zero fraction of at least 1")]
  InvalidSplitRatio(usize, usize),
}

/// Structural damage found by [`Heap::check`](crate::Heap::check).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapCorruption {
  #[error("prologue block is damaged")]
  BadPrologue,

  #[error("epilogue at {offset:#x} is not at the heap end {heap_end:#x}")]
  BadEpilogue { offset: usize, heap_end: usize },

  #[error("block {offset:#x} is not 8-byte aligned")]
  Misaligned { offset: usize },

  #[error("block {offset:#x} has invalid size {size}")]
  BadSize { offset: usize, size: usize },

  #[error("block {offset:#x} runs past the heap end")]
  PastHeapEnd { offset: usize },

  #[error("block {offset:#x} header {header:#x} differs from footer {footer:#x}")]
  TagMismatch { offset: usize, header: u32, footer: u32 },

  #[error("free block {offset:#x} is not linked into any size-class list")]
  Unlisted { offset: usize },

  #[error("list node {offset:#x} in class {class} is not a free block")]
  NotFree { offset: usize, class: usize },

  #[error("free block {offset:#x} of size {size} sits in class {class}, expected {expected}")]
  WrongClass {
    offset: usize,
    size: usize,
    class: usize,
    expected: usize,
  },

  #[error("free block {offset:#x} is reachable more than once")]
  Duplicate { offset: usize },

  #[error("list node {offset:#x} has back link {found:#x}, expected {expected:#x}")]
  BrokenLink {
    offset: usize,
    found: usize,
    expected: usize,
  },
}
