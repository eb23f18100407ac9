use std::collections::HashSet;

use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::{debug, trace};

use crate::{
  config::{FreeCheck, HeapConfig},
  error::AllocError,
  free_list::{self, HEADS_END, SizeClasses},
  layout::{self, DSIZE, WSIZE},
  source::{HeapSource, VecHeap},
};

// =============================================================================
// Reserved layout
// =============================================================================

/// Payload offset of the prologue block (header at 44, footer at 48).
pub(crate) const PROLOGUE: usize = HEADS_END + DSIZE;

/// Payload offset of the first real block; the epilogue header sits just before it.
pub(crate) const FIRST_BLOCK: usize = PROLOGUE + DSIZE;

/// Bytes claimed by `initialize`: sentinels, padding, prologue, epilogue.
const INITIAL_BYTES: usize = FIRST_BLOCK;

const _: () = assert!(PROLOGUE % DSIZE == 0);
const _: () = assert!(FIRST_BLOCK % DSIZE == 0);
const _: () = assert!(INITIAL_BYTES == 56);

// =============================================================================
// Types
// =============================================================================

/// Handle to an allocated payload: its byte offset inside the heap.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct HeapPtr(usize);

impl HeapPtr {
  /// Wraps a raw offset. Passing it to `free`/`reallocate` is only sound if the
  /// heap handed it out (or [`FreeCheck::Strict`] is on).
  pub const fn from_offset(offset: usize) -> Self {
    Self(offset)
  }

  pub const fn offset(self) -> usize {
    self.0
  }
}

/// One block as seen by a heap walk.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockInfo {
  /// Payload offset.
  pub offset: usize,
  /// Total size, tags included.
  pub size: usize,
  pub allocated: bool,
}

/// Segregated-fit heap over a growable [`HeapSource`].
///
/// All state lives in the managed bytes except the tuning, the skip-policy rng
/// and, in strict mode, the set of live payloads.
pub struct Heap<S = VecHeap, R = StdRng> {
  pub(crate) source: S,
  pub(crate) config: HeapConfig,
  pub(crate) classes: SizeClasses,
  pub(crate) rng: R,
  /// Set while a reallocate runs: every merge is taken.
  pub(crate) force_coalesce: bool,
  pub(crate) live: Option<HashSet<usize>>,
}

impl<S: HeapSource> Heap<S, StdRng> {
  /// Builds a heap whose skip policy draws from `StdRng` seeded with `config.seed`.
  pub fn new(source: S, config: HeapConfig) -> Result<Self, AllocError> {
    let rng = StdRng::seed_from_u64(config.seed);
    Self::with_rng(source, config, rng)
  }
}

impl<S: HeapSource, R: Rng> Heap<S, R> {
  pub fn with_rng(source: S, config: HeapConfig, rng: R) -> Result<Self, AllocError> {
    config.validate()?;
    let live = (config.free_check == FreeCheck::Strict).then(HashSet::new);
    let mut heap = Self {
      source,
      classes: SizeClasses::new(config.class_limits),
      config,
      rng,
      force_coalesce: false,
      live,
    };
    heap.initialize()?;
    Ok(heap)
  }

  fn initialize(&mut self) -> Result<(), AllocError> {
    if !self.source.is_empty() {
      return Err(AllocError::SourceInUse {
        len: self.source.len(),
      });
    }
    self
      .source
      .grow(INITIAL_BYTES)
      .ok_or(AllocError::Exhausted {
        requested: INITIAL_BYTES,
      })?;

    let mem = self.source.bytes_mut();
    free_list::reset(mem);
    layout::put(mem, HEADS_END, 0);
    layout::set_block(mem, PROLOGUE, DSIZE, true);
    layout::set_epilogue(mem, FIRST_BLOCK);

    debug!(
      classes = ?self.config.class_limits,
      seed = self.config.seed,
      "heap initialized"
    );
    Ok(())
  }

  // ===========================================================================
  // Region manager
  // ===========================================================================

  /// Grows the heap by at least `bytes`, turning the extension into a free
  /// block that is coalesced with a free predecessor. Returns the surviving block.
  pub(crate) fn extend(&mut self, bytes: usize) -> Result<usize, AllocError> {
    let size = layout::align_up(bytes, DSIZE);
    let bp = self
      .source
      .grow(size)
      .ok_or(AllocError::Exhausted { requested: size })?;

    let mem = self.source.bytes_mut();
    layout::set_block(mem, bp, size, false);
    layout::set_epilogue(mem, bp + size);

    debug!(bytes = size, heap = self.source.len(), "extended heap");
    Ok(self.coalesce(bp))
  }

  /// Appends `small_reserve_blocks` free blocks for the smallest class. They
  /// are deliberately left unmerged. Exhaustion here is not an error.
  fn reserve_small_blocks(&mut self) {
    let count = self.config.small_reserve_blocks;
    if count == 0 {
      return;
    }
    let step = self.classes.smallest_class_block();
    let Some(mut bp) = step
      .checked_mul(count)
      .and_then(|bytes| self.source.grow(bytes))
    else {
      debug!(count, "skipped small-block reserve");
      return;
    };

    let mem = self.source.bytes_mut();
    for _ in 0..count {
      layout::set_block(mem, bp, step, false);
      free_list::insert(mem, bp, 0);
      bp += step;
    }
    layout::set_epilogue(mem, bp);
  }

  // ===========================================================================
  // Front end
  // ===========================================================================

  /// Allocates a block with at least `size` usable bytes.
  pub fn allocate(&mut self, size: usize) -> Result<HeapPtr, AllocError> {
    let bp = self.allocate_block(size)?;
    self.track(bp);
    trace!(size, offset = bp, "allocate");
    Ok(HeapPtr(bp))
  }

  /// Like [`allocate`](Self::allocate), with the first `size` bytes zeroed.
  pub fn allocate_zeroed(&mut self, size: usize) -> Result<HeapPtr, AllocError> {
    let ptr = self.allocate(size)?;
    self.payload_mut(ptr)[..size].fill(0);
    Ok(ptr)
  }

  pub(crate) fn allocate_block(&mut self, size: usize) -> Result<usize, AllocError> {
    if size == 0 {
      return Err(AllocError::ZeroSize);
    }
    let asize = layout::adjusted_size(size).ok_or(AllocError::TooLarge { size })?;

    if let Some(bp) = self.find_fit(asize) {
      return Ok(self.place(bp, asize));
    }

    let bp = self.extend(asize)?;
    if self.classes.may_hold(0, asize) {
      self.reserve_small_blocks();
    }
    Ok(self.place(bp, asize))
  }

  /// Releases `ptr` and merges it with free neighbours.
  ///
  /// With [`FreeCheck::PassThrough`] every pointer is accepted; freeing
  /// anything not currently allocated corrupts the heap.
  pub fn free(&mut self, ptr: HeapPtr) -> Result<(), AllocError> {
    self.check_live(ptr.0)?;
    self.untrack(ptr.0);
    trace!(offset = ptr.0, "free");
    self.free_block(ptr.0);
    Ok(())
  }

  pub(crate) fn free_block(&mut self, bp: usize) {
    let mem = self.source.bytes_mut();
    let size = layout::size(mem, bp);
    layout::set_block(mem, bp, size, false);
    self.coalesce(bp);
  }

  /// Resizes `ptr` to at least `size` usable bytes.
  ///
  /// `None` behaves like [`allocate`](Self::allocate). Shrinking (including to
  /// zero) keeps the block as it is. Growing absorbs free neighbours when they
  /// suffice, otherwise moves the payload. On failure the original block is
  /// still allocated and its contents untouched.
  pub fn reallocate(&mut self, ptr: Option<HeapPtr>, size: usize) -> Result<HeapPtr, AllocError> {
    let Some(ptr) = ptr else {
      return self.allocate(size);
    };
    self.check_live(ptr.0)?;

    let bp = ptr.0;
    let asize = layout::adjusted_size(size).ok_or(AllocError::TooLarge { size })?;
    let old_size = layout::size(self.source.bytes(), bp);
    if asize <= old_size {
      trace!(offset = bp, size, "reallocate kept block");
      return Ok(ptr);
    }

    self.force_coalesce = true;
    let grown = self.grow_block(bp, old_size, asize, size);
    self.force_coalesce = false;

    let new_bp = grown?;
    if new_bp != bp {
      self.untrack(bp);
      self.track(new_bp);
    }
    trace!(from = bp, to = new_bp, size, "reallocate");
    Ok(HeapPtr(new_bp))
  }

  fn grow_block(
    &mut self,
    bp: usize,
    old_size: usize,
    asize: usize,
    size: usize,
  ) -> Result<usize, AllocError> {
    let mem = self.source.bytes();
    let next = layout::next_blk(mem, bp);
    let next_size = if layout::is_allocated(mem, next) {
      None
    } else {
      Some(layout::size(mem, next))
    };
    let prev = if layout::prev_allocated(mem, bp) {
      None
    } else {
      let prev = layout::prev_blk(mem, bp);
      Some((prev, layout::size(mem, prev)))
    };

    // Successor alone.
    if let Some(next_size) = next_size
      && old_size + next_size >= asize
    {
      let mem = self.source.bytes_mut();
      free_list::remove(mem, next);
      layout::set_block(mem, bp, old_size + next_size, true);
      return Ok(bp);
    }

    if let Some((prev, prev_size)) = prev {
      // Predecessor alone.
      if prev_size + old_size >= asize {
        return Ok(self.slide_into_prev(prev, bp, prev_size + old_size, old_size));
      }
      // Both neighbours.
      if let Some(next_size) = next_size
        && prev_size + old_size + next_size >= asize
      {
        free_list::remove(self.source.bytes_mut(), next);
        let total = prev_size + old_size + next_size;
        return Ok(self.slide_into_prev(prev, bp, total, old_size));
      }
      return self.move_by_copy(bp, old_size, size);
    }

    self.move_by_free(bp, old_size, size)
  }

  /// Takes the free block `prev` (and anything already unlinked after `bp`),
  /// moving the payload of `bp` down to `prev`.
  fn slide_into_prev(&mut self, prev: usize, bp: usize, total: usize, old_size: usize) -> usize {
    let mem = self.source.bytes_mut();
    free_list::remove(mem, prev);
    mem.copy_within(bp..bp + old_size - DSIZE, prev);
    layout::set_block(mem, prev, total, true);
    prev
  }

  /// Move path when the predecessor is allocated: free first so the block can
  /// grow into its own successor or the heap end, then allocate with slack.
  /// The two payload words that become free-list links are saved across the free.
  fn move_by_free(&mut self, bp: usize, old_size: usize, size: usize) -> Result<usize, AllocError> {
    let mem = self.source.bytes();
    let saved = (layout::get(mem, bp), layout::get(mem, bp + WSIZE));

    self.free_block(bp);
    let request = size.saturating_add(self.config.realloc_slack);
    match self.allocate_block(request) {
      Ok(new_bp) => {
        let mem = self.source.bytes_mut();
        if new_bp != bp {
          mem.copy_within(bp + DSIZE..bp + old_size - DSIZE, new_bp + DSIZE);
        }
        layout::put(mem, new_bp, saved.0);
        layout::put(mem, new_bp + WSIZE, saved.1);
        Ok(new_bp)
      }
      Err(err) => {
        // Nothing moved: `bp` heads a free block that still holds the
        // payload, possibly merged with its successor. Take it back and
        // give the successor its own block again.
        let classes = self.classes;
        let mem = self.source.bytes_mut();
        free_list::remove(mem, bp);
        let merged = layout::size(mem, bp);
        layout::set_block(mem, bp, old_size, true);
        if merged > old_size {
          let next = bp + old_size;
          layout::set_block(mem, next, merged - old_size, false);
          free_list::insert(mem, next, classes.classify(merged - old_size));
        }
        layout::put(mem, bp, saved.0);
        layout::put(mem, bp + WSIZE, saved.1);
        Err(err)
      }
    }
  }

  /// Move path when a free predecessor exists but is too small: allocate
  /// elsewhere, copy, then free.
  fn move_by_copy(&mut self, bp: usize, old_size: usize, size: usize) -> Result<usize, AllocError> {
    let request = size.saturating_add(self.config.realloc_slack);
    let new_bp = self.allocate_block(request)?;
    let mem = self.source.bytes_mut();
    mem.copy_within(bp..bp + old_size - DSIZE, new_bp);
    self.free_block(bp);
    Ok(new_bp)
  }

  // ===========================================================================
  // Introspection
  // ===========================================================================

  /// Usable payload bytes of `ptr`'s block.
  pub fn usable_size(&self, ptr: HeapPtr) -> usize {
    layout::size(self.source.bytes(), ptr.0) - DSIZE
  }

  pub fn payload(&self, ptr: HeapPtr) -> &[u8] {
    let len = self.usable_size(ptr);
    &self.source.bytes()[ptr.0..ptr.0 + len]
  }

  pub fn payload_mut(&mut self, ptr: HeapPtr) -> &mut [u8] {
    let len = self.usable_size(ptr);
    &mut self.source.bytes_mut()[ptr.0..ptr.0 + len]
  }

  pub fn heap_size(&self) -> usize {
    self.source.len()
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  pub fn size_classes(&self) -> &SizeClasses {
    &self.classes
  }

  /// Walks every block between the prologue and the epilogue.
  pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
    let mem = self.source.bytes();
    let mut bp = FIRST_BLOCK;
    core::iter::from_fn(move || {
      let tag = layout::tag(mem, bp);
      if tag.size == 0 {
        return None;
      }
      let info = BlockInfo {
        offset: bp,
        size: tag.size,
        allocated: tag.allocated,
      };
      bp += tag.size;
      Some(info)
    })
  }

  /// Free blocks of `class`, most recently inserted first.
  pub fn free_list(&self, class: usize) -> impl Iterator<Item = usize> + '_ {
    free_list::iter(self.source.bytes(), class)
  }
}
