//! Heap consistency walk and free validation.

use std::collections::BTreeSet;

use rand::Rng;
use tracing::warn;

use crate::{
  config::CLASS_COUNT,
  error::{AllocError, HeapCorruption},
  free_list,
  heap::{FIRST_BLOCK, Heap, PROLOGUE},
  layout::{self, ALIGNMENT, DSIZE, MIN_BLOCK_SIZE, NIL, Tag},
  source::HeapSource,
};

/// Totals gathered by [`Heap::check`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub heap_bytes: usize,
  pub allocated_blocks: usize,
  pub allocated_bytes: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub free_per_class: [usize; CLASS_COUNT],
}

impl<S: HeapSource, R: Rng> Heap<S, R> {
  /// Walks every block and every free list, verifying:
  /// - prologue and epilogue are intact and the epilogue ends the heap;
  /// - each block is aligned, sized in double words and has matching tags;
  /// - each free block is on exactly one list, the one its size maps to;
  /// - list back links mirror forward links and lists hold only free blocks.
  pub fn check(&self) -> Result<HeapStats, HeapCorruption> {
    let mem = self.source.bytes();
    let end = mem.len();

    let prologue = Tag::new(DSIZE, true);
    if end < FIRST_BLOCK
      || layout::tag(mem, PROLOGUE) != prologue
      || layout::footer_tag(mem, PROLOGUE) != prologue
    {
      return Err(HeapCorruption::BadPrologue);
    }

    let mut stats = HeapStats {
      heap_bytes: end,
      ..HeapStats::default()
    };
    let mut free = BTreeSet::new();

    let mut bp = FIRST_BLOCK;
    loop {
      if bp > end {
        return Err(HeapCorruption::PastHeapEnd { offset: bp });
      }
      let header = layout::get(mem, layout::hdr(bp));
      let tag = Tag::unpack(header);
      if tag.size == 0 {
        if !tag.allocated || bp != end {
          return Err(HeapCorruption::BadEpilogue {
            offset: bp,
            heap_end: end,
          });
        }
        break;
      }
      if bp % ALIGNMENT != 0 {
        return Err(HeapCorruption::Misaligned { offset: bp });
      }
      if tag.size < MIN_BLOCK_SIZE || tag.size % ALIGNMENT != 0 {
        return Err(HeapCorruption::BadSize {
          offset: bp,
          size: tag.size,
        });
      }
      if bp + tag.size > end {
        return Err(HeapCorruption::PastHeapEnd { offset: bp });
      }
      let footer = layout::get(mem, bp + tag.size - DSIZE);
      if footer != header {
        return Err(HeapCorruption::TagMismatch {
          offset: bp,
          header,
          footer,
        });
      }

      if tag.allocated {
        stats.allocated_blocks += 1;
        stats.allocated_bytes += tag.size;
      } else {
        stats.free_blocks += 1;
        stats.free_bytes += tag.size;
        free.insert(bp);
      }
      bp += tag.size;
    }

    let mut listed = BTreeSet::new();
    for class in 0..CLASS_COUNT {
      let mut expected_prev = free_list::head(class);
      let mut node = layout::next_link(mem, expected_prev);
      while node != NIL {
        if !free.contains(&node) {
          return Err(HeapCorruption::NotFree {
            offset: node,
            class,
          });
        }
        if !listed.insert(node) {
          return Err(HeapCorruption::Duplicate { offset: node });
        }
        let back = layout::prev_link(mem, node);
        if back != expected_prev {
          return Err(HeapCorruption::BrokenLink {
            offset: node,
            found: back,
            expected: expected_prev,
          });
        }
        let size = layout::size(mem, node);
        let expected = self.classes.classify(size);
        if expected != class {
          return Err(HeapCorruption::WrongClass {
            offset: node,
            size,
            class,
            expected,
          });
        }
        stats.free_per_class[class] += 1;
        expected_prev = node;
        node = layout::next_link(mem, node);
      }
    }

    if let Some(&offset) = free.difference(&listed).next() {
      return Err(HeapCorruption::Unlisted { offset });
    }
    Ok(stats)
  }

  // ===========================================================================
  // Free validation
  // ===========================================================================

  /// Rejects frees of pointers that are not live, when strict checking is on.
  pub(crate) fn check_live(&self, bp: usize) -> Result<(), AllocError> {
    let Some(live) = &self.live else {
      return Ok(());
    };
    if live.contains(&bp) {
      return Ok(());
    }

    let err = if self.looks_like_free_block(bp) {
      AllocError::DoubleFree { offset: bp }
    } else {
      AllocError::InvalidFree { offset: bp }
    };
    warn!(offset = bp, error = %err, "rejected free");
    Err(err)
  }

  fn looks_like_free_block(&self, bp: usize) -> bool {
    bp >= FIRST_BLOCK
      && bp % ALIGNMENT == 0
      && bp < self.source.len()
      && self.blocks().any(|block| block.offset == bp && !block.allocated)
  }

  pub(crate) fn track(&mut self, bp: usize) {
    if let Some(live) = &mut self.live {
      live.insert(bp);
    }
  }

  pub(crate) fn untrack(&mut self, bp: usize) {
    if let Some(live) = &mut self.live {
      live.remove(&bp);
    }
  }
}
