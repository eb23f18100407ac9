//! Boundary-tag coalescing.
//!
//! A block that just became free is merged with free neighbours. When a merge
//! keeps the class of the neighbour that is already listed, that neighbour's
//! list slot is reused in place. A merge that would move a block into another
//! class is skipped one time in `merge_skip_one_in`, trading some
//! fragmentation for fewer relinks. Merges with both neighbours free, and
//! every merge during a reallocate, always happen.

use rand::Rng;
use tracing::trace;

use crate::{
  free_list,
  heap::Heap,
  layout,
  source::HeapSource,
};

impl<S: HeapSource, R: Rng> Heap<S, R> {
  /// Merges the free block `bp` with its free neighbours and leaves the
  /// survivor on its class list. Returns the survivor.
  pub(crate) fn coalesce(&mut self, bp: usize) -> usize {
    let mem = self.source.bytes();
    let size = layout::size(mem, bp);
    let next = layout::next_blk(mem, bp);
    let prev_alloc = layout::prev_allocated(mem, bp);
    let next_alloc = layout::is_allocated(mem, next);

    match (prev_alloc, next_alloc) {
      (true, true) => {
        let class = self.classes.classify(size);
        free_list::insert(self.source.bytes_mut(), bp, class);
        bp
      }
      (true, false) => self.merge_next(bp, size, next),
      (false, true) => self.merge_prev(bp, size),
      (false, false) => self.merge_both(bp, size, next),
    }
  }

  /// Whether to leave a cross-class merge undone this time.
  fn skip_merge(&mut self) -> bool {
    let one_in = self.config.merge_skip_one_in;
    !self.force_coalesce && one_in != 0 && self.rng.gen_ratio(1, one_in)
  }

  fn merge_next(&mut self, bp: usize, size: usize, next: usize) -> usize {
    let next_size = layout::size(self.source.bytes(), next);
    let merged = size + next_size;
    let next_class = self.classes.classify(next_size);
    let class = self.classes.classify(merged);

    if next_class == class {
      let mem = self.source.bytes_mut();
      free_list::replace(mem, next, bp);
      layout::set_block(mem, bp, merged, false);
    } else if self.skip_merge() {
      trace!(offset = bp, next, "skipped merge with successor");
      let own = self.classes.classify(size);
      free_list::insert(self.source.bytes_mut(), bp, own);
    } else {
      let mem = self.source.bytes_mut();
      free_list::remove(mem, next);
      layout::set_block(mem, bp, merged, false);
      free_list::insert(mem, bp, class);
    }
    bp
  }

  fn merge_prev(&mut self, bp: usize, size: usize) -> usize {
    let mem = self.source.bytes();
    let prev = layout::prev_blk(mem, bp);
    let prev_size = layout::size(mem, prev);
    let merged = prev_size + size;
    let prev_class = self.classes.classify(prev_size);
    let class = self.classes.classify(merged);

    if prev_class == class {
      layout::set_block(self.source.bytes_mut(), prev, merged, false);
      prev
    } else if self.skip_merge() {
      trace!(offset = bp, prev, "skipped merge with predecessor");
      let own = self.classes.classify(size);
      free_list::insert(self.source.bytes_mut(), bp, own);
      bp
    } else {
      let mem = self.source.bytes_mut();
      free_list::remove(mem, prev);
      layout::set_block(mem, prev, merged, false);
      free_list::insert(mem, prev, class);
      prev
    }
  }

  fn merge_both(&mut self, bp: usize, size: usize, next: usize) -> usize {
    let mem = self.source.bytes();
    let prev = layout::prev_blk(mem, bp);
    let prev_size = layout::size(mem, prev);
    let merged = prev_size + size + layout::size(mem, next);
    let prev_class = self.classes.classify(prev_size);
    let class = self.classes.classify(merged);

    let mem = self.source.bytes_mut();
    free_list::remove(mem, next);
    layout::set_block(mem, prev, merged, false);
    if prev_class != class {
      free_list::remove(mem, prev);
      free_list::insert(mem, prev, class);
    }
    prev
  }
}

#[cfg(test)]
mod tests {
  use rand::rngs::mock::StepRng;

  use crate::{HeapConfig, heap::Heap, source::VecHeap};

  /// `gen_ratio` on a constant-zero stream always succeeds.
  fn always_skip() -> StepRng {
    StepRng::new(0, 0)
  }

  fn never_skip() -> StepRng {
    StepRng::new(u64::MAX, 0)
  }

  fn heap(rng: StepRng) -> Heap<VecHeap, StepRng> {
    let config = HeapConfig::default().with_small_reserve_blocks(0);
    Heap::with_rng(VecHeap::default(), config, rng).unwrap()
  }

  #[test]
  fn same_class_merge_with_successor_reuses_list_slot() {
    let mut heap = heap(always_skip());
    let a = heap.allocate(16).unwrap();
    let b = heap.allocate(16).unwrap();
    let _guard = heap.allocate(16).unwrap();

    heap.free(b).unwrap();
    heap.free(a).unwrap();

    // 24 + 24 stays in class 0, so the skip policy is never consulted.
    assert_eq!(heap.free_list(0).collect::<Vec<_>>(), vec![a.offset()]);
    assert_eq!(heap.blocks().next().map(|b| b.size), Some(48));
    heap.check().unwrap();
  }

  #[test]
  fn cross_class_merge_can_be_skipped() {
    let mut heap = heap(always_skip());
    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(100).unwrap();
    let _guard = heap.allocate(100).unwrap();

    heap.free(b).unwrap();
    heap.free(a).unwrap();

    // 112 + 112 would cross into class 1; both blocks stay apart in class 0.
    let mut listed: Vec<_> = heap.free_list(0).collect();
    listed.sort();
    assert_eq!(listed, vec![a.offset(), b.offset()]);
    assert_eq!(heap.free_list(1).count(), 0);
    heap.check().unwrap();
  }

  #[test]
  fn cross_class_merge_taken_when_not_skipped() {
    let mut heap = heap(never_skip());
    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(100).unwrap();
    let _guard = heap.allocate(100).unwrap();

    heap.free(a).unwrap();
    heap.free(b).unwrap();

    assert_eq!(heap.free_list(0).count(), 0);
    assert_eq!(heap.free_list(1).collect::<Vec<_>>(), vec![a.offset()]);
    assert_eq!(heap.blocks().next().map(|b| b.size), Some(224));
    heap.check().unwrap();
  }

  #[test]
  fn both_neighbours_always_merge() {
    let mut heap = heap(always_skip());
    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(100).unwrap();
    let c = heap.allocate(100).unwrap();
    let _guard = heap.allocate(100).unwrap();

    heap.free(a).unwrap();
    heap.free(c).unwrap();
    heap.free(b).unwrap();

    assert_eq!(heap.free_list(0).count(), 0);
    assert_eq!(heap.free_list(1).collect::<Vec<_>>(), vec![a.offset()]);
    assert_eq!(heap.blocks().next().map(|b| b.size), Some(336));
    heap.check().unwrap();
  }

  #[test]
  fn extension_merges_with_trailing_free_block() {
    let mut heap = heap(never_skip());
    let a = heap.allocate(200).unwrap();
    heap.free(a).unwrap();
    let before = heap.heap_size();

    // Nothing listed fits 608 bytes, so the heap grows by the full request
    // and the extension joins the trailing 208-byte block.
    let big = heap.allocate(600).unwrap();
    assert_eq!(big.offset(), a.offset());
    assert_eq!(heap.heap_size(), before + 608);
    assert_eq!(heap.usable_size(big), 208 + 608 - 8);
    heap.check().unwrap();
  }
}
