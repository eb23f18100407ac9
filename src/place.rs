use rand::Rng;

use crate::{
  config::CLASS_COUNT,
  free_list,
  heap::Heap,
  layout::{self, MIN_BLOCK_SIZE},
  source::HeapSource,
};

impl<S: HeapSource, R: Rng> Heap<S, R> {
  /// Best fit inside the lowest class that has any block of at least `asize`.
  pub(crate) fn find_fit(&self, asize: usize) -> Option<usize> {
    let mem = self.source.bytes();
    (0..CLASS_COUNT)
      .filter(|&class| self.classes.may_hold(class, asize))
      .find_map(|class| best_fit(mem, class, asize))
  }

  /// Marks the listed free block `bp` allocated for a request of `asize`,
  /// splitting off the tail when it is large enough to be worth keeping.
  /// The allocated part always starts at `bp`.
  pub(crate) fn place(&mut self, bp: usize, asize: usize) -> usize {
    let (num, den) = self.config.split_ratio;
    let classes = self.classes;
    let mem = self.source.bytes_mut();
    let csize = layout::size(mem, bp);
    let remainder = csize - asize;

    if csize.saturating_mul(den) > asize.saturating_mul(num) && remainder >= MIN_BLOCK_SIZE {
      let rest = bp + asize;
      let rest_class = classes.classify(remainder);
      if classes.classify(csize) == rest_class {
        free_list::replace(mem, bp, rest);
      } else {
        free_list::remove(mem, bp);
        free_list::insert(mem, rest, rest_class);
      }
      layout::set_block(mem, bp, asize, true);
      layout::set_block(mem, rest, remainder, false);
    } else {
      free_list::remove(mem, bp);
      layout::set_block(mem, bp, csize, true);
    }
    bp
  }
}

/// Smallest block of `class` holding `asize`; an exact fit ends the scan.
fn best_fit(mem: &[u8], class: usize, asize: usize) -> Option<usize> {
  let mut best: Option<(usize, usize)> = None;
  for bp in free_list::iter(mem, class) {
    let size = layout::size(mem, bp);
    if size == asize {
      return Some(bp);
    }
    if size > asize && best.is_none_or(|(_, best_size)| size < best_size) {
      best = Some((bp, size));
    }
  }
  best.map(|(bp, _)| bp)
}
