//! Segregated free lists.
//!
//! Each class has a sentinel node in the reserved area at the heap base. A
//! sentinel looks like the link words of a free block (prev at `+0`, next at
//! `+4`) but carries no tags. Free blocks are threaded through their first
//! two payload words, newest first, terminated by [`NIL`].
//!
//! These functions are the only code that writes links.

use crate::{
  config::CLASS_COUNT,
  layout::{self, DSIZE, NIL},
};

/// Offset of the first sentinel. `[0, 8)` stays unused so that offset 0 can mean "no link".
pub const HEADS_BASE: usize = DSIZE;

/// End of the sentinel area.
pub const HEADS_END: usize = HEADS_BASE + CLASS_COUNT * DSIZE;

/// Sentinel node of `class`.
#[inline(always)]
pub const fn head(class: usize) -> usize {
  HEADS_BASE + class * DSIZE
}

// =============================================================================
// Size classes
// =============================================================================

/// Ordered class thresholds; class `i` holds sizes below `limits[i]`, the last
/// class everything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClasses {
  limits: [usize; CLASS_COUNT - 1],
}

impl SizeClasses {
  pub const fn new(limits: [usize; CLASS_COUNT - 1]) -> Self {
    Self { limits }
  }

  /// Smallest class whose upper bound exceeds `size`.
  #[inline]
  pub fn classify(&self, size: usize) -> usize {
    self
      .limits
      .iter()
      .position(|&limit| size < limit)
      .unwrap_or(CLASS_COUNT - 1)
  }

  /// Whether a request of `asize` may be served from `class` at all.
  #[inline]
  pub fn may_hold(&self, class: usize, asize: usize) -> bool {
    self.limits.get(class).is_none_or(|&limit| asize <= limit)
  }

  pub fn limit(&self, class: usize) -> Option<usize> {
    self.limits.get(class).copied()
  }

  /// Largest aligned block size that still lands in the smallest class.
  pub fn smallest_class_block(&self) -> usize {
    layout::align_down(self.limits[0] - 1, DSIZE)
  }
}

// =============================================================================
// List operations
// =============================================================================

/// Initializes every sentinel to an empty list.
pub fn reset(mem: &mut [u8]) {
  for class in 0..CLASS_COUNT {
    layout::set_prev_link(mem, head(class), NIL);
    layout::set_next_link(mem, head(class), NIL);
  }
}

/// Pushes `bp` at the front of `class`.
pub fn insert(mem: &mut [u8], bp: usize, class: usize) {
  let head = head(class);
  let first = layout::next_link(mem, head);
  layout::set_prev_link(mem, bp, head);
  layout::set_next_link(mem, bp, first);
  layout::set_next_link(mem, head, bp);
  if first != NIL {
    layout::set_prev_link(mem, first, bp);
  }
}

/// Unlinks `bp` from whatever list holds it.
pub fn remove(mem: &mut [u8], bp: usize) {
  let prev = layout::prev_link(mem, bp);
  let next = layout::next_link(mem, bp);
  layout::set_next_link(mem, prev, next);
  if next != NIL {
    layout::set_prev_link(mem, next, prev);
  }
}

/// Puts `new` at the list position currently held by `old`, saving an
/// unlink/relink pair when a block moves but keeps its class.
pub fn replace(mem: &mut [u8], old: usize, new: usize) {
  let prev = layout::prev_link(mem, old);
  let next = layout::next_link(mem, old);
  layout::set_prev_link(mem, new, prev);
  layout::set_next_link(mem, new, next);
  layout::set_next_link(mem, prev, new);
  if next != NIL {
    layout::set_prev_link(mem, next, new);
  }
}

/// Iterates the blocks of `class`, front to back.
pub fn iter(mem: &[u8], class: usize) -> Iter<'_> {
  Iter {
    mem,
    cursor: layout::next_link(mem, head(class)),
  }
}

pub struct Iter<'a> {
  mem: &'a [u8],
  cursor: usize,
}

impl Iterator for Iter<'_> {
  type Item = usize;

  fn next(&mut self) -> Option<usize> {
    if self.cursor == NIL {
      return None;
    }
    let bp = self.cursor;
    self.cursor = layout::next_link(self.mem, bp);
    Some(bp)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::DEFAULT_CLASS_LIMITS;

  fn classes() -> SizeClasses {
    SizeClasses::new(DEFAULT_CLASS_LIMITS)
  }

  #[test]
  fn classify_picks_smallest_exceeding_limit() {
    let c = classes();
    assert_eq!(c.classify(16), 0);
    assert_eq!(c.classify(120), 0);
    assert_eq!(c.classify(128), 1);
    assert_eq!(c.classify(511), 1);
    assert_eq!(c.classify(512), 2);
    assert_eq!(c.classify(4095), 2);
    assert_eq!(c.classify(4096), 3);
    assert_eq!(c.classify(1 << 24), 3);
  }

  #[test]
  fn eligibility_is_inclusive_and_last_class_unbounded() {
    let c = classes();
    assert!(c.may_hold(0, 128));
    assert!(!c.may_hold(0, 136));
    assert!(c.may_hold(3, usize::MAX));
  }

  #[test]
  fn smallest_class_block_stays_in_class_zero() {
    let c = classes();
    assert_eq!(c.smallest_class_block(), 120);
    assert_eq!(c.classify(c.smallest_class_block()), 0);
  }

  #[test]
  fn insert_remove_replace() {
    let mut mem = vec![0u8; 256];
    reset(&mut mem);

    insert(&mut mem, 64, 1);
    insert(&mut mem, 96, 1);
    insert(&mut mem, 128, 1);
    assert_eq!(iter(&mem, 1).collect::<Vec<_>>(), vec![128, 96, 64]);
    assert_eq!(layout::prev_link(&mem, 128), head(1));

    remove(&mut mem, 96);
    assert_eq!(iter(&mem, 1).collect::<Vec<_>>(), vec![128, 64]);
    assert_eq!(layout::prev_link(&mem, 64), 128);

    replace(&mut mem, 128, 160);
    assert_eq!(iter(&mem, 1).collect::<Vec<_>>(), vec![160, 64]);
    assert_eq!(layout::prev_link(&mem, 64), 160);
    assert_eq!(layout::prev_link(&mem, 160), head(1));

    remove(&mut mem, 64);
    remove(&mut mem, 160);
    assert_eq!(iter(&mem, 1).count(), 0);
    assert!((0..CLASS_COUNT).all(|c| iter(&mem, c).next().is_none()));
  }

  #[test]
  fn heads_fill_the_reserved_area() {
    assert_eq!(head(0), 8);
    assert_eq!(head(CLASS_COUNT - 1) + DSIZE, HEADS_END);
    assert_eq!(HEADS_END, 40);
  }
}
