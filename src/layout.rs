//! Boundary-tag codec.
//!
//! Every block is addressed by the offset of its payload (`bp`). The header
//! word sits just before the payload and the footer word closes the block:
//!
//! ```text
//!   hdr        bp                                   ftr
//!   ┌──────────┬────────────────────────────────────┬──────────┐
//!   │ size | a │ payload (free: prev, next, ...)    │ size | a │
//!   └──────────┴────────────────────────────────────┴──────────┘
//!   bp - 4     bp                        bp + size - 8
//! ```
//!
//! All accessors take the raw heap bytes and assume a well-formed block.

// =============================================================================
// Constants
// =============================================================================

/// Boundary tag / link slot width.
pub const WSIZE: usize = 4;
/// Double word; also the alignment unit of payloads and block sizes.
pub const DSIZE: usize = 8;
pub const ALIGNMENT: usize = DSIZE;

/// Header + prev + next + footer.
pub const MIN_BLOCK_SIZE: usize = 2 * DSIZE;

/// Largest block size representable in a tag.
pub const MAX_BLOCK_SIZE: usize = (u32::MAX as usize) & !(ALIGNMENT - 1);

/// Link value meaning "no block". Offset 0 is reserved and never a node.
pub const NIL: usize = 0;

const ALLOC_BIT: u32 = 0x1;
const SIZE_MASK: u32 = !0x7;

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(MIN_BLOCK_SIZE == 2 * WSIZE + 2 * WSIZE);
const _: () = assert!(MAX_BLOCK_SIZE % ALIGNMENT == 0);

// =============================================================================
// Tags
// =============================================================================

/// Decoded `(size, allocated)` pair.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Tag {
  pub size: usize,
  pub allocated: bool,
}

impl Tag {
  #[inline]
  pub const fn new(size: usize, allocated: bool) -> Self {
    Self { size, allocated }
  }

  #[inline]
  pub const fn pack(self) -> u32 {
    debug_assert!(self.size <= MAX_BLOCK_SIZE);
    (self.size as u32 & SIZE_MASK) | self.allocated as u32
  }

  #[inline]
  pub const fn unpack(word: u32) -> Self {
    Self {
      size: (word & SIZE_MASK) as usize,
      allocated: word & ALLOC_BIT != 0,
    }
  }
}

// =============================================================================
// Raw words
// =============================================================================

#[inline(always)]
pub fn get(mem: &[u8], off: usize) -> u32 {
  let mut word = [0u8; WSIZE];
  word.copy_from_slice(&mem[off..off + WSIZE]);
  u32::from_ne_bytes(word)
}

#[inline(always)]
pub fn put(mem: &mut [u8], off: usize, val: u32) {
  mem[off..off + WSIZE].copy_from_slice(&val.to_ne_bytes());
}

// =============================================================================
// Block navigation
// =============================================================================

#[inline(always)]
pub const fn hdr(bp: usize) -> usize {
  bp - WSIZE
}

#[inline(always)]
pub fn ftr(mem: &[u8], bp: usize) -> usize {
  bp + size(mem, bp) - DSIZE
}

#[inline(always)]
pub fn tag(mem: &[u8], bp: usize) -> Tag {
  Tag::unpack(get(mem, hdr(bp)))
}

#[inline(always)]
pub fn size(mem: &[u8], bp: usize) -> usize {
  tag(mem, bp).size
}

#[inline(always)]
pub fn is_allocated(mem: &[u8], bp: usize) -> bool {
  tag(mem, bp).allocated
}

/// Tag stored in the footer of `bp`, located through the header size.
#[inline(always)]
pub fn footer_tag(mem: &[u8], bp: usize) -> Tag {
  Tag::unpack(get(mem, ftr(mem, bp)))
}

#[inline(always)]
pub fn next_blk(mem: &[u8], bp: usize) -> usize {
  bp + size(mem, bp)
}

/// Previous block, found through its footer (the word at `bp - 8`).
#[inline(always)]
pub fn prev_blk(mem: &[u8], bp: usize) -> usize {
  bp - Tag::unpack(get(mem, bp - DSIZE)).size
}

/// Allocated bit of the block preceding `bp`, read from its footer.
#[inline(always)]
pub fn prev_allocated(mem: &[u8], bp: usize) -> bool {
  Tag::unpack(get(mem, bp - DSIZE)).allocated
}

/// Writes identical header and footer tags for a block of `size` at `bp`.
#[inline]
pub fn set_block(mem: &mut [u8], bp: usize, size: usize, allocated: bool) {
  let word = Tag::new(size, allocated).pack();
  put(mem, hdr(bp), word);
  put(mem, bp + size - DSIZE, word);
}

/// Writes the zero-size allocated epilogue header for a block starting at `bp`.
#[inline]
pub fn set_epilogue(mem: &mut [u8], bp: usize) {
  put(mem, hdr(bp), Tag::new(0, true).pack());
}

// =============================================================================
// Free-block links
// =============================================================================

#[inline(always)]
pub fn prev_link(mem: &[u8], bp: usize) -> usize {
  get(mem, bp) as usize
}

#[inline(always)]
pub fn next_link(mem: &[u8], bp: usize) -> usize {
  get(mem, bp + WSIZE) as usize
}

#[inline(always)]
pub fn set_prev_link(mem: &mut [u8], bp: usize, link: usize) {
  put(mem, bp, link as u32);
}

#[inline(always)]
pub fn set_next_link(mem: &mut [u8], bp: usize, link: usize) {
  put(mem, bp + WSIZE, link as u32);
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[inline(always)]
pub const fn align_down(x: usize, align: usize) -> usize {
  x & !(align - 1)
}

/// Block size needed to serve a `size`-byte request, or `None` when the
/// rounding would overflow a tag.
#[inline]
pub fn adjusted_size(size: usize) -> Option<usize> {
  if size <= DSIZE {
    return Some(MIN_BLOCK_SIZE);
  }
  let asize = size.checked_add(DSIZE + DSIZE - 1)? / DSIZE * DSIZE;
  (asize <= MAX_BLOCK_SIZE).then_some(asize)
}
