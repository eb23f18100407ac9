//! Backing memory for a [`Heap`](crate::Heap): the "grow the break by N
//! bytes" primitive plus byte access to everything below the break.

use core::ptr::null_mut;

/// Simulated heap maximum.
pub const DEFAULT_HEAP_LIMIT: usize = 20 << 20; // 20MB

/// Links are stored as 32-bit offsets, so no heap may outgrow them.
const OFFSET_LIMIT: usize = u32::MAX as usize;

/// A contiguous region that only grows at its end.
pub trait HeapSource {
  /// Extends the region by `bytes`, returning the offset of the old break
  /// (the first byte of the extension). `None` means exhaustion; nothing
  /// changes in that case.
  fn grow(&mut self, bytes: usize) -> Option<usize>;

  /// Current break.
  fn len(&self) -> usize;

  fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Bytes `[0, len)`.
  fn bytes(&self) -> &[u8];

  fn bytes_mut(&mut self) -> &mut [u8];
}

// =============================================================================
// VecHeap
// =============================================================================

/// Owned, growable buffer with a hard limit.
#[derive(Debug, Clone)]
pub struct VecHeap {
  buf: Vec<u8>,
  limit: usize,
}

impl VecHeap {
  pub fn with_limit(limit: usize) -> Self {
    Self {
      buf: Vec::new(),
      limit: limit.min(OFFSET_LIMIT),
    }
  }

  pub fn limit(&self) -> usize {
    self.limit
  }
}

impl Default for VecHeap {
  fn default() -> Self {
    Self::with_limit(DEFAULT_HEAP_LIMIT)
  }
}

impl HeapSource for VecHeap {
  fn grow(&mut self, bytes: usize) -> Option<usize> {
    let old = self.buf.len();
    let new = old.checked_add(bytes).filter(|&n| n <= self.limit)?;
    self.buf.resize(new, 0);
    Some(old)
  }

  fn len(&self) -> usize {
    self.buf.len()
  }

  fn bytes(&self) -> &[u8] {
    &self.buf
  }

  fn bytes_mut(&mut self) -> &mut [u8] {
    &mut self.buf
  }
}

// =============================================================================
// MmapHeap
// =============================================================================

/// Fixed reservation from the OS with a movable break inside it. The base
/// never moves, so `base() + offset` is a stable address.
#[derive(Debug)]
pub struct MmapHeap {
  base: *mut u8,
  capacity: usize,
  brk: usize,
}

impl MmapHeap {
  /// Reserves `capacity` bytes of address space. Pages are only backed once touched.
  pub fn reserve(capacity: usize) -> Option<Self> {
    let capacity = capacity.min(OFFSET_LIMIT);
    if capacity == 0 {
      return None;
    }
    let base = unsafe { os_mmap(capacity) };
    if base.is_null() {
      return None;
    }
    Some(Self {
      base,
      capacity,
      brk: 0,
    })
  }

  pub fn base(&self) -> *mut u8 {
    self.base
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Offset of `ptr` inside the region, if it lies below the break.
  pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
    let addr = ptr as usize;
    let base = self.base as usize;
    (addr >= base && addr < base + self.brk).then(|| addr - base)
  }
}

impl HeapSource for MmapHeap {
  fn grow(&mut self, bytes: usize) -> Option<usize> {
    let old = self.brk;
    self.brk = old.checked_add(bytes).filter(|&n| n <= self.capacity)?;
    Some(old)
  }

  fn len(&self) -> usize {
    self.brk
  }

  fn bytes(&self) -> &[u8] {
    // SAFETY: `[base, base + brk)` lies inside the live mapping and is only
    // reachable through `&self`/`&mut self`.
    unsafe { core::slice::from_raw_parts(self.base, self.brk) }
  }

  fn bytes_mut(&mut self) -> &mut [u8] {
    // SAFETY: as above, with exclusive access through `&mut self`.
    unsafe { core::slice::from_raw_parts_mut(self.base, self.brk) }
  }
}

impl Drop for MmapHeap {
  fn drop(&mut self) {
    unsafe { os_munmap(self.base, self.capacity) };
  }
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}
