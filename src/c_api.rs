//! C entry points over one process-wide heap backed by [`MmapHeap`].
//!
//! The heap is not synchronized: callers must confine every `mm_*` call to a
//! single thread.

use core::{cell::UnsafeCell, ffi::c_int, ptr::null_mut};

use crate::{
  config::HeapConfig,
  heap::{Heap, HeapPtr},
  source::MmapHeap,
};

/// Address space reserved per heap. Pages are backed lazily.
const RESERVE_BYTES: usize = 1 << 30; // 1GB

struct GlobalHeap(UnsafeCell<Option<Heap<MmapHeap>>>);

// SAFETY: single-threaded contract above.
unsafe impl Sync for GlobalHeap {}

static HEAP: GlobalHeap = GlobalHeap(UnsafeCell::new(None));

fn fresh() -> Option<Heap<MmapHeap>> {
  let source = MmapHeap::reserve(RESERVE_BYTES)?;
  Heap::new(source, HeapConfig::default()).ok()
}

/// Global heap, created on first use.
unsafe fn heap() -> Option<&'static mut Heap<MmapHeap>> {
  let slot = unsafe { &mut *HEAP.0.get() };
  if slot.is_none() {
    *slot = fresh();
  }
  slot.as_mut()
}

fn address(heap: &Heap<MmapHeap>, ptr: HeapPtr) -> *mut u8 {
  heap.source().base().wrapping_add(ptr.offset())
}

fn handle(heap: &Heap<MmapHeap>, ptr: *const u8) -> Option<HeapPtr> {
  heap.source().offset_of(ptr).map(HeapPtr::from_offset)
}

/// Discards any previous heap and starts an empty one. 0 on success, -1 on failure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_init() -> c_int {
  let slot = unsafe { &mut *HEAP.0.get() };
  *slot = None;
  *slot = fresh();
  if slot.is_some() { 0 } else { -1 }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_malloc(size: usize) -> *mut u8 {
  let Some(heap) = (unsafe { heap() }) else {
    return null_mut();
  };
  match heap.allocate(size) {
    Ok(ptr) => address(heap, ptr),
    Err(_) => null_mut(),
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_free(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }
  if let Some(heap) = (unsafe { heap() })
    && let Some(ptr) = handle(heap, ptr)
  {
    let _ = heap.free(ptr);
  }
}

/// Null `ptr` allocates. On failure returns null and `ptr` stays valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  let Some(heap) = (unsafe { heap() }) else {
    return null_mut();
  };
  let old = if ptr.is_null() {
    None
  } else {
    match handle(heap, ptr) {
      Some(old) => Some(old),
      None => return null_mut(),
    }
  };
  match heap.reallocate(old, size) {
    Ok(new) => address(heap, new),
    Err(_) => null_mut(),
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_usable_size(ptr: *mut u8) -> usize {
  if ptr.is_null() {
    return 0;
  }
  match unsafe { heap() } {
    Some(heap) => handle(heap, ptr).map_or(0, |ptr| heap.usable_size(ptr)),
    None => 0,
  }
}
