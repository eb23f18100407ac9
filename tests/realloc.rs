use rand::rngs::mock::StepRng;
use segalloc::{AllocError, BlockInfo, Heap, HeapConfig, HeapPtr, VecHeap};

type TestHeap = Heap<VecHeap, StepRng>;

fn heap_with(source: VecHeap, rng: StepRng) -> TestHeap {
  let config = HeapConfig::default().with_small_reserve_blocks(0);
  Heap::with_rng(source, config, rng).unwrap()
}

fn heap() -> TestHeap {
  heap_with(VecHeap::default(), StepRng::new(u64::MAX, 0))
}

fn fill(heap: &mut TestHeap, ptr: HeapPtr, len: usize) {
  for (i, b) in heap.payload_mut(ptr)[..len].iter_mut().enumerate() {
    *b = (i * 7 + 3) as u8;
  }
}

fn assert_filled(heap: &TestHeap, ptr: HeapPtr, len: usize) {
  for (i, &b) in heap.payload(ptr)[..len].iter().enumerate() {
    assert_eq!(b, (i * 7 + 3) as u8, "byte {i}");
  }
}

#[test]
fn null_pointer_allocates() {
  let mut heap = heap();
  let p = heap.reallocate(None, 100).unwrap();
  assert_eq!(heap.usable_size(p), 104);
  assert_eq!(heap.reallocate(None, 0), Err(AllocError::ZeroSize));
}

#[test]
fn shrinking_keeps_block() {
  let mut heap = heap();
  let p = heap.allocate(500).unwrap();
  fill(&mut heap, p, 500);
  let usable = heap.usable_size(p);

  assert_eq!(heap.reallocate(Some(p), 10), Ok(p));
  assert_eq!(heap.reallocate(Some(p), 0), Ok(p));
  assert_eq!(heap.reallocate(Some(p), usable), Ok(p));
  assert_eq!(heap.usable_size(p), usable);
  assert_filled(&heap, p, 500);
  heap.check().unwrap();
}

#[test]
fn grows_into_free_successor() {
  let mut heap = heap();
  let a = heap.allocate(100).unwrap();
  let b = heap.allocate(100).unwrap();
  let _guard = heap.allocate(100).unwrap();
  heap.free(b).unwrap();
  fill(&mut heap, a, 100);
  let size = heap.heap_size();

  let p = heap.reallocate(Some(a), 200).unwrap();
  assert_eq!(p, a);
  assert_eq!(heap.usable_size(p), 216);
  assert_eq!(heap.heap_size(), size);
  assert_filled(&heap, p, 100);
  heap.check().unwrap();
}

#[test]
fn slides_into_free_predecessor() {
  let mut heap = heap();
  let a = heap.allocate(100).unwrap();
  let b = heap.allocate(100).unwrap();
  let _guard = heap.allocate(100).unwrap();
  heap.free(a).unwrap();
  fill(&mut heap, b, 100);

  let p = heap.reallocate(Some(b), 200).unwrap();
  assert_eq!(p, a);
  assert_eq!(heap.usable_size(p), 216);
  assert_filled(&heap, p, 100);
  heap.check().unwrap();
}

#[test]
fn absorbs_both_neighbours() {
  let mut heap = heap();
  let a = heap.allocate(100).unwrap();
  let b = heap.allocate(100).unwrap();
  let c = heap.allocate(100).unwrap();
  let _guard = heap.allocate(100).unwrap();
  heap.free(a).unwrap();
  heap.free(c).unwrap();
  fill(&mut heap, b, 100);

  let p = heap.reallocate(Some(b), 300).unwrap();
  assert_eq!(p, a);
  assert_eq!(heap.usable_size(p), 328);
  assert_filled(&heap, p, 100);
  assert_eq!(heap.check().unwrap().free_blocks, 0);
}

#[test]
fn last_block_grows_in_place() {
  let mut heap = heap();
  let a = heap.allocate(100).unwrap();
  fill(&mut heap, a, 100);
  let size = heap.heap_size();

  // Freed, merged with the extension and taken back at the same offset.
  let p = heap.reallocate(Some(a), 1000).unwrap();
  assert_eq!(p, a);
  assert!(heap.usable_size(p) >= 1000);
  assert_eq!(heap.heap_size(), size + 1144);
  assert_filled(&heap, p, 100);
  heap.check().unwrap();
}

#[test]
fn moves_when_neighbours_are_allocated() {
  let mut heap = heap();
  let a = heap.allocate(100).unwrap();
  let _guard = heap.allocate(100).unwrap();
  fill(&mut heap, a, 100);

  let p = heap.reallocate(Some(a), 1000).unwrap();
  assert_ne!(p, a);
  // Slack over the request on the move path.
  assert!(heap.usable_size(p) >= 1000 + 136);
  assert_filled(&heap, p, 100);
  assert_eq!(heap.free_list(0).collect::<Vec<_>>(), vec![a.offset()]);
  heap.check().unwrap();
}

#[test]
fn moves_past_undersized_free_predecessor() {
  let mut heap = heap();
  let a = heap.allocate(16).unwrap();
  let b = heap.allocate(100).unwrap();
  let _guard = heap.allocate(100).unwrap();
  heap.free(a).unwrap();
  fill(&mut heap, b, 100);

  let p = heap.reallocate(Some(b), 1000).unwrap();
  assert_ne!(p, b);
  assert_ne!(p, a);
  assert_filled(&heap, p, 100);
  // The old block joins the free predecessor.
  assert_eq!(
    heap.blocks().next(),
    Some(BlockInfo {
      offset: a.offset(),
      size: 136,
      allocated: false
    })
  );
  heap.check().unwrap();
}

#[test]
fn exhaustion_leaves_block_intact() {
  let mut heap = heap_with(VecHeap::with_limit(4096), StepRng::new(u64::MAX, 0));
  let p = heap.allocate(1000).unwrap();
  let _guard = heap.allocate(100).unwrap();
  fill(&mut heap, p, 1000);
  let size = heap.heap_size();
  let usable = heap.usable_size(p);

  assert!(matches!(
    heap.reallocate(Some(p), 10_000),
    Err(AllocError::Exhausted { .. })
  ));
  assert_eq!(
    heap.reallocate(Some(p), usize::MAX),
    Err(AllocError::TooLarge { size: usize::MAX })
  );
  assert_eq!(heap.heap_size(), size);
  assert_eq!(heap.usable_size(p), usable);
  assert_filled(&heap, p, 1000);
  assert_eq!(heap.check().unwrap().free_blocks, 0);
  heap.free(p).unwrap();
}

#[test]
fn exhaustion_at_heap_end_leaves_block_intact() {
  let mut heap = heap_with(VecHeap::with_limit(2048), StepRng::new(u64::MAX, 0));
  let p = heap.allocate(1000).unwrap();
  fill(&mut heap, p, 1000);

  assert!(heap.reallocate(Some(p), 4000).is_err());
  assert_eq!(heap.usable_size(p), 1000);
  assert_filled(&heap, p, 1000);
  let stats = heap.check().unwrap();
  assert_eq!((stats.allocated_blocks, stats.free_blocks), (1, 0));
}

#[test]
fn merge_skipping_resumes_after_reallocate() {
  let mut heap = heap_with(VecHeap::default(), StepRng::new(0, 0));
  let a = heap.allocate(100).unwrap();
  let b = heap.allocate(100).unwrap();
  let _c = heap.allocate(100).unwrap();
  let d = heap.allocate(100).unwrap();
  let e = heap.allocate(100).unwrap();
  let _guard = heap.allocate(100).unwrap();

  heap.free(b).unwrap();
  // Forced merge inside the move: `b` is absorbed regardless of the rng.
  let moved = heap.reallocate(Some(a), 2000).unwrap();
  assert_ne!(moved, a);
  assert_eq!(heap.blocks().next().map(|b| b.size), Some(224));

  // Outside reallocate the always-skip rng is honoured again.
  heap.free(e).unwrap();
  heap.free(d).unwrap();
  assert_eq!(
    heap.free_list(0).collect::<Vec<_>>(),
    vec![d.offset(), e.offset()]
  );
  heap.check().unwrap();
}

#[test]
fn exhaustion_restores_free_successor() {
  let mut heap = heap_with(VecHeap::with_limit(4096), StepRng::new(u64::MAX, 0));
  let p = heap.allocate(1000).unwrap();
  let s = heap.allocate(100).unwrap();
  let _guard = heap.allocate(100).unwrap();
  heap.free(s).unwrap();
  fill(&mut heap, p, 1000);
  let before: Vec<_> = heap.blocks().collect();

  assert!(heap.reallocate(Some(p), 10_000).is_err());
  assert_eq!(heap.blocks().collect::<Vec<_>>(), before);
  assert_eq!(heap.free_list(0).collect::<Vec<_>>(), vec![s.offset()]);
  assert_filled(&heap, p, 1000);
  heap.check().unwrap();
}
