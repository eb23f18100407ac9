//! Malloc-lab style trace files and a checking replay driver.
//!
//! A trace starts with four header numbers (suggested heap size, id count,
//! op count, weight), one per line, followed by one op per line:
//!
//! ```text
//! a <id> <bytes>
//! r <id> <bytes>
//! f <id>
//! ```
//!
//! Blank lines and `#` comments are ignored.

use std::{
  collections::{BTreeMap, HashMap},
  str::FromStr,
};

use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::{
  error::{AllocError, HeapCorruption},
  heap::{Heap, HeapPtr},
  layout::ALIGNMENT,
  source::HeapSource,
};

// =============================================================================
// Parsing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
  Alloc { id: usize, size: usize },
  Realloc { id: usize, size: usize },
  Free { id: usize },
}

impl Op {
  pub fn id(self) -> usize {
    match self {
      Op::Alloc { id, .. } | Op::Realloc { id, .. } | Op::Free { id } => id,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
  pub suggested_heap: usize,
  pub ids: usize,
  pub weight: usize,
  pub ops: Vec<Op>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
  #[error("trace ends before the {0} header field")]
  MissingHeader(&'static str),

  #[error("line {line}: expected a number, found {token:?}")]
  BadNumber { line: usize, token: String },

  #[error("line {line}: unknown op {op:?}")]
  UnknownOp { line: usize, op: String },

  #[error("line {line}: wrong number of arguments for {op:?}")]
  Arity { line: usize, op: String },

  #[error("line {line}: id {id} is outside the declared {ids} ids")]
  IdOutOfRange { line: usize, id: usize, ids: usize },

  #[error("header declares {declared} ops, trace has {found}")]
  OpCount { declared: usize, found: usize },
}

const HEADER_FIELDS: [&str; 4] = ["heap size", "id count", "op count", "weight"];

fn number(line: usize, token: &str) -> Result<usize, TraceError> {
  token.parse().map_err(|_| TraceError::BadNumber {
    line,
    token: token.to_owned(),
  })
}

impl Trace {
  pub fn parse(text: &str) -> Result<Self, TraceError> {
    let mut lines = text
      .lines()
      .enumerate()
      .map(|(i, raw)| (i + 1, raw.split('#').next().unwrap_or("").trim()))
      .filter(|(_, line)| !line.is_empty());

    let mut header = [0usize; 4];
    for (slot, field) in header.iter_mut().zip(HEADER_FIELDS) {
      let (line, text) = lines.next().ok_or(TraceError::MissingHeader(field))?;
      *slot = number(line, text)?;
    }
    let [suggested_heap, ids, declared, weight] = header;

    let mut ops = Vec::with_capacity(declared);
    for (line, text) in lines {
      let tokens: Vec<&str> = text.split_whitespace().collect();
      let arity = |expected: usize| {
        if tokens.len() == expected {
          Ok(())
        } else {
          Err(TraceError::Arity {
            line,
            op: tokens[0].to_owned(),
          })
        }
      };
      let op = match tokens[0] {
        "a" => {
          arity(3)?;
          Op::Alloc {
            id: number(line, tokens[1])?,
            size: number(line, tokens[2])?,
          }
        }
        "r" => {
          arity(3)?;
          Op::Realloc {
            id: number(line, tokens[1])?,
            size: number(line, tokens[2])?,
          }
        }
        "f" => {
          arity(2)?;
          Op::Free {
            id: number(line, tokens[1])?,
          }
        }
        other => {
          return Err(TraceError::UnknownOp {
            line,
            op: other.to_owned(),
          });
        }
      };
      if op.id() >= ids {
        return Err(TraceError::IdOutOfRange {
          line,
          id: op.id(),
          ids,
        });
      }
      ops.push(op);
    }

    if ops.len() != declared {
      return Err(TraceError::OpCount {
        declared,
        found: ops.len(),
      });
    }
    Ok(Self {
      suggested_heap,
      ids,
      weight,
      ops,
    })
  }
}

impl FromStr for Trace {
  type Err = TraceError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

// =============================================================================
// Replay
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOptions {
  /// Run [`Heap::check`] after every op.
  pub check_heap: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayReport {
  pub ops: usize,
  /// Largest sum of requested bytes live at once.
  pub peak_live_bytes: usize,
  /// Heap size after the last op.
  pub heap_bytes: usize,
  /// `peak_live_bytes / heap_bytes`.
  pub utilization: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplayError {
  #[error("op {index} (id {id}): {source}")]
  Alloc {
    index: usize,
    id: usize,
    source: AllocError,
  },

  #[error("op {index}: id {id} is not allocated")]
  NotLive { index: usize, id: usize },

  #[error("op {index} (id {id}): payload {offset:#x} is not 8-byte aligned")]
  Misaligned { index: usize, id: usize, offset: usize },

  #[error("op {index} (id {id}): {usable} usable bytes for a {requested}-byte request")]
  TooSmall {
    index: usize,
    id: usize,
    usable: usize,
    requested: usize,
  },

  #[error("op {index} (id {id}): payload overlaps id {other}")]
  Overlap { index: usize, id: usize, other: usize },

  #[error("op {index} (id {id}): payload contents changed")]
  Clobbered { index: usize, id: usize },

  #[error("op {index}: {source}")]
  Corrupt {
    index: usize,
    source: HeapCorruption,
  },
}

/// Byte `i` of id `id`'s payload while it is live.
fn pattern(id: usize, i: usize) -> u8 {
  (id.wrapping_mul(0x9E37_79B9) ^ i.wrapping_mul(31)) as u8
}

#[derive(Clone, Copy)]
struct Live {
  ptr: HeapPtr,
  size: usize,
}

/// Live payload spans keyed by start offset, for overlap checks.
#[derive(Default)]
struct Spans(BTreeMap<usize, (usize, usize)>);

impl Spans {
  /// Adds `[start, start + len)` for `id`, or returns the id it overlaps.
  fn insert(&mut self, start: usize, len: usize, id: usize) -> Result<(), usize> {
    let end = start + len;
    if let Some((_, &(prev_end, other))) = self.0.range(..=start).next_back()
      && prev_end > start
    {
      return Err(other);
    }
    if let Some((&next_start, &(_, other))) = self.0.range(start + 1..).next()
      && next_start < end
    {
      return Err(other);
    }
    self.0.insert(start, (end, id));
    Ok(())
  }

  fn remove(&mut self, start: usize) {
    self.0.remove(&start);
  }
}

struct Replayer<'h, S, R> {
  heap: &'h mut Heap<S, R>,
  live: HashMap<usize, Live>,
  spans: Spans,
  live_bytes: usize,
  peak_live_bytes: usize,
}

impl<S: HeapSource, R: Rng> Replayer<'_, S, R> {
  fn verify(&self, index: usize, id: usize, block: Live, len: usize) -> Result<(), ReplayError> {
    let intact = self.heap.payload(block.ptr).get(..len).is_some_and(|bytes| {
      bytes
        .iter()
        .enumerate()
        .all(|(i, &b)| b == pattern(id, i))
    });
    if intact {
      Ok(())
    } else {
      Err(ReplayError::Clobbered { index, id })
    }
  }

  /// Validates a freshly returned payload, fills it and records it live.
  fn admit(&mut self, index: usize, id: usize, block: Live) -> Result<(), ReplayError> {
    let offset = block.ptr.offset();
    if offset % ALIGNMENT != 0 {
      return Err(ReplayError::Misaligned { index, id, offset });
    }
    let usable = self.heap.usable_size(block.ptr);
    if usable < block.size {
      return Err(ReplayError::TooSmall {
        index,
        id,
        usable,
        requested: block.size,
      });
    }
    self
      .spans
      .insert(offset, block.size, id)
      .map_err(|other| ReplayError::Overlap { index, id, other })?;

    for (i, b) in self.heap.payload_mut(block.ptr)[..block.size]
      .iter_mut()
      .enumerate()
    {
      *b = pattern(id, i);
    }
    self.live.insert(id, block);
    self.live_bytes += block.size;
    self.peak_live_bytes = self.peak_live_bytes.max(self.live_bytes);
    Ok(())
  }

  fn retire(&mut self, id: usize, block: Live) {
    self.spans.remove(block.ptr.offset());
    self.live.remove(&id);
    self.live_bytes -= block.size;
  }

  fn step(&mut self, index: usize, op: Op) -> Result<(), ReplayError> {
    let alloc_err = |id, source| ReplayError::Alloc { index, id, source };
    match op {
      Op::Alloc { id, size } => {
        if let Some(old) = self.live.get(&id).copied() {
          self.retire(id, old);
        }
        let ptr = self.heap.allocate(size).map_err(|e| alloc_err(id, e))?;
        self.admit(index, id, Live { ptr, size })
      }
      Op::Realloc { id, size } => {
        let old = self.live.get(&id).copied();
        if let Some(old) = old {
          self.verify(index, id, old, old.size)?;
        }
        let ptr = self
          .heap
          .reallocate(old.map(|b| b.ptr), size)
          .map_err(|e| alloc_err(id, e))?;
        let block = Live { ptr, size };
        if let Some(old) = old {
          self.verify(index, id, block, old.size.min(size))?;
          self.retire(id, old);
        }
        self.admit(index, id, block)
      }
      Op::Free { id } => {
        let block = *self
          .live
          .get(&id)
          .ok_or(ReplayError::NotLive { index, id })?;
        self.verify(index, id, block, block.size)?;
        self.retire(id, block);
        self.heap.free(block.ptr).map_err(|e| alloc_err(id, e))
      }
    }
  }
}

/// Replays `trace` against `heap`, checking every payload it hands out.
pub fn replay<S: HeapSource, R: Rng>(
  heap: &mut Heap<S, R>,
  trace: &Trace,
  options: &ReplayOptions,
) -> Result<ReplayReport, ReplayError> {
  let mut replayer = Replayer {
    heap,
    live: HashMap::with_capacity(trace.ids),
    spans: Spans::default(),
    live_bytes: 0,
    peak_live_bytes: 0,
  };

  for (index, &op) in trace.ops.iter().enumerate() {
    replayer.step(index, op)?;
    if options.check_heap {
      replayer
        .heap
        .check()
        .map_err(|source| ReplayError::Corrupt { index, source })?;
    }
  }

  let heap_bytes = replayer.heap.heap_size();
  let peak_live_bytes = replayer.peak_live_bytes;
  let report = ReplayReport {
    ops: trace.ops.len(),
    peak_live_bytes,
    heap_bytes,
    utilization: peak_live_bytes as f64 / heap_bytes as f64,
  };
  debug!(
    ops = report.ops,
    peak = peak_live_bytes,
    heap = heap_bytes,
    "replay finished"
  );
  Ok(report)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{HeapConfig, source::VecHeap};

  const SHORT: &str = "\
# two blocks, one grown
4096
2
5
1
a 0 512
a 1 128
r 0 640   # grows in place or moves
f 1
f 0
";

  fn heap() -> Heap {
    Heap::new(VecHeap::default(), HeapConfig::default()).unwrap()
  }

  #[test]
  fn parses_header_ops_and_comments() {
    let trace: Trace = SHORT.parse().unwrap();
    assert_eq!(trace.suggested_heap, 4096);
    assert_eq!(trace.ids, 2);
    assert_eq!(trace.weight, 1);
    assert_eq!(
      trace.ops,
      vec![
        Op::Alloc { id: 0, size: 512 },
        Op::Alloc { id: 1, size: 128 },
        Op::Realloc { id: 0, size: 640 },
        Op::Free { id: 1 },
        Op::Free { id: 0 },
      ]
    );
  }

  #[test]
  fn rejects_malformed_traces() {
    assert_eq!(
      Trace::parse("10\n1\n"),
      Err(TraceError::MissingHeader("op count"))
    );
    assert_eq!(
      Trace::parse("10\n1\n1\n1\nx 0 8\n"),
      Err(TraceError::UnknownOp {
        line: 5,
        op: "x".into()
      })
    );
    assert_eq!(
      Trace::parse("10\n1\n1\n1\nf 0 8\n"),
      Err(TraceError::Arity {
        line: 5,
        op: "f".into()
      })
    );
    assert_eq!(
      Trace::parse("10\n1\n1\n1\na 3 8\n"),
      Err(TraceError::IdOutOfRange {
        line: 5,
        id: 3,
        ids: 1
      })
    );
    assert_eq!(
      Trace::parse("10\n1\n2\n1\na 0 8\n"),
      Err(TraceError::OpCount {
        declared: 2,
        found: 1
      })
    );
    assert!(matches!(
      Trace::parse("ten\n"),
      Err(TraceError::BadNumber { line: 1, .. })
    ));
  }

  #[test]
  fn replay_reports_peak_usage() {
    let trace: Trace = SHORT.parse().unwrap();
    let mut heap = heap();
    let report = replay(&mut heap, &trace, &ReplayOptions { check_heap: true }).unwrap();
    assert_eq!(report.ops, 5);
    assert_eq!(report.peak_live_bytes, 768);
    assert_eq!(report.heap_bytes, heap.heap_size());
    assert!(report.utilization > 0.0 && report.utilization <= 1.0);
    assert_eq!(heap.check().unwrap().allocated_blocks, 0);
  }

  #[test]
  fn replay_flags_free_of_dead_id() {
    let trace = Trace::parse("0\n1\n2\n1\na 0 8\nf 0\n").unwrap();
    let mut doubled = trace.clone();
    doubled.ops.push(Op::Free { id: 0 });
    let err = replay(&mut heap(), &doubled, &ReplayOptions::default()).unwrap_err();
    assert_eq!(err, ReplayError::NotLive { index: 2, id: 0 });
  }

  #[test]
  fn spans_detect_overlap() {
    let mut spans = Spans::default();
    spans.insert(64, 32, 0).unwrap();
    assert_eq!(spans.insert(80, 8, 1), Err(0));
    assert_eq!(spans.insert(48, 17, 2), Err(0));
    spans.insert(96, 8, 3).unwrap();
    spans.insert(48, 16, 4).unwrap();
    spans.remove(64);
    spans.insert(72, 8, 5).unwrap();
  }
}
