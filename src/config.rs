//! Tuning knobs. The defaults reproduce the workload-tuned values the
//! allocator was calibrated with; none of them is load-bearing for
//! correctness.

use crate::{error::ConfigError, layout::MIN_BLOCK_SIZE};

/// Number of segregated free lists.
pub const CLASS_COUNT: usize = 4;

/// Upper bounds (exclusive) of the first three classes. The last class is unbounded.
pub const DEFAULT_CLASS_LIMITS: [usize; CLASS_COUNT - 1] = [128, 512, 4096];

/// Split when `block * 2 > request * 3`, i.e. the remainder exceeds half the request.
pub const DEFAULT_SPLIT_RATIO: (usize, usize) = (3, 2);

/// Smallest-class blocks pre-extended alongside a small-request extension.
pub const DEFAULT_SMALL_RESERVE_BLOCKS: usize = 6;

/// Extra bytes requested when reallocate has to move a block.
pub const DEFAULT_REALLOC_SLACK: usize = 136;

/// Cross-class merges are skipped one time in this many.
pub const DEFAULT_MERGE_SKIP_ONE_IN: u32 = 4;

pub const DEFAULT_SEED: u64 = 29;

const _: () = assert!(DEFAULT_CLASS_LIMITS[0] > MIN_BLOCK_SIZE);
const _: () = assert!(DEFAULT_SPLIT_RATIO.0 >= DEFAULT_SPLIT_RATIO.1);

/// What `free` does with pointers it cannot vouch for.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FreeCheck {
  /// Accept every pointer, like the historical check hook that always reported success.
  #[default]
  PassThrough,
  /// Track live allocations and reject double and wild frees.
  Strict,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
  pub class_limits: [usize; CLASS_COUNT - 1],
  pub split_ratio: (usize, usize),
  pub small_reserve_blocks: usize,
  pub realloc_slack: usize,
  /// 0 disables the randomized skip.
  pub merge_skip_one_in: u32,
  pub seed: u64,
  pub free_check: FreeCheck,
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      class_limits: DEFAULT_CLASS_LIMITS,
      split_ratio: DEFAULT_SPLIT_RATIO,
      small_reserve_blocks: DEFAULT_SMALL_RESERVE_BLOCKS,
      realloc_slack: DEFAULT_REALLOC_SLACK,
      merge_skip_one_in: DEFAULT_MERGE_SKIP_ONE_IN,
      seed: DEFAULT_SEED,
      free_check: FreeCheck::PassThrough,
    }
  }
}

impl HeapConfig {
  pub fn with_class_limits(mut self, limits: [usize; CLASS_COUNT - 1]) -> Self {
    self.class_limits = limits;
    self
  }

  pub fn with_split_ratio(mut self, num: usize, den: usize) -> Self {
    self.split_ratio = (num, den);
    self
  }

  pub fn with_small_reserve_blocks(mut self, blocks: usize) -> Self {
    self.small_reserve_blocks = blocks;
    self
  }

  pub fn with_realloc_slack(mut self, slack: usize) -> Self {
    self.realloc_slack = slack;
    self
  }

  pub fn with_merge_skip_one_in(mut self, one_in: u32) -> Self {
    self.merge_skip_one_in = one_in;
    self
  }

  pub fn with_seed(mut self, seed: u64) -> Self {
    self.seed = seed;
    self
  }

  pub fn with_free_check(mut self, check: FreeCheck) -> Self {
    self.free_check = check;
    self
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let limits = self.class_limits;
    if limits[0] <= MIN_BLOCK_SIZE {
      return Err(ConfigError::ClassLimitTooSmall(limits[0]));
    }
    if limits.windows(2).any(|w| w[0] >= w[1]) {
      return Err(ConfigError::ClassLimitsNotAscending(limits));
    }
    let (num, den) = self.split_ratio;
    if num == 0 || den == 0 || num < den {
      return Err(ConfigError::InvalidSplitRatio(num, den));
    }
    Ok(())
  }
}
