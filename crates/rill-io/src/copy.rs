/// Files at or above this size copy part-wise. 5 GiB.
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 5 * 1024 * 1024 * 1024;

/// Smallest allowed part. 5 MiB.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Largest allowed part count per copy.
pub const MAX_PARTS: u64 = 10_000;

/// Tunables for a copy operation.
#[derive(Debug, Clone, Copy)]
pub struct CopyOptions {
  /// Sizes at or above this copy part-wise; below it, one read and one write.
  pub multipart_threshold: u64,
}

impl Default for CopyOptions {
  fn default() -> Self {
    Self {
      multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
    }
  }
}

/// Choose a part size for a multipart copy of `len` bytes: at least
/// [`MIN_PART_SIZE`], and large enough that the part count never exceeds
/// [`MAX_PARTS`].
pub fn part_size_for(len: u64) -> u64 {
  let by_count = len.div_ceil(MAX_PARTS);
  by_count.max(MIN_PART_SIZE)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_small_files_use_min_part() {
    assert_eq!(part_size_for(1), MIN_PART_SIZE);
    assert_eq!(part_size_for(MIN_PART_SIZE * 3), MIN_PART_SIZE);
  }

  #[test]
  fn test_part_count_bounded() {
    // 100 GiB would need > 10_000 parts at the minimum size
    let len: u64 = 100 * 1024 * 1024 * 1024;
    let part = part_size_for(len);
    assert!(part > MIN_PART_SIZE);
    assert!(len.div_ceil(part) <= MAX_PARTS);
  }

  #[test]
  fn test_exact_threshold_boundary() {
    let part = part_size_for(DEFAULT_MULTIPART_THRESHOLD);
    assert_eq!(part, MIN_PART_SIZE);
    assert!(DEFAULT_MULTIPART_THRESHOLD.div_ceil(part) <= MAX_PARTS);
  }
}
