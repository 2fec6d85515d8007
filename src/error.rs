//! Error types.
//!
//! Exhaustion is the only failure a caller is expected to handle at
//! runtime. Construction errors reject bad arena geometry up front, and
//! [`VerifyError`] describes corruption found by a consistency walk.

use std::io;

use thiserror::Error;

/// Errors raised by the allocator.
#[derive(Error, Debug)]
pub enum MallocError {
  /// No segment in the ring could satisfy the request.
  #[error("failed to allocate {requested} bytes")]
  OutOfMemory {
    /// Size the caller asked for, before alignment.
    requested: usize,
  },

  /// The segment count is not a power of two between 1 and 8.
  #[error("invalid segment count {count}: must be a power of two in 1..=8")]
  InvalidSegmentCount {
    /// Rejected count.
    count: usize,
  },

  /// The arena cannot be split into usable segments.
  #[error("invalid arena capacity {capacity}: {reason}")]
  InvalidCapacity {
    /// Rejected capacity in bytes.
    capacity: usize,
    /// Why it was rejected.
    reason: &'static str,
  },

  /// The arena base is not 8-byte aligned.
  #[error("arena base {base:#x} is not 8-byte aligned")]
  MisalignedBase {
    /// Rejected base address.
    base: usize,
  },

  /// Reserving anonymous memory for the arena failed.
  #[error("failed to reserve {capacity} bytes: {source}")]
  Reserve {
    /// Requested capacity.
    capacity: usize,
    /// Underlying OS error.
    #[source]
    source: io::Error,
  },

  /// Existing arena contents could not be walked back into a heap.
  #[error("failed to restore arena: {0}")]
  Restore(#[from] VerifyError),
}

/// A consistency violation inside one segment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
  /// Structural damage at a specific block.
  #[error("segment {segment}: corrupted block at {address:#x}: {detail}")]
  Corruption {
    /// Tag of the segment that failed the check.
    segment: usize,
    /// Address of the offending block header.
    address: usize,
    /// What was wrong.
    detail: &'static str,
  },
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, MallocError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn out_of_memory_names_requested_size() {
    let err = MallocError::OutOfMemory { requested: 4096 };
    assert_eq!(err.to_string(), "failed to allocate 4096 bytes");
  }

  #[test]
  fn restore_wraps_corruption() {
    let corruption = VerifyError::Corruption {
      segment: 3,
      address: 0x1000,
      detail: "tag mismatch",
    };
    let err = MallocError::from(corruption.clone());
    assert!(matches!(err, MallocError::Restore(ref inner) if *inner == corruption));
    assert_eq!(
      err.to_string(),
      "failed to restore arena: segment 3: corrupted block at 0x1000: tag mismatch"
    );
  }
}
