//! Block header codec.
//!
//! Every block starts with an 8-byte header made of two `u32` words:
//!
//! ```text
//! +--------------------------------+--------------------------------+
//! |  size word: aligned size | tag |  left word: left size | FREE   |
//! +--------------------------------+--------------------------------+
//! | next free (u64, free blocks)   | prev free (u64, free blocks)   |
//! +--------------------------------+--------------------------------+
//! ```
//!
//! Aligned sizes are multiples of 8, so the low 3 bits of the size word
//! carry the owning segment's tag and the low bit of the left word
//! carries the free flag. A size word whose size bits are zero marks the
//! high-water mark of a segment (the tail marker).

use core::ptr;

// =============================================================================
// Constants
// =============================================================================

/// Bytes of metadata in front of every payload.
pub const HEADER_SIZE: usize = 8;
/// Smallest payload handed out; large enough for both free-list links.
pub const MIN_BLOCK: usize = 16;
/// Smallest block (header + payload) that can exist in a segment.
pub const MIN_CHUNK: usize = HEADER_SIZE + MIN_BLOCK;
/// Block sizes and addresses are multiples of this.
pub const ALIGNMENT: usize = 8;
/// Low bits of the size word that hold the segment tag.
pub const SEGMENT_MASK: u32 = (ALIGNMENT - 1) as u32;
/// Largest number of segments a tag can address.
pub const MAX_SEGMENTS: usize = SEGMENT_MASK as usize + 1;
/// Largest segment. Sizes must fit the `u32` size word.
pub const MAX_SEGMENT_CAPACITY: usize = 1 << 31;
/// Largest request that can ever produce a block.
pub const MAX_REQUEST: usize = MAX_SEGMENT_CAPACITY - HEADER_SIZE;

/// Number of size-class bins per segment.
pub const BIN_COUNT: usize = 128;
/// Up to this size there is one bin per multiple of 8.
const LINEAR_LIMIT: usize = 256;
const LINEAR_BINS: usize = LINEAR_LIMIT / ALIGNMENT;
/// Bins per power of two past the linear range.
const BINS_PER_DOUBLING: usize = 4;

const SIZE_OFFSET: usize = 0;
const LEFT_OFFSET: usize = 4;
const NEXT_OFFSET: usize = 8;
const PREV_OFFSET: usize = 16;

const FREE_BIT: u32 = 1;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(MIN_BLOCK >= PREV_OFFSET + 8 - HEADER_SIZE);
const _: () = assert!(MIN_CHUNK % ALIGNMENT == 0);
const _: () = assert!(MAX_SEGMENTS == 8);
const _: () = assert!(bin_of(MIN_CHUNK) == 2);
const _: () = assert!(bin_of(MAX_SEGMENT_CAPACITY) < BIN_COUNT);

// =============================================================================
// Sizing
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Block size for a request of `requested` payload bytes, header included.
///
/// Returns `None` when no segment could ever hold the block.
#[inline]
pub const fn aligned_size(requested: usize) -> Option<usize> {
  if requested > MAX_REQUEST {
    return None;
  }
  let payload = if requested < MIN_BLOCK { MIN_BLOCK } else { requested };
  Some(align_up(payload, ALIGNMENT) + HEADER_SIZE)
}

/// Bin index for a block of `size` bytes. Monotonic in `size`.
#[inline]
pub const fn bin_of(size: usize) -> usize {
  if size <= LINEAR_LIMIT {
    return (size / ALIGNMENT).saturating_sub(1);
  }

  // Geometric range: power-of-two order, then quarter within it
  let s = size - 1;
  let order = (usize::BITS - 1 - s.leading_zeros()) as usize;
  let sub = (s >> (order - 2)) & (BINS_PER_DOUBLING - 1);
  LINEAR_BINS + (order - LINEAR_LIMIT.trailing_zeros() as usize) * BINS_PER_DOUBLING + sub
}

// =============================================================================
// Size/Tag Packing
// =============================================================================

/// Packs an aligned size and a segment tag into one size word.
#[inline(always)]
pub const fn pack(size: usize, tag: usize) -> u32 {
  debug_assert!(size % ALIGNMENT == 0);
  debug_assert!(tag < MAX_SEGMENTS);
  size as u32 | tag as u32
}

/// Size bits of a size word.
#[inline(always)]
pub const fn unpack_size(word: u32) -> usize {
  (word & !SEGMENT_MASK) as usize
}

/// Tag bits of a size word.
#[inline(always)]
pub const fn unpack_tag(word: u32) -> usize {
  (word & SEGMENT_MASK) as usize
}

// =============================================================================
// Block View
// =============================================================================

/// Raw view over the header of the block at a given address.
///
/// All accessors are `unsafe`: the caller guarantees the address is an
/// 8-aligned block header inside a live arena.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Block(usize);

impl Block {
  #[inline(always)]
  pub const fn at(addr: usize) -> Self {
    Self(addr)
  }

  /// Block owning the payload pointer returned by an allocation.
  #[inline(always)]
  pub fn from_payload(payload: *mut u8) -> Self {
    Self(payload as usize - HEADER_SIZE)
  }

  #[inline(always)]
  pub const fn addr(self) -> usize {
    self.0
  }

  #[inline(always)]
  pub const fn payload(self) -> *mut u8 {
    (self.0 + HEADER_SIZE) as *mut u8
  }

  #[inline(always)]
  unsafe fn read_u32(self, offset: usize) -> u32 {
    unsafe { ptr::read((self.0 + offset) as *const u32) }
  }

  #[inline(always)]
  unsafe fn write_u32(self, offset: usize, value: u32) {
    unsafe { ptr::write((self.0 + offset) as *mut u32, value) }
  }

  #[inline(always)]
  pub unsafe fn size_word(self) -> u32 {
    unsafe { self.read_u32(SIZE_OFFSET) }
  }

  #[inline(always)]
  pub unsafe fn size(self) -> usize {
    unpack_size(unsafe { self.size_word() })
  }

  #[inline(always)]
  pub unsafe fn tag(self) -> usize {
    unpack_tag(unsafe { self.size_word() })
  }

  #[inline(always)]
  pub unsafe fn set_size(self, size: usize, tag: usize) {
    unsafe { self.write_u32(SIZE_OFFSET, pack(size, tag)) }
  }

  /// Size of the physically preceding block, 0 for the first block.
  #[inline(always)]
  pub unsafe fn left(self) -> usize {
    (unsafe { self.read_u32(LEFT_OFFSET) } & !SEGMENT_MASK) as usize
  }

  #[inline(always)]
  pub unsafe fn is_free(self) -> bool {
    (unsafe { self.read_u32(LEFT_OFFSET) } & FREE_BIT) != 0
  }

  #[inline(always)]
  pub unsafe fn set_left(self, left: usize, free: bool) {
    debug_assert!(left % ALIGNMENT == 0);
    let word = left as u32 | if free { FREE_BIT } else { 0 };
    unsafe { self.write_u32(LEFT_OFFSET, word) }
  }

  #[inline(always)]
  pub unsafe fn set_free(self, free: bool) {
    unsafe { self.set_left(self.left(), free) }
  }

  /// Writes the high-water mark sentinel: zero size, real tag.
  #[inline(always)]
  pub unsafe fn write_tail(self, tag: usize, left: usize) {
    unsafe {
      self.set_size(0, tag);
      self.set_left(left, false);
    }
  }

  #[inline(always)]
  pub unsafe fn next(self) -> usize {
    unsafe { ptr::read((self.0 + NEXT_OFFSET) as *const u64) as usize }
  }

  #[inline(always)]
  pub unsafe fn set_next(self, next: usize) {
    unsafe { ptr::write((self.0 + NEXT_OFFSET) as *mut u64, next as u64) }
  }

  #[inline(always)]
  pub unsafe fn prev(self) -> usize {
    unsafe { ptr::read((self.0 + PREV_OFFSET) as *const u64) as usize }
  }

  #[inline(always)]
  pub unsafe fn set_prev(self, prev: usize) {
    unsafe { ptr::write((self.0 + PREV_OFFSET) as *mut u64, prev as u64) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn aligned_size_matches_rule() {
    assert_eq!(aligned_size(1), Some(24));
    assert_eq!(aligned_size(10), Some(24));
    assert_eq!(aligned_size(16), Some(24));
    assert_eq!(aligned_size(17), Some(32));
    assert_eq!(aligned_size(100), Some(112));
    assert_eq!(aligned_size(0), Some(24));
    assert_eq!(aligned_size(MAX_REQUEST), Some(MAX_SEGMENT_CAPACITY));
    assert_eq!(aligned_size(MAX_REQUEST + 1), None);

    for s in 1..4096 {
      let a = aligned_size(s).unwrap();
      assert_eq!(a % ALIGNMENT, 0);
      assert_eq!(a, align_up(s.max(MIN_BLOCK), ALIGNMENT) + HEADER_SIZE);
    }
  }

  #[test]
  fn bins_are_monotonic_and_in_range() {
    let mut last = 0;
    let mut size = MIN_CHUNK;
    while size <= 1 << 20 {
      let bin = bin_of(size);
      assert!(bin >= last, "bin_of({size}) = {bin} < {last}");
      assert!(bin < BIN_COUNT);
      last = bin;
      size += ALIGNMENT;
    }
    assert!(bin_of(MAX_SEGMENT_CAPACITY) < BIN_COUNT);
  }

  #[test]
  fn geometric_bins_split_each_doubling_in_quarters() {
    assert_eq!(bin_of(256), 31);
    assert_eq!(bin_of(264), 32);
    assert_eq!(bin_of(320), 32);
    assert_eq!(bin_of(328), 33);
    assert_eq!(bin_of(512), 35);
    assert_eq!(bin_of(520), 36);
  }

  #[test]
  fn pack_roundtrips_size_and_tag() {
    for tag in 0..MAX_SEGMENTS {
      let word = pack(4096, tag);
      assert_eq!(unpack_size(word), 4096);
      assert_eq!(unpack_tag(word), tag);
      assert_eq!(word & SEGMENT_MASK, tag as u32);
      assert_eq!(word & !SEGMENT_MASK, 4096);
    }
  }

  #[test]
  fn block_view_reads_back_fields() {
    let mut buf = [0u64; 8];
    let block = Block::at(buf.as_mut_ptr() as usize);

    unsafe {
      block.set_size(48, 5);
      block.set_left(24, true);
      block.set_next(0xdead_bee8);
      block.set_prev(0x1000);

      assert_eq!(block.size(), 48);
      assert_eq!(block.tag(), 5);
      assert_eq!(block.left(), 24);
      assert!(block.is_free());
      assert_eq!(block.next(), 0xdead_bee8);
      assert_eq!(block.prev(), 0x1000);

      block.set_free(false);
      assert!(!block.is_free());
      assert_eq!(block.left(), 24);
    }

    assert_eq!(Block::from_payload(block.payload()), block);
  }

  #[test]
  fn tail_marker_has_zero_size() {
    let mut buf = [u64::MAX; 2];
    let block = Block::at(buf.as_mut_ptr() as usize);
    unsafe {
      block.write_tail(3, 64);
      assert_eq!(block.size(), 0);
      assert_eq!(block.tag(), 3);
      assert_eq!(block.left(), 64);
      assert!(!block.is_free());
    }
  }
}
