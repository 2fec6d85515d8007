//! Off-heap arena allocator sharded into thread-affine segments.
//!
//! A fixed-capacity [`Arena`] is split into up to eight equal segments,
//! each a locked size-classed free-list allocator. Allocation starts at
//! the calling thread's home segment and walks the ring on failure. Every
//! block header carries its segment's tag in the low 3 bits of the size
//! word, so [`SegMalloc::free`] finds the owner from the address alone,
//! whichever thread calls it.
//!
//! ```
//! use segmalloc::SegMalloc;
//!
//! let malloc = SegMalloc::new(1 << 20)?;
//! let ptr = malloc.allocate(100)?;
//! assert_eq!(unsafe { malloc.allocated_size(ptr) }, 104);
//! unsafe { malloc.free(ptr) };
//! assert_eq!(malloc.total_free_bytes(), 1 << 20);
//! # Ok::<(), segmalloc::MallocError>(())
//! ```

use core::{
  alloc::{GlobalAlloc, Layout},
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicU32, Ordering},
};
use std::io;

use memmap2::MmapMut;
use tracing::{debug, trace, warn};

pub mod arena;
pub mod error;
pub mod header;
mod segment;

pub use arena::Arena;
pub use error::{MallocError, Result, VerifyError};

use header::{ALIGNMENT, Block, HEADER_SIZE, MAX_SEGMENT_CAPACITY, MAX_SEGMENTS, MIN_CHUNK};
use segment::Segment;

// =============================================================================
// Constants
// =============================================================================

/// Default number of segments an arena is split into.
pub const SEGMENT_COUNT: usize = 8;

const _: () = assert!(SEGMENT_COUNT.is_power_of_two());
const _: () = assert!(SEGMENT_COUNT <= MAX_SEGMENTS);

// =============================================================================
// Thread Affinity
// =============================================================================

// Each thread gets a different ID
fn thread_id_u32() -> u32 {
  thread_local! {
    static TID: u32 = {
      static CTR: AtomicU32 = AtomicU32::new(0);
      CTR.fetch_add(1, Ordering::Relaxed) // We only need uniqueness, not synchronization
    };
  }
  TID.with(|&id| id)
}

// =============================================================================
// Config
// =============================================================================

/// Construction options for [`SegMalloc`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MallocConfig {
  /// Number of segments; a power of two in `1..=8`.
  pub segments: usize,
  /// Walk existing block headers instead of formatting the arena.
  pub restore: bool,
}

impl Default for MallocConfig {
  fn default() -> Self {
    Self {
      segments: SEGMENT_COUNT,
      restore: false,
    }
  }
}

impl MallocConfig {
  pub fn with_segments(mut self, segments: usize) -> Self {
    self.segments = segments;
    self
  }

  pub fn with_restore(mut self, restore: bool) -> Self {
    self.restore = restore;
    self
  }
}

// =============================================================================
// Sharded Allocator
// =============================================================================

/// Allocator over one arena, sharded into a ring of segments.
pub struct SegMalloc {
  segments: Box<[Segment]>,
  mask: usize,
  segment_size: usize,
  arena: Arena,
}

impl SegMalloc {
  /// Reserves `capacity` bytes and splits them into [`SEGMENT_COUNT`] segments.
  pub fn new(capacity: usize) -> Result<Self> {
    Self::with_config(Arena::reserve(capacity)?, &MallocConfig::default())
  }

  /// Manages caller-supplied memory, formatting it as empty.
  ///
  /// # Safety
  ///
  /// See [`Arena::from_raw_parts`].
  pub unsafe fn from_raw_parts(base: NonNull<u8>, capacity: usize) -> Result<Self> {
    let arena = unsafe { Arena::from_raw_parts(base, capacity) }?;
    Self::with_config(arena, &MallocConfig::default())
  }

  /// Manages a file mapping, restoring whatever heap it already holds.
  ///
  /// A freshly created (zero-filled) file opens as an empty heap. The
  /// mapping need not land at the address it had when the heap was built.
  pub fn from_mmap(mmap: MmapMut) -> Result<Self> {
    Self::with_config(
      Arena::from_mmap(mmap)?,
      &MallocConfig::default().with_restore(true),
    )
  }

  /// Splits `arena` into segments as `config` describes.
  pub fn with_config(arena: Arena, config: &MallocConfig) -> Result<Self> {
    let count = config.segments;
    if !count.is_power_of_two() || count > MAX_SEGMENTS {
      return Err(MallocError::InvalidSegmentCount { count });
    }

    let capacity = arena.capacity();
    let segment_size = (capacity / count) & !(ALIGNMENT - 1);
    if segment_size < MIN_CHUNK {
      return Err(MallocError::InvalidCapacity {
        capacity,
        reason: "segments would be smaller than one block",
      });
    }
    if segment_size > MAX_SEGMENT_CAPACITY {
      return Err(MallocError::InvalidCapacity {
        capacity,
        reason: "segments would exceed 2 GiB",
      });
    }

    let mask = count - 1;
    let base = arena.base() as usize;
    let mut segments = Vec::with_capacity(count);
    for i in 0..count {
      let segment_base = base + i * segment_size;
      let next = (i + 1) & mask;
      let segment = if config.restore {
        unsafe { Segment::restore(segment_base, segment_size, i, next) }?
      } else {
        unsafe { Segment::format(segment_base, segment_size, i, next) }
      };
      segments.push(segment);
    }

    debug!(
      ?arena,
      segments = count,
      segment_size,
      restore = config.restore,
      "arena initialized"
    );

    Ok(Self {
      segments: segments.into_boxed_slice(),
      mask,
      segment_size,
      arena,
    })
  }

  /// Segment the calling thread starts allocating from.
  #[inline]
  pub fn home_segment(&self) -> usize {
    thread_id_u32() as usize & self.mask
  }

  /// Walks the ring from the home segment. Returns the block and the
  /// number of segments skipped.
  fn ring_allocate(&self, size: usize) -> Option<(NonNull<u8>, usize)> {
    let aligned = header::aligned_size(size)?;
    let bin = header::bin_of(aligned);

    let start = self.home_segment();
    let mut index = start;
    let mut hops = 0;

    loop {
      let segment = &self.segments[index];
      if segment.free_bytes() >= aligned
        && let Some(ptr) = segment.allocate(bin, aligned)
      {
        return Some((ptr, hops));
      }

      index = segment.next();
      if index == start {
        return None;
      }
      hops += 1;
    }
  }

  /// Allocates at least `size` bytes, 8-byte aligned.
  ///
  /// Fails with [`MallocError::OutOfMemory`] once no segment has a block
  /// large enough. The arena never grows, so retrying without freeing
  /// anything fails again.
  pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
    match self.ring_allocate(size) {
      Some((ptr, hops)) => {
        if hops > 0 {
          trace!(requested = size, hops, "allocation fell back along the ring");
        }
        Ok(ptr)
      }
      None => {
        warn!(
          requested = size,
          free_bytes = self.total_free_bytes(),
          "arena exhausted"
        );
        Err(MallocError::OutOfMemory { requested: size })
      }
    }
  }

  /// Like [`SegMalloc::allocate`], with the usable bytes zeroed.
  pub fn allocate_zeroed(&self, size: usize) -> Result<NonNull<u8>> {
    let ptr = self.allocate(size)?;
    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, self.allocated_size(ptr)) };
    Ok(ptr)
  }

  /// Returns a block to the segment named by its header tag.
  ///
  /// # Safety
  ///
  /// `ptr` must come from [`SegMalloc::allocate`] on this allocator and
  /// must not have been freed already.
  pub unsafe fn free(&self, ptr: NonNull<u8>) {
    debug_assert!(self.arena.contains(ptr.as_ptr()));
    let tag = unsafe { self.segment_of(ptr) };
    unsafe { self.segments[tag].release(ptr.as_ptr()) };
  }

  /// Tag of the segment that owns `ptr`, read from its header.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation from this allocator.
  #[inline]
  pub unsafe fn segment_of(&self, ptr: NonNull<u8>) -> usize {
    unsafe { Block::from_payload(ptr.as_ptr()).tag() }
  }

  /// Usable bytes behind `ptr`; at least what was requested.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation from this allocator.
  #[inline]
  pub unsafe fn allocated_size(&self, ptr: NonNull<u8>) -> usize {
    unsafe { Block::from_payload(ptr.as_ptr()).size() - HEADER_SIZE }
  }

  /// Sum of every segment's free bytes. Advisory under concurrency.
  pub fn total_free_bytes(&self) -> usize {
    self.segments.iter().map(Segment::free_bytes).sum()
  }

  /// Bytes under management (bytes lost to segment rounding excluded).
  pub fn total_memory(&self) -> usize {
    self.segments.iter().map(Segment::capacity).sum()
  }

  pub fn used_memory(&self) -> usize {
    self.total_memory().saturating_sub(self.total_free_bytes())
  }

  pub fn segment_count(&self) -> usize {
    self.segments.len()
  }

  pub fn segment_size(&self) -> usize {
    self.segment_size
  }

  /// Free bytes of one segment. Panics if `index` is out of range.
  pub fn segment_free_bytes(&self, index: usize) -> usize {
    self.segments[index].free_bytes()
  }

  /// Checks every segment, returning the first violation found.
  pub fn check_all(&self) -> core::result::Result<(), VerifyError> {
    self.segments.iter().try_for_each(Segment::check)
  }

  /// Checks every segment; panics on corruption.
  pub fn verify_all(&self) {
    self.segments.iter().for_each(Segment::verify);
  }

  pub fn arena(&self) -> &Arena {
    &self.arena
  }

  /// Flushes a file-backed arena to disk.
  pub fn flush(&self) -> io::Result<()> {
    self.arena.flush()
  }
}

impl core::fmt::Debug for SegMalloc {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("SegMalloc")
      .field("arena", &self.arena)
      .field("segments", &self.segments.len())
      .field("segment_size", &self.segment_size)
      .field("free_bytes", &self.total_free_bytes())
      .finish()
  }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

// No logging on this path: it may run inside the global allocator.
unsafe impl GlobalAlloc for SegMalloc {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    self
      .ring_allocate(layout.size())
      .map_or(null_mut(), |(ptr, _)| ptr.as_ptr())
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    if let Some(ptr) = NonNull::new(ptr) {
      unsafe { self.free(ptr) };
    }
  }
}
