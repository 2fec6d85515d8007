//! Single-segment, size-classed free-list allocator.
//!
//! A segment owns one contiguous slice of the arena:
//!
//! ```text
//! base                                  top (high-water mark)          end
//! +--------+------+--------+-----------+-----------+---------------------+
//! | block  | free | block  |   block   |   free    | tail marker | ....  |
//! +--------+------+--------+-----------+-----------+---------------------+
//!  <---------------- blocks, walkable by size ---------><-- untouched -->
//! ```
//!
//! Free blocks are threaded into doubly linked lists, one per bin. A block
//! is never free next to another free block or next to the high-water mark:
//! `release` merges such neighbours immediately.

use core::{
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  ptr::NonNull,
  sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tracing::{debug, error};

use crate::error::VerifyError;
use crate::header::{ALIGNMENT, BIN_COUNT, Block, MIN_CHUNK, bin_of};

// =============================================================================
// Spin Lock
// =============================================================================

pub(crate) struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

/// Exclusive access to a segment's bins; unlocks on drop.
struct BinsGuard<'a> {
  segment: &'a Segment,
}

impl Deref for BinsGuard<'_> {
  type Target = Bins;

  fn deref(&self) -> &Bins {
    unsafe { &*self.segment.bins.get() }
  }
}

impl DerefMut for BinsGuard<'_> {
  fn deref_mut(&mut self) -> &mut Bins {
    unsafe { &mut *self.segment.bins.get() }
  }
}

impl Drop for BinsGuard<'_> {
  fn drop(&mut self) {
    self.segment.lock.unlock();
  }
}

// =============================================================================
// Bins
// =============================================================================

/// Lock-protected mutable state of a segment.
struct Bins {
  /// Head block address per bin, 0 when empty.
  heads: [usize; BIN_COUNT],
  /// Bit `i` set iff `heads[i] != 0`.
  avail: u128,
  /// First never-allocated byte.
  top: usize,
}

impl Bins {
  const fn new(top: usize) -> Self {
    Self {
      heads: [0; BIN_COUNT],
      avail: 0,
      top,
    }
  }

  unsafe fn push(&mut self, block: Block, size: usize) {
    let bin = bin_of(size);
    let head = self.heads[bin];
    unsafe {
      block.set_next(head);
      block.set_prev(0);
      if head != 0 {
        Block::at(head).set_prev(block.addr());
      }
    }
    self.heads[bin] = block.addr();
    self.avail |= 1 << bin;
  }

  unsafe fn unlink(&mut self, block: Block, size: usize) {
    let bin = bin_of(size);
    let (next, prev) = unsafe { (block.next(), block.prev()) };
    unsafe {
      if prev != 0 {
        Block::at(prev).set_next(next);
      } else {
        self.heads[bin] = next;
        if next == 0 {
          self.avail &= !(1 << bin);
        }
      }
      if next != 0 {
        Block::at(next).set_prev(prev);
      }
    }
  }

  /// First block in `bin` that holds `size`, else the head of the next non-empty bin.
  unsafe fn find(&self, bin: usize, size: usize) -> Option<(Block, usize)> {
    if self.avail & (1 << bin) != 0 {
      let mut cur = self.heads[bin];
      while cur != 0 {
        let block = Block::at(cur);
        let block_size = unsafe { block.size() };
        if block_size >= size {
          return Some((block, block_size));
        }
        cur = unsafe { block.next() };
      }
    }

    // Every block in a higher bin is larger than anything mapping to `bin`.
    let larger = if bin + 1 < BIN_COUNT {
      self.avail & (!0u128 << (bin + 1))
    } else {
      0
    };
    if larger == 0 {
      return None;
    }
    let block = Block::at(self.heads[larger.trailing_zeros() as usize]);
    Some((block, unsafe { block.size() }))
  }
}

// =============================================================================
// Segment
// =============================================================================

/// One independently locked sub-allocator over `[base, end)`.
pub(crate) struct Segment {
  tag: usize,
  base: usize,
  end: usize,
  /// Index of the next segment in the ring.
  next: usize,
  /// Free-list bytes plus untouched tail. Advisory outside the lock.
  free_bytes: AtomicUsize,
  lock: SpinLock,
  bins: UnsafeCell<Bins>,
}

unsafe impl Sync for Segment {}
unsafe impl Send for Segment {}

impl Segment {
  fn empty(base: usize, capacity: usize, tag: usize, next: usize) -> Self {
    debug_assert!(capacity >= MIN_CHUNK);
    Self {
      tag,
      base,
      end: base + capacity,
      next,
      free_bytes: AtomicUsize::new(capacity),
      lock: SpinLock::new(),
      bins: UnsafeCell::new(Bins::new(base)),
    }
  }

  /// Creates an empty segment, discarding whatever the range held.
  ///
  /// # Safety
  ///
  /// `[base, base + capacity)` must be writable, 8-aligned, and owned by
  /// this segment alone.
  pub unsafe fn format(base: usize, capacity: usize, tag: usize, next: usize) -> Self {
    let segment = Self::empty(base, capacity, tag, next);
    unsafe { Block::at(base).write_tail(tag, 0) };
    segment
  }

  /// Rebuilds a segment from the block headers already in the range.
  ///
  /// Headers carry only sizes and flags, so the walk works wherever the
  /// range is mapped; free-list links are rewritten from scratch. A
  /// zero-filled range restores as an empty segment.
  ///
  /// # Safety
  ///
  /// Same as [`Segment::format`].
  pub unsafe fn restore(
    base: usize,
    capacity: usize,
    tag: usize,
    next: usize,
  ) -> Result<Self, VerifyError> {
    let mut segment = Self::empty(base, capacity, tag, next);
    let end = segment.end;
    let bins = segment.bins.get_mut();

    let mut addr = base;
    let mut left = 0;
    let mut blocks = 0usize;
    let mut free = 0usize;

    while addr < end {
      let block = Block::at(addr);
      let size = unsafe { block.size() };
      if size == 0 {
        break;
      }
      if unsafe { block.tag() } != tag {
        return Err(corruption(tag, addr, "tag mismatch"));
      }
      if size < MIN_CHUNK || addr + size > end {
        return Err(corruption(tag, addr, "block size out of range"));
      }
      if unsafe { block.left() } != left {
        return Err(corruption(tag, addr, "left size does not match preceding block"));
      }
      if unsafe { block.is_free() } {
        unsafe { bins.push(block, size) };
        free += size;
      }
      blocks += 1;
      left = size;
      addr += size;
    }

    bins.top = addr;
    if addr < end {
      // Zero-filled memory reads as a tail marker with tag 0.
      unsafe { Block::at(addr).write_tail(tag, left) };
    }
    free += end - addr;
    segment.free_bytes.store(free, Ordering::Relaxed);
    // Catches free blocks left unmerged, which the walk alone accepts.
    segment.check()?;

    debug!(
      segment = tag,
      blocks,
      free_bytes = free,
      used = addr - base,
      "restored segment"
    );
    Ok(segment)
  }

  #[inline]
  pub fn next(&self) -> usize {
    self.next
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.end - self.base
  }

  /// Optimistic free-byte count; may be stale by the time it is used.
  #[inline]
  pub fn free_bytes(&self) -> usize {
    self.free_bytes.load(Ordering::Relaxed)
  }

  #[inline]
  fn lock(&self) -> BinsGuard<'_> {
    self.lock.lock();
    BinsGuard { segment: self }
  }

  /// Allocates a block of exactly `aligned` bytes (header included) whose
  /// size class is `bin`. `None` means "try another segment".
  pub fn allocate(&self, bin: usize, aligned: usize) -> Option<NonNull<u8>> {
    debug_assert_eq!(bin, bin_of(aligned));
    let mut bins = self.lock();

    let block = match unsafe { bins.find(bin, aligned) } {
      Some((block, size)) => unsafe {
        bins.unlink(block, size);
        self.carve(&mut bins, block, size, aligned)
      },
      None => unsafe { self.bump(&mut bins, aligned)? },
    };

    NonNull::new(block.payload())
  }

  /// Takes `aligned` bytes from the front of an unlinked free block,
  /// filing the remainder when it is big enough to stand alone.
  unsafe fn carve(&self, bins: &mut Bins, block: Block, size: usize, aligned: usize) -> Block {
    let used = if size - aligned >= MIN_CHUNK {
      let rest = Block::at(block.addr() + aligned);
      let rest_size = size - aligned;
      unsafe {
        rest.set_size(rest_size, self.tag);
        rest.set_left(aligned, true);
        self.set_left_of(block.addr() + size, rest_size);
        bins.push(rest, rest_size);
        block.set_size(aligned, self.tag);
      }
      aligned
    } else {
      size
    };

    unsafe { block.set_free(false) };
    self.free_bytes.fetch_sub(used, Ordering::Relaxed);
    block
  }

  /// Advances the high-water mark by `aligned` bytes if the tail has room.
  unsafe fn bump(&self, bins: &mut Bins, aligned: usize) -> Option<Block> {
    let top = bins.top;
    let room = self.end - top;
    if room < aligned {
      return None;
    }

    // A sliver too small to ever be a block goes with this one.
    let size = if room - aligned < MIN_CHUNK { room } else { aligned };
    let block = Block::at(top);
    unsafe {
      let left = block.left();
      block.set_size(size, self.tag);
      block.set_left(left, false);
    }

    bins.top = top + size;
    if bins.top < self.end {
      unsafe { Block::at(bins.top).write_tail(self.tag, size) };
    }
    self.free_bytes.fetch_sub(size, Ordering::Relaxed);
    Some(block)
  }

  /// Updates the left-size field of whatever starts at `addr`.
  #[inline]
  unsafe fn set_left_of(&self, addr: usize, left: usize) {
    if addr < self.end {
      let right = Block::at(addr);
      unsafe { right.set_left(left, right.is_free()) };
    }
  }

  /// Returns the block owning `payload` to this segment.
  ///
  /// # Safety
  ///
  /// `payload` must be a live allocation whose header carries this
  /// segment's tag.
  pub unsafe fn release(&self, payload: *mut u8) {
    let mut block = Block::from_payload(payload);
    debug_assert_eq!(unsafe { block.tag() }, self.tag);

    {
      let mut bins = self.lock();
      let mut size = unsafe { block.size() };
      self.free_bytes.fetch_add(size, Ordering::Relaxed);

      unsafe {
        let left = block.left();
        if left != 0 {
          let neighbour = Block::at(block.addr() - left);
          if neighbour.is_free() {
            bins.unlink(neighbour, left);
            block = neighbour;
            size += left;
          }
        }

        let right = block.addr() + size;
        if right < bins.top {
          let neighbour = Block::at(right);
          if neighbour.is_free() {
            let right_size = neighbour.size();
            bins.unlink(neighbour, right_size);
            size += right_size;
          }
        }

        if block.addr() + size == bins.top {
          // Fold back into the untouched tail.
          bins.top = block.addr();
          let left = block.left();
          block.write_tail(self.tag, left);
        } else {
          let left = block.left();
          block.set_size(size, self.tag);
          block.set_left(left, true);
          self.set_left_of(block.addr() + size, size);
          bins.push(block, size);
        }
      }
    }

    // May run inside the global allocator: no logging here.
    #[cfg(feature = "debug-tripwire")]
    {
      if let Err(err) = self.check() {
        panic!("{err}");
      }
    }
  }

  /// Walks every block and free list, checking they agree.
  pub fn check(&self) -> Result<(), VerifyError> {
    let bins = self.lock();
    let tag = self.tag;
    let top = bins.top;

    if top < self.base || top > self.end {
      return Err(corruption(tag, top, "high-water mark outside segment"));
    }

    let mut free_count = 0usize;
    let mut free_sum = 0usize;
    let mut addr = self.base;
    let mut left = 0;
    let mut last_free = None;

    while addr < top {
      let block = Block::at(addr);
      let (size, block_tag, block_left, free) =
        unsafe { (block.size(), block.tag(), block.left(), block.is_free()) };

      if block_tag != tag {
        return Err(corruption(tag, addr, "tag mismatch"));
      }
      if size < MIN_CHUNK {
        return Err(corruption(tag, addr, "size below minimum block"));
      }
      if addr + size > top {
        return Err(corruption(tag, addr, "block overruns high-water mark"));
      }
      if block_left != left {
        return Err(corruption(tag, addr, "left size does not match preceding block"));
      }
      if free {
        if last_free.is_some() {
          return Err(corruption(tag, addr, "adjacent free blocks not coalesced"));
        }
        free_count += 1;
        free_sum += size;
        last_free = Some(addr);
      } else {
        last_free = None;
      }

      left = size;
      addr += size;
    }

    if let Some(addr) = last_free {
      return Err(corruption(tag, addr, "free block touches high-water mark"));
    }

    if top < self.end {
      let marker = Block::at(top);
      let (size, marker_tag, marker_left) = unsafe { (marker.size(), marker.tag(), marker.left()) };
      if size != 0 || marker_tag != tag {
        return Err(corruption(tag, top, "tail marker damaged"));
      }
      if marker_left != left {
        return Err(corruption(tag, top, "tail marker left size mismatch"));
      }
    }

    // Back links and bin checks rule out duplicates, so equal counts mean
    // every free block is filed once.
    let mut listed = 0usize;
    for (bin, &head) in bins.heads.iter().enumerate() {
      if (head != 0) != (bins.avail & (1 << bin) != 0) {
        return Err(corruption(tag, head, "bin availability bit out of sync"));
      }

      let mut prev = 0;
      let mut cur = head;
      while cur != 0 {
        listed += 1;
        if listed > free_count {
          return Err(corruption(tag, cur, "more listed blocks than free blocks"));
        }
        if cur < self.base || cur >= top || cur % ALIGNMENT != 0 {
          return Err(corruption(tag, cur, "listed block outside segment"));
        }
        let block = Block::at(cur);
        let (size, block_tag, free, back, next) =
          unsafe { (block.size(), block.tag(), block.is_free(), block.prev(), block.next()) };
        if block_tag != tag || !free {
          return Err(corruption(tag, cur, "listed block is not free"));
        }
        if back != prev {
          return Err(corruption(tag, cur, "broken back link"));
        }
        if bin_of(size) != bin {
          return Err(corruption(tag, cur, "block filed in wrong bin"));
        }
        prev = cur;
        cur = next;
      }
    }

    if listed != free_count {
      return Err(corruption(tag, self.base, "free block missing from bins"));
    }

    let expected = free_sum + (self.end - top);
    if self.free_bytes() != expected {
      return Err(corruption(tag, self.base, "free byte counter out of sync"));
    }

    Ok(())
  }

  /// Like [`Segment::check`], but a violation is fatal.
  pub fn verify(&self) {
    if let Err(err) = self.check() {
      error!(segment = self.tag, %err, "segment verification failed");
      panic!("{err}");
    }
  }
}

#[inline]
fn corruption(segment: usize, address: usize, detail: &'static str) -> VerifyError {
  VerifyError::Corruption {
    segment,
    address,
    detail,
  }
}
