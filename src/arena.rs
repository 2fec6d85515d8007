//! The flat address range the allocator manages.

use core::ptr::{NonNull, null_mut};
use std::io;

use memmap2::MmapMut;

use crate::error::{MallocError, Result};
use crate::header::ALIGNMENT;

// =============================================================================
// Platform
// =============================================================================

#[cfg(unix)]
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

#[cfg(unix)]
unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

#[cfg(not(unix))]
const FALLBACK_ALIGN: usize = 4096;

#[cfg(not(unix))]
unsafe fn os_mmap(size: usize) -> *mut u8 {
  match std::alloc::Layout::from_size_align(size, FALLBACK_ALIGN) {
    Ok(layout) => unsafe { std::alloc::alloc_zeroed(layout) },
    Err(_) => null_mut(),
  }
}

#[cfg(not(unix))]
unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe {
    std::alloc::dealloc(
      ptr,
      std::alloc::Layout::from_size_align_unchecked(size, FALLBACK_ALIGN),
    )
  };
}

// =============================================================================
// Arena
// =============================================================================

/// Where the arena's bytes came from, and who releases them.
enum Origin {
  /// Reserved by us; unmapped on drop.
  Anonymous,
  /// Supplied by the caller, who keeps ownership.
  Borrowed,
  /// A file mapping; unmapped when the handle drops.
  Mapped(MmapMut),
}

/// A contiguous, fixed-capacity address range.
///
/// Capacity never changes after construction. Fresh reservations and
/// new file mappings start zero-filled.
pub struct Arena {
  base: NonNull<u8>,
  capacity: usize,
  origin: Origin,
}

// The arena is a plain byte range; all mutation goes through segment locks.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
  /// Reserves `capacity` bytes of fresh, zeroed memory.
  pub fn reserve(capacity: usize) -> Result<Self> {
    if capacity == 0 {
      return Err(MallocError::InvalidCapacity {
        capacity,
        reason: "capacity must be non-zero",
      });
    }

    let raw = unsafe { os_mmap(capacity) };
    let Some(base) = NonNull::new(raw) else {
      return Err(MallocError::Reserve {
        capacity,
        source: io::Error::last_os_error(),
      });
    };

    Ok(Self {
      base,
      capacity,
      origin: Origin::Anonymous,
    })
  }

  /// Attaches to `capacity` bytes at `base` without taking ownership.
  ///
  /// # Safety
  ///
  /// The range must be valid for reads and writes, 8-byte aligned, and
  /// outlive the arena. Nothing else may touch it while the arena lives.
  pub unsafe fn from_raw_parts(base: NonNull<u8>, capacity: usize) -> Result<Self> {
    Self::checked(base, capacity, Origin::Borrowed)
  }

  /// Uses a writable file mapping as the arena.
  pub fn from_mmap(mut mmap: MmapMut) -> Result<Self> {
    let capacity = mmap.len();
    let Some(base) = NonNull::new(mmap.as_mut_ptr()) else {
      return Err(MallocError::InvalidCapacity {
        capacity,
        reason: "mapping is empty",
      });
    };
    Self::checked(base, capacity, Origin::Mapped(mmap))
  }

  fn checked(base: NonNull<u8>, capacity: usize, origin: Origin) -> Result<Self> {
    if capacity == 0 {
      return Err(MallocError::InvalidCapacity {
        capacity,
        reason: "capacity must be non-zero",
      });
    }
    if base.as_ptr() as usize % ALIGNMENT != 0 {
      return Err(MallocError::MisalignedBase {
        base: base.as_ptr() as usize,
      });
    }
    Ok(Self {
      base,
      capacity,
      origin,
    })
  }

  #[inline]
  pub fn base(&self) -> *mut u8 {
    self.base.as_ptr()
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  #[inline]
  pub fn contains(&self, ptr: *const u8) -> bool {
    let base = self.base.as_ptr() as usize;
    let addr = ptr as usize;
    addr >= base && addr < base + self.capacity
  }

  /// Whether the arena is backed by a file mapping.
  pub fn is_mapped(&self) -> bool {
    matches!(self.origin, Origin::Mapped(_))
  }

  /// Flushes a file-backed arena to disk. No-op for memory-only arenas.
  pub fn flush(&self) -> io::Result<()> {
    match &self.origin {
      Origin::Mapped(mmap) => mmap.flush(),
      Origin::Anonymous | Origin::Borrowed => Ok(()),
    }
  }
}

impl Drop for Arena {
  fn drop(&mut self) {
    if let Origin::Anonymous = self.origin {
      unsafe { os_munmap(self.base.as_ptr(), self.capacity) };
    }
  }
}

impl core::fmt::Debug for Arena {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    let origin = match self.origin {
      Origin::Anonymous => "anonymous",
      Origin::Borrowed => "borrowed",
      Origin::Mapped(_) => "mapped",
    };
    f.debug_struct("Arena")
      .field("base", &self.base)
      .field("capacity", &self.capacity)
      .field("origin", &origin)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reserve_is_zeroed_and_writable() {
    let arena = Arena::reserve(1 << 16).unwrap();
    assert_eq!(arena.capacity(), 1 << 16);
    assert!(!arena.is_mapped());

    let bytes = unsafe { core::slice::from_raw_parts_mut(arena.base(), arena.capacity()) };
    assert!(bytes.iter().all(|&b| b == 0));
    bytes[100] = 7;
    assert_eq!(bytes[100], 7);
    assert!(arena.contains(unsafe { arena.base().add(100) }));
    assert!(!arena.contains(unsafe { arena.base().add(1 << 16) }));
  }

  #[test]
  fn zero_capacity_is_rejected() {
    assert!(matches!(
      Arena::reserve(0),
      Err(MallocError::InvalidCapacity { capacity: 0, .. })
    ));
  }

  #[test]
  fn borrowed_base_must_be_aligned() {
    let mut buf = vec![0u64; 64];
    let base = NonNull::new(buf.as_mut_ptr() as *mut u8).unwrap();

    let arena = unsafe { Arena::from_raw_parts(base, 512) }.unwrap();
    assert_eq!(arena.base(), base.as_ptr());
    drop(arena);

    let skewed = NonNull::new(unsafe { base.as_ptr().add(4) }).unwrap();
    assert!(matches!(
      unsafe { Arena::from_raw_parts(skewed, 256) },
      Err(MallocError::MisalignedBase { .. })
    ));
  }

  #[test]
  fn anonymous_mapping_backs_an_arena() {
    let mmap = MmapMut::map_anon(8192).unwrap();
    let arena = Arena::from_mmap(mmap).unwrap();
    assert!(arena.is_mapped());
    assert_eq!(arena.capacity(), 8192);
  }
}
