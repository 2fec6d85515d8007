use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

use segmalloc::SegMalloc;

thread_local! {
  static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
}

/// Counts heap allocations made by the current thread.
struct Counting;

unsafe impl GlobalAlloc for Counting {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let _ = ALLOCATIONS.try_with(|n| n.set(n.get() + 1));
    unsafe { System.alloc(layout) }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    unsafe { System.dealloc(ptr, layout) }
  }
}

#[global_allocator]
static GLOBAL: Counting = Counting;

fn allocations() -> usize {
  ALLOCATIONS.with(Cell::get)
}

// Verification may run from inside `GlobalAlloc::dealloc`, so it must not
// call back into the global allocator.
#[test]
fn verification_does_not_allocate() {
  let malloc = SegMalloc::new(1 << 20).unwrap();
  let mut live = Vec::with_capacity(64);
  for i in 0..64 {
    live.push(malloc.allocate(16 + i * 24).unwrap());
  }
  for ptr in live.iter().step_by(2) {
    unsafe { malloc.free(*ptr) };
  }

  let before = allocations();
  malloc.check_all().unwrap();
  malloc.verify_all();
  assert_eq!(allocations(), before);

  for ptr in live.iter().skip(1).step_by(2) {
    unsafe { malloc.free(*ptr) };
  }
  assert_eq!(malloc.total_free_bytes(), 1 << 20);
}
