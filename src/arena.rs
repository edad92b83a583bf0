//! Bump allocators over a caller-supplied buffer.
//!
//! Neither allocator touches the backend's page map. A buffer may come from anywhere, including
//! a [`Backend`](crate::Backend) block tagged [`Owner::Arena`](crate::Owner::Arena).

use core::{marker::PhantomData, ptr::NonNull};

use crate::{DEFAULT_ALIGNMENT, order::align_up};

// =============================================================================
// Arena
// =============================================================================

/// Linear allocator. Individual allocations are never freed; [`Arena::reset`] frees them all.
#[derive(Debug)]
pub struct Arena<'a> {
  buf: NonNull<u8>,
  len: usize,
  /// Start of the most recent allocation, for in-place resize.
  prev_offset: usize,
  offset: usize,
  _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> Arena<'a> {
  pub fn new(buf: &'a mut [u8]) -> Self {
    Self {
      len: buf.len(),
      buf: NonNull::from(buf).cast(),
      prev_offset: 0,
      offset: 0,
      _marker: PhantomData,
    }
  }

  pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
    self.alloc_align(size, DEFAULT_ALIGNMENT)
  }

  /// Allocates `size` zeroed bytes aligned to `align`, which must be a power of two.
  pub fn alloc_align(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
    if !align.is_power_of_two() {
      return None;
    }

    let base = self.buf.as_ptr() as usize;
    let start = align_up(base.checked_add(self.offset)?, align) - base;
    let end = start.checked_add(size)?;
    if end > self.len {
      return None;
    }

    self.prev_offset = start;
    self.offset = end;
    let ptr = unsafe { self.buf.add(start) };
    unsafe { ptr.write_bytes(0, size) };
    Some(ptr)
  }

  /// Resizes an allocation from this arena.
  ///
  /// The most recent allocation grows or shrinks in place; any other is copied to a fresh
  /// allocation. Returns `None` if `ptr` is not from this arena or the arena is full.
  pub fn resize(
    &mut self,
    ptr: NonNull<u8>,
    old_size: usize,
    new_size: usize,
  ) -> Option<NonNull<u8>> {
    let base = self.buf.as_ptr() as usize;
    let addr = ptr.as_ptr() as usize;
    if addr < base || addr >= base + self.offset {
      return None;
    }

    let start = addr - base;
    if start == self.prev_offset {
      let end = start.checked_add(new_size)?;
      if end > self.len {
        return None;
      }
      if new_size > old_size {
        unsafe { ptr.add(old_size).write_bytes(0, new_size - old_size) };
      }
      self.offset = end;
      return Some(ptr);
    }

    let new = self.alloc(new_size)?;
    unsafe { new.copy_from_nonoverlapping(ptr, old_size.min(new_size)) };
    Some(new)
  }

  /// Frees every allocation at once.
  pub fn reset(&mut self) {
    self.prev_offset = 0;
    self.offset = 0;
  }

  /// Bytes consumed, alignment padding included.
  pub fn used(&self) -> usize {
    self.offset
  }

  pub fn capacity(&self) -> usize {
    self.len
  }
}

// =============================================================================
// Stack
// =============================================================================

/// Header stored in the byte right before every stack allocation.
#[repr(C)]
struct StackHeader {
  /// Distance from the previous top to the allocation.
  padding: u8,
}

const STACK_HEADER_SIZE: usize = size_of::<StackHeader>();

/// Largest alignment whose padding still fits in a [`StackHeader`].
const MAX_STACK_ALIGN: usize = 128;

/// LIFO allocator. Freeing an allocation also frees everything allocated after it.
#[derive(Debug)]
pub struct Stack<'a> {
  buf: NonNull<u8>,
  len: usize,
  offset: usize,
  _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> Stack<'a> {
  pub fn new(buf: &'a mut [u8]) -> Self {
    Self {
      len: buf.len(),
      buf: NonNull::from(buf).cast(),
      offset: 0,
      _marker: PhantomData,
    }
  }

  pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
    self.alloc_align(size, DEFAULT_ALIGNMENT)
  }

  /// Allocates `size` zeroed bytes aligned to `align` (a power of two, at most 128).
  pub fn alloc_align(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
    if !align.is_power_of_two() || align > MAX_STACK_ALIGN {
      return None;
    }

    let base = self.buf.as_ptr() as usize;
    let top = base.checked_add(self.offset)?;
    let padding = padding_with_header(top, align, STACK_HEADER_SIZE);
    let start = self.offset.checked_add(padding)?;
    let end = start.checked_add(size)?;
    if end > self.len {
      return None;
    }

    let ptr = unsafe { self.buf.add(start) };
    unsafe {
      ptr
        .sub(STACK_HEADER_SIZE)
        .cast::<StackHeader>()
        .write(StackHeader {
          padding: padding as u8,
        });
      ptr.write_bytes(0, size);
    }
    self.offset = end;
    Some(ptr)
  }

  /// Pops `ptr` and everything above it. Returns `false` if `ptr` is not a live allocation.
  pub fn free(&mut self, ptr: NonNull<u8>) -> bool {
    let base = self.buf.as_ptr() as usize;
    let addr = ptr.as_ptr() as usize;
    if addr < base + STACK_HEADER_SIZE || addr >= base + self.offset {
      return false;
    }

    let header = unsafe { ptr.sub(STACK_HEADER_SIZE).cast::<StackHeader>().read() };
    match (addr - base).checked_sub(header.padding as usize) {
      Some(top) if top <= self.offset => {
        self.offset = top;
        true
      }
      _ => false,
    }
  }

  pub fn resize(
    &mut self,
    ptr: NonNull<u8>,
    old_size: usize,
    new_size: usize,
  ) -> Option<NonNull<u8>> {
    self.resize_align(ptr, old_size, new_size, DEFAULT_ALIGNMENT)
  }

  /// Resizes a live allocation.
  ///
  /// The topmost allocation grows or shrinks in place when `ptr` already satisfies `align`;
  /// any other is copied to a fresh allocation on top. Returns `None` if `ptr` is not live or the
  /// stack is full.
  pub fn resize_align(
    &mut self,
    ptr: NonNull<u8>,
    old_size: usize,
    new_size: usize,
    align: usize,
  ) -> Option<NonNull<u8>> {
    if !align.is_power_of_two() || align > MAX_STACK_ALIGN {
      return None;
    }

    let base = self.buf.as_ptr() as usize;
    let addr = ptr.as_ptr() as usize;
    let end = base + self.offset;
    if addr < base + STACK_HEADER_SIZE || addr >= end || old_size > end - addr {
      return None;
    }
    if old_size == new_size {
      return Some(ptr);
    }

    if addr + old_size == end && addr % align == 0 {
      let new_end = (addr - base).checked_add(new_size)?;
      if new_end > self.len {
        return None;
      }
      if new_size > old_size {
        unsafe { ptr.add(old_size).write_bytes(0, new_size - old_size) };
      }
      self.offset = new_end;
      return Some(ptr);
    }

    let new = self.alloc_align(new_size, align)?;
    unsafe { new.copy_from_nonoverlapping(ptr, old_size.min(new_size)) };
    Some(new)
  }

  pub fn reset(&mut self) {
    self.offset = 0;
  }

  pub fn used(&self) -> usize {
    self.offset
  }

  pub fn capacity(&self) -> usize {
    self.len
  }
}

/// Padding from `addr` to the next `align` boundary that leaves room for a `header` before it.
fn padding_with_header(addr: usize, align: usize, header: usize) -> usize {
  let mut padding = align_up(addr, align) - addr;
  if padding < header {
    padding += align_up(header - padding, align);
  }
  padding
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn arena_aligns_and_exhausts() {
    let mut buf = [0xFFu8; 256];
    let mut arena = Arena::new(&mut buf);

    let a = arena.alloc_align(3, 1).unwrap();
    let b = arena.alloc_align(8, 8).unwrap();
    assert_eq!(b.as_ptr() as usize % 8, 0);
    assert!(b.as_ptr() as usize >= a.as_ptr() as usize + 3);
    assert_eq!(unsafe { b.as_ptr().read() }, 0);

    assert!(arena.alloc_align(8, 3).is_none());
    assert!(arena.alloc(1024).is_none());

    arena.reset();
    assert_eq!(arena.used(), 0);
    assert!(arena.alloc_align(256, 1).is_some());
    assert!(arena.alloc_align(1, 1).is_none());
  }

  #[test]
  fn arena_resizes_last_allocation_in_place() {
    let mut buf = [0u8; 512];
    let mut arena = Arena::new(&mut buf);

    let a = arena.alloc(16).unwrap();
    unsafe { a.as_ptr().write_bytes(0xAA, 16) };
    let grown = arena.resize(a, 16, 64).unwrap();
    assert_eq!(grown, a);
    assert_eq!(unsafe { a.add(16).read() }, 0);

    let b = arena.alloc(16).unwrap();
    unsafe { b.as_ptr().write_bytes(0xBB, 16) };
    let moved = arena.resize(a, 64, 32).unwrap();
    assert_ne!(moved, a);
    assert_eq!(unsafe { moved.read() }, 0xAA);
    assert_eq!(unsafe { b.read() }, 0xBB);

    let mut other = [0u8; 8];
    let foreign = NonNull::from(&mut other).cast::<u8>();
    assert!(arena.resize(foreign, 8, 16).is_none());
  }

  #[test]
  fn stack_rewinds_on_free() {
    let mut buf = [0u8; 256];
    let mut stack = Stack::new(&mut buf);

    let a = stack.alloc(10).unwrap();
    let after_a = stack.used();
    let b = stack.alloc_align(20, 32).unwrap();
    assert_eq!(b.as_ptr() as usize % 32, 0);
    let c = stack.alloc(5).unwrap();

    assert!(stack.free(c));
    assert!(stack.free(b));
    assert_eq!(stack.used(), after_a);
    assert!(!stack.free(b));

    assert!(stack.free(a));
    assert_eq!(stack.used(), 0);
    assert_eq!(stack.alloc(10), Some(a));
  }

  #[test]
  fn stack_refuses_interior_pointers() {
    let mut buf = [0u8; 256];
    let mut stack = Stack::new(&mut buf);
    let a = stack.alloc(64).unwrap();
    unsafe { a.as_ptr().write_bytes(0xFF, 64) };
    let used = stack.used();

    assert!(!stack.free(unsafe { a.add(8) }));
    assert_eq!(stack.used(), used);
    assert!(stack.free(a));
    assert_eq!(stack.used(), 0);
  }

  #[test]
  fn stack_resizes_top_in_place_and_copies_others() {
    let mut buf = [0u8; 512];
    let mut stack = Stack::new(&mut buf);

    let a = stack.alloc(16).unwrap();
    unsafe { a.as_ptr().write_bytes(0xAA, 16) };
    assert_eq!(stack.resize(a, 16, 16), Some(a));
    let grown = stack.resize(a, 16, 48).unwrap();
    assert_eq!(grown, a);
    assert_eq!(unsafe { a.add(16).read() }, 0);
    let shrunk = stack.resize(a, 48, 8).unwrap();
    assert_eq!(shrunk, a);
    assert_eq!(stack.used(), a.as_ptr() as usize - stack.buf.as_ptr() as usize + 8);

    let b = stack.alloc(16).unwrap();
    unsafe { b.as_ptr().write_bytes(0xBB, 16) };
    let moved = stack.resize(a, 8, 32).unwrap();
    assert_ne!(moved, a);
    assert!(moved > b);
    assert_eq!(unsafe { moved.read() }, 0xAA);
    assert_eq!(unsafe { moved.add(7).read() }, 0xAA);
    assert_eq!(unsafe { b.read() }, 0xBB);

    // Freed allocations and oversized growth are refused.
    assert!(stack.free(b));
    assert!(stack.resize(b, 16, 32).is_none());
    assert!(stack.resize(a, 8, 4096).is_none());
    assert!(stack.resize_align(a, 8, 16, 3).is_none());
  }

  #[test]
  fn stack_rejects_bad_requests() {
    let mut buf = [0u8; 64];
    let mut stack = Stack::new(&mut buf);
    assert!(stack.alloc_align(8, 256).is_none());
    assert!(stack.alloc_align(8, 6).is_none());
    assert!(stack.alloc(64).is_none());
    assert!(stack.alloc(32).is_some());
  }

  #[test]
  fn padding_leaves_room_for_header() {
    assert_eq!(padding_with_header(0x1000, 16, 1), 16);
    assert_eq!(padding_with_header(0x1001, 16, 1), 15);
    assert_eq!(padding_with_header(0x100F, 16, 1), 1);
    assert_eq!(padding_with_header(0x100F, 16, 4), 17);
  }
}
