//! Page descriptors and the side table that maps addresses to them.

use core::{fmt, ops, ptr::NonNull};

use bitflags::bitflags;

use crate::{
  PAGE_SHIFT, PAGE_SIZE,
  error::{BackendError, Result},
};

bitflags! {
  /// State bits of a page descriptor.
  #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
  pub struct PageFlags: u8 {
    /// The page heads a free block sitting in a bin.
    const FREE = 0x01;
    /// The page is backed by read/write memory.
    const COMMITTED = 0x02;
    /// Reserved for out-of-band allocations. Never set on buddy pages.
    const HUGE = 0x04;
    /// First page of a block; the only page holding free-list linkage.
    const HEAD = 0x08;
  }
}

/// Front-end category currently holding a block.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Owner {
  #[default]
  None = 0,
  Arena = 1,
  Pool = 2,
  Heap = 3,
  Debug = 4,
}

impl Owner {
  pub const fn name(self) -> &'static str {
    match self {
      Owner::None => "none",
      Owner::Arena => "arena",
      Owner::Pool => "pool",
      Owner::Heap => "heap",
      Owner::Debug => "debug",
    }
  }
}

impl fmt::Display for Owner {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Metadata for one page slot of the managed region.
///
/// Descriptors live in the metadata prefix of the reserved region, never inside the pages they
/// describe.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageDescriptor {
  pub(crate) flags: PageFlags,
  pub(crate) order: u8,
  pub(crate) owner: Owner,
  /// Page index of the head of the block this page belongs to.
  pub(crate) zone: u32,
  pub(crate) next: Option<u32>,
  pub(crate) prev: Option<u32>,
}

impl PageDescriptor {
  pub(crate) const EMPTY: Self = Self {
    flags: PageFlags::empty(),
    order: 0,
    owner: Owner::None,
    zone: 0,
    next: None,
    prev: None,
  };

  pub fn flags(&self) -> PageFlags {
    self.flags
  }

  pub fn order(&self) -> usize {
    self.order as usize
  }

  pub fn owner(&self) -> Owner {
    self.owner
  }

  pub fn is_free(&self) -> bool {
    self.flags.contains(PageFlags::FREE)
  }

  pub fn is_head(&self) -> bool {
    self.flags.contains(PageFlags::HEAD)
  }

  pub fn is_committed(&self) -> bool {
    self.flags.contains(PageFlags::COMMITTED)
  }

  /// Page index of the head of the block containing this page.
  pub fn zone_index(&self) -> usize {
    self.zone as usize
  }
}

/// Flat array of descriptors, one per page of the managed range.
pub(crate) struct DescriptorTable {
  descs: NonNull<PageDescriptor>,
  len: usize,
  /// Address of the page described by `descs[0]`.
  start: NonNull<u8>,
}

impl DescriptorTable {
  /// Builds a table of `len` empty descriptors at `descs` describing pages from `start`.
  ///
  /// # Safety
  ///
  /// `descs` must be aligned and writable for `len` descriptors, and stay valid for the
  /// lifetime of the table. `start` must be page aligned with `len` pages of address space behind
  /// it.
  pub(crate) unsafe fn new(descs: NonNull<PageDescriptor>, len: usize, start: NonNull<u8>) -> Self {
    debug_assert!(descs.is_aligned());
    debug_assert_eq!(start.as_ptr() as usize % PAGE_SIZE, 0);
    for i in 0..len {
      unsafe { descs.add(i).write(PageDescriptor::EMPTY) };
    }
    Self { descs, len, start }
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub(crate) fn start(&self) -> NonNull<u8> {
    self.start
  }

  /// First address past the described pages.
  #[inline]
  pub(crate) fn end_addr(&self) -> usize {
    self.start.as_ptr() as usize + (self.len << PAGE_SHIFT)
  }

  #[inline]
  pub(crate) fn contains(&self, addr: usize) -> bool {
    addr >= self.start.as_ptr() as usize && addr < self.end_addr()
  }

  /// Index of the page containing `addr`.
  #[inline]
  pub(crate) fn index_of(&self, addr: usize) -> Result<usize> {
    if !self.contains(addr) {
      return Err(BackendError::OutOfBounds { addr });
    }
    Ok((addr - self.start.as_ptr() as usize) >> PAGE_SHIFT)
  }

  /// Start address of page `idx`.
  #[inline]
  pub(crate) fn address_of(&self, idx: usize) -> NonNull<u8> {
    debug_assert!(idx < self.len);
    unsafe { self.start.add(idx << PAGE_SHIFT) }
  }

  /// Array index of a descriptor reference, if it points into this table.
  pub(crate) fn index_of_descriptor(&self, desc: &PageDescriptor) -> Result<usize> {
    let base = self.descs.as_ptr() as usize;
    let addr = desc as *const PageDescriptor as usize;
    let size = size_of::<PageDescriptor>();
    if addr < base || addr >= base + self.len * size || (addr - base) % size != 0 {
      return Err(BackendError::ForeignDescriptor);
    }
    Ok((addr - base) / size)
  }

  pub(crate) fn as_slice(&self) -> &[PageDescriptor] {
    unsafe { core::slice::from_raw_parts(self.descs.as_ptr(), self.len) }
  }

  pub(crate) fn as_mut_slice(&mut self) -> &mut [PageDescriptor] {
    unsafe { core::slice::from_raw_parts_mut(self.descs.as_ptr(), self.len) }
  }
}

impl ops::Index<usize> for DescriptorTable {
  type Output = PageDescriptor;

  #[inline]
  fn index(&self, idx: usize) -> &PageDescriptor {
    &self.as_slice()[idx]
  }
}

impl ops::IndexMut<usize> for DescriptorTable {
  #[inline]
  fn index_mut(&mut self, idx: usize) -> &mut PageDescriptor {
    &mut self.as_mut_slice()[idx]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Table over heap-backed descriptors and a fake page range; no page is ever dereferenced.
  fn table(len: usize, descs: &mut Vec<PageDescriptor>) -> DescriptorTable {
    descs.resize(len, PageDescriptor::EMPTY);
    let start = NonNull::new((64 * PAGE_SIZE) as *mut u8).unwrap();
    unsafe { DescriptorTable::new(NonNull::new(descs.as_mut_ptr()).unwrap(), len, start) }
  }

  #[test]
  fn address_and_index_are_inverse() {
    let mut storage = Vec::new();
    let table = table(32, &mut storage);
    for idx in 0..table.len() {
      let addr = table.address_of(idx).as_ptr() as usize;
      assert_eq!(table.index_of(addr), Ok(idx));
      assert_eq!(table.index_of(addr + PAGE_SIZE - 1), Ok(idx));
      assert_eq!(table.index_of_descriptor(&table[idx]), Ok(idx));
    }
  }

  #[test]
  fn out_of_range_addresses_are_rejected() {
    let mut storage = Vec::new();
    let table = table(4, &mut storage);
    let start = table.start().as_ptr() as usize;
    assert_eq!(
      table.index_of(start - 1),
      Err(BackendError::OutOfBounds { addr: start - 1 })
    );
    let end = table.end_addr();
    assert_eq!(table.index_of(end), Err(BackendError::OutOfBounds { addr: end }));
  }

  #[test]
  fn foreign_descriptor_is_rejected() {
    let mut storage = Vec::new();
    let table = table(4, &mut storage);
    let stray = PageDescriptor::EMPTY;
    assert_eq!(table.index_of_descriptor(&stray), Err(BackendError::ForeignDescriptor));
  }

  #[test]
  fn owner_names_are_distinct() {
    let owners = [Owner::None, Owner::Arena, Owner::Pool, Owner::Heap, Owner::Debug];
    for (i, a) in owners.iter().enumerate() {
      for b in &owners[i + 1..] {
        assert_ne!(a.name(), b.name());
      }
    }
    assert_eq!(Owner::Pool.to_string(), "pool");
  }
}
