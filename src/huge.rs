//! Out-of-band mappings for requests larger than the biggest buddy block.

use core::ptr::NonNull;

use crate::{
  HUGE_MAGIC, PAGE_SIZE,
  descriptor::{Owner, PageFlags},
  error::{BackendError, Result},
  os,
};

/// Header at the start of every huge mapping. The caller's pointer is one page past it.
#[repr(C)]
pub(crate) struct HugeHeader {
  /// Total mapped size, header page included.
  size: usize,
  magic: u64,
  flags: PageFlags,
  owner: Owner,
  next: Option<NonNull<HugeHeader>>,
  prev: Option<NonNull<HugeHeader>>,
}

const _: () = assert!(size_of::<HugeHeader>() <= PAGE_SIZE);

/// Byte offset of the magic within a header page.
#[cfg(test)]
pub(crate) const MAGIC_OFFSET: usize = core::mem::offset_of!(HugeHeader, magic);

/// Doubly linked list of live huge mappings.
pub(crate) struct HugeRegistry {
  head: Option<NonNull<HugeHeader>>,
  count: usize,
  bytes: usize,
}

impl HugeRegistry {
  pub(crate) const fn new() -> Self {
    Self {
      head: None,
      count: 0,
      bytes: 0,
    }
  }

  /// Maps `size` bytes plus a header page and registers the mapping.
  pub(crate) fn alloc(&mut self, size: usize, owner: Owner) -> Result<NonNull<u8>> {
    let total = size
      .checked_next_multiple_of(PAGE_SIZE)
      .and_then(|s| s.checked_add(PAGE_SIZE))
      .ok_or(BackendError::OutOfMemory { size })?;

    let raw = os::map(total)?;
    let header = raw.cast::<HugeHeader>();
    unsafe {
      header.write(HugeHeader {
        size: total,
        magic: HUGE_MAGIC,
        flags: PageFlags::HUGE | PageFlags::COMMITTED | PageFlags::HEAD,
        owner,
        next: self.head,
        prev: None,
      });
      if let Some(mut old) = self.head {
        old.as_mut().prev = Some(header);
      }
    }
    self.head = Some(header);
    self.count += 1;
    self.bytes += total;

    let ptr = unsafe { raw.add(PAGE_SIZE) };
    log::debug!("huge alloc: {total} bytes at {:p} for {owner}", ptr);
    Ok(ptr)
  }

  /// Finds the registered header whose data starts at `addr`.
  fn find(&self, addr: usize) -> Option<NonNull<HugeHeader>> {
    let header_addr = addr.checked_sub(PAGE_SIZE)?;
    let mut cur = self.head;
    while let Some(header) = cur {
      if header.as_ptr() as usize == header_addr {
        return Some(header);
      }
      cur = unsafe { header.as_ref().next };
    }
    None
  }

  /// Validates, unlinks and unmaps the huge allocation at `ptr`.
  ///
  /// A header with a bad magic is left mapped.
  pub(crate) fn free(&mut self, ptr: NonNull<u8>) -> Result<()> {
    let addr = ptr.as_ptr() as usize;
    let header = self.find(addr).ok_or(BackendError::NotHuge { addr })?;

    let (size, next, prev) = {
      let h = unsafe { header.as_ref() };
      if h.magic != HUGE_MAGIC || !h.flags.contains(PageFlags::HUGE) {
        log::error!(
          "huge free: header for {:p} is corrupted (magic {:#x}), leaving it mapped",
          ptr,
          h.magic
        );
        return Err(BackendError::HugeCorrupted {
          addr,
          found: h.magic,
        });
      }
      (h.size, h.next, h.prev)
    };

    unsafe {
      match prev {
        Some(mut p) => p.as_mut().next = next,
        None => self.head = next,
      }
      if let Some(mut n) = next {
        n.as_mut().prev = prev;
      }
    }
    self.count -= 1;
    self.bytes -= size;

    log::debug!("huge free: {size} bytes at {:p}", ptr);
    unsafe { os::unmap(header.cast(), size) }
  }

  /// Caller-visible size of the huge allocation at `ptr`.
  pub(crate) fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize> {
    let addr = ptr.as_ptr() as usize;
    let header = self.find(addr).ok_or(BackendError::NotHuge { addr })?;
    Ok(unsafe { header.as_ref().size } - PAGE_SIZE)
  }

  /// Owner tag recorded for the huge allocation at `ptr`.
  pub(crate) fn owner(&self, ptr: NonNull<u8>) -> Result<Owner> {
    let addr = ptr.as_ptr() as usize;
    let header = self.find(addr).ok_or(BackendError::NotHuge { addr })?;
    Ok(unsafe { header.as_ref().owner })
  }

  pub(crate) fn count(&self) -> usize {
    self.count
  }

  /// Total mapped bytes, headers included.
  pub(crate) fn bytes(&self) -> usize {
    self.bytes
  }

  /// Unmaps every registered mapping. Returns the first unmap failure, if any.
  pub(crate) fn release_all(&mut self) -> Result<()> {
    let mut result = Ok(());
    let mut cur = self.head.take();
    while let Some(header) = cur {
      let (size, next) = unsafe { (header.as_ref().size, header.as_ref().next) };
      if let Err(err) = unsafe { os::unmap(header.cast(), size) }
        && result.is_ok()
      {
        result = Err(err);
      }
      cur = next;
    }
    self.count = 0;
    self.bytes = 0;
    result
  }
}
