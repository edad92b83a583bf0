//! Virtual memory primitives.

use core::ptr::{NonNull, null_mut};

use crate::error::{BackendError, Result, errno};

/// Reserves `size` bytes of address space with no access rights.
pub(crate) fn reserve(size: usize) -> Result<NonNull<u8>> {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_NONE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    return Err(BackendError::ReserveFailed {
      size,
      errno: errno(),
    });
  }
  NonNull::new(ptr.cast()).ok_or(BackendError::ReserveFailed { size, errno: 0 })
}

/// Grants read/write access to `size` bytes at `ptr`, which must lie inside a reservation.
pub(crate) unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<()> {
  let rc = unsafe { libc::mprotect(ptr.as_ptr().cast(), size, libc::PROT_READ | libc::PROT_WRITE) };
  if rc != 0 {
    return Err(BackendError::CommitFailed {
      addr: ptr.as_ptr() as usize,
      size,
      errno: errno(),
    });
  }
  Ok(())
}

/// Maps `size` fresh read/write bytes.
pub(crate) fn map(size: usize) -> Result<NonNull<u8>> {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    return Err(BackendError::MapFailed {
      size,
      errno: errno(),
    });
  }
  NonNull::new(ptr.cast()).ok_or(BackendError::MapFailed { size, errno: 0 })
}

/// Releases a mapping obtained from [`reserve`] or [`map`].
pub(crate) unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<()> {
  let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
  if rc != 0 {
    return Err(BackendError::UnmapFailed {
      addr: ptr.as_ptr() as usize,
      size,
      errno: errno(),
    });
  }
  Ok(())
}

/// Hands the physical pages behind `size` bytes at `ptr` back to the OS.
///
/// The range stays mapped and reads back as zeroes.
#[cfg(feature = "release-mem")]
pub(crate) unsafe fn release(ptr: NonNull<u8>, size: usize) {
  let rc = unsafe { libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_DONTNEED) };
  if rc != 0 {
    log::debug!("madvise({:p}, {size}) failed: os error {}", ptr, errno());
  }
}

/// Page size reported by the OS.
pub(crate) fn page_size() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size <= 0 { crate::PAGE_SIZE } else { size as usize }
}
