use thiserror::Error;

use crate::PAGE_SIZE;

/// Errors reported by the backend page manager.
///
/// Every failure is returned to the caller; nothing in the backend aborts or retries.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BackendError {
  #[error("region of {size} bytes cannot hold its metadata and one top-level block")]
  RegionTooSmall { size: usize },

  #[error("region of {size} bytes has more pages than a descriptor can index")]
  RegionTooLarge { size: usize },

  #[error("os page size {os_page_size} does not divide the allocator page size {PAGE_SIZE}")]
  UnsupportedPageSize { os_page_size: usize },

  #[error("failed to reserve {size} bytes of address space (os error {errno})")]
  ReserveFailed { size: usize, errno: i32 },

  #[error("failed to commit {size} bytes at {addr:#x} (os error {errno})")]
  CommitFailed { addr: usize, size: usize, errno: i32 },

  #[error("failed to map {size} bytes (os error {errno})")]
  MapFailed { size: usize, errno: i32 },

  #[error("failed to unmap {size} bytes at {addr:#x} (os error {errno})")]
  UnmapFailed { addr: usize, size: usize, errno: i32 },

  #[error("zero-size allocation")]
  ZeroSize,

  #[error("out of memory (requested: {size} bytes)")]
  OutOfMemory { size: usize },

  #[error("address {addr:#x} is outside the managed region")]
  OutOfBounds { addr: usize },

  #[error("address {addr:#x} is not the start of an allocated block")]
  NotBlockStart { addr: usize },

  #[error("address {addr:#x} is not inside an allocated block")]
  NotAllocated { addr: usize },

  #[error("double free detected at address {addr:#x}")]
  DoubleFree { addr: usize },

  #[error("address {addr:#x} is not a live huge allocation")]
  NotHuge { addr: usize },

  #[error("huge allocation header for {addr:#x} is corrupted (magic {found:#x})")]
  HugeCorrupted { addr: usize, found: u64 },

  #[error("descriptor does not belong to this backend")]
  ForeignDescriptor,
}

/// Errors reported by [`Pool`](crate::Pool).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
  #[error("block size {size} is outside 1..={max}")]
  InvalidBlockSize { size: usize, max: usize },

  #[error("address {addr:#x} does not belong to this pool")]
  ForeignBlock { addr: usize },

  #[error("double free of pool block at address {addr:#x}")]
  DoubleFree { addr: usize },

  #[error(transparent)]
  Backend(#[from] BackendError),
}

pub type Result<T, E = BackendError> = core::result::Result<T, E>;

/// Last OS error number, for error reporting.
pub(crate) fn errno() -> i32 {
  std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
