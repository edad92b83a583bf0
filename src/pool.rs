//! Fixed-size block pools carved out of backend zones.

use core::{
  ptr::NonNull,
  sync::atomic::{AtomicU32, Ordering},
};

use crate::{
  Backend, DEFAULT_ALIGNMENT, MAX_ORDER, MAX_POOL_BLOCK_SIZE,
  descriptor::Owner,
  error::{BackendError, PoolError},
  order::{align_up, order_for, order_size},
};

/// Smallest zone a pool requests from the backend.
const MIN_ZONE_SIZE: usize = 16 << 10; // 16KB
/// Blocks a zone should hold when the minimum size is not enough.
const TARGET_BLOCKS_PER_ZONE: usize = 128;

const ZONE_HEADER_SIZE: usize = align_up(size_of::<ZoneHeader>(), DEFAULT_ALIGNMENT);

#[repr(C)]
struct FreeBlock {
  next: Option<NonNull<FreeBlock>>,
}

/// Bookkeeping at offset 0 of each zone. Blocks start at `ZONE_HEADER_SIZE`.
#[repr(C)]
struct ZoneHeader {
  next: Option<NonNull<ZoneHeader>>,
  prev: Option<NonNull<ZoneHeader>>,
  free_list: Option<NonNull<FreeBlock>>,
  data_start: NonNull<u8>,
  block_size: usize,
  capacity: usize,
  used: usize,
  pool_id: u32,
}

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// A pool of equally sized blocks.
///
/// Zones are requested from the [`Backend`] with [`Owner::Pool`] and returned to it once empty,
/// except for the last zone, which is kept for reuse. A pool does not free its zones on drop;
/// call [`Pool::destroy`] with the backend it allocated from.
#[derive(Debug)]
pub struct Pool {
  id: u32,
  block_size: usize,
  zone_order: usize,
  head: Option<NonNull<ZoneHeader>>,
  active: Option<NonNull<ZoneHeader>>,
  zones: usize,
  capacity: usize,
  used: usize,
}

impl Pool {
  /// Creates an empty pool. Memory is requested on the first [`Pool::alloc`].
  pub fn new(block_size: usize) -> Result<Self, PoolError> {
    if block_size == 0 || block_size > MAX_POOL_BLOCK_SIZE {
      return Err(PoolError::InvalidBlockSize {
        size: block_size,
        max: MAX_POOL_BLOCK_SIZE,
      });
    }
    Ok(Self::with_block_size(block_size))
  }

  /// `block_size` must be in `1..=MAX_POOL_BLOCK_SIZE`.
  fn with_block_size(block_size: usize) -> Self {
    let align = if block_size < DEFAULT_ALIGNMENT {
      size_of::<usize>()
    } else {
      DEFAULT_ALIGNMENT
    };
    let block_size = align_up(block_size.max(size_of::<FreeBlock>()), align);

    Self {
      id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
      block_size,
      zone_order: zone_order_for(block_size),
      head: None,
      active: None,
      zones: 0,
      capacity: 0,
      used: 0,
    }
  }

  /// Size of every block, after alignment.
  pub fn block_size(&self) -> usize {
    self.block_size
  }

  /// Total blocks across all zones.
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Blocks currently handed out.
  pub fn used(&self) -> usize {
    self.used
  }

  pub fn zones(&self) -> usize {
    self.zones
  }

  pub fn alloc(&mut self, backend: &mut Backend) -> Result<NonNull<u8>, PoolError> {
    let zone = match self.zone_with_room() {
      Some(zone) => zone,
      None => self.grow(backend)?,
    };
    self.active = Some(zone);

    let header = unsafe { &mut *zone.as_ptr() };
    let Some(block) = header.free_list else {
      debug_assert!(false, "zone with room has an empty free list");
      return Err(PoolError::Backend(BackendError::OutOfMemory {
        size: self.block_size,
      }));
    };
    header.free_list = unsafe { block.as_ref().next };
    header.used += 1;
    self.used += 1;

    Ok(block.cast())
  }

  /// Returns a block to its zone, releasing the zone if it becomes empty.
  ///
  /// Blocks that are already free are reported as [`PoolError::DoubleFree`] and leave the pool
  /// untouched.
  pub fn free(&mut self, backend: &mut Backend, ptr: NonNull<u8>) -> Result<(), PoolError> {
    let addr = ptr.as_ptr() as usize;
    let zone = zone_header(backend, ptr)?;
    let header = unsafe { &mut *zone.as_ptr() };
    let data = header.data_start.as_ptr() as usize;
    if header.pool_id != self.id
      || addr < data
      || (addr - data) % header.block_size != 0
      || (addr - data) / header.block_size >= header.capacity
    {
      log::warn!("pool free: {:p} does not belong to pool {}", ptr, self.id);
      return Err(PoolError::ForeignBlock { addr });
    }

    let block = ptr.cast::<FreeBlock>();
    if header.used == 0 || header.holds_free(block) {
      log::warn!("pool free: double free of {:p} in pool {}", ptr, self.id);
      return Err(PoolError::DoubleFree { addr });
    }

    unsafe { block.write(FreeBlock { next: header.free_list }) };
    header.free_list = Some(block);
    header.used -= 1;
    self.used -= 1;

    if header.used == 0 && self.zones > 1 {
      self.release_zone(backend, zone)?;
    }
    Ok(())
  }

  /// Returns every zone to the backend.
  pub fn destroy(mut self, backend: &mut Backend) -> Result<(), PoolError> {
    let mut result = Ok(());
    let mut cur = self.head.take();
    while let Some(zone) = cur {
      cur = unsafe { zone.as_ref().next };
      if let Err(err) = backend.free(zone.cast())
        && result.is_ok()
      {
        result = Err(err.into());
      }
    }
    self.active = None;
    result
  }

  /// Active zone if it has a free block, else the first zone that does.
  fn zone_with_room(&self) -> Option<NonNull<ZoneHeader>> {
    let has_room = |zone: NonNull<ZoneHeader>| unsafe { zone.as_ref().free_list.is_some() };
    if let Some(active) = self.active
      && has_room(active)
    {
      return Some(active);
    }

    let mut cur = self.head;
    while let Some(zone) = cur {
      if has_room(zone) {
        return Some(zone);
      }
      cur = unsafe { zone.as_ref().next };
    }
    None
  }

  /// Requests a zone from the backend, slices it into blocks and links it at the list head.
  fn grow(&mut self, backend: &mut Backend) -> Result<NonNull<ZoneHeader>, PoolError> {
    let zone_size = order_size(self.zone_order);
    let start = backend.alloc(zone_size, Owner::Pool)?;

    let capacity = (zone_size - ZONE_HEADER_SIZE) / self.block_size;
    let data_start = unsafe { start.add(ZONE_HEADER_SIZE) };

    let mut free_list = None;
    for i in (0..capacity).rev() {
      let block = unsafe { data_start.add(i * self.block_size) }.cast::<FreeBlock>();
      unsafe { block.write(FreeBlock { next: free_list }) };
      free_list = Some(block);
    }

    let zone = start.cast::<ZoneHeader>();
    unsafe {
      zone.write(ZoneHeader {
        next: self.head,
        prev: None,
        free_list,
        data_start,
        block_size: self.block_size,
        capacity,
        used: 0,
        pool_id: self.id,
      });
      if let Some(mut old) = self.head {
        old.as_mut().prev = Some(zone);
      }
    }
    self.head = Some(zone);
    self.zones += 1;
    self.capacity += capacity;

    log::debug!(
      "pool {}: new zone {:p} ({zone_size} bytes, {capacity} blocks of {})",
      self.id,
      start,
      self.block_size
    );
    Ok(zone)
  }

  fn release_zone(
    &mut self,
    backend: &mut Backend,
    zone: NonNull<ZoneHeader>,
  ) -> Result<(), PoolError> {
    let (next, prev, capacity) = {
      let header = unsafe { zone.as_ref() };
      (header.next, header.prev, header.capacity)
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
    if self.active == Some(zone) {
      self.active = next.or(prev);
    }
    self.zones -= 1;
    self.capacity -= capacity;

    log::debug!("pool {}: releasing empty zone {:p}", self.id, zone);
    backend.free(zone.cast())?;
    Ok(())
  }
}

impl ZoneHeader {
  /// Whether `block` is already threaded on this zone's free list.
  fn holds_free(&self, block: NonNull<FreeBlock>) -> bool {
    let mut cur = self.free_list;
    while let Some(free) = cur {
      if free == block {
        return true;
      }
      cur = unsafe { free.as_ref().next };
    }
    false
  }
}

/// Header of the pool zone containing `ptr`.
fn zone_header(backend: &Backend, ptr: NonNull<u8>) -> Result<NonNull<ZoneHeader>, PoolError> {
  let zone_start = backend.zone_of(ptr)?;
  if backend.owner_of(zone_start)? != Owner::Pool {
    log::warn!("pool free: {:p} is not in a pool zone", ptr);
    return Err(PoolError::ForeignBlock {
      addr: ptr.as_ptr() as usize,
    });
  }
  Ok(zone_start.cast())
}

// =============================================================================
// Size classes
// =============================================================================

/// Number of generic pools: one per power of two from 8 to `MAX_POOL_BLOCK_SIZE` bytes.
pub const GENERIC_POOLS: usize = 7;

const MIN_CLASS_SHIFT: u32 = 3;

const _: () = assert!(MAX_POOL_BLOCK_SIZE == 1 << (MIN_CLASS_SHIFT as usize + GENERIC_POOLS - 1));

/// Generic pool serving a `size`-byte request. `size` must be in `1..=MAX_POOL_BLOCK_SIZE`.
#[inline]
fn class_index(size: usize) -> usize {
  (size.next_power_of_two().trailing_zeros().max(MIN_CLASS_SHIFT) - MIN_CLASS_SHIFT) as usize
}

/// Power-of-two pools of 8 to 512 bytes with size-based dispatch.
///
/// [`Pools::free`] finds the owning pool through the zone header, so callers only keep the
/// pointer.
#[derive(Debug)]
pub struct Pools {
  pools: [Pool; GENERIC_POOLS],
}

impl Pools {
  pub fn new() -> Self {
    Self {
      pools: core::array::from_fn(|i| Pool::with_block_size(1 << (MIN_CLASS_SHIFT as usize + i))),
    }
  }

  /// Allocates a block from the smallest pool whose blocks hold `size` bytes.
  pub fn alloc(&mut self, backend: &mut Backend, size: usize) -> Result<NonNull<u8>, PoolError> {
    if size == 0 || size > MAX_POOL_BLOCK_SIZE {
      return Err(PoolError::InvalidBlockSize {
        size,
        max: MAX_POOL_BLOCK_SIZE,
      });
    }
    self.pools[class_index(size)].alloc(backend)
  }

  pub fn free(&mut self, backend: &mut Backend, ptr: NonNull<u8>) -> Result<(), PoolError> {
    let zone = zone_header(backend, ptr)?;
    let pool_id = unsafe { zone.as_ref().pool_id };
    match self.pools.iter_mut().find(|pool| pool.id == pool_id) {
      Some(pool) => pool.free(backend, ptr),
      None => {
        log::warn!("pools free: {:p} belongs to pool {pool_id}, not a generic pool", ptr);
        Err(PoolError::ForeignBlock {
          addr: ptr.as_ptr() as usize,
        })
      }
    }
  }

  /// Generic pool that serves `size`-byte requests.
  pub fn pool_for(&self, size: usize) -> Option<&Pool> {
    (1..=MAX_POOL_BLOCK_SIZE)
      .contains(&size)
      .then(|| &self.pools[class_index(size)])
  }

  /// Returns every zone of every pool to the backend. The first error is reported.
  pub fn destroy(self, backend: &mut Backend) -> Result<(), PoolError> {
    let mut result = Ok(());
    for pool in self.pools {
      if let Err(err) = pool.destroy(backend)
        && result.is_ok()
      {
        result = Err(err);
      }
    }
    result
  }
}

impl Default for Pools {
  fn default() -> Self {
    Self::new()
  }
}

/// Zone order holding about `TARGET_BLOCKS_PER_ZONE` blocks, at least `MIN_ZONE_SIZE` bytes.
fn zone_order_for(block_size: usize) -> usize {
  let ideal = ZONE_HEADER_SIZE + block_size * TARGET_BLOCKS_PER_ZONE;
  order_for(ideal.max(MIN_ZONE_SIZE)).min(MAX_ORDER)
}

#[cfg(test)]
mod tests {
  use std::collections::HashSet;

  use super::*;
  use crate::{BackendError, PAGE_SIZE};

  fn backend() -> Backend {
    Backend::init(16 << 20).unwrap()
  }

  #[test]
  fn block_sizes_are_aligned() {
    assert_eq!(Pool::new(1).unwrap().block_size(), size_of::<usize>());
    assert_eq!(Pool::new(24).unwrap().block_size(), 32);
    assert_eq!(Pool::new(512).unwrap().block_size(), 512);
    assert_eq!(
      Pool::new(0).unwrap_err(),
      PoolError::InvalidBlockSize {
        size: 0,
        max: MAX_POOL_BLOCK_SIZE
      }
    );
    assert!(Pool::new(MAX_POOL_BLOCK_SIZE + 1).is_err());
  }

  #[test]
  fn zone_order_has_a_floor() {
    assert_eq!(order_size(zone_order_for(8)), MIN_ZONE_SIZE);
    assert!(order_size(zone_order_for(512)) >= 512 * TARGET_BLOCKS_PER_ZONE);
  }

  #[test]
  fn blocks_are_distinct_and_in_one_zone() {
    let mut backend = backend();
    let mut pool = Pool::new(48).unwrap();
    let mut seen = HashSet::new();

    for _ in 0..100 {
      let p = pool.alloc(&mut backend).unwrap();
      assert_eq!(p.as_ptr() as usize % DEFAULT_ALIGNMENT, 0);
      assert!(seen.insert(p.as_ptr() as usize));
      assert_eq!(backend.owner_of(p), Ok(Owner::Pool));
    }
    assert_eq!(pool.zones(), 1);
    assert_eq!(pool.used(), 100);
    pool.destroy(&mut backend).unwrap();
    backend.assert_consistent();
  }

  #[test]
  fn empty_zones_return_to_the_backend() {
    let mut backend = backend();
    let mut pool = Pool::new(256).unwrap();
    let mut ptrs = Vec::new();

    while pool.zones() < 3 {
      ptrs.push(pool.alloc(&mut backend).unwrap());
    }
    let used_with_three = backend.stats().used_pages;

    for p in ptrs.drain(..) {
      pool.free(&mut backend, p).unwrap();
    }
    assert_eq!(pool.used(), 0);
    assert_eq!(pool.zones(), 1);
    assert!(backend.stats().used_pages < used_with_three);

    // The kept zone serves the next request without touching the backend.
    let before = backend.stats().used_pages;
    let p = pool.alloc(&mut backend).unwrap();
    assert_eq!(backend.stats().used_pages, before);
    pool.free(&mut backend, p).unwrap();

    pool.destroy(&mut backend).unwrap();
    assert_eq!(backend.stats().used_pages, 0);
    backend.assert_consistent();
  }

  #[test]
  fn freed_blocks_are_reused() {
    let mut backend = backend();
    let mut pool = Pool::new(64).unwrap();
    let a = pool.alloc(&mut backend).unwrap();
    let _b = pool.alloc(&mut backend).unwrap();
    pool.free(&mut backend, a).unwrap();
    assert_eq!(pool.alloc(&mut backend).unwrap(), a);
    pool.destroy(&mut backend).unwrap();
  }

  #[test]
  fn foreign_pointers_are_rejected() {
    let mut backend = backend();
    let mut pool = Pool::new(32).unwrap();
    let mut other = Pool::new(32).unwrap();
    let a = pool.alloc(&mut backend).unwrap();
    let b = other.alloc(&mut backend).unwrap();

    let addr = b.as_ptr() as usize;
    assert_eq!(pool.free(&mut backend, b), Err(PoolError::ForeignBlock { addr }));

    let misaligned = unsafe { a.add(4) };
    let addr = misaligned.as_ptr() as usize;
    assert_eq!(pool.free(&mut backend, misaligned), Err(PoolError::ForeignBlock { addr }));

    let page = backend.alloc(PAGE_SIZE, Owner::Heap).unwrap();
    let addr = page.as_ptr() as usize;
    assert_eq!(pool.free(&mut backend, page), Err(PoolError::ForeignBlock { addr }));

    let mut local = 0u64;
    let stack = NonNull::from(&mut local).cast::<u8>();
    let addr = stack.as_ptr() as usize;
    assert_eq!(
      pool.free(&mut backend, stack),
      Err(PoolError::Backend(BackendError::OutOfBounds { addr }))
    );

    pool.destroy(&mut backend).unwrap();
    other.destroy(&mut backend).unwrap();
  }

  #[test]
  fn double_free_with_live_neighbours_is_rejected() {
    let mut backend = backend();
    let mut pool = Pool::new(32).unwrap();
    let a = pool.alloc(&mut backend).unwrap();
    let _b = pool.alloc(&mut backend).unwrap();

    pool.free(&mut backend, a).unwrap();
    let addr = a.as_ptr() as usize;
    assert_eq!(pool.free(&mut backend, a), Err(PoolError::DoubleFree { addr }));
    assert_eq!(pool.used(), 1);

    // The block went on the free list once, so it is handed out once.
    let x = pool.alloc(&mut backend).unwrap();
    let y = pool.alloc(&mut backend).unwrap();
    assert_ne!(x, y);
    pool.destroy(&mut backend).unwrap();
  }

  #[test]
  fn double_free_in_empty_zone_is_rejected() {
    let mut backend = backend();
    let mut pool = Pool::new(64).unwrap();
    let a = pool.alloc(&mut backend).unwrap();
    pool.free(&mut backend, a).unwrap();
    assert_eq!(pool.used(), 0);

    let addr = a.as_ptr() as usize;
    assert_eq!(pool.free(&mut backend, a), Err(PoolError::DoubleFree { addr }));
    assert_eq!(pool.used(), 0);
    assert_eq!(pool.zones(), 1);
    pool.destroy(&mut backend).unwrap();
    backend.assert_consistent();
  }

  #[test]
  fn size_classes_cover_eight_to_max() {
    assert_eq!(class_index(1), 0);
    assert_eq!(class_index(8), 0);
    assert_eq!(class_index(9), 1);
    assert_eq!(class_index(16), 1);
    assert_eq!(class_index(100), 4);
    assert_eq!(class_index(257), 6);
    assert_eq!(class_index(MAX_POOL_BLOCK_SIZE), GENERIC_POOLS - 1);
  }

  #[test]
  fn pools_dispatch_by_size_and_free_by_zone() {
    let mut backend = backend();
    let mut pools = Pools::new();

    let small = pools.alloc(&mut backend, 5).unwrap();
    let mid = pools.alloc(&mut backend, 100).unwrap();
    let large = pools.alloc(&mut backend, MAX_POOL_BLOCK_SIZE).unwrap();
    assert_eq!(pools.pool_for(5).unwrap().block_size(), 8);
    assert_eq!(pools.pool_for(100).unwrap().block_size(), 128);
    assert_eq!(pools.pool_for(100).unwrap().used(), 1);
    assert!(pools.pool_for(0).is_none());
    assert_ne!(backend.zone_of(small), backend.zone_of(mid));
    assert_eq!(mid.as_ptr() as usize % DEFAULT_ALIGNMENT, 0);

    assert_eq!(
      pools.alloc(&mut backend, MAX_POOL_BLOCK_SIZE + 1),
      Err(PoolError::InvalidBlockSize {
        size: MAX_POOL_BLOCK_SIZE + 1,
        max: MAX_POOL_BLOCK_SIZE
      })
    );
    assert!(pools.alloc(&mut backend, 0).is_err());

    pools.free(&mut backend, mid).unwrap();
    assert_eq!(pools.pool_for(100).unwrap().used(), 0);
    let addr = mid.as_ptr() as usize;
    assert_eq!(pools.free(&mut backend, mid), Err(PoolError::DoubleFree { addr }));

    let mut custom = Pool::new(100).unwrap();
    let foreign = custom.alloc(&mut backend).unwrap();
    let addr = foreign.as_ptr() as usize;
    assert_eq!(pools.free(&mut backend, foreign), Err(PoolError::ForeignBlock { addr }));
    custom.destroy(&mut backend).unwrap();

    pools.free(&mut backend, small).unwrap();
    pools.free(&mut backend, large).unwrap();
    pools.destroy(&mut backend).unwrap();
    assert_eq!(backend.stats().used_pages, 0);
    backend.assert_consistent();
  }
}
