//! The buddy page manager.
//!
//! One reserved region is laid out as `[descriptor table | page slots]`. Only the descriptor
//! table is committed up front; page slots are committed one top-level block
//! (`2^MAX_ORDER` pages) at a time as the bins run dry. Requests above [`MAX_BLOCK_SIZE`] go to
//! their own mapping through the huge registry.

use core::{fmt, ptr::NonNull};

use crate::{
  DEFAULT_REGION_SIZE, MAX_BLOCK_SIZE, MAX_ORDER, PAGE_SIZE, TOP_BLOCK_PAGES,
  bins::BinSet,
  descriptor::{DescriptorTable, Owner, PageDescriptor, PageFlags},
  error::{BackendError, Result},
  huge::HugeRegistry,
  order::{order_for, order_size},
  os,
};

/// Handle to one buddy heap. Every operation goes through it; dropping it releases the region.
pub struct Backend {
  region: NonNull<u8>,
  region_size: usize,
  table: DescriptorTable,
  bins: BinSet,
  huge: HugeRegistry,
  /// Next never-committed page index. Always a multiple of `TOP_BLOCK_PAGES`.
  cursor: usize,
  used_pages: usize,
  released: bool,
}

// The backend exclusively owns its mappings; nothing in it is tied to the creating thread.
unsafe impl Send for Backend {}

impl Backend {
  /// Reserves `region_size` bytes of address space and sets up an empty heap over it.
  pub fn init(region_size: usize) -> Result<Self> {
    let os_page_size = os::page_size();
    if PAGE_SIZE % os_page_size != 0 {
      return Err(BackendError::UnsupportedPageSize { os_page_size });
    }

    let total_pages = region_size / PAGE_SIZE;
    let metadata_size = total_pages * size_of::<PageDescriptor>();
    let metadata_pages = metadata_size.div_ceil(PAGE_SIZE);
    let managed_pages = total_pages.saturating_sub(metadata_pages);
    if managed_pages < TOP_BLOCK_PAGES {
      return Err(BackendError::RegionTooSmall { size: region_size });
    }
    if managed_pages > u32::MAX as usize {
      return Err(BackendError::RegionTooLarge { size: region_size });
    }

    let reserved = total_pages * PAGE_SIZE;
    let region = os::reserve(reserved)?;
    if let Err(err) = unsafe { os::commit(region, metadata_pages * PAGE_SIZE) } {
      let _ = unsafe { os::unmap(region, reserved) };
      return Err(err);
    }

    let table = unsafe {
      DescriptorTable::new(
        region.cast(),
        managed_pages,
        region.add(metadata_pages * PAGE_SIZE),
      )
    };

    log::debug!(
      "backend init: {reserved} bytes at {:p}, {metadata_pages} metadata pages, {managed_pages} managed pages",
      region
    );

    Ok(Self {
      region,
      region_size: reserved,
      table,
      bins: BinSet::new(),
      huge: HugeRegistry::new(),
      cursor: 0,
      used_pages: 0,
      released: false,
    })
  }

  /// [`Backend::init`] with [`DEFAULT_REGION_SIZE`].
  pub fn with_default_region() -> Result<Self> {
    Self::init(DEFAULT_REGION_SIZE)
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// Allocates at least `size` bytes tagged with `owner`.
  ///
  /// Buddy blocks are page aligned and span `2^order_for(size)` pages. Requests above
  /// [`MAX_BLOCK_SIZE`] get their own mapping.
  pub fn alloc(&mut self, size: usize, owner: Owner) -> Result<NonNull<u8>> {
    if size == 0 {
      return Err(BackendError::ZeroSize);
    }
    if size > MAX_BLOCK_SIZE {
      return self.huge.alloc(size, owner);
    }

    let target = order_for(size);
    debug_assert!(target <= MAX_ORDER);

    let order = match self.bins.first_non_empty(target) {
      Some(order) => order,
      None => {
        self.commit_top_level_block(size)?;
        MAX_ORDER
      }
    };

    let Some(idx) = self.bins.pop(&mut self.table, order) else {
      debug_assert!(false, "bin {order} reported non-empty but popped nothing");
      return Err(BackendError::OutOfMemory { size });
    };

    self.split(idx, order, target);
    self.mark_allocated(idx, target, owner);
    self.used_pages += 1 << target;

    let ptr = self.table.address_of(idx);
    log::trace!("alloc: {size} bytes -> {:p} (order {target}, {owner})", ptr);
    Ok(ptr)
  }

  /// Commits the next `2^MAX_ORDER` pages and files them as one free block in the top bin.
  fn commit_top_level_block(&mut self, size: usize) -> Result<()> {
    let idx = self.cursor;
    debug_assert_eq!(idx % TOP_BLOCK_PAGES, 0, "top-level block must be buddy aligned");

    if idx + TOP_BLOCK_PAGES > self.table.len() {
      log::debug!("backend exhausted: {} of {} pages committed", idx, self.table.len());
      return Err(BackendError::OutOfMemory { size });
    }

    unsafe { os::commit(self.table.address_of(idx), MAX_BLOCK_SIZE)? };

    let order = MAX_ORDER as u8;
    for desc in &mut self.table.as_mut_slice()[idx..idx + TOP_BLOCK_PAGES] {
      *desc = PageDescriptor {
        flags: PageFlags::COMMITTED,
        order,
        zone: idx as u32,
        ..PageDescriptor::EMPTY
      };
    }
    self.table[idx].flags = PageFlags::FREE | PageFlags::COMMITTED | PageFlags::HEAD;
    self.bins.push(&mut self.table, MAX_ORDER, idx);
    self.cursor += TOP_BLOCK_PAGES;

    log::debug!(
      "committed top-level block at page {idx} ({:p})",
      self.table.address_of(idx)
    );
    Ok(())
  }

  /// Halves the block at `idx` from `order` down to `target`, filing every upper half.
  fn split(&mut self, idx: usize, mut order: usize, target: usize) {
    while order > target {
      order -= 1;
      let buddy = idx + (1 << order);
      self.table[buddy] = free_head(buddy, order);
      self.bins.push(&mut self.table, order, buddy);
      self.table[idx].order = order as u8;
      log::trace!("split: page {idx} -> buddies {idx}/{buddy} at order {order}");
    }
  }

  /// Tags every page of the block at `idx` with its order, owner and head.
  fn mark_allocated(&mut self, idx: usize, order: usize, owner: Owner) {
    let pages = 1 << order;
    for (i, desc) in self.table.as_mut_slice()[idx..idx + pages].iter_mut().enumerate() {
      *desc = PageDescriptor {
        flags: if i == 0 {
          PageFlags::COMMITTED | PageFlags::HEAD
        } else {
          PageFlags::COMMITTED
        },
        order: order as u8,
        owner,
        zone: idx as u32,
        next: None,
        prev: None,
      };
    }
  }

  // ===========================================================================
  // Free
  // ===========================================================================

  /// Returns a block to the heap, coalescing it with free buddies.
  ///
  /// Pointers outside the managed range are handed to the huge registry. Double frees and
  /// pointers that do not start a live block are reported and leave the heap untouched.
  pub fn free(&mut self, ptr: NonNull<u8>) -> Result<()> {
    let addr = ptr.as_ptr() as usize;
    if self.is_huge(ptr) {
      return self.huge.free(ptr);
    }

    let idx = self.table.index_of(addr)?;
    if addr % PAGE_SIZE != 0 {
      log::warn!("free: {:p} is not page aligned", ptr);
      return Err(BackendError::NotBlockStart { addr });
    }

    let desc = self.table[idx];
    if desc.is_free() || (!desc.is_head() && self.inside_free_block(idx)) {
      log::warn!("free: double free of {:p}", ptr);
      return Err(BackendError::DoubleFree { addr });
    }
    if !desc.is_head() || !desc.is_committed() {
      log::warn!("free: {:p} does not start an allocated block", ptr);
      return Err(BackendError::NotBlockStart { addr });
    }

    let order = desc.order();
    for desc in &mut self.table.as_mut_slice()[idx..idx + (1 << order)] {
      desc.owner = Owner::None;
    }
    self.used_pages -= 1 << order;
    log::trace!("free: {:p} (order {order}, {})", ptr, desc.owner);

    self.coalesce(idx, order);
    Ok(())
  }

  /// Merges the free block at `idx` with its buddies while possible, then files the result.
  fn coalesce(&mut self, mut idx: usize, mut order: usize) {
    while order < MAX_ORDER {
      let buddy = idx ^ (1 << order);
      if buddy >= self.table.len() {
        break;
      }

      let b = &self.table[buddy];
      if !(b.is_free() && b.is_head() && b.order() == order) {
        break;
      }

      self.bins.remove(&mut self.table, order, buddy);
      let (low, high) = (idx.min(buddy), idx.max(buddy));
      self.table[high] = PageDescriptor {
        flags: PageFlags::COMMITTED,
        order: (order + 1) as u8,
        zone: low as u32,
        ..PageDescriptor::EMPTY
      };
      log::trace!("merge: pages {low}/{high} -> order {}", order + 1);

      idx = low;
      order += 1;
    }

    self.table[idx] = free_head(idx, order);
    self.bins.push(&mut self.table, order, idx);

    #[cfg(feature = "release-mem")]
    if order == MAX_ORDER {
      unsafe { os::release(self.table.address_of(idx), MAX_BLOCK_SIZE) };
    }
  }

  /// Whether non-head page `idx` lies inside a block that is sitting in a bin.
  ///
  /// Follows zone back-references, which always point at a lower or equal page index.
  fn inside_free_block(&self, idx: usize) -> bool {
    let mut zone = self.table[idx].zone_index();
    for _ in 0..=MAX_ORDER {
      let head = &self.table[zone];
      if head.is_head() {
        return head.is_free() && idx < zone + (1 << head.order());
      }
      if head.zone_index() == zone {
        break;
      }
      zone = head.zone_index();
    }
    false
  }

  // ===========================================================================
  // Lookup
  // ===========================================================================

  /// Descriptor of the page containing `ptr`.
  pub fn descriptor_for(&self, ptr: NonNull<u8>) -> Result<&PageDescriptor> {
    let idx = self.table.index_of(ptr.as_ptr() as usize)?;
    Ok(&self.table[idx])
  }

  /// Start address of the page described by `desc`, which must come from this backend.
  pub fn address_for(&self, desc: &PageDescriptor) -> Result<NonNull<u8>> {
    let idx = self.table.index_of_descriptor(desc)?;
    Ok(self.table.address_of(idx))
  }

  /// Start of the allocated block containing `ptr`.
  pub fn zone_of(&self, ptr: NonNull<u8>) -> Result<NonNull<u8>> {
    let addr = ptr.as_ptr() as usize;
    let idx = self.table.index_of(addr)?;
    let head_idx = self.table[idx].zone_index();
    let head = &self.table[head_idx];
    if !head.is_head() || !head.is_committed() || head.is_free() {
      return Err(BackendError::NotAllocated { addr });
    }
    if idx >= head_idx + (1 << head.order()) {
      return Err(BackendError::NotAllocated { addr });
    }
    Ok(self.table.address_of(head_idx))
  }

  /// Usable size of the allocation starting at `ptr`, buddy or huge.
  pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize> {
    if self.is_huge(ptr) {
      return self.huge.usable_size(ptr);
    }
    let addr = ptr.as_ptr() as usize;
    if self.zone_of(ptr)? != ptr {
      return Err(BackendError::NotBlockStart { addr });
    }
    Ok(order_size(self.descriptor_for(ptr)?.order()))
  }

  /// Owner tag of the allocation containing `ptr`, buddy or huge.
  pub fn owner_of(&self, ptr: NonNull<u8>) -> Result<Owner> {
    if self.is_huge(ptr) {
      return self.huge.owner(ptr);
    }
    let head = self.zone_of(ptr)?;
    Ok(self.descriptor_for(head)?.owner())
  }

  /// Whether `ptr` lies in the buddy-managed page range.
  pub fn contains(&self, ptr: NonNull<u8>) -> bool {
    self.table.contains(ptr.as_ptr() as usize)
  }

  /// Whether `ptr` would be routed to the huge path by [`Backend::free`].
  pub fn is_huge(&self, ptr: NonNull<u8>) -> bool {
    !self.contains(ptr)
  }

  /// Bytes of address space reserved for this heap, metadata included.
  pub fn region_size(&self) -> usize {
    self.region_size
  }

  pub fn stats(&self) -> BackendStats {
    let mut free_blocks = [0; MAX_ORDER + 1];
    let mut free_pages = 0;
    for (order, count) in free_blocks.iter_mut().enumerate() {
      *count = self.bins.len(order);
      free_pages += *count << order;
    }
    BackendStats {
      total_pages: self.table.len(),
      committed_pages: self.cursor,
      used_pages: self.used_pages,
      free_pages,
      free_blocks,
      huge_allocations: self.huge.count(),
      huge_bytes: self.huge.bytes(),
    }
  }

  // ===========================================================================
  // Teardown
  // ===========================================================================

  /// Unmaps every huge allocation and the reserved region.
  pub fn destroy(mut self) -> Result<()> {
    self.release()
  }

  fn release(&mut self) -> Result<()> {
    self.released = true;
    let huge = self.huge.release_all();
    let region = unsafe { os::unmap(self.region, self.region_size) };
    log::debug!("backend released: {} bytes at {:p}", self.region_size, self.region);
    huge.and(region)
  }
}

impl Drop for Backend {
  fn drop(&mut self) {
    if self.released {
      return;
    }
    if let Err(err) = self.release() {
      log::error!("backend drop: {err}");
    }
  }
}

impl fmt::Debug for Backend {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Backend")
      .field("region", &self.region)
      .field("region_size", &self.region_size)
      .field("start", &self.table.start())
      .field("cursor", &self.cursor)
      .field("used_pages", &self.used_pages)
      .finish_non_exhaustive()
  }
}

fn free_head(idx: usize, order: usize) -> PageDescriptor {
  PageDescriptor {
    flags: PageFlags::FREE | PageFlags::COMMITTED | PageFlags::HEAD,
    order: order as u8,
    zone: idx as u32,
    ..PageDescriptor::EMPTY
  }
}

// =============================================================================
// Stats
// =============================================================================

/// Point-in-time snapshot of a backend's page accounting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendStats {
  /// Page slots in the managed range.
  pub total_pages: usize,
  /// Pages backed by read/write memory.
  pub committed_pages: usize,
  /// Pages in allocated buddy blocks.
  pub used_pages: usize,
  /// Pages in blocks sitting in bins.
  pub free_pages: usize,
  /// Free block count per order.
  pub free_blocks: [usize; MAX_ORDER + 1],
  pub huge_allocations: usize,
  /// Mapped bytes of huge allocations, header pages included.
  pub huge_bytes: usize,
}

impl fmt::Display for BackendStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(
      f,
      "pages: {} total, {} committed, {} used, {} free",
      self.total_pages, self.committed_pages, self.used_pages, self.free_pages
    )?;
    writeln!(f, "| order | block size | free blocks |")?;
    for (order, count) in self.free_blocks.iter().enumerate() {
      writeln!(f, "| {order:>5} | {:>10} | {count:>11} |", order_size(order))?;
    }
    write!(
      f,
      "huge: {} allocations, {} bytes",
      self.huge_allocations, self.huge_bytes
    )
  }
}

// =============================================================================
// Consistency checks
// =============================================================================

#[cfg(test)]
impl Backend {
  /// Asserts the bin and accounting invariants over the whole heap.
  pub(crate) fn assert_consistent(&self) {
    let mut seen = vec![false; self.table.len()];
    let mut free_pages = 0;
    for order in 0..=MAX_ORDER {
      let mut count = 0;
      for idx in self.bins.iter(&self.table, order) {
        let desc = &self.table[idx];
        assert!(desc.is_free() && desc.is_head(), "page {idx} in bin {order} is {desc:?}");
        assert_eq!(desc.order(), order, "page {idx} filed in the wrong bin");
        assert_eq!(idx % (1 << order), 0, "page {idx} misaligned for order {order}");
        assert!(!seen[idx], "page {idx} filed twice");
        seen[idx] = true;
        count += 1;
        free_pages += 1 << order;
      }
      assert_eq!(count, self.bins.len(order), "bin {order} count drifted");
    }
    assert_eq!(
      free_pages + self.used_pages,
      self.cursor,
      "free + used pages must equal committed pages"
    );
  }

  pub(crate) fn free_blocks(&self, order: usize) -> usize {
    self.bins.len(order)
  }
}
