//! Per-order free lists threaded through the descriptor table.

use crate::{
  MAX_ORDER,
  descriptor::{DescriptorTable, PageFlags},
};

/// One intrusive doubly linked free list per order.
///
/// Links are page indices stored in the head descriptors, so block memory is never touched.
pub(crate) struct BinSet {
  heads: [Option<u32>; MAX_ORDER + 1],
  counts: [usize; MAX_ORDER + 1],
}

impl BinSet {
  pub(crate) const fn new() -> Self {
    Self {
      heads: [None; MAX_ORDER + 1],
      counts: [0; MAX_ORDER + 1],
    }
  }

  /// Pushes descriptor `idx` at the head of bin `order`, overwriting any stale links.
  pub(crate) fn push(&mut self, table: &mut DescriptorTable, order: usize, idx: usize) {
    debug_assert!(table[idx].flags.contains(PageFlags::FREE | PageFlags::HEAD));
    debug_assert_eq!(table[idx].order as usize, order);

    let old_head = self.heads[order];
    if let Some(old) = old_head {
      table[old as usize].prev = Some(idx as u32);
    }

    let desc = &mut table[idx];
    desc.prev = None;
    desc.next = old_head;

    self.heads[order] = Some(idx as u32);
    self.counts[order] += 1;
  }

  /// Unlinks descriptor `idx`, which must be a member of bin `order`.
  pub(crate) fn remove(&mut self, table: &mut DescriptorTable, order: usize, idx: usize) {
    let (prev, next) = {
      let desc = &mut table[idx];
      (desc.prev.take(), desc.next.take())
    };

    match prev {
      Some(p) => table[p as usize].next = next,
      None => {
        debug_assert_eq!(self.heads[order], Some(idx as u32));
        self.heads[order] = next;
      }
    }

    if let Some(n) = next {
      table[n as usize].prev = prev;
    }

    self.counts[order] -= 1;
  }

  /// Removes and returns the head of bin `order`.
  pub(crate) fn pop(&mut self, table: &mut DescriptorTable, order: usize) -> Option<usize> {
    let idx = self.heads[order]? as usize;
    self.remove(table, order, idx);
    Some(idx)
  }

  #[inline]
  pub(crate) fn is_empty(&self, order: usize) -> bool {
    self.heads[order].is_none()
  }

  #[inline]
  pub(crate) fn len(&self, order: usize) -> usize {
    self.counts[order]
  }

  /// Lowest non-empty order in `from..=MAX_ORDER`.
  pub(crate) fn first_non_empty(&self, from: usize) -> Option<usize> {
    (from..=MAX_ORDER).find(|&order| !self.is_empty(order))
  }

  /// Walks the members of bin `order`, head first.
  pub(crate) fn iter<'a>(
    &'a self,
    table: &'a DescriptorTable,
    order: usize,
  ) -> impl Iterator<Item = usize> + 'a {
    let mut cur = self.heads[order];
    core::iter::from_fn(move || {
      let idx = cur? as usize;
      cur = table[idx].next;
      Some(idx)
    })
  }
}
