//! Size, page-count and buddy-order arithmetic.

use crate::PAGE_SIZE;

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Number of pages needed for `size` bytes, rounded up to a power of two. Always >= 1.
#[inline]
pub const fn pages_for(size: usize) -> usize {
  size.div_ceil(PAGE_SIZE).next_power_of_two()
}

/// Buddy order of a `size`-byte request: `log2(pages_for(size))`.
///
/// A size of 0 maps to order 0. Callers reject zero-size requests before getting here.
#[inline]
pub const fn order_for(size: usize) -> usize {
  pages_for(size).trailing_zeros() as usize
}

/// Byte size of a block of the given order.
#[inline(always)]
pub const fn order_size(order: usize) -> usize {
  PAGE_SIZE << order
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pages_round_up_to_power_of_two() {
    assert_eq!(pages_for(0), 1);
    assert_eq!(pages_for(1), 1);
    assert_eq!(pages_for(PAGE_SIZE), 1);
    assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    assert_eq!(pages_for(3 * PAGE_SIZE), 4);
    assert_eq!(pages_for(5 * PAGE_SIZE - 7), 8);
  }

  #[test]
  fn order_is_smallest_fitting_exponent() {
    for size in (1..(64 * PAGE_SIZE)).step_by(509) {
      let k = order_for(size);
      assert!(order_size(k) >= size, "size {size} order {k}");
      if k > 0 {
        assert!(order_size(k - 1) < size, "size {size} order {k} not minimal");
      }
    }
    assert_eq!(order_for(0), 0);
    assert_eq!(order_for(4000), 0);
    assert_eq!(order_for(1 << 20), 8);
  }

  #[test]
  fn largest_order_fits_a_descriptor() {
    let order = order_for(crate::MAX_BLOCK_SIZE);
    assert_eq!(order, crate::MAX_ORDER);
    assert_eq!(order as u8 as usize, order);
    assert_eq!(order_size(order), crate::MAX_BLOCK_SIZE);
  }

  #[test]
  fn align_up_rounds_to_multiple() {
    assert_eq!(align_up(0, 16), 0);
    assert_eq!(align_up(1, 16), 16);
    assert_eq!(align_up(16, 16), 16);
    assert_eq!(align_up(4097, PAGE_SIZE), 2 * PAGE_SIZE);
  }
}
