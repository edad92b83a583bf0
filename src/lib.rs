//! A page-granular binary buddy backend with pool and arena front-ends.
//!
//! [`Backend`] reserves one virtual region, commits it lazily in `2^MAX_ORDER`-page blocks and
//! hands out power-of-two page blocks tagged with an [`Owner`]. Metadata lives in a side table of
//! [`PageDescriptor`]s, so allocated memory is never touched by the allocator. Requests above
//! [`MAX_BLOCK_SIZE`] are served by independent mappings.
//!
//! [`Pool`] carves backend zones into fixed-size blocks, and [`Pools`] dispatches small requests
//! over power-of-two pools. [`Arena`] and [`Stack`] are bump allocators over a caller-supplied
//! buffer.

mod arena;
mod backend;
mod bins;
mod descriptor;
mod error;
mod huge;
pub mod order;
mod os;
mod pool;


pub use crate::{
  arena::{Arena, Stack},
  backend::{Backend, BackendStats},
  descriptor::{Owner, PageDescriptor, PageFlags},
  error::{BackendError, PoolError, Result},
  pool::{GENERIC_POOLS, Pool, Pools},
};

// =============================================================================
// Constants
// =============================================================================

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT; // 4KB

/// Largest buddy order. A top-level block spans `2^MAX_ORDER` pages.
pub const MAX_ORDER: usize = 8;

/// Pages in one top-level block, the unit in which the region is committed.
pub const TOP_BLOCK_PAGES: usize = 1 << MAX_ORDER;

/// Largest request served by the buddy heap. Anything bigger is a huge allocation.
pub const MAX_BLOCK_SIZE: usize = PAGE_SIZE << MAX_ORDER; // 1MB

/// Tag written into every huge allocation header.
pub const HUGE_MAGIC: u64 = 0xF2_2CAA_33CE;

pub const DEFAULT_REGION_SIZE: usize = 64 << 20; // 64MB

/// Default alignment of arena, stack and pool blocks.
pub const DEFAULT_ALIGNMENT: usize = 2 * size_of::<usize>();

/// Largest block a [`Pool`] hands out.
pub const MAX_POOL_BLOCK_SIZE: usize = 512;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_ORDER <= u8::MAX as usize);
const _: () = assert!(MAX_BLOCK_SIZE == PAGE_SIZE * TOP_BLOCK_PAGES);
const _: () = assert!(DEFAULT_REGION_SIZE % MAX_BLOCK_SIZE == 0);
const _: () = assert!(DEFAULT_ALIGNMENT.is_power_of_two());
const _: () = assert!(MAX_POOL_BLOCK_SIZE < MAX_BLOCK_SIZE / 8);
