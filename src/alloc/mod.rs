//! Trampoline allocator.
//!
//! Bump-allocates fixed [`TRAMPOLINE_MAX_SIZE`]-byte slots out of RWX
//! pages placed near the host process's own code, so AArch64's 26-bit
//! and x86-64's 32-bit PC-relative references from relocated
//! instructions stay in range where possible. Pages are never unmapped
//! and slots are never freed on unhook — a bounded leak accepted in
//! exchange for not having to track which trampolines are still
//! reachable from in-flight call stacks.
//!
//! The pool-of-pages shape mirrors the existing `ThreadAllocator`/
//! `ProximityAllocator` split, but the pool itself is a plain bump
//! allocator rather than a `slice_pool`-backed free list, and gap search
//! is anchored to the host executable per the original plugin's own
//! `getAddressForTrampo`/`seekNewPageAddr` (see `search`).

use crate::arch::TRAMPOLINE_MAX_SIZE;
use crate::error::{Error, Result};
use crate::util;
use lazy_static::lazy_static;
use std::sync::Mutex;

mod search;

lazy_static! {
  /// Process-global trampoline page pool shared by every installed hook.
  static ref ALLOCATOR: Mutex<TrampolineAllocator> = Mutex::new(TrampolineAllocator::new());
}

/// Returns the address of a fresh [`TRAMPOLINE_MAX_SIZE`]-byte RWX slot,
/// distinct from any slot previously returned. Maps a new page on demand.
pub fn allocate_slot() -> Result<usize> {
  ALLOCATOR.lock().unwrap().allocate_slot()
}

/// One backing RWX page, bump-allocated — never freed, never shrunk.
struct TrampolinePage {
  base: usize,
  capacity: usize,
  used: usize,
}

impl TrampolinePage {
  fn has_room(&self) -> bool {
    self.used + TRAMPOLINE_MAX_SIZE <= self.capacity
  }

  fn take_slot(&mut self) -> usize {
    let slot = self.base + self.used;
    self.used += TRAMPOLINE_MAX_SIZE;
    slot
  }
}

/// Owns every trampoline page mapped so far in this process.
struct TrampolineAllocator {
  pages: Vec<TrampolinePage>,
}

impl TrampolineAllocator {
  fn new() -> Self {
    TrampolineAllocator { pages: Vec::new() }
  }

  fn allocate_slot(&mut self) -> Result<usize> {
    if let Some(page) = self.pages.iter_mut().find(|page| page.has_room()) {
      return Ok(page.take_slot());
    }

    let mut page = map_new_page()?;
    let slot = page.take_slot();
    self.pages.push(page);
    Ok(slot)
  }
}

/// Maps a fresh page near the host executable's code: try the anchored
/// gap's base, then `base + page`, `base + 2*page`, retry the whole loop
/// once more, and finally fall back to an unconstrained mapping.
fn map_new_page() -> Result<TrampolinePage> {
  let page_size = util::page_size();
  let desired = search::anchored_gap(page_size)?;

  for attempt in 0..2 {
    for slot in 0..=2 {
      let candidate = desired + slot * page_size;
      match map_hinted(candidate, page_size) {
        Ok(addr) if addr != candidate && attempt == 0 => {
          unsafe { libc::munmap(addr as *mut libc::c_void, page_size) };
        },
        Ok(addr) => {
          tracing::debug!(requested = candidate, got = addr, "mapped new trampoline page");
          return Ok(TrampolinePage { base: addr, capacity: page_size, used: 0 });
        },
        Err(_) => continue,
      }
    }
  }

  tracing::warn!("falling back to an unconstrained trampoline page mapping");
  map_unconstrained(page_size).map(|addr| TrampolinePage { base: addr, capacity: page_size, used: 0 })
}

/// Maps `len` bytes RWX, using `addr` as a placement hint (not
/// `MAP_FIXED`): the caller checks the returned address and retries if
/// it landed elsewhere.
fn map_hinted(addr: usize, len: usize) -> Result<usize> {
  unsafe {
    let ptr = libc::mmap(
      addr as *mut libc::c_void,
      len,
      libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    );

    if ptr == libc::MAP_FAILED {
      Err(Error::MappingFailure)
    } else {
      Ok(ptr as usize)
    }
  }
}

fn map_unconstrained(len: usize) -> Result<usize> {
  map_hinted(0, len)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn slots_are_distinct_and_within_a_page() {
    let mut allocator = TrampolineAllocator::new();
    let a = allocator.allocate_slot().unwrap();
    let b = allocator.allocate_slot().unwrap();
    assert_ne!(a, b);
    assert_eq!(b - a, TRAMPOLINE_MAX_SIZE);
  }

  #[test]
  fn fills_a_page_then_allocates_a_new_one() {
    let mut allocator = TrampolineAllocator::new();
    let page_size = util::page_size();
    let per_page = page_size / TRAMPOLINE_MAX_SIZE;

    let mut addrs = Vec::new();
    for _ in 0..per_page {
      addrs.push(allocator.allocate_slot().unwrap());
    }
    assert_eq!(allocator.pages.len(), 1);

    let overflow = allocator.allocate_slot().unwrap();
    assert_eq!(allocator.pages.len(), 2);
    assert!(!addrs.contains(&overflow));
  }
}
