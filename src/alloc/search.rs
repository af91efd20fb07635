//! Anchored gap search for trampoline page placement.
//!
//! Ported from the plugin's own `seekNewPageAddr`: walk the process's
//! memory map sequentially, tracking the previous mapping's `[start, end)`,
//! and don't accept a gap until the scan has passed at least one mapping
//! that belongs to the host executable — this keeps trampolines out of the
//! heap/stack/library region and anchored to the process's own code.

use crate::error::{Error, Result};

/// Returns the first acceptable gap's starting address, anchored to the
/// host executable's own mappings.
#[cfg(target_os = "linux")]
pub fn anchored_gap(page_size: usize) -> Result<usize> {
  use std::fs;

  let maps = fs::read_to_string("/proc/self/maps").map_err(|_| Error::MappingFailure)?;
  let exe_name = fs::read_link("/proc/self/exe").ok();
  let exe_name = exe_name.as_ref().and_then(|p| p.to_str());

  let mut last_start: u64 = 0;
  let mut last_end: u64 = 0;
  let mut anchored = false;

  for line in maps.lines() {
    let mut fields = line.split_whitespace();
    let range = match fields.next() {
      Some(range) => range,
      None => continue,
    };
    // perms, offset, dev, inode precede the (optional) pathname.
    let pathname = fields.nth(4).unwrap_or("");

    let (start, end) = match parse_range(range) {
      Some(pair) => pair,
      None => continue,
    };

    if last_start == 0 {
      last_start = start;
      last_end = end;
      continue;
    }

    if start.saturating_sub(last_end) > page_size as u64 * 2 {
      let names_host = exe_name.map_or(false, |name| pathname.contains(name));

      if !names_host && !anchored {
        tracing::trace!(gap_start = last_end, gap_end = start, "skipping gap, not yet anchored to host code");
        last_start = start;
        last_end = end;
        continue;
      } else if !anchored {
        tracing::trace!(at = start, "anchored to host executable's code pages");
        anchored = true;
        last_start = start;
        last_end = end;
        continue;
      }

      tracing::trace!(gap_start = last_end, gap_end = start, "found candidate trampoline gap");
      return Ok(last_end as usize);
    }

    last_start = start;
    last_end = end;
  }

  Err(Error::MappingFailure)
}

fn parse_range(range: &str) -> Option<(u64, u64)> {
  let mut parts = range.split('-');
  let start = u64::from_str_radix(parts.next()?, 16).ok()?;
  let end = u64::from_str_radix(parts.next()?, 16).ok()?;
  Some((start, end))
}

/// Non-Linux POSIX fallback: there is no portable `/proc/self/maps`
/// equivalent, so this walks mapped regions forward from the allocator's
/// own code via `region::query` until it finds unmapped space, without the
/// host-binary anchor.
#[cfg(not(target_os = "linux"))]
pub fn anchored_gap(_page_size: usize) -> Result<usize> {
  let mut current = anchored_gap as *const () as usize;

  loop {
    match region::query(current as *const _) {
      Ok(region) => current = region.upper(),
      Err(region::Error::FreeMemory) => return Ok(current),
      Err(_) => return Err(Error::MappingFailure),
    }
  }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
  use super::*;

  #[test]
  fn finds_some_gap_near_process_code() {
    let page_size = crate::util::page_size();
    let addr = anchored_gap(page_size).expect("a gap should exist in any running process");
    assert!(addr > 0);
  }
}
