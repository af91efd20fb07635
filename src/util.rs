use crate::error::Result;

/// Returns true if an address is executable.
pub fn is_executable_address(address: *const ()) -> Result<bool> {
  Ok(
    region::query(address as *const _)?
      .protection
      .contains(region::Protection::EXECUTE),
  )
}

/// Returns the OS page size, queried fresh each call (pages never resize
/// at runtime, but there is no reason to cache what `region` already does).
pub fn page_size() -> usize {
  region::page::size()
}

/// Rounds `addr` down to the start of its containing page and returns
/// `(page_base, protection_len)` covering `len` bytes starting at `addr`.
pub fn page_span(addr: usize, len: usize) -> (usize, usize) {
  let page = page_size();
  let base = addr - (addr % page);
  let span = addr + len - base;
  let rounded = (span + page - 1) / page * page;
  (base, rounded)
}
