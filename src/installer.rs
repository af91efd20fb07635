//! Hook installer: builds a trampoline, patches the source prologue, and
//! reverses both.
//!
//! The page-protection toggling pattern (explicit `READ_WRITE_EXECUTE`
//! then back to `READ_EXECUTE`, rather than an RAII guard that restores
//! whatever protection was previously in force) matches the target
//! protection the engine always wants for patched code, regardless of
//! what the page happened to carry before.

use crate::arch::{self, ABSJMP_LEN, NOP_UNIT, SCRATCH_RESTORE, SCRATCH_SAVE, TRAMPOLINE_MAX_SIZE};
use crate::error::{Error, Result};
use crate::{alloc, util};

/// Everything the installer produced for one hook: the relocated
/// original prefix plus jump-back, the jump instruction overwriting the
/// source, and enough bookkeeping to reverse both.
pub struct Installed {
  pub trampoline: usize,
  pub hook_len: usize,
  pub trampo_len: usize,
  pub original_bytes: Vec<u8>,
}

/// Probes `source`, relocates the probed prefix into a freshly allocated
/// trampoline slot, then overwrites `source`'s prologue with a jump to
/// `destination`.
pub fn install(source: usize, destination: usize) -> Result<Installed> {
  if source == destination {
    return Err(Error::SameAddress);
  }
  if !util::is_executable_address(source as *const ())? || !util::is_executable_address(destination as *const ())? {
    return Err(Error::NotExecutable);
  }

  let min_bytes = ABSJMP_LEN + SCRATCH_SAVE.len() + SCRATCH_RESTORE.len();
  let probe = arch::probe_minimum_jump_size(source as *const (), min_bytes)?;
  let slot = alloc::allocate_slot()?;
  let relocated = arch::relocate(&probe, source, slot)?;
  if relocated.is_empty() {
    return Err(Error::UnrelocatableInstruction);
  }

  let trampo_len = write_trampoline(slot, &relocated, source + probe.len)?;

  let mut original_bytes = vec![0u8; probe.len];
  unsafe {
    std::ptr::copy_nonoverlapping(source as *const u8, original_bytes.as_mut_ptr(), probe.len);
  }

  patch_source(source, destination, &original_bytes)?;

  Ok(Installed {
    trampoline: slot,
    hook_len: probe.len,
    trampo_len,
    original_bytes,
  })
}

/// Writes `relocated` into the trampoline slot, followed by scratch-save
/// and an absolute jump back to `resume_at` (the first byte past the
/// probed source prefix). Returns the total bytes written.
///
/// The scratch register saved here is restored on the *source* side
/// (see [`patch_source`]), not here — the jump that follows the save
/// clobbers the scratch register to hold its target, and execution never
/// returns to this slot to undo that.
fn write_trampoline(slot: usize, relocated: &[u8], resume_at: usize) -> Result<usize> {
  let mut code = Vec::with_capacity(TRAMPOLINE_MAX_SIZE);
  code.extend_from_slice(relocated);
  code.extend_from_slice(SCRATCH_SAVE);
  code.extend_from_slice(&arch::absolute_jump(resume_at));

  if code.len() > TRAMPOLINE_MAX_SIZE {
    return Err(Error::TrampolineTooLarge);
  }

  let (page_base, span) = util::page_span(slot, TRAMPOLINE_MAX_SIZE);
  unsafe {
    region::protect(page_base as *const _, span, region::Protection::READ_WRITE_EXECUTE)?;
    std::ptr::copy_nonoverlapping(code.as_ptr(), slot as *mut u8, code.len());
    region::protect(page_base as *const _, span, region::Protection::READ_EXECUTE)?;
  }

  Ok(code.len())
}

/// Builds the bytes that overwrite `hook_len` source bytes while a hook
/// is active: an absolute jump to `destination`, the scratch-restore
/// this jump's sibling in the trampoline owes the caller's register,
/// then NOP filler up to `hook_len`. The restore sits after an
/// unconditional jump and is never reached by control flow — it exists
/// only to balance the trampoline's scratch-save byte for byte, matching
/// the source plugin's own layout.
fn dispatch_code(destination: usize, hook_len: usize) -> Vec<u8> {
  let mut code = arch::absolute_jump(destination);
  code.extend_from_slice(SCRATCH_RESTORE);
  fill_nops(&mut code, hook_len);
  code
}

/// Overwrites `original_bytes.len()` bytes at `source` with
/// [`dispatch_code`] for `destination`. Per spec §4.4, any step failing
/// after the trampoline write requires restoring the prior source bytes
/// before reporting failure: if the write itself fails, nothing has
/// been touched; if the trailing protection restore fails after the
/// write already landed, this writes `original_bytes` back over the new
/// dispatch code (best effort) so the source is left exactly as it was
/// found, and `active` never goes out of sync with what's actually at
/// `source`.
fn patch_source(source: usize, destination: usize, original_bytes: &[u8]) -> Result<()> {
  let hook_len = original_bytes.len();
  let code = dispatch_code(destination, hook_len);
  let (page_base, span) = util::page_span(source, hook_len);

  unsafe {
    region::protect(page_base as *const _, span, region::Protection::READ_WRITE_EXECUTE)?;
    std::ptr::copy_nonoverlapping(code.as_ptr(), source as *mut u8, code.len());

    if let Err(error) = region::protect(page_base as *const _, span, region::Protection::READ_EXECUTE) {
      tracing::error!(source, %error, "failed to restore page protection after patching source, rolling back");
      std::ptr::copy_nonoverlapping(original_bytes.as_ptr(), source as *mut u8, original_bytes.len());
      if let Err(retry_error) = region::protect(page_base as *const _, span, region::Protection::READ_EXECUTE) {
        tracing::error!(source, %retry_error, "failed to restore page protection after rollback");
      }
      return Err(error.into());
    }
  }

  Ok(())
}

/// Pads `code` up to `len` bytes with [`NOP_UNIT`], assuming `len` is a
/// multiple of the NOP unit's width (true for both supported backends).
fn fill_nops(code: &mut Vec<u8>, len: usize) {
  while code.len() < len {
    code.extend_from_slice(NOP_UNIT);
  }
}

/// Restores `original_bytes` at `source`. The trampoline page is never
/// reclaimed: no failure mode touching it requires rollback. Mirrors
/// [`patch_source`]'s rollback symmetrically: if the trailing
/// protection restore fails after `original_bytes` has already landed,
/// this writes the dispatch sequence for `destination` back over
/// `source` (best effort) so a failed `unhook()` leaves the hook exactly
/// as active as it was before the call, matching spec §3's invariant
/// that `active` track what's really at `source`.
pub fn uninstall(source: usize, destination: usize, original_bytes: &[u8]) -> Result<()> {
  let (page_base, span) = util::page_span(source, original_bytes.len());

  unsafe {
    region::protect(page_base as *const _, span, region::Protection::READ_WRITE_EXECUTE)?;
    std::ptr::copy_nonoverlapping(original_bytes.as_ptr(), source as *mut u8, original_bytes.len());

    if let Err(error) = region::protect(page_base as *const _, span, region::Protection::READ_EXECUTE) {
      tracing::error!(source, %error, "failed to restore page protection after unhooking, rolling back");
      let code = dispatch_code(destination, original_bytes.len());
      std::ptr::copy_nonoverlapping(code.as_ptr(), source as *mut u8, code.len());
      if let Err(retry_error) = region::protect(page_base as *const _, span, region::Protection::READ_EXECUTE) {
        tracing::error!(source, %retry_error, "failed to restore page protection after rollback");
      }
      return Err(error.into());
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  extern "C" fn target() -> u32 {
    111
  }

  extern "C" fn replacement() -> u32 {
    222
  }

  #[test]
  fn install_then_uninstall_round_trips_the_prologue() {
    let source = target as usize;
    let destination = replacement as usize;

    let installed = install(source, destination).expect("install should succeed");
    assert_eq!(target(), 222);

    uninstall(source, destination, &installed.original_bytes).expect("uninstall should succeed");
    assert_eq!(target(), 111);
  }

  #[test]
  fn trampoline_calls_through_to_the_original_behavior() {
    let source = target as usize;
    let destination = replacement as usize;

    let installed = install(source, destination).expect("install should succeed");
    let original: extern "C" fn() -> u32 = unsafe { std::mem::transmute(installed.trampoline) };
    assert_eq!(original(), 111);

    uninstall(source, destination, &installed.original_bytes).unwrap();
  }

  #[test]
  fn refuses_to_hook_a_function_onto_itself() {
    let source = target as usize;
    assert!(matches!(install(source, source), Err(Error::SameAddress)));
  }
}
