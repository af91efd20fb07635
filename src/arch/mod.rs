//! Architecture abstraction.
//!
//! Both supported architectures are modeled behind the same small capability
//! set — probe, relocate, absolute-jump bytes, scratch-save bytes,
//! scratch-restore bytes, NOP filler — selected at build time based on the
//! target ISA. Everything above this module (the allocator, the installer,
//! the registry) is architecture-agnostic.

use crate::error::{Error, Result};
use cfg_if::cfg_if;

cfg_if! {
  if #[cfg(target_arch = "x86_64")] {
    mod x86_64;
    use self::x86_64 as backend;
  } else if #[cfg(target_arch = "aarch64")] {
    mod aarch64;
    use self::aarch64 as backend;
  } else {
    mod unsupported;
    use self::unsupported as backend;
  }
}

/// Fixed per-trampoline-slot size, shared by the allocator and the
/// installer's capacity check.
pub const TRAMPOLINE_MAX_SIZE: usize = 64;

pub use backend::{
  absolute_jump, ABSJMP_ADDR_OFFSET, ABSJMP_LEN, NOP_UNIT, SCRATCH_RESTORE, SCRATCH_SAVE,
};

/// True when this build targets a supported ISA.
pub const fn is_supported() -> bool {
  cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
}

/// Result of [`probe_minimum_jump_size`]: the cumulative length decoded,
/// a newline-joined textual summary (one line per instruction, in order),
/// and the per-instruction length breakdown.
pub struct Probe {
  pub len: usize,
  pub assembly_text: String,
  pub instruction_lengths: Vec<usize>,
}

/// Decodes consecutive instructions starting at `start` until the
/// cumulative byte count is at least `min_bytes`, architecture dispatch
/// handled by `backend::decode_one`.
pub fn probe_minimum_jump_size(start: *const (), min_bytes: usize) -> Result<Probe> {
  if !is_supported() {
    return Err(Error::UnsupportedArchitecture);
  }

  let mut len = 0usize;
  let mut assembly_text = String::new();
  let mut instruction_lengths = Vec::new();

  while len < min_bytes {
    let cursor = unsafe { (start as *const u8).add(len) };
    let (ins_len, text) = backend::decode_one(cursor)
      .map_err(|_| Error::DecodeFailure(cursor as usize))?;
    instruction_lengths.push(ins_len);
    assembly_text.push_str(&text);
    assembly_text.push('\n');
    len += ins_len;
  }

  tracing::trace!(len, instructions = instruction_lengths.len(), "probed source prefix");
  Ok(Probe { len, assembly_text, instruction_lengths })
}

/// Rewrites `probe`'s instructions so they behave identically when executed
/// from `destination_addr` instead of `source_addr`.
pub fn relocate(probe: &Probe, source_addr: usize, destination_addr: usize) -> Result<Vec<u8>> {
  backend::relocate(probe, source_addr, destination_addr)
}
