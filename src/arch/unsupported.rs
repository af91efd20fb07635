//! Stand-in backend for targets that are neither x86-64 nor AArch64.
//!
//! Every entry point fails immediately with `UnsupportedArchitecture`; the
//! caller ([`super::probe_minimum_jump_size`]) already checks
//! [`super::is_supported`] before reaching here, so these bodies exist only
//! so the crate compiles on other targets.

use crate::error::{Error, Result};

pub const ABSJMP_LEN: usize = 0;
pub const ABSJMP_ADDR_OFFSET: usize = 0;
pub const SCRATCH_SAVE: &[u8] = &[];
pub const SCRATCH_RESTORE: &[u8] = &[];
pub const NOP_UNIT: &[u8] = &[];

pub fn decode_one(_addr: *const u8) -> Result<(usize, String)> {
  Err(Error::UnsupportedArchitecture)
}

pub fn relocate(_probe: &super::Probe, _source_addr: usize, _destination_addr: usize) -> Result<Vec<u8>> {
  Err(Error::UnsupportedArchitecture)
}

pub fn absolute_jump(_destination: usize) -> Vec<u8> {
  Vec::new()
}
