//! Error types returned by the hook engine.

use thiserror::Error;

/// The result of an internal engine operation.
pub type Result<T> = ::std::result::Result<T, Error>;

/// Every way a probe, relocation, allocation, or patch can fail.
///
/// Public entry points (`HookRecord::hook`, `HookRecord::unhook`) never
/// propagate this type directly — they report `bool` and log the error,
/// per the engine's error-handling contract. Everything below that
/// boundary uses `Result<T, Error>` and `?`.
#[derive(Debug, Error)]
pub enum Error {
  /// Build targets neither x86-64 nor AArch64.
  #[error("target architecture is not supported by the hook engine")]
  UnsupportedArchitecture,
  /// The source and destination address are identical.
  #[error("source and destination address are the same")]
  SameAddress,
  /// `source` or `destination` does not resolve to executable memory.
  #[error("address is not executable")]
  NotExecutable,
  /// The instruction probe could not decode a byte sequence at the source.
  #[error("failed to decode instruction at 0x{0:x}")]
  DecodeFailure(usize),
  /// A PC/RIP-relative instruction in the probed prefix cannot be rewritten
  /// to reach its original target from the trampoline.
  #[error("instruction cannot be relocated without losing its target")]
  UnrelocatableInstruction,
  /// The relocated prefix plus framing does not fit in a trampoline slot.
  #[error("relocated prefix does not fit the trampoline slot")]
  TrampolineTooLarge,
  /// An anonymous mapping for a new trampoline page failed.
  #[error("failed to map a new trampoline page")]
  MappingFailure,
  /// `unhook()` was called on a record that is not currently active.
  #[error("hook is not active")]
  NotActive,
  /// A memory-protection query or change failed.
  #[error(transparent)]
  RegionFailure(#[from] region::Error),
}
