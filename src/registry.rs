//! Hook registry: owns every installed hook's bookkeeping and exposes the
//! `bool`-returning public surface described by [`crate::error::Error`]'s
//! contract.
//!
//! `darfink-detour-rs` has no registry of its own — each `Detour` is owned
//! directly by the caller. A process-wide table keyed by a stable,
//! generation-safe handle is borrowed from `dollannn-counterstrikerust`'s
//! `MidHookKey`/`SlotMap<MidHookKey, MidHookEntry>` pair, adapted to this
//! crate's `lazy_static!` + `std::sync::Mutex` convention rather than that
//! crate's `LazyLock`/`parking_lot::RwLock`.

use crate::error::Result;
use crate::installer;
use lazy_static::lazy_static;
use slotmap::{new_key_type, SlotMap};
use std::sync::Mutex;

new_key_type! {
  /// Stable handle to an installed hook. Never reused across `remove_hook`.
  pub struct HookHandle;
}

/// Caller-supplied grouping tag, used only by [`remove_all_hooks_from`] to
/// bulk-remove every hook registered under it. Opaque to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Owner(pub usize);

struct HookRecord {
  source: usize,
  destination: usize,
  owner: Owner,
  trampoline: usize,
  original_bytes: Vec<u8>,
  hook_len: usize,
  #[allow(dead_code)]
  trampo_len: usize,
  active: bool,
}

impl HookRecord {
  /// Stores `source`/`destination`/`owner` only; the record starts
  /// inactive. No probing, allocation, or byte patching happens until
  /// [`HookRecord::hook`] is called.
  fn new(source: usize, destination: usize, owner: Owner) -> Result<Self> {
    if source == destination {
      return Err(crate::error::Error::SameAddress);
    }
    Ok(HookRecord {
      source,
      destination,
      owner,
      trampoline: 0,
      original_bytes: Vec::new(),
      hook_len: 0,
      trampo_len: 0,
      active: false,
    })
  }

  fn hook(&mut self) -> Result<()> {
    if self.active {
      return Ok(());
    }
    let installed = installer::install(self.source, self.destination)?;
    self.trampoline = installed.trampoline;
    self.original_bytes = installed.original_bytes;
    self.hook_len = installed.hook_len;
    self.trampo_len = installed.trampo_len;
    self.active = true;
    Ok(())
  }

  fn unhook(&mut self) -> Result<()> {
    if !self.active {
      return Err(crate::error::Error::NotActive);
    }
    installer::uninstall(self.source, self.destination, &self.original_bytes)?;
    self.active = false;
    Ok(())
  }
}

impl Drop for HookRecord {
  /// Restores the original prologue if the hook is still active. Unlike
  /// the pattern this is adapted from, a failure here is logged rather
  /// than asserted — a caller tearing down a hook during process exit
  /// should not panic over memory that's about to be reclaimed anyway.
  fn drop(&mut self) {
    if self.active {
      if let Err(error) = installer::uninstall(self.source, self.destination, &self.original_bytes) {
        tracing::error!(source = self.source, %error, "failed to restore original bytes while dropping a hook");
      }
    }
  }
}

/// Every hook installed so far in this process, keyed by handle.
struct HookRegistry {
  hooks: SlotMap<HookHandle, HookRecord>,
}

impl HookRegistry {
  fn new() -> Self {
    HookRegistry { hooks: SlotMap::with_key() }
  }
}

lazy_static! {
  static ref REGISTRY: Mutex<HookRegistry> = Mutex::new(HookRegistry::new());
}

/// Registers a redirection of `source` to `destination` under `owner` and
/// returns a handle for it. The record starts inactive — no bytes are
/// touched, no trampoline is allocated, until [`hook`] is called.
pub fn init_hook(source: usize, destination: usize, owner: Owner) -> Result<HookHandle> {
  let record = HookRecord::new(source, destination, owner)?;
  Ok(REGISTRY.lock().unwrap().hooks.insert(record))
}

/// Re-enables a hook previously disabled with [`unhook`]. A no-op, and
/// `true`, if the hook is already active. Returns `false` if `handle`
/// does not name a live hook or re-installation fails (logged).
pub fn hook(handle: HookHandle) -> bool {
  let mut registry = REGISTRY.lock().unwrap();
  match registry.hooks.get_mut(handle) {
    Some(record) => match record.hook() {
      Ok(()) => true,
      Err(error) => {
        tracing::error!(%error, "failed to hook");
        false
      },
    },
    None => false,
  }
}

/// Disables a hook, restoring the original prologue, without discarding
/// its bookkeeping — [`hook`] can reinstall it later. Returns `false` if
/// `handle` does not name a live hook or it is already inactive.
pub fn unhook(handle: HookHandle) -> bool {
  let mut registry = REGISTRY.lock().unwrap();
  match registry.hooks.get_mut(handle) {
    Some(record) => match record.unhook() {
      Ok(()) => true,
      Err(error) => {
        tracing::error!(%error, "failed to unhook");
        false
      },
    },
    None => false,
  }
}

/// Returns the trampoline address for `handle`, i.e. the address callers
/// should invoke to run the original, un-hooked function. `None` if the
/// handle is unknown or the hook is currently inactive.
pub fn original(handle: HookHandle) -> Option<usize> {
  let registry = REGISTRY.lock().unwrap();
  registry.hooks.get(handle).filter(|record| record.active).map(|record| record.trampoline)
}

/// Permanently removes a hook's bookkeeping, restoring the original
/// prologue first if it is still active. The trampoline page itself is
/// never reclaimed. Returns `false` if `handle` is unknown.
pub fn remove_hook(handle: HookHandle) -> bool {
  REGISTRY.lock().unwrap().hooks.remove(handle).is_some()
}

/// Removes every hook registered under `owner`, in insertion order.
/// Returns how many were removed.
pub fn remove_all_hooks_from(owner: Owner) -> usize {
  let mut registry = REGISTRY.lock().unwrap();
  let matching: Vec<HookHandle> = registry
    .hooks
    .iter()
    .filter(|(_, record)| record.owner == owner)
    .map(|(handle, _)| handle)
    .collect();

  for handle in &matching {
    registry.hooks.remove(*handle);
  }
  matching.len()
}

#[cfg(test)]
mod tests {
  use super::*;

  extern "C" fn target_a() -> u32 {
    1
  }

  extern "C" fn target_b() -> u32 {
    2
  }

  extern "C" fn replacement() -> u32 {
    99
  }

  #[test]
  fn hook_unhook_hook_round_trips() {
    let handle = init_hook(target_a as usize, replacement as usize, Owner(1)).unwrap();
    assert_eq!(target_a(), 1);
    assert!(original(handle).is_none());

    assert!(hook(handle));
    assert_eq!(target_a(), 99);

    assert!(unhook(handle));
    assert_eq!(target_a(), 1);

    assert!(hook(handle));
    assert_eq!(target_a(), 99);

    remove_hook(handle);
    assert_eq!(target_a(), 1);
  }

  #[test]
  fn unhook_twice_reports_failure_without_side_effects() {
    let handle = init_hook(target_b as usize, replacement as usize, Owner(2)).unwrap();
    assert!(hook(handle));
    assert!(unhook(handle));
    assert!(!unhook(handle));
    remove_hook(handle);
  }

  #[test]
  fn remove_all_hooks_from_bulk_removes_by_owner() {
    let owner = Owner(42);
    let a = init_hook(target_a as usize, replacement as usize, owner).unwrap();
    let b = init_hook(target_b as usize, replacement as usize, owner).unwrap();
    assert!(hook(a));
    assert!(hook(b));

    assert_eq!(remove_all_hooks_from(owner), 2);
    assert!(!unhook(a));
    assert!(!unhook(b));
  }
}
