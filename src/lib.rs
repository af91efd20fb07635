//! An in-process function hooking engine for x86-64 and AArch64.
//!
//! This crate provides inline detouring functionality by disassembling
//! and patching functions during runtime, using machine code allocated
//! within executable memory. It overwrites a target function's prolog
//! with an unconditional jump to a replacement function, and keeps a
//! trampoline around so the original behavior can still be invoked.
//!
//! ## Procedure
//!
//! To illustrate hooking on an x86-64 target:
//!
//! ```c
//! 0 int return_five() {
//! 1     return 5;
//! 00400020 [b8 05 00 00 00] mov eax, 5
//! 00400025 [c3]             ret
//! 2 }
//! ```
//!
//! Hooking `return_five` overwrites its prolog with an absolute jump to
//! the replacement, padding any leftover bytes with NOPs:
//!
//! ```c
//! 00400020 [48 b8 ..imm64.. ff e0] movabs $detour,%rax ; jmpq *%rax
//! 2 }
//! ```
//!
//! A trampoline holding the relocated original prolog plus a jump back
//! is generated first, so [`original`] keeps working regardless of
//! whether the hook is currently active.
//!
//! ## Concurrency
//!
//! Every operation here is synchronous. Installing or removing a hook
//! while another thread might be executing inside the hooked function's
//! prolog is undefined behavior — callers are responsible for quiescing
//! the target before calling [`init_hook`], [`hook`] or [`unhook`].
//!
//! ## Platforms
//!
//! Both `x86-64` and `aarch64` are supported on POSIX targets. Building
//! for anything else compiles, but every operation returns
//! [`Error::UnsupportedArchitecture`].

#[macro_use]
extern crate cfg_if;
#[macro_use]
extern crate lazy_static;

mod alloc;
mod arch;
mod error;
mod installer;
mod registry;
mod util;

pub use error::{Error, Result};
pub use registry::{init_hook, hook, unhook, original, remove_hook, remove_all_hooks_from, HookHandle, Owner};

#[cfg(test)]
mod tests {
  use super::*;

  extern "C" fn add(x: i32, y: i32) -> i32 {
    unsafe { std::ptr::read_volatile(&x as *const i32) + y }
  }

  extern "C" fn sub(x: i32, y: i32) -> i32 {
    x - y
  }

  extern "C" fn div(x: i32, y: i32) -> i32 {
    x / y
  }

  #[test]
  fn reinstalling_over_a_live_hook_shares_the_same_target() {
    let owner = Owner(1);
    let first = init_hook(add as usize, sub as usize, owner).unwrap();
    assert!(hook(first));
    assert_eq!(add(5, 5), 0);

    let second = init_hook(add as usize, div as usize, owner).unwrap();
    assert!(hook(second));
    assert_eq!(add(10, 5), 2);

    remove_hook(second);
    remove_hook(first);
  }

  #[test]
  fn same_target_and_destination_is_rejected() {
    let err = init_hook(add as usize, add as usize, Owner(2)).unwrap_err();
    assert!(matches!(err, Error::SameAddress));
  }
}
