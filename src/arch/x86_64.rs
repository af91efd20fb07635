//! x86-64 backend.
//!
//! Variable-length decoding is delegated to `udis86` through the same
//! bindings already linked (`libudis86-sys`), configured for AT&T syntax
//! so RIP-relative operands render as `disp(%rip)` — the substring the
//! relocator below pattern-matches on.

use crate::arch::Probe;
use crate::error::{Error, Result};
use std::ffi::CStr;
use std::mem;

/// `movabs $0,%rax ; jmpq *%rax` — 12 bytes.
pub const ABSJMP_LEN: usize = 12;
/// Offset of the 8-byte immediate within [`absolute_jump`]'s output.
pub const ABSJMP_ADDR_OFFSET: usize = 2;
/// `pushq %rax`
pub const SCRATCH_SAVE: &[u8] = &[0x50];
/// `popq %rax`
pub const SCRATCH_RESTORE: &[u8] = &[0x58];
/// Single-byte NOP filler.
pub const NOP_UNIT: &[u8] = &[0x90];

#[repr(packed)]
struct AbsJmp {
  mov_rax: [u8; 2],
  imm: u64,
  jmp_rax: [u8; 2],
}

/// Builds `movabs $destination,%rax ; jmpq *%rax`.
pub fn absolute_jump(destination: usize) -> Vec<u8> {
  let code = AbsJmp {
    mov_rax: [0x48, 0xB8],
    imm: (destination as u64).to_le(),
    jmp_rax: [0xFF, 0xE0],
  };

  let bytes: [u8; ABSJMP_LEN] = unsafe { mem::transmute(code) };
  bytes.to_vec()
}

/// Decodes one instruction at `addr`, returning its length and the AT&T
/// assembly line `udis86` renders for it.
pub fn decode_one(addr: *const u8) -> Result<(usize, String)> {
  unsafe {
    let mut ud: udis::ud = mem::zeroed();
    udis::ud_init(&mut ud);
    udis::ud_set_mode(&mut ud, (mem::size_of::<usize>() * 8) as u8);
    udis::ud_set_syntax(&mut ud, udis::ud_translate_att);
    udis::ud_set_user_opaque_data(&mut ud, addr as *mut _);
    udis::ud_set_input_hook(&mut ud, Some(read_next_byte));

    let len = udis::ud_disassemble(&mut ud) as usize;
    if len == 0 {
      return Err(Error::DecodeFailure(addr as usize));
    }

    let asm = udis::ud_insn_asm(&ud);
    let text = if asm.is_null() {
      String::new()
    } else {
      CStr::from_ptr(asm).to_string_lossy().into_owned()
    };

    Ok((len, text))
  }
}

/// `udis86` input hook: reads one byte from the opaque cursor and advances
/// it. Mirrors the existing `Disassembler::udis_read_address` hook shape.
unsafe extern "C" fn read_next_byte(ud: *mut udis::ud) -> libc::c_int {
  let cursor = udis::ud_get_user_opaque_data(ud) as *mut u8;
  let byte = *cursor;
  udis::ud_set_user_opaque_data(ud, cursor.add(1) as *mut _);
  libc::c_int::from(byte)
}

/// Relocates a probed prefix: copy each instruction's bytes unchanged,
/// then for any instruction whose assembly line contains `(%rip)`,
/// recompute the absolute target from the original address and rewrite
/// the displacement for the new location.
pub fn relocate(probe: &Probe, source_addr: usize, destination_addr: usize) -> Result<Vec<u8>> {
  let mut out = vec![0u8; probe.len];
  let mut current_source = source_addr;
  let mut current_dest = 0usize;

  for (line, &ins_len) in probe
    .assembly_text
    .lines()
    .zip(probe.instruction_lengths.iter())
  {
    let src = unsafe { std::slice::from_raw_parts(current_source as *const u8, ins_len) };
    out[current_dest..current_dest + ins_len].copy_from_slice(src);

    if let Some(rip_at) = line.find("(%rip)") {
      let displacement = match parse_rip_displacement(&line[..rip_at]) {
        Some(d) if d != 0 => d,
        _ => return Ok(Vec::new()),
      };

      let target = current_source as i64 + ins_len as i64 + displacement;
      let next_dest = destination_addr as i64 + current_dest as i64 + ins_len as i64;
      let new_displacement = target - next_dest;

      if new_displacement > i64::from(i32::MAX) || new_displacement < i64::from(i32::MIN) {
        tracing::warn!(
          source = current_source,
          "x86-64 RIP displacement overflows 32 bits after relocation"
        );
        return Ok(Vec::new());
      }

      match find_displacement_slot(&out[current_dest..current_dest + ins_len], displacement as i32) {
        Some(slot) => {
          let at = current_dest + slot;
          out[at..at + 4].copy_from_slice(&(new_displacement as i32).to_le_bytes());
        },
        None => return Ok(Vec::new()),
      }
    }

    current_source += ins_len;
    current_dest += ins_len;
  }

  Ok(out)
}

/// Extracts the signed displacement token immediately preceding `(%rip)`,
/// e.g. `"mov -0x2010(%rip),%rax"` ⟶ `Some(-0x2010)`.
fn parse_rip_displacement(prefix: &str) -> Option<i64> {
  let token_start = prefix
    .rfind(|c: char| c == ' ' || c == ',')
    .map(|i| i + 1)
    .unwrap_or(0);
  let token = &prefix[token_start..];

  let (sign, rest) = match token.strip_prefix('-') {
    Some(rest) => (-1i64, rest),
    None => (1i64, token.strip_prefix('+').unwrap_or(token)),
  };

  let hex = rest.strip_prefix("0x").unwrap_or(rest);
  i64::from_str_radix(hex, 16).ok().map(|value| sign * value)
}

/// Scans the last bytes of an instruction for the exact little-endian
/// 32-bit encoding of `displacement` — recovers the operand field's
/// location without a structured decoder.
fn find_displacement_slot(instruction: &[u8], displacement: i32) -> Option<usize> {
  if instruction.len() < 4 {
    return None;
  }

  (0..=instruction.len() - 4)
    .rev()
    .find(|&i| i32::from_le_bytes(instruction[i..i + 4].try_into().unwrap()) == displacement)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arch::{self, TRAMPOLINE_MAX_SIZE};

  fn map_rwx_page() -> *mut u8 {
    unsafe {
      let ptr = libc::mmap(
        std::ptr::null_mut(),
        region::page::size(),
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      );
      assert_ne!(ptr, libc::MAP_FAILED);
      ptr as *mut u8
    }
  }

  #[test]
  fn decodes_simple_function() {
    // mov eax, 5 ; ret
    let page = map_rwx_page();
    let code: [u8; 6] = [0xB8, 0x05, 0x00, 0x00, 0x00, 0xC3];
    unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), page, code.len()) };

    let probe = arch::probe_minimum_jump_size(page as *const (), 5).unwrap();
    assert_eq!(probe.len, 6);
    assert_eq!(probe.instruction_lengths, vec![5, 1]);
  }

  #[test]
  fn relocates_rip_relative_load() {
    // mov 0x10(%rip), %eax ; ret  — loads the dword eight bytes past `ret`.
    let page = map_rwx_page();
    let code: [u8; 7] = [0x8B, 0x05, 0x10, 0x00, 0x00, 0x00, 0xC3];
    unsafe {
      std::ptr::copy_nonoverlapping(code.as_ptr(), page, code.len());
      // Place a recognizable marker at the RIP-relative target.
      (page.add(7 + 0x10) as *mut u32).write_unaligned(0xDEAD_BEEF);
    }

    let probe = arch::probe_minimum_jump_size(page as *const (), 6).unwrap();
    assert!(probe.assembly_text.contains("(%rip)"));

    let dest_buf = map_rwx_page();
    let relocated = relocate(&probe, page as usize, dest_buf as usize).unwrap();
    assert!(!relocated.is_empty());
    assert_eq!(relocated.len(), probe.len);

    unsafe {
      std::ptr::copy_nonoverlapping(relocated.as_ptr(), dest_buf, relocated.len());
      let read: extern "C" fn() -> u32 = std::mem::transmute(dest_buf);
      assert_eq!(read(), 0xDEAD_BEEF);
    }
  }

  #[test]
  fn relocation_fails_on_int32_overflow() {
    let page = map_rwx_page();
    // mov 0x7fffffff(%rip), %eax ; ret
    let mut code = vec![0x8B, 0x05];
    code.extend_from_slice(&0x7FFF_FFFFi32.to_le_bytes());
    code.push(0xC3);
    unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), page, code.len()) };

    let probe = arch::probe_minimum_jump_size(page as *const (), code.len() - 1).unwrap();
    // A destination far enough away that the new displacement cannot fit
    // signed 32 bits even though the original did.
    let far_dest = (page as usize).wrapping_sub(0x1_0000_0000);
    let relocated = relocate(&probe, page as usize, far_dest);
    assert!(relocated.unwrap().is_empty());
  }

  #[test]
  fn absolute_jump_has_expected_shape() {
    let jump = absolute_jump(0x1122_3344_5566_7788);
    assert_eq!(jump.len(), ABSJMP_LEN);
    assert_eq!(&jump[0..2], &[0x48, 0xB8]);
    assert_eq!(&jump[10..12], &[0xFF, 0xE0]);
    assert_eq!(
      u64::from_le_bytes(jump[ABSJMP_ADDR_OFFSET..ABSJMP_ADDR_OFFSET + 8].try_into().unwrap()),
      0x1122_3344_5566_7788
    );
  }

  #[test]
  fn trampoline_framing_fits_budget() {
    assert!(ABSJMP_LEN + SCRATCH_SAVE.len() + SCRATCH_RESTORE.len() < TRAMPOLINE_MAX_SIZE);
  }
}
