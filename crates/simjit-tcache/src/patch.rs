//! The three patch forms the cache writes into generated code.
//!
//! Generated blocks end every exit with an *unlinked* exit sequence that hands the next guest PC
//! back to the dispatcher:
//!
//! ```text
//!     mov  eax, next_pc      ; B8 imm32   <- patch site is the imm32
//!     pop  edx
//!     ret
//! ```
//!
//! Linking rewrites the `mov` opcode into a `jmp` to another block's entry and unlinking writes
//! the `mov` back. Breaking a block overwrites translated code with [`EXIT_STUB`].

/// `mov eax, imm32`
pub const OP_MOV_EAX_IMM32: u8 = 0xb8;
/// `jmp rel32`
pub const OP_JMP_REL32: u8 = 0xe9;
/// `jmp rel8`
pub const OP_JMP_REL8: u8 = 0xeb;

/// Forced-exit stub: `mov eax, imm32; pop edx; ret`.
pub const EXIT_STUB: [u8; 7] = [OP_MOV_EAX_IMM32, 0, 0, 0, 0, 0x5a, 0xc3];
pub const EXIT_STUB_LEN: usize = EXIT_STUB.len();
/// Offset of the imm32 guest PC inside [`EXIT_STUB`].
pub const EXIT_STUB_PC_OFFSET: usize = 1;

/// Decoded state of a patch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteForm {
    /// `mov eax, pc`: control returns to the dispatcher with `pc`.
    Exit(u32),
    /// Direct jump with the displacement measured from the end of the displacement field.
    Jump { rel: i32 },
    Unknown(u8),
}

fn site_in_bounds(code: &[u8], site: usize) -> bool {
    site >= 1 && site.checked_add(4).is_some_and(|end| end <= code.len())
}

/// Write the unlinked exit form (`mov eax, target_pc`) at `site`.
///
/// Returns `false` when `site` does not leave room for the opcode and imm32.
pub fn write_exit(code: &mut [u8], site: usize, target_pc: u32) -> bool {
    if !site_in_bounds(code, site) {
        return false;
    }
    code[site - 1] = OP_MOV_EAX_IMM32;
    code[site..site + 4].copy_from_slice(&target_pc.to_le_bytes());
    true
}

/// Write a direct jump at `site` so that it lands on host address `target`, given that the
/// block's code starts at host address `code_base`.
///
/// Short jumps are used when the displacement fits. Returns `false` (leaving the site untouched)
/// when the target is out of `rel32` range.
pub fn write_jump(code: &mut [u8], code_base: u64, site: usize, target: u64) -> bool {
    if !site_in_bounds(code, site) {
        return false;
    }
    let site_addr = code_base.wrapping_add(site as u64);
    let ra = (target as i128) - (site_addr as i128);
    if ra > -127 && ra < 128 {
        code[site - 1] = OP_JMP_REL8;
        code[site] = (ra - 1) as i8 as u8;
        return true;
    }
    let Ok(rel) = i32::try_from(ra - 4) else {
        return false;
    };
    code[site - 1] = OP_JMP_REL32;
    code[site..site + 4].copy_from_slice(&rel.to_le_bytes());
    true
}

pub fn read_site(code: &[u8], site: usize) -> SiteForm {
    if !site_in_bounds(code, site) {
        return SiteForm::Unknown(0);
    }
    let imm = [code[site], code[site + 1], code[site + 2], code[site + 3]];
    match code[site - 1] {
        OP_MOV_EAX_IMM32 => SiteForm::Exit(u32::from_le_bytes(imm)),
        OP_JMP_REL32 => SiteForm::Jump {
            rel: i32::from_le_bytes(imm),
        },
        OP_JMP_REL8 => SiteForm::Jump {
            rel: i32::from(code[site] as i8),
        },
        op => SiteForm::Unknown(op),
    }
}

/// Host address a jump at `site` lands on, if the site holds a jump.
pub fn jump_target(code: &[u8], code_base: u64, site: usize) -> Option<u64> {
    let base = code_base.wrapping_add(site as u64);
    match (code.get(site.wrapping_sub(1)), read_site(code, site)) {
        (Some(&OP_JMP_REL8), SiteForm::Jump { rel }) => {
            Some(base.wrapping_add(1).wrapping_add(rel as i64 as u64))
        }
        (Some(&OP_JMP_REL32), SiteForm::Jump { rel }) => {
            Some(base.wrapping_add(4).wrapping_add(rel as i64 as u64))
        }
        _ => None,
    }
}

/// Overwrite `code[at..]` with [`EXIT_STUB`] returning to `pc`.
pub fn write_exit_stub(code: &mut [u8], at: usize, pc: u32) -> bool {
    let Some(end) = at.checked_add(EXIT_STUB_LEN) else {
        return false;
    };
    if end > code.len() {
        return false;
    }
    code[at..end].copy_from_slice(&EXIT_STUB);
    code[at + EXIT_STUB_PC_OFFSET..at + EXIT_STUB_PC_OFFSET + 4].copy_from_slice(&pc.to_le_bytes());
    true
}

/// Guest PC carried by an exit stub at `at`, if one is there.
pub fn read_exit_stub(code: &[u8], at: usize) -> Option<u32> {
    let stub = code.get(at..at.checked_add(EXIT_STUB_LEN)?)?;
    if stub[0] != OP_MOV_EAX_IMM32 || stub[5..] != EXIT_STUB[5..] {
        return None;
    }
    Some(u32::from_le_bytes([stub[1], stub[2], stub[3], stub[4]]))
}
