//! AArch64 instruction encoding.
//!
//! Every function builds a complete [`Instruction`]: final encoding bits for
//! self-contained instructions, zeroed relocation fields for the linker to
//! patch, assembly text for the writer, and the semantic operand fields the
//! peephole matches on. All integer operations are 64-bit; 32-bit forms
//! exist only for character loads and stores.

use crate::instr::{Instruction, JitAttr, Opcode, Relocation};
use crate::reg::{Cond, Reg};
use crate::{CodegenError, CodegenResult};

fn rd(reg: Reg) -> u32 {
    reg.index()
}

fn rn(reg: Reg) -> u32 {
    reg.index() << 5
}

fn rm(reg: Reg) -> u32 {
    reg.index() << 16
}

// --- Moves and immediates ---

pub fn movz(dest: Reg, imm16: u16, shift: u8) -> Instruction {
    debug_assert!(shift % 16 == 0 && shift <= 48);
    let hw = (shift as u32 / 16) << 21;
    let encoding = 0xD280_0000 | hw | ((imm16 as u32) << 5) | rd(dest);
    let asm = if shift == 0 {
        format!("movz {}, #{}", dest, imm16)
    } else {
        format!("movz {}, #{}, lsl #{}", dest, imm16, shift)
    };
    Instruction::new(encoding, asm, Opcode::Movz)
        .with_dest(dest)
        .with_imm(imm16 as i64)
}

pub fn movk(dest: Reg, imm16: u16, shift: u8) -> Instruction {
    debug_assert!(shift % 16 == 0 && shift <= 48);
    let hw = (shift as u32 / 16) << 21;
    let encoding = 0xF280_0000 | hw | ((imm16 as u32) << 5) | rd(dest);
    Instruction::new(
        encoding,
        format!("movk {}, #{}, lsl #{}", dest, imm16, shift),
        Opcode::Movk,
    )
    .with_dest(dest)
    .with_imm(imm16 as i64)
}

/// `mov Xd, Xm` via ORR with the zero register.
pub fn mov_reg(dest: Reg, src: Reg) -> Instruction {
    let encoding = 0xAA00_03E0 | rm(src) | rd(dest);
    Instruction::new(encoding, format!("mov {}, {}", dest, src), Opcode::MovReg)
        .with_dest(dest)
        .with_src1(src)
}

/// Shortest MOVZ/MOVK sequence for a 64-bit constant.
pub fn load_integer(dest: Reg, value: i64) -> Vec<Instruction> {
    let bits = value as u64;
    let slices: [u16; 4] = [
        bits as u16,
        (bits >> 16) as u16,
        (bits >> 32) as u16,
        (bits >> 48) as u16,
    ];
    let mut out = vec![movz(dest, slices[0], 0)];
    for (i, &slice) in slices.iter().enumerate().skip(1) {
        if slice != 0 {
            out.push(movk(dest, slice, (i * 16) as u8));
        }
    }
    out
}

/// Absolute-address load as a full MOVZ/MOVK sequence, each slice carrying
/// its relocation and the JitAddress attribute. The assembly writer folds
/// the sequence back into an ADRP/ADD pair for static output.
pub fn load_address_absolute(dest: Reg, label: &str) -> Vec<Instruction> {
    let relocations = [
        Relocation::MovzMovk0,
        Relocation::MovzMovk16,
        Relocation::MovzMovk32,
        Relocation::MovzMovk48,
    ];
    relocations
        .iter()
        .enumerate()
        .map(|(i, &relocation)| {
            let shift = (i * 16) as u8;
            let base = if i == 0 {
                movz(dest, 0, 0)
            } else {
                movk(dest, 0, shift)
            };
            base.with_relocation(relocation, label)
                .with_jit_attr(JitAttr::JitAddress)
        })
        .collect()
}

/// Page-relative address load: ADRP plus ADD of the low 12 bits.
pub fn load_address_adrp(dest: Reg, label: &str) -> Vec<Instruction> {
    vec![adrp(dest, label), add_lo12(dest, dest, label)]
}

pub fn adrp(dest: Reg, label: &str) -> Instruction {
    Instruction::new(
        0x9000_0000 | rd(dest),
        format!("adrp {}, {}", dest, label),
        Opcode::Adrp,
    )
    .with_dest(dest)
    .with_relocation(Relocation::Page21, label)
}

pub fn add_lo12(dest: Reg, base: Reg, label: &str) -> Instruction {
    Instruction::new(
        0x9100_0000 | rn(base) | rd(dest),
        format!("add {}, {}, :lo12:{}", dest, base, label),
        Opcode::AddImm,
    )
    .with_dest(dest)
    .with_src1(base)
    .with_relocation(Relocation::AddLo12, label)
}

// --- Integer arithmetic ---

pub fn add_imm(dest: Reg, base: Reg, imm12: u32) -> CodegenResult<Instruction> {
    if imm12 > 0xFFF {
        return Err(CodegenError::ImmediateOverflow(imm12 as i64));
    }
    Ok(Instruction::new(
        0x9100_0000 | (imm12 << 10) | rn(base) | rd(dest),
        format!("add {}, {}, #{}", dest, base, imm12),
        Opcode::AddImm,
    )
    .with_dest(dest)
    .with_src1(base)
    .with_imm(imm12 as i64))
}

pub fn sub_imm(dest: Reg, base: Reg, imm12: u32) -> CodegenResult<Instruction> {
    if imm12 > 0xFFF {
        return Err(CodegenError::ImmediateOverflow(imm12 as i64));
    }
    Ok(Instruction::new(
        0xD100_0000 | (imm12 << 10) | rn(base) | rd(dest),
        format!("sub {}, {}, #{}", dest, base, imm12),
        Opcode::SubImm,
    )
    .with_dest(dest)
    .with_src1(base)
    .with_imm(imm12 as i64))
}

/// ADD immediate with the value shifted left 12 bits, for offsets like the
/// runtime-table displacement (524288 = 128 << 12).
pub fn add_imm_shifted(dest: Reg, base: Reg, imm12: u32) -> CodegenResult<Instruction> {
    if imm12 > 0xFFF {
        return Err(CodegenError::ImmediateOverflow(imm12 as i64));
    }
    Ok(Instruction::new(
        0x9140_0000 | (imm12 << 10) | rn(base) | rd(dest),
        format!("add {}, {}, #{}, lsl #12", dest, base, imm12),
        Opcode::AddImm,
    )
    .with_dest(dest)
    .with_src1(base)
    .with_imm((imm12 as i64) << 12))
}

/// Supervisor call.
pub fn svc(imm16: u16) -> Instruction {
    Instruction::new(
        0xD400_0001 | ((imm16 as u32) << 5),
        format!("svc #{:#x}", imm16),
        Opcode::Other,
    )
    .with_imm(imm16 as i64)
}

pub fn add_reg(dest: Reg, a: Reg, b: Reg) -> Instruction {
    Instruction::new(
        0x8B00_0000 | rm(b) | rn(a) | rd(dest),
        format!("add {}, {}, {}", dest, a, b),
        Opcode::AddReg,
    )
    .with_dest(dest)
    .with_src1(a)
    .with_src2(b)
}

pub fn sub_reg(dest: Reg, a: Reg, b: Reg) -> Instruction {
    Instruction::new(
        0xCB00_0000 | rm(b) | rn(a) | rd(dest),
        format!("sub {}, {}, {}", dest, a, b),
        Opcode::SubReg,
    )
    .with_dest(dest)
    .with_src1(a)
    .with_src2(b)
}

/// MUL as MADD with XZR accumulator.
pub fn mul(dest: Reg, a: Reg, b: Reg) -> Instruction {
    Instruction::new(
        0x9B00_7C00 | rm(b) | rn(a) | rd(dest),
        format!("mul {}, {}, {}", dest, a, b),
        Opcode::Mul,
    )
    .with_dest(dest)
    .with_src1(a)
    .with_src2(b)
}

pub fn sdiv(dest: Reg, a: Reg, b: Reg) -> Instruction {
    Instruction::new(
        0x9AC0_0C00 | rm(b) | rn(a) | rd(dest),
        format!("sdiv {}, {}, {}", dest, a, b),
        Opcode::Div,
    )
    .with_dest(dest)
    .with_src1(a)
    .with_src2(b)
}

/// `msub dest, a, b, acc` — dest = acc - a*b. Remainder is
/// `msub r, q, divisor, dividend` after an SDIV.
pub fn msub(dest: Reg, a: Reg, b: Reg, acc: Reg) -> Instruction {
    Instruction::new(
        0x9B00_8000 | rm(b) | (acc.index() << 10) | rn(a) | rd(dest),
        format!("msub {}, {}, {}, {}", dest, a, b, acc),
        Opcode::Msub,
    )
    .with_dest(dest)
    .with_src1(a)
    .with_src2(b)
}

pub fn and_reg(dest: Reg, a: Reg, b: Reg) -> Instruction {
    Instruction::new(
        0x8A00_0000 | rm(b) | rn(a) | rd(dest),
        format!("and {}, {}, {}", dest, a, b),
        Opcode::AndReg,
    )
    .with_dest(dest)
    .with_src1(a)
    .with_src2(b)
}

pub fn orr_reg(dest: Reg, a: Reg, b: Reg) -> Instruction {
    Instruction::new(
        0xAA00_0000 | rm(b) | rn(a) | rd(dest),
        format!("orr {}, {}, {}", dest, a, b),
        Opcode::OrrReg,
    )
    .with_dest(dest)
    .with_src1(a)
    .with_src2(b)
}

pub fn eor_reg(dest: Reg, a: Reg, b: Reg) -> Instruction {
    Instruction::new(
        0xCA00_0000 | rm(b) | rn(a) | rd(dest),
        format!("eor {}, {}, {}", dest, a, b),
        Opcode::EorReg,
    )
    .with_dest(dest)
    .with_src1(a)
    .with_src2(b)
}

/// EOR with an all-ones immediate is not encodable as one ORN-free op on
/// every value, so logical NOT is ORN of the zero register.
pub fn mvn_reg(dest: Reg, src: Reg) -> Instruction {
    // ORN dest, xzr, src
    Instruction::new(
        0xAA20_03E0 | rm(src) | rd(dest),
        format!("mvn {}, {}", dest, src),
        Opcode::Other,
    )
    .with_dest(dest)
    .with_src1(src)
}

pub fn lslv(dest: Reg, a: Reg, b: Reg) -> Instruction {
    Instruction::new(
        0x9AC0_2000 | rm(b) | rn(a) | rd(dest),
        format!("lsl {}, {}, {}", dest, a, b),
        Opcode::Shift,
    )
    .with_dest(dest)
    .with_src1(a)
    .with_src2(b)
}

pub fn lsrv(dest: Reg, a: Reg, b: Reg) -> Instruction {
    Instruction::new(
        0x9AC0_2400 | rm(b) | rn(a) | rd(dest),
        format!("lsr {}, {}, {}", dest, a, b),
        Opcode::Shift,
    )
    .with_dest(dest)
    .with_src1(a)
    .with_src2(b)
}

pub fn asrv(dest: Reg, a: Reg, b: Reg) -> Instruction {
    Instruction::new(
        0x9AC0_2800 | rm(b) | rn(a) | rd(dest),
        format!("asr {}, {}, {}", dest, a, b),
        Opcode::Shift,
    )
    .with_dest(dest)
    .with_src1(a)
    .with_src2(b)
}

/// LSL by a constant via UBFM.
pub fn lsl_imm(dest: Reg, src: Reg, shift: u8) -> Instruction {
    let shift = shift as u32 & 63;
    let immr = (64 - shift) % 64;
    let imms = 63 - shift;
    Instruction::new(
        0xD340_0000 | (immr << 16) | (imms << 10) | rn(src) | rd(dest),
        format!("lsl {}, {}, #{}", dest, src, shift),
        Opcode::Shift,
    )
    .with_dest(dest)
    .with_src1(src)
    .with_imm(shift as i64)
}

/// LSR by a constant via UBFM.
pub fn lsr_imm(dest: Reg, src: Reg, shift: u8) -> Instruction {
    let shift = shift as u32 & 63;
    Instruction::new(
        0xD340_0000 | (shift << 16) | (63 << 10) | rn(src) | rd(dest),
        format!("lsr {}, {}, #{}", dest, src, shift),
        Opcode::Shift,
    )
    .with_dest(dest)
    .with_src1(src)
    .with_imm(shift as i64)
}

/// ASR by a constant via SBFM.
pub fn asr_imm(dest: Reg, src: Reg, shift: u8) -> Instruction {
    let shift = shift as u32 & 63;
    Instruction::new(
        0x9340_0000 | (shift << 16) | (63 << 10) | rn(src) | rd(dest),
        format!("asr {}, {}, #{}", dest, src, shift),
        Opcode::Shift,
    )
    .with_dest(dest)
    .with_src1(src)
    .with_imm(shift as i64)
}

/// UBFX: extract `width` bits starting at `lsb`.
pub fn ubfx(dest: Reg, src: Reg, lsb: u8, width: u8) -> Instruction {
    let lsb = lsb as u32 & 63;
    let imms = lsb + (width as u32).clamp(1, 64 - lsb) - 1;
    Instruction::new(
        0xD340_0000 | (lsb << 16) | (imms << 10) | rn(src) | rd(dest),
        format!("ubfx {}, {}, #{}, #{}", dest, src, lsb, width),
        Opcode::Ubfx,
    )
    .with_dest(dest)
    .with_src1(src)
}

// --- Compare and conditional set ---

pub fn cmp_reg(a: Reg, b: Reg) -> Instruction {
    Instruction::new(
        0xEB00_001F | rm(b) | rn(a),
        format!("cmp {}, {}", a, b),
        Opcode::CmpReg,
    )
    .with_src1(a)
    .with_src2(b)
}

pub fn cmp_imm(a: Reg, imm12: u32) -> CodegenResult<Instruction> {
    if imm12 > 0xFFF {
        return Err(CodegenError::ImmediateOverflow(imm12 as i64));
    }
    Ok(Instruction::new(
        0xF100_001F | (imm12 << 10) | rn(a),
        format!("cmp {}, #{}", a, imm12),
        Opcode::CmpImm,
    )
    .with_src1(a)
    .with_imm(imm12 as i64))
}

/// CSET: 1 on `cond`, else 0.
pub fn cset(dest: Reg, cond: Cond) -> Instruction {
    let encoding = 0x9A9F_07E0 | (cond.invert().encoding() << 12) | rd(dest);
    Instruction::new(
        encoding,
        format!("cset {}, {}", dest, cond.mnemonic()),
        Opcode::Cset,
    )
    .with_dest(dest)
    .with_cond(cond)
}

/// CSETM: all-ones on `cond`, else 0 — BCPL truth values.
pub fn csetm(dest: Reg, cond: Cond) -> Instruction {
    let encoding = 0xDA9F_03E0 | (cond.invert().encoding() << 12) | rd(dest);
    Instruction::new(
        encoding,
        format!("csetm {}, {}", dest, cond.mnemonic()),
        Opcode::Csetm,
    )
    .with_dest(dest)
    .with_cond(cond)
}

// --- Branches ---

pub fn b(label: &str) -> Instruction {
    Instruction::new(0x1400_0000, format!("b {}", label), Opcode::B)
        .with_relocation(Relocation::PcRel26, label)
}

pub fn b_cond(cond: Cond, label: &str) -> Instruction {
    Instruction::new(
        0x5400_0000 | cond.encoding(),
        format!("b.{} {}", cond.mnemonic(), label),
        Opcode::Bcond,
    )
    .with_cond(cond)
    .with_relocation(Relocation::PcRel19, label)
}

pub fn cbz(reg: Reg, label: &str) -> Instruction {
    Instruction::new(
        0xB400_0000 | rd(reg),
        format!("cbz {}, {}", reg, label),
        Opcode::Cbz,
    )
    .with_src1(reg)
    .with_relocation(Relocation::PcRel19, label)
}

pub fn cbnz(reg: Reg, label: &str) -> Instruction {
    Instruction::new(
        0xB500_0000 | rd(reg),
        format!("cbnz {}, {}", reg, label),
        Opcode::Cbnz,
    )
    .with_src1(reg)
    .with_relocation(Relocation::PcRel19, label)
}

pub fn bl(label: &str) -> Instruction {
    Instruction::new(0x9400_0000, format!("bl {}", label), Opcode::Bl)
        .with_relocation(Relocation::PcRel26, label)
}

pub fn blr(target: Reg) -> Instruction {
    Instruction::new(
        0xD63F_0000 | rn(target),
        format!("blr {}", target),
        Opcode::Blr,
    )
    .with_src1(target)
}

pub fn ret() -> Instruction {
    Instruction::new(0xD65F_03C0, "ret", Opcode::Ret)
}

pub fn brk(imm16: u16) -> Instruction {
    Instruction::new(
        0xD420_0000 | ((imm16 as u32) << 5),
        format!("brk #{:#x}", imm16),
        Opcode::Brk,
    )
    .with_imm(imm16 as i64)
}

pub fn nop() -> Instruction {
    Instruction::new(0xD503_201F, "nop", Opcode::Nop)
}

// --- Loads and stores ---

/// 64-bit load. Picks LDR (unsigned scaled) or LDUR (signed 9-bit) by
/// offset shape.
pub fn ldr(dest: Reg, base: Reg, offset: i32) -> CodegenResult<Instruction> {
    if offset >= 0 && offset % 8 == 0 && offset / 8 <= 0xFFF {
        let imm12 = (offset / 8) as u32;
        Ok(Instruction::new(
            0xF940_0000 | (imm12 << 10) | rn(base) | rd(dest),
            format!("ldr {}, [{}, #{}]", dest, base, offset),
            Opcode::Ldr,
        )
        .with_dest(dest)
        .with_mem(base, offset))
    } else if (-256..256).contains(&offset) {
        let imm9 = (offset as u32) & 0x1FF;
        Ok(Instruction::new(
            0xF840_0000 | (imm9 << 12) | rn(base) | rd(dest),
            format!("ldur {}, [{}, #{}]", dest, base, offset),
            Opcode::Ldr,
        )
        .with_dest(dest)
        .with_mem(base, offset))
    } else {
        Err(CodegenError::ImmediateOverflow(offset as i64))
    }
}

/// 64-bit store.
pub fn str(src: Reg, base: Reg, offset: i32) -> CodegenResult<Instruction> {
    if offset >= 0 && offset % 8 == 0 && offset / 8 <= 0xFFF {
        let imm12 = (offset / 8) as u32;
        Ok(Instruction::new(
            0xF900_0000 | (imm12 << 10) | rn(base) | rd(src),
            format!("str {}, [{}, #{}]", src, base, offset),
            Opcode::Str,
        )
        .with_src1(src)
        .with_mem(base, offset))
    } else if (-256..256).contains(&offset) {
        let imm9 = (offset as u32) & 0x1FF;
        Ok(Instruction::new(
            0xF800_0000 | (imm9 << 12) | rn(base) | rd(src),
            format!("stur {}, [{}, #{}]", src, base, offset),
            Opcode::Str,
        )
        .with_src1(src)
        .with_mem(base, offset))
    } else {
        Err(CodegenError::ImmediateOverflow(offset as i64))
    }
}

/// 32-bit load (characters). `dest` still names an X register; the W form
/// zero-extends into it.
pub fn ldr32(dest: Reg, base: Reg, offset: i32) -> CodegenResult<Instruction> {
    if offset >= 0 && offset % 4 == 0 && offset / 4 <= 0xFFF {
        let imm12 = (offset / 4) as u32;
        Ok(Instruction::new(
            0xB940_0000 | (imm12 << 10) | rn(base) | rd(dest),
            format!("ldr w{}, [{}, #{}]", dest.index(), base, offset),
            Opcode::Ldr,
        )
        .with_dest(dest)
        .with_mem(base, offset))
    } else {
        Err(CodegenError::ImmediateOverflow(offset as i64))
    }
}

pub fn str32(src: Reg, base: Reg, offset: i32) -> CodegenResult<Instruction> {
    if offset >= 0 && offset % 4 == 0 && offset / 4 <= 0xFFF {
        let imm12 = (offset / 4) as u32;
        Ok(Instruction::new(
            0xB900_0000 | (imm12 << 10) | rn(base) | rd(src),
            format!("str w{}, [{}, #{}]", src.index(), base, offset),
            Opcode::Str,
        )
        .with_src1(src)
        .with_mem(base, offset))
    } else {
        Err(CodegenError::ImmediateOverflow(offset as i64))
    }
}

/// Double-precision load.
pub fn ldr_fp(dest: Reg, base: Reg, offset: i32) -> CodegenResult<Instruction> {
    if offset >= 0 && offset % 8 == 0 && offset / 8 <= 0xFFF {
        let imm12 = (offset / 8) as u32;
        Ok(Instruction::new(
            0xFD40_0000 | (imm12 << 10) | rn(base) | rd(dest),
            format!("ldr {}, [{}, #{}]", dest, base, offset),
            Opcode::LdrFp,
        )
        .with_dest(dest)
        .with_mem(base, offset))
    } else if (-256..256).contains(&offset) {
        let imm9 = (offset as u32) & 0x1FF;
        Ok(Instruction::new(
            0xFC40_0000 | (imm9 << 12) | rn(base) | rd(dest),
            format!("ldur {}, [{}, #{}]", dest, base, offset),
            Opcode::LdrFp,
        )
        .with_dest(dest)
        .with_mem(base, offset))
    } else {
        Err(CodegenError::ImmediateOverflow(offset as i64))
    }
}

pub fn str_fp(src: Reg, base: Reg, offset: i32) -> CodegenResult<Instruction> {
    if offset >= 0 && offset % 8 == 0 && offset / 8 <= 0xFFF {
        let imm12 = (offset / 8) as u32;
        Ok(Instruction::new(
            0xFD00_0000 | (imm12 << 10) | rn(base) | rd(src),
            format!("str {}, [{}, #{}]", src, base, offset),
            Opcode::StrFp,
        )
        .with_src1(src)
        .with_mem(base, offset))
    } else if (-256..256).contains(&offset) {
        let imm9 = (offset as u32) & 0x1FF;
        Ok(Instruction::new(
            0xFC00_0000 | (imm9 << 12) | rn(base) | rd(src),
            format!("stur {}, [{}, #{}]", src, base, offset),
            Opcode::StrFp,
        )
        .with_src1(src)
        .with_mem(base, offset))
    } else {
        Err(CodegenError::ImmediateOverflow(offset as i64))
    }
}

/// Register-offset 64-bit load: `ldr dest, [base, index, lsl #shift]`.
pub fn ldr_reg_offset(dest: Reg, base: Reg, index: Reg, shift: u8) -> Instruction {
    let s = if shift > 0 { 1 << 12 } else { 0 };
    Instruction::new(
        0xF860_6800 | s | rm(index) | rn(base) | rd(dest),
        format!("ldr {}, [{}, {}, lsl #{}]", dest, base, index, shift),
        Opcode::Ldr,
    )
    .with_dest(dest)
    .with_src1(base)
    .with_src2(index)
}

pub fn str_reg_offset(src: Reg, base: Reg, index: Reg, shift: u8) -> Instruction {
    let s = if shift > 0 { 1 << 12 } else { 0 };
    Instruction::new(
        0xF820_6800 | s | rm(index) | rn(base) | rd(src),
        format!("str {}, [{}, {}, lsl #{}]", src, base, index, shift),
        Opcode::Str,
    )
    .with_src1(src)
    .with_src2(index)
}

// --- Pairs (prologue/epilogue) ---

/// `stp a, b, [base, #offset]!` (pre-index).
pub fn stp_pre(a: Reg, b: Reg, base: Reg, offset: i32) -> Instruction {
    let imm7 = ((offset / 8) as u32) & 0x7F;
    Instruction::new(
        0xA980_0000 | (imm7 << 15) | (b.index() << 10) | rn(base) | rd(a),
        format!("stp {}, {}, [{}, #{}]!", a, b, base, offset),
        Opcode::Stp,
    )
    .with_mem(base, offset)
}

/// `ldp a, b, [base], #offset` (post-index).
pub fn ldp_post(a: Reg, b: Reg, base: Reg, offset: i32) -> Instruction {
    let imm7 = ((offset / 8) as u32) & 0x7F;
    Instruction::new(
        0xA8C0_0000 | (imm7 << 15) | (b.index() << 10) | rn(base) | rd(a),
        format!("ldp {}, {}, [{}], #{}", a, b, base, offset),
        Opcode::Ldp,
    )
    .with_mem(base, offset)
}

/// `stp a, b, [base, #offset]` (signed offset, no writeback). FP pairs use
/// the SIMD encoding.
pub fn stp_offset(a: Reg, b: Reg, base: Reg, offset: i32) -> Instruction {
    let imm7 = ((offset / 8) as u32) & 0x7F;
    let base_bits = if a.is_fp() { 0x6D00_0000 } else { 0xA900_0000 };
    Instruction::new(
        base_bits | (imm7 << 15) | (b.index() << 10) | rn(base) | rd(a),
        format!("stp {}, {}, [{}, #{}]", a, b, base, offset),
        Opcode::Stp,
    )
    .with_mem(base, offset)
}

pub fn ldp_offset(a: Reg, b: Reg, base: Reg, offset: i32) -> Instruction {
    let imm7 = ((offset / 8) as u32) & 0x7F;
    let base_bits = if a.is_fp() { 0x6D40_0000 } else { 0xA940_0000 };
    Instruction::new(
        base_bits | (imm7 << 15) | (b.index() << 10) | rn(base) | rd(a),
        format!("ldp {}, {}, [{}, #{}]", a, b, base, offset),
        Opcode::Ldp,
    )
    .with_mem(base, offset)
}

// --- Floating point ---

pub fn scvtf(dest: Reg, src: Reg) -> Instruction {
    Instruction::new(
        0x9E62_0000 | rn(src) | rd(dest),
        format!("scvtf {}, {}", dest, src),
        Opcode::Scvtf,
    )
    .with_dest(dest)
    .with_src1(src)
}

pub fn fcvtzs(dest: Reg, src: Reg) -> Instruction {
    Instruction::new(
        0x9E78_0000 | rn(src) | rd(dest),
        format!("fcvtzs {}, {}", dest, src),
        Opcode::Fcvtzs,
    )
    .with_dest(dest)
    .with_src1(src)
}

/// FMOV between banks; direction follows the operand kinds.
pub fn fmov(dest: Reg, src: Reg) -> Instruction {
    let encoding = match (dest.is_fp(), src.is_fp()) {
        (true, false) => 0x9E67_0000 | rn(src) | rd(dest),
        (false, true) => 0x9E66_0000 | rn(src) | rd(dest),
        (true, true) => 0x1E60_4000 | rn(src) | rd(dest),
        (false, false) => unreachable!("fmov between two GP registers"),
    };
    Instruction::new(encoding, format!("fmov {}, {}", dest, src), Opcode::Fmov)
        .with_dest(dest)
        .with_src1(src)
}

pub fn fadd(dest: Reg, a: Reg, b: Reg) -> Instruction {
    Instruction::new(
        0x1E60_2800 | rm(b) | rn(a) | rd(dest),
        format!("fadd {}, {}, {}", dest, a, b),
        Opcode::Fadd,
    )
    .with_dest(dest)
    .with_src1(a)
    .with_src2(b)
}

pub fn fsub(dest: Reg, a: Reg, b: Reg) -> Instruction {
    Instruction::new(
        0x1E60_3800 | rm(b) | rn(a) | rd(dest),
        format!("fsub {}, {}, {}", dest, a, b),
        Opcode::Fsub,
    )
    .with_dest(dest)
    .with_src1(a)
    .with_src2(b)
}

pub fn fmul(dest: Reg, a: Reg, b: Reg) -> Instruction {
    Instruction::new(
        0x1E60_0800 | rm(b) | rn(a) | rd(dest),
        format!("fmul {}, {}, {}", dest, a, b),
        Opcode::Fmul,
    )
    .with_dest(dest)
    .with_src1(a)
    .with_src2(b)
}

pub fn fdiv(dest: Reg, a: Reg, b: Reg) -> Instruction {
    Instruction::new(
        0x1E60_1800 | rm(b) | rn(a) | rd(dest),
        format!("fdiv {}, {}, {}", dest, a, b),
        Opcode::Fdiv,
    )
    .with_dest(dest)
    .with_src1(a)
    .with_src2(b)
}

pub fn fcmp(a: Reg, b: Reg) -> Instruction {
    Instruction::new(
        0x1E60_2000 | rm(b) | rn(a),
        format!("fcmp {}, {}", a, b),
        Opcode::Fcmp,
    )
    .with_src1(a)
    .with_src2(b)
}

pub fn fneg(dest: Reg, src: Reg) -> Instruction {
    Instruction::new(
        0x1E61_4000 | rn(src) | rd(dest),
        format!("fneg {}, {}", dest, src),
        Opcode::Fneg,
    )
    .with_dest(dest)
    .with_src1(src)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_encodings() {
        assert_eq!(mov_reg(Reg::X(0), Reg::X(1)).encoding, 0xAA01_03E0);
        assert_eq!(movz(Reg::X(0), 1, 0).encoding, 0xD280_0020);
        assert_eq!(ret().encoding, 0xD65F_03C0);
        assert_eq!(nop().encoding, 0xD503_201F);
        assert_eq!(brk(1).encoding, 0xD420_0020);
        assert_eq!(
            stp_pre(Reg::FP, Reg::LR, Reg::Sp, -16).encoding,
            0xA9BF_7BFD
        );
        assert_eq!(
            ldp_post(Reg::FP, Reg::LR, Reg::Sp, 16).encoding,
            0xA8C1_7BFD
        );
    }

    #[test]
    fn test_arithmetic_encodings() {
        assert_eq!(add_imm(Reg::X(0), Reg::X(1), 4).unwrap().encoding, 0x9100_1020);
        assert_eq!(sub_imm(Reg::Sp, Reg::Sp, 16).unwrap().encoding, 0xD100_43FF);
        assert_eq!(mul(Reg::X(0), Reg::X(1), Reg::X(2)).encoding, 0x9B02_7C20);
        assert_eq!(sdiv(Reg::X(0), Reg::X(1), Reg::X(2)).encoding, 0x9AC2_0C20);
        assert_eq!(
            msub(Reg::X(0), Reg::X(1), Reg::X(2), Reg::X(3)).encoding,
            0x9B02_8C20
        );
    }

    #[test]
    fn test_memory_encodings() {
        assert_eq!(ldr(Reg::X(0), Reg::FP, 0).unwrap().encoding, 0xF940_03A0);
        assert_eq!(str(Reg::X(0), Reg::Sp, 0).unwrap().encoding, 0xF900_03E0);
        // Negative offsets pick the LDUR form.
        let neg = ldr(Reg::X(0), Reg::FP, -16).unwrap();
        assert_eq!(neg.encoding & 0xFFC0_0000, 0xF840_0000);
        assert!(neg.assembly.starts_with("ldur"));
        // Out-of-range offsets are rejected, not silently truncated.
        assert!(ldr(Reg::X(0), Reg::FP, -512).is_err());
    }

    #[test]
    fn test_float_encodings() {
        assert_eq!(fadd(Reg::D(0), Reg::D(1), Reg::D(2)).encoding, 0x1E62_2820);
        assert_eq!(fcmp(Reg::D(0), Reg::D(1)).encoding, 0x1E61_2000);
        assert_eq!(scvtf(Reg::D(0), Reg::X(0)).encoding, 0x9E62_0000);
        assert_eq!(fcvtzs(Reg::X(0), Reg::D(0)).encoding, 0x9E78_0000);
        assert_eq!(fmov(Reg::X(0), Reg::D(0)).encoding, 0x9E66_0000);
        assert_eq!(fmov(Reg::D(0), Reg::X(0)).encoding, 0x9E67_0000);
    }

    #[test]
    fn test_cset_uses_inverted_condition() {
        // cset x0, eq == csinc x0, xzr, xzr, ne
        assert_eq!(cset(Reg::X(0), Cond::Eq).encoding, 0x9A9F_17E0);
    }

    #[test]
    fn test_load_integer_sequences() {
        let small = load_integer(Reg::X(0), 42);
        assert_eq!(small.len(), 1);
        assert_eq!(small[0].opcode, Opcode::Movz);

        let large = load_integer(Reg::X(0), 0x1_0000);
        assert_eq!(large.len(), 2);
        assert_eq!(large[1].opcode, Opcode::Movk);

        let negative = load_integer(Reg::X(0), -1);
        assert_eq!(negative.len(), 4);
    }

    #[test]
    fn test_absolute_address_sequence_is_tagged() {
        let seq = load_address_absolute(Reg::X(28), "L__data_segment_base");
        assert_eq!(seq.len(), 4);
        for instr in &seq {
            assert_eq!(instr.jit_attr, JitAttr::JitAddress);
            assert!(instr.target_label.is_some());
        }
        assert_eq!(seq[0].relocation, Relocation::MovzMovk0);
        assert_eq!(seq[3].relocation, Relocation::MovzMovk48);
    }

    #[test]
    fn test_branch_relocations() {
        assert_eq!(b("L1").relocation, Relocation::PcRel26);
        assert_eq!(bl("F").relocation, Relocation::PcRel26);
        assert_eq!(b_cond(Cond::Eq, "L1").relocation, Relocation::PcRel19);
        assert_eq!(cbz(Reg::X(0), "L1").relocation, Relocation::PcRel19);
    }

    #[test]
    fn test_shift_immediates() {
        // lsl x0, x1, #3 == ubfm x0, x1, #61, #60
        let lsl = lsl_imm(Reg::X(0), Reg::X(1), 3);
        assert_eq!(lsl.encoding, 0xD340_0000 | (61 << 16) | (60 << 10) | (1 << 5));
        let lsr = lsr_imm(Reg::X(0), Reg::X(1), 3);
        assert_eq!(lsr.encoding, 0xD340_0000 | (3 << 16) | (63 << 10) | (1 << 5));
    }
}
