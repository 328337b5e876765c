//! Per-function call-frame layout and prologue/epilogue emission.
//!
//! The frame is reserved in one piece below the saved frame-pointer pair:
//!
//! ```text
//!   fp + 8       saved x30
//!   fp + 0       saved x29      <- x29
//!   fp - 8       stack canary (when enabled)
//!   ...          saved callee-saved registers
//!   sp + 8(n+s)  ...
//!   sp + 8n      spill slots
//!   sp + 0       parameter homes and locals   <- sp after the prologue
//! ```
//!
//! Named slots sit at the bottom so their SP-relative offsets are fixed as
//! soon as `assign_slots` runs — before the body is generated. The save
//! area and total frame size are only settled by `finalize_layout`, after
//! code generation has recorded every callee-saved register the body
//! touches; the prologue is generated then and spliced in front of the
//! body. The total adjustment is always a multiple of 16 bytes.

use crate::encoder;
use crate::instr::Instruction;
use crate::reg::Reg;
use crate::{CodegenError, CodegenResult};
use bcpl_ast::VarType;
use std::collections::BTreeMap;

/// The word written at prologue and checked at epilogue.
pub const STACK_CANARY: u64 = 0xCAFE_F00D_D15C_0BAD;

/// Immediate for the BRK raised on canary mismatch.
pub const CANARY_BRK_CODE: u16 = 0xCA;

#[derive(Debug)]
pub struct CallFrameManager {
    function_name: String,
    parameters: Vec<(String, VarType)>,
    locals: Vec<(String, VarType)>,
    reserved_spill_slots: usize,
    used_spill_slots: usize,
    callee_saved: Vec<Reg>,
    enable_canary: bool,

    laid_out: bool,
    finalized: bool,
    slot_offsets: BTreeMap<String, usize>,
    named_slots: usize,
    frame_size: u32,
}

impl CallFrameManager {
    pub fn new(function_name: &str, enable_canary: bool) -> Self {
        CallFrameManager {
            function_name: function_name.to_string(),
            parameters: Vec::new(),
            locals: Vec::new(),
            reserved_spill_slots: 0,
            used_spill_slots: 0,
            callee_saved: Vec::new(),
            enable_canary,
            laid_out: false,
            finalized: false,
            slot_offsets: BTreeMap::new(),
            named_slots: 0,
            frame_size: 0,
        }
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Register a parameter, in call order.
    pub fn add_parameter(&mut self, name: &str, var_type: VarType) {
        self.parameters.push((name.to_string(), var_type));
    }

    /// Register a local distinct from the parameters.
    pub fn add_local(&mut self, name: &str, var_type: VarType) {
        if self.parameters.iter().any(|(n, _)| n == name)
            || self.locals.iter().any(|(n, _)| n == name)
        {
            return;
        }
        self.locals.push((name.to_string(), var_type));
    }

    /// Preallocate spill capacity from the register-pressure heuristic:
    /// `max_live_variables - |variable registers|`, floored at zero.
    pub fn reserve_spill_slots(&mut self, max_live_variables: usize, variable_regs: usize) {
        self.reserved_spill_slots = max_live_variables.saturating_sub(variable_regs);
    }

    /// Declare that a callee-saved register is used and must be preserved.
    /// Legal until the layout is finalized.
    pub fn force_save_register(&mut self, reg: Reg) {
        debug_assert!(!self.finalized, "save list frozen by finalize_layout");
        if !self.callee_saved.contains(&reg) {
            self.callee_saved.push(reg);
        }
    }

    pub fn callee_saved(&self) -> &[Reg] {
        &self.callee_saved
    }

    /// Fix the SP-relative offset of every named slot. Runs before code
    /// generation; slot offsets never move afterwards.
    pub fn assign_slots(&mut self) {
        let mut next = 0usize;
        for (name, _) in &self.parameters {
            self.slot_offsets.insert(name.clone(), next);
            next += 1;
        }
        for (name, _) in &self.locals {
            self.slot_offsets.insert(name.clone(), next);
            next += 1;
        }
        self.named_slots = next;
        self.laid_out = true;
    }

    /// Settle the save area and total frame size. Runs after the body has
    /// been generated, when the callee-saved list is complete.
    pub fn finalize_layout(&mut self) {
        debug_assert!(self.laid_out, "assign_slots must run first");
        let save_words = self.callee_saved.len();
        let canary_words = if self.enable_canary { 1 } else { 0 };
        let total_words =
            self.named_slots + self.reserved_spill_slots + save_words + canary_words;
        self.frame_size = (((total_words * 8) + 15) & !15) as u32;
        self.finalized = true;
        log::trace!(
            "frame {}: {} named slots, {} spill, {} saves, {} bytes",
            self.function_name,
            self.named_slots,
            self.reserved_spill_slots,
            save_words,
            self.frame_size
        );
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// SP-relative byte offset of a named slot, creating a spill slot from
    /// the reserved pool for names first seen after layout.
    fn sp_offset_of(&mut self, name: &str) -> CodegenResult<i32> {
        if !self.laid_out {
            return Err(CodegenError::FrameNotLaidOut(name.to_string()));
        }
        if let Some(&slot) = self.slot_offsets.get(name) {
            return Ok((slot * 8) as i32);
        }
        // Spilled temporaries land in the reserved area above the named
        // slots.
        if self.used_spill_slots >= self.reserved_spill_slots {
            return Err(CodegenError::Internal(format!(
                "spill slots exhausted in {} (wanted one for '{}')",
                self.function_name, name
            )));
        }
        let slot = self.named_slots + self.used_spill_slots;
        self.used_spill_slots += 1;
        self.slot_offsets.insert(name.to_string(), slot);
        Ok((slot * 8) as i32)
    }

    /// SP-relative offset of callee-saved save index `j`.
    fn save_sp_offset(&self, j: usize) -> i32 {
        ((self.named_slots + self.reserved_spill_slots + j) * 8) as i32
    }

    /// The final fp-relative offset of a slot. Faults when asked before the
    /// layout is final.
    pub fn offset_of(&mut self, name: &str) -> CodegenResult<i32> {
        if !self.finalized {
            return Err(CodegenError::FrameNotLaidOut(name.to_string()));
        }
        let sp_offset = self.sp_offset_of(name)?;
        Ok(sp_offset - self.frame_size as i32)
    }

    pub fn has_slot(&self, name: &str) -> bool {
        self.slot_offsets.contains_key(name)
    }

    /// Store a register into a named slot.
    pub fn store_to_slot(&mut self, name: &str, reg: Reg) -> CodegenResult<Instruction> {
        let offset = self.sp_offset_of(name)?;
        if reg.is_fp() {
            encoder::str_fp(reg, Reg::Sp, offset)
        } else {
            encoder::str(reg, Reg::Sp, offset)
        }
    }

    /// Load a named slot into a register.
    pub fn load_from_slot(&mut self, name: &str, reg: Reg) -> CodegenResult<Instruction> {
        let offset = self.sp_offset_of(name)?;
        if reg.is_fp() {
            encoder::ldr_fp(reg, Reg::Sp, offset)
        } else {
            encoder::ldr(reg, Reg::Sp, offset)
        }
    }

    /// Address of a slot: `dest := sp + offset`, which equals the
    /// fp-relative location once the frame is up.
    pub fn slot_address(&mut self, name: &str, dest: Reg) -> CodegenResult<Instruction> {
        let sp_offset = self.sp_offset_of(name)?;
        encoder::add_imm(dest, Reg::Sp, sp_offset as u32)
    }

    /// Emit the prologue. The layout must be finalized.
    pub fn generate_prologue(&mut self) -> CodegenResult<Vec<Instruction>> {
        if !self.finalized {
            return Err(CodegenError::FrameNotLaidOut(self.function_name.clone()));
        }
        let mut out = Vec::new();
        out.push(encoder::stp_pre(Reg::FP, Reg::LR, Reg::Sp, -16));
        out.push(encoder::mov_reg(Reg::FP, Reg::Sp));

        let mut remaining = self.frame_size;
        while remaining > 0 {
            let chunk = remaining.min(0xFF0);
            out.push(encoder::sub_imm(Reg::Sp, Reg::Sp, chunk)?);
            remaining -= chunk;
        }

        // Callee-saved registers, paired where banks line up.
        let saves = self.callee_saved.clone();
        let mut i = 0;
        while i < saves.len() {
            let offset = self.save_sp_offset(i);
            if i + 1 < saves.len() && saves[i].is_fp() == saves[i + 1].is_fp() {
                out.push(encoder::stp_offset(saves[i], saves[i + 1], Reg::Sp, offset));
                i += 2;
            } else {
                out.push(if saves[i].is_fp() {
                    encoder::str_fp(saves[i], Reg::Sp, offset)?
                } else {
                    encoder::str(saves[i], Reg::Sp, offset)?
                });
                i += 1;
            }
        }

        if self.enable_canary {
            // The canary sits just under the saved fp pair.
            out.extend(encoder::load_integer(Reg::X(16), STACK_CANARY as i64));
            out.push(encoder::str(
                Reg::X(16),
                Reg::Sp,
                self.frame_size as i32 - 8,
            )?);
        }
        Ok(out)
    }

    /// Emit the epilogue, the mirror of the prologue. `ok_label` names the
    /// continuation after a passing canary check.
    pub fn generate_epilogue(&mut self, ok_label: &str) -> CodegenResult<Vec<Instruction>> {
        if !self.finalized {
            return Err(CodegenError::FrameNotLaidOut(self.function_name.clone()));
        }
        let mut out = Vec::new();

        if self.enable_canary {
            out.push(encoder::ldr(
                Reg::X(16),
                Reg::Sp,
                self.frame_size as i32 - 8,
            )?);
            out.extend(encoder::load_integer(Reg::X(17), STACK_CANARY as i64));
            out.push(encoder::cmp_reg(Reg::X(16), Reg::X(17)));
            out.push(encoder::b_cond(crate::reg::Cond::Eq, ok_label));
            out.push(encoder::brk(CANARY_BRK_CODE));
            out.push(Instruction::label(ok_label, crate::instr::Segment::Code));
        }

        let saves = self.callee_saved.clone();
        let mut i = 0;
        while i < saves.len() {
            let offset = self.save_sp_offset(i);
            if i + 1 < saves.len() && saves[i].is_fp() == saves[i + 1].is_fp() {
                out.push(encoder::ldp_offset(saves[i], saves[i + 1], Reg::Sp, offset));
                i += 2;
            } else {
                out.push(if saves[i].is_fp() {
                    encoder::ldr_fp(saves[i], Reg::Sp, offset)?
                } else {
                    encoder::ldr(saves[i], Reg::Sp, offset)?
                });
                i += 1;
            }
        }

        // Restore sp from the frame pointer, then the fp/lr pair.
        out.push(encoder::add_imm(Reg::Sp, Reg::FP, 0)?);
        out.push(encoder::ldp_post(Reg::FP, Reg::LR, Reg::Sp, 16));
        out.push(encoder::ret());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn laid_out_frame() -> CallFrameManager {
        let mut frame = CallFrameManager::new("F", false);
        frame.add_parameter("a", VarType::INTEGER);
        frame.add_parameter("b", VarType::INTEGER);
        frame.add_local("t", VarType::INTEGER);
        frame.reserve_spill_slots(6, 4);
        frame.assign_slots();
        frame
    }

    #[test]
    fn test_offset_before_layout_is_fatal() {
        let mut frame = CallFrameManager::new("F", false);
        frame.add_local("x", VarType::INTEGER);
        assert!(matches!(
            frame.offset_of("x"),
            Err(CodegenError::FrameNotLaidOut(_))
        ));
        // Even with slots assigned, the fp-relative form needs the final
        // frame size.
        frame.assign_slots();
        assert!(matches!(
            frame.offset_of("x"),
            Err(CodegenError::FrameNotLaidOut(_))
        ));
    }

    #[test]
    fn test_frame_size_is_16_byte_multiple() {
        let mut frame = laid_out_frame();
        frame.finalize_layout();
        assert_eq!(frame.frame_size() % 16, 0);
        // 3 named + 2 reserved spill slots = 5 words -> 48 bytes.
        assert_eq!(frame.frame_size(), 48);
    }

    #[test]
    fn test_slot_offsets_stable_across_finalize() {
        let mut frame = laid_out_frame();
        let before = frame.sp_offset_of("t").unwrap();
        frame.force_save_register(Reg::X(20));
        frame.force_save_register(Reg::X(21));
        frame.finalize_layout();
        assert_eq!(frame.sp_offset_of("t").unwrap(), before);
    }

    #[test]
    fn test_fp_relative_offsets_are_negative_and_distinct() {
        let mut frame = laid_out_frame();
        frame.finalize_layout();
        let a = frame.offset_of("a").unwrap();
        let b = frame.offset_of("b").unwrap();
        let t = frame.offset_of("t").unwrap();
        assert!(a < 0 && b < 0 && t < 0);
        assert_ne!(a, b);
        assert_ne!(b, t);
    }

    #[test]
    fn test_spill_slot_pool() {
        let mut frame = laid_out_frame();
        // Two reserved slots: two unknown names succeed, the third fails.
        assert!(frame.store_to_slot("_spill_a", Reg::X(20)).is_ok());
        assert!(frame.store_to_slot("_spill_b", Reg::X(21)).is_ok());
        assert!(frame.store_to_slot("_spill_c", Reg::X(22)).is_err());
        // Re-requesting an assigned slot is stable.
        let first = frame.sp_offset_of("_spill_a").unwrap();
        assert_eq!(first, frame.sp_offset_of("_spill_a").unwrap());
    }

    #[test]
    fn test_prologue_epilogue_shape() {
        let mut frame = CallFrameManager::new("F", false);
        frame.add_local("x", VarType::INTEGER);
        frame.assign_slots();
        frame.force_save_register(Reg::X(20));
        frame.force_save_register(Reg::X(21));
        frame.finalize_layout();

        let prologue = frame.generate_prologue().unwrap();
        // stp fp/lr, mov fp, sub sp, stp saves.
        assert_eq!(prologue[0].encoding, 0xA9BF_7BFD);
        assert!(prologue.iter().any(|i| i.assembly.starts_with("stp x20, x21")));

        let epilogue = frame.generate_epilogue("L_F_canary_ok").unwrap();
        assert_eq!(epilogue.last().unwrap().encoding, 0xD65F_03C0); // ret
        assert_eq!(epilogue[epilogue.len() - 2].encoding, 0xA8C1_7BFD); // ldp
    }

    #[test]
    fn test_canary_write_and_check() {
        let mut frame = CallFrameManager::new("F", true);
        frame.add_local("x", VarType::INTEGER);
        frame.assign_slots();
        frame.finalize_layout();

        let prologue = frame.generate_prologue().unwrap();
        assert!(prologue.iter().any(|i| i.assembly.starts_with("str x16")));

        let epilogue = frame.generate_epilogue("L_F_canary_ok").unwrap();
        assert!(epilogue.iter().any(|i| i.opcode == crate::instr::Opcode::Brk));
        assert!(epilogue.iter().any(|i| i.is_label_definition));
    }

    #[test]
    fn test_parameters_before_locals_in_layout() {
        let mut frame = laid_out_frame();
        // Parameters are laid out first, at the bottom of the frame.
        let a = frame.sp_offset_of("a").unwrap();
        let t = frame.sp_offset_of("t").unwrap();
        assert!(a < t, "parameter slot {} should sit below local {}", a, t);
        assert_eq!(a, 0);
    }

    #[test]
    fn test_prologue_requires_finalized_layout() {
        let mut frame = CallFrameManager::new("F", false);
        frame.assign_slots();
        assert!(frame.generate_prologue().is_err());
        frame.finalize_layout();
        assert!(frame.generate_prologue().is_ok());
    }
}
