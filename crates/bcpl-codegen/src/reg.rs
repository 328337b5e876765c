//! Registers, condition codes and the register manager.
//!
//! The manager keeps six pools: general-purpose scratch and variable
//! registers, their floating-point counterparts, and the vector pair. The
//! variable pools are callee-saved; scratch registers are caller-saved and
//! never bound to a variable. Scratch and spillable acquisitions return
//! distinct handle types so a scratch register can never be released into
//! the variable pool by mistake.

use crate::frame::CallFrameManager;
use crate::instr::Instruction;
use crate::{CodegenError, CodegenResult};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// One machine register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reg {
    /// General-purpose Xn.
    X(u8),
    /// The stack pointer (encodes as 31 in addressing contexts).
    Sp,
    /// The zero register (encodes as 31 in operand contexts).
    Xzr,
    /// Double-precision Dn.
    D(u8),
    /// 128-bit vector Vn.
    V(u8),
}

impl Reg {
    pub const FP: Reg = Reg::X(29);
    pub const LR: Reg = Reg::X(30);
    /// Data-segment base for global access and the runtime table.
    pub const DATA_BASE: Reg = Reg::X(28);
    /// Runtime function-pointer table base.
    pub const RUNTIME_TABLE: Reg = Reg::X(19);

    /// The 5-bit encoding index.
    pub fn index(self) -> u32 {
        match self {
            Reg::X(n) | Reg::D(n) | Reg::V(n) => n as u32,
            Reg::Sp | Reg::Xzr => 31,
        }
    }

    pub fn is_fp(self) -> bool {
        matches!(self, Reg::D(_))
    }

    pub fn is_vector(self) -> bool {
        matches!(self, Reg::V(_))
    }

    /// Caller-saved under the AArch64 procedure call standard.
    pub fn is_caller_saved(self) -> bool {
        match self {
            Reg::X(n) => n <= 18,
            Reg::D(n) => !(8..=15).contains(&n),
            Reg::V(n) => !(8..=15).contains(&n),
            Reg::Sp | Reg::Xzr => false,
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::X(n) => write!(f, "x{}", n),
            Reg::Sp => write!(f, "sp"),
            Reg::Xzr => write!(f, "xzr"),
            Reg::D(n) => write!(f, "d{}", n),
            Reg::V(n) => write!(f, "v{}", n),
        }
    }
}

/// AArch64 condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Mi,
    Pl,
    Ge,
    Lt,
    Gt,
    Le,
}

impl Cond {
    pub fn encoding(self) -> u32 {
        match self {
            Cond::Eq => 0b0000,
            Cond::Ne => 0b0001,
            Cond::Mi => 0b0100,
            Cond::Pl => 0b0101,
            Cond::Ge => 0b1010,
            Cond::Lt => 0b1011,
            Cond::Gt => 0b1100,
            Cond::Le => 0b1101,
        }
    }

    pub fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Mi => Cond::Pl,
            Cond::Pl => Cond::Mi,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Mi => "mi",
            Cond::Pl => "pl",
            Cond::Ge => "ge",
            Cond::Lt => "lt",
            Cond::Gt => "gt",
            Cond::Le => "le",
        }
    }
}

/// GP scratch pool: temporaries only, caller-saved.
pub const SCRATCH_REGS: [Reg; 6] = [
    Reg::X(10),
    Reg::X(11),
    Reg::X(12),
    Reg::X(13),
    Reg::X(14),
    Reg::X(15),
];

/// Standard GP variable pool (callee-saved, X19/X28 reserved).
pub const VARIABLE_REGS: [Reg; 8] = [
    Reg::X(20),
    Reg::X(21),
    Reg::X(22),
    Reg::X(23),
    Reg::X(24),
    Reg::X(25),
    Reg::X(26),
    Reg::X(27),
];

/// Extended GP variable pool: when a function never touches globals or the
/// runtime, X19 and X28 are free for variables too.
pub const EXTENDED_VARIABLE_REGS: [Reg; 10] = [
    Reg::X(20),
    Reg::X(21),
    Reg::X(22),
    Reg::X(23),
    Reg::X(24),
    Reg::X(25),
    Reg::X(26),
    Reg::X(27),
    Reg::X(19),
    Reg::X(28),
];

/// FP scratch pool (caller-saved, clear of the D0-D7 argument registers).
pub const FP_SCRATCH_REGS: [Reg; 6] = [
    Reg::D(16),
    Reg::D(17),
    Reg::D(18),
    Reg::D(19),
    Reg::D(20),
    Reg::D(21),
];

/// FP variable pool D8-D15 (callee-saved).
pub const FP_VARIABLE_REGS: [Reg; 8] = [
    Reg::D(8),
    Reg::D(9),
    Reg::D(10),
    Reg::D(11),
    Reg::D(12),
    Reg::D(13),
    Reg::D(14),
    Reg::D(15),
];

/// Vector scratch pool: V0-V7 and V16-V31 are caller-saved.
pub const VEC_SCRATCH_REGS: [Reg; 8] = [
    Reg::V(0),
    Reg::V(1),
    Reg::V(2),
    Reg::V(3),
    Reg::V(4),
    Reg::V(5),
    Reg::V(6),
    Reg::V(7),
];

/// Vector variable pool V8-V15 (callee-saved low halves).
pub const VEC_VARIABLE_REGS: [Reg; 8] = [
    Reg::V(8),
    Reg::V(9),
    Reg::V(10),
    Reg::V(11),
    Reg::V(12),
    Reg::V(13),
    Reg::V(14),
    Reg::V(15),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegStatus {
    #[default]
    Free,
    InUseVariable,
    InUseScratch,
    InUseRoutineAddr,
    InUseDataBase,
}

#[derive(Debug, Clone, Default)]
pub struct RegisterInfo {
    pub status: RegStatus,
    pub bound_to: Option<String>,
    pub dirty: bool,
}

/// Handle for a scratch register. Released with
/// [`RegisterManager::release_scratch`].
#[derive(Debug)]
pub struct ScratchReg(pub Reg);

/// Handle for a spillable temporary from a variable pool. Released with
/// [`RegisterManager::release_temp`].
#[derive(Debug)]
pub struct TempReg(pub Reg);

/// Per-function register bookkeeping. `reset_for_new_function` must be
/// called between functions.
#[derive(Debug)]
pub struct RegisterManager {
    registers: BTreeMap<Reg, RegisterInfo>,
    variable_to_reg: FxHashMap<String, Reg>,
    lru: VecDeque<Reg>,
    fp_lru: VecDeque<Reg>,
    active_variable_pool: Vec<Reg>,
    spilled: FxHashSet<String>,
    /// Every register written since the last reset — the prologue must
    /// save the callee-saved ones.
    touched: BTreeSet<Reg>,
}

impl Default for RegisterManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterManager {
    pub fn new() -> Self {
        let mut manager = RegisterManager {
            registers: BTreeMap::new(),
            variable_to_reg: FxHashMap::default(),
            lru: VecDeque::new(),
            fp_lru: VecDeque::new(),
            active_variable_pool: VARIABLE_REGS.to_vec(),
            spilled: FxHashSet::default(),
            touched: BTreeSet::new(),
        };
        manager.initialize();
        manager
    }

    fn initialize(&mut self) {
        self.registers.clear();
        for reg in SCRATCH_REGS
            .iter()
            .chain(EXTENDED_VARIABLE_REGS.iter())
            .chain(FP_SCRATCH_REGS.iter())
            .chain(FP_VARIABLE_REGS.iter())
            .chain(VEC_SCRATCH_REGS.iter())
            .chain(VEC_VARIABLE_REGS.iter())
        {
            self.registers.insert(*reg, RegisterInfo::default());
        }
    }

    /// Select the active pools for a new function and wipe all state.
    /// Functions that touch globals or the runtime keep X28 (data base) and
    /// X19 (runtime table) reserved; the rest get the extended pool.
    pub fn reset_for_new_function(&mut self, needs_data_base: bool) {
        self.initialize();
        self.variable_to_reg.clear();
        self.lru.clear();
        self.fp_lru.clear();
        self.spilled.clear();
        self.touched.clear();
        if needs_data_base {
            self.active_variable_pool = VARIABLE_REGS.to_vec();
            self.registers.get_mut(&Reg::DATA_BASE).unwrap().status = RegStatus::InUseDataBase;
            self.registers.get_mut(&Reg::RUNTIME_TABLE).unwrap().status =
                RegStatus::InUseRoutineAddr;
        } else {
            self.active_variable_pool = EXTENDED_VARIABLE_REGS.to_vec();
        }
    }

    pub fn variable_pool(&self) -> &[Reg] {
        &self.active_variable_pool
    }

    pub fn fp_variable_pool(&self) -> &[Reg] {
        &FP_VARIABLE_REGS
    }

    pub fn is_scratch(&self, reg: Reg) -> bool {
        SCRATCH_REGS.contains(&reg) || FP_SCRATCH_REGS.contains(&reg)
    }

    fn find_free(&self, pool: &[Reg]) -> Option<Reg> {
        pool.iter()
            .copied()
            .find(|reg| self.registers[reg].status == RegStatus::Free)
    }

    /// A free caller-saved scratch register; exhausting the pool is an
    /// internal error, never a spill.
    pub fn acquire_scratch_reg(&mut self) -> CodegenResult<ScratchReg> {
        let reg = self
            .find_free(&SCRATCH_REGS)
            .ok_or(CodegenError::ScratchExhausted)?;
        let info = self.registers.get_mut(&reg).unwrap();
        info.status = RegStatus::InUseScratch;
        info.dirty = false;
        Ok(ScratchReg(reg))
    }

    pub fn acquire_fp_scratch_reg(&mut self) -> CodegenResult<ScratchReg> {
        let reg = self
            .find_free(&FP_SCRATCH_REGS)
            .ok_or(CodegenError::ScratchExhausted)?;
        self.registers.get_mut(&reg).unwrap().status = RegStatus::InUseScratch;
        Ok(ScratchReg(reg))
    }

    pub fn release_scratch(&mut self, handle: ScratchReg) {
        let info = self.registers.get_mut(&handle.0).unwrap();
        info.status = RegStatus::Free;
        info.bound_to = None;
        info.dirty = false;
    }

    /// A spillable temporary from the variable pool. When every register is
    /// bound, the least-recently-used variable is evicted: its value is
    /// stored to its frame slot and the variable is marked spilled.
    pub fn acquire_spillable_temp_reg(
        &mut self,
        frame: &mut CallFrameManager,
        spill_code: &mut Vec<Instruction>,
    ) -> CodegenResult<TempReg> {
        self.acquire_temp_in(false, frame, spill_code)
    }

    pub fn acquire_spillable_fp_temp_reg(
        &mut self,
        frame: &mut CallFrameManager,
        spill_code: &mut Vec<Instruction>,
    ) -> CodegenResult<TempReg> {
        self.acquire_temp_in(true, frame, spill_code)
    }

    fn acquire_temp_in(
        &mut self,
        fp: bool,
        frame: &mut CallFrameManager,
        spill_code: &mut Vec<Instruction>,
    ) -> CodegenResult<TempReg> {
        let pool: Vec<Reg> = if fp {
            FP_VARIABLE_REGS.to_vec()
        } else {
            self.active_variable_pool.clone()
        };
        if let Some(reg) = self.find_free(&pool) {
            let info = self.registers.get_mut(&reg).unwrap();
            info.status = RegStatus::InUseScratch;
            info.dirty = false;
            self.touched.insert(reg);
            return Ok(TempReg(reg));
        }

        // Evict the least-recently-used variable binding.
        let victim = self.eviction_candidate(fp)?;
        let name = self.registers[&victim]
            .bound_to
            .clone()
            .ok_or(CodegenError::Internal("LRU victim has no binding".into()))?;
        if self.registers[&victim].dirty {
            spill_code.push(frame.store_to_slot(&name, victim)?);
        }
        self.unbind_variable(&name);
        self.spilled.insert(name);

        let info = self.registers.get_mut(&victim).unwrap();
        info.status = RegStatus::InUseScratch;
        info.bound_to = None;
        info.dirty = false;
        self.touched.insert(victim);
        Ok(TempReg(victim))
    }

    fn eviction_candidate(&self, fp: bool) -> CodegenResult<Reg> {
        let lru = if fp { &self.fp_lru } else { &self.lru };
        lru.iter()
            .copied()
            .find(|reg| self.registers[reg].status == RegStatus::InUseVariable)
            .ok_or(CodegenError::NoSpillCandidate(if fp { "FP" } else { "GP" }))
    }

    pub fn release_temp(&mut self, handle: TempReg) {
        let info = self.registers.get_mut(&handle.0).unwrap();
        info.status = RegStatus::Free;
        info.bound_to = None;
        info.dirty = false;
    }

    /// Free whatever register this is, routing FP and GP correctly. Used by
    /// code paths that only have the raw register.
    pub fn release_register(&mut self, reg: Reg) {
        if let Some(info) = self.registers.get_mut(&reg) {
            if let Some(name) = info.bound_to.take() {
                self.variable_to_reg.remove(&name);
                self.lru.retain(|r| *r != reg);
                self.fp_lru.retain(|r| *r != reg);
            }
            info.status = RegStatus::Free;
            info.dirty = false;
        }
    }

    /// Bind a variable to a register (linear-scan priming or reload).
    pub fn bind_variable(&mut self, name: &str, reg: Reg) {
        let info = self.registers.get_mut(&reg).unwrap_or_else(|| {
            panic!("binding {} to unmanaged register {}", name, reg)
        });
        info.status = RegStatus::InUseVariable;
        info.bound_to = Some(name.to_string());
        info.dirty = false;
        self.variable_to_reg.insert(name.to_string(), reg);
        self.spilled.remove(name);
        self.touched.insert(reg);
        let lru = if reg.is_fp() { &mut self.fp_lru } else { &mut self.lru };
        lru.retain(|r| *r != reg);
        lru.push_back(reg);
    }

    fn unbind_variable(&mut self, name: &str) {
        if let Some(reg) = self.variable_to_reg.remove(name) {
            self.lru.retain(|r| *r != reg);
            self.fp_lru.retain(|r| *r != reg);
            if let Some(info) = self.registers.get_mut(&reg) {
                info.bound_to = None;
            }
        }
    }

    /// The variable's current home register, refreshing its LRU position.
    pub fn variable_register(&mut self, name: &str) -> Option<Reg> {
        let reg = self.variable_to_reg.get(name).copied()?;
        let lru = if reg.is_fp() { &mut self.fp_lru } else { &mut self.lru };
        lru.retain(|r| *r != reg);
        lru.push_back(reg);
        Some(reg)
    }

    pub fn is_variable_spilled(&self, name: &str) -> bool {
        self.spilled.contains(name)
    }

    pub fn mark_dirty(&mut self, reg: Reg) {
        if let Some(info) = self.registers.get_mut(&reg) {
            info.dirty = true;
        }
    }

    pub fn is_dirty(&self, reg: Reg) -> bool {
        self.registers.get(&reg).map(|i| i.dirty).unwrap_or(false)
    }

    /// In-use caller-saved registers a call site must preserve. The code
    /// generator emits the save/restore pairs; preservation is not the
    /// manager's job.
    pub fn in_use_caller_saved(&self) -> Vec<Reg> {
        self.registers
            .iter()
            .filter(|(reg, info)| {
                reg.is_caller_saved()
                    && !matches!(info.status, RegStatus::Free)
            })
            .map(|(reg, _)| *reg)
            .collect()
    }

    /// In-use callee-saved registers, for the frame manager's save list.
    pub fn in_use_callee_saved(&self) -> Vec<Reg> {
        self.registers
            .iter()
            .filter(|(reg, info)| {
                !reg.is_caller_saved()
                    && !matches!(info.status, RegStatus::Free)
            })
            .map(|(reg, _)| *reg)
            .collect()
    }

    /// Callee-saved registers the function has written; the frame manager
    /// saves exactly these.
    pub fn touched_callee_saved(&self) -> Vec<Reg> {
        self.touched
            .iter()
            .filter(|reg| !reg.is_caller_saved() && !matches!(reg, Reg::Sp | Reg::Xzr))
            .copied()
            .collect()
    }

    pub fn status_of(&self, reg: Reg) -> RegStatus {
        self.registers
            .get(&reg)
            .map(|i| i.status)
            .unwrap_or(RegStatus::Free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_pool_exhausts_with_error() {
        let mut manager = RegisterManager::new();
        let mut held = Vec::new();
        for _ in 0..SCRATCH_REGS.len() {
            held.push(manager.acquire_scratch_reg().unwrap());
        }
        assert!(matches!(
            manager.acquire_scratch_reg(),
            Err(CodegenError::ScratchExhausted)
        ));
        for handle in held {
            manager.release_scratch(handle);
        }
        assert!(manager.acquire_scratch_reg().is_ok());
    }

    #[test]
    fn test_reset_reserves_data_base_when_needed() {
        let mut manager = RegisterManager::new();
        manager.reset_for_new_function(true);
        assert_eq!(manager.status_of(Reg::DATA_BASE), RegStatus::InUseDataBase);
        assert_eq!(manager.variable_pool().len(), VARIABLE_REGS.len());

        manager.reset_for_new_function(false);
        assert_eq!(manager.status_of(Reg::DATA_BASE), RegStatus::Free);
        assert_eq!(manager.variable_pool().len(), EXTENDED_VARIABLE_REGS.len());
    }

    #[test]
    fn test_lru_eviction_spills_dirty_binding() {
        let mut manager = RegisterManager::new();
        manager.reset_for_new_function(true);
        let mut frame = CallFrameManager::new("t", false);

        // Bind every variable-pool register.
        for (i, reg) in VARIABLE_REGS.iter().enumerate() {
            let name = format!("v{}", i);
            frame.add_local(&name, bcpl_ast::VarType::INTEGER);
            manager.bind_variable(&name, *reg);
        }
        manager.mark_dirty(VARIABLE_REGS[0]);
        frame.assign_slots();

        let mut spill = Vec::new();
        let temp = manager
            .acquire_spillable_temp_reg(&mut frame, &mut spill)
            .unwrap();
        // v0 was least recently used and dirty: one store emitted.
        assert_eq!(temp.0, VARIABLE_REGS[0]);
        assert_eq!(spill.len(), 1);
        assert!(manager.is_variable_spilled("v0"));
    }

    #[test]
    fn test_variable_register_touch_updates_lru() {
        let mut manager = RegisterManager::new();
        manager.reset_for_new_function(true);
        let mut frame = CallFrameManager::new("t", false);
        for (i, reg) in VARIABLE_REGS.iter().enumerate() {
            let name = format!("v{}", i);
            frame.add_local(&name, bcpl_ast::VarType::INTEGER);
            manager.bind_variable(&name, *reg);
        }
        frame.assign_slots();

        // Touch v0 so v1 becomes the eviction candidate.
        manager.variable_register("v0");
        let mut spill = Vec::new();
        let temp = manager
            .acquire_spillable_temp_reg(&mut frame, &mut spill)
            .unwrap();
        assert_eq!(temp.0, VARIABLE_REGS[1]);
    }

    #[test]
    fn test_caller_saved_query() {
        let mut manager = RegisterManager::new();
        manager.reset_for_new_function(true);
        let s = manager.acquire_scratch_reg().unwrap();
        let in_use = manager.in_use_caller_saved();
        assert!(in_use.contains(&s.0));
        manager.release_scratch(s);
        assert!(manager.in_use_caller_saved().is_empty());
    }

    #[test]
    fn test_cond_invert_roundtrip() {
        for cond in [Cond::Eq, Cond::Ne, Cond::Ge, Cond::Lt, Cond::Gt, Cond::Le] {
            assert_eq!(cond.invert().invert(), cond);
        }
    }
}
