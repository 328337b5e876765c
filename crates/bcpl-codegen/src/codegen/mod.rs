//! CFG-driven code generation.
//!
//! Each function's CFG is visited in sorted block order: a label definition
//! opens every block, the block's statements are dispatched one by one, and
//! the final statement doubles as the terminator (conditional statements
//! keep their condition; the branch targets come from the block's successor
//! list). The generator owns one register for the most recent expression
//! result and releases it after every consumption.

mod calls;
mod expr;

use crate::data::{DataGenerator, DATA_SEGMENT_BASE_LABEL};
use crate::encoder;
use crate::frame::CallFrameManager;
use crate::instr::{Instruction, InstructionStream, Segment};
use crate::labels::LabelManager;
use crate::linear_scan::{self, FunctionAllocation};
use crate::reg::{Cond, Reg, RegisterManager, ScratchReg, TempReg};
use crate::{CodegenError, CodegenResult};
use bcpl_analysis::cfg::{BasicBlock, ControlFlowGraph};
use bcpl_analysis::{intervals, FunctionMetrics, SymbolTable};
use bcpl_ast::{BranchCondition, Decl, Expr, NumberLiteral, Program, RepeatKind, Stmt, VarType};
use bcpl_runtime::RuntimeRegistry;
use std::collections::BTreeMap;

/// Compilation-wide options.
#[derive(Debug, Clone, Default)]
pub struct CodegenOptions {
    /// Emit JIT-shaped address loads and table-based runtime calls.
    pub jit_mode: bool,
    pub enable_stack_canaries: bool,
    /// JIT code-buffer base; 0 in static mode.
    pub code_base: u64,
    /// JIT data-buffer base; 0 in static mode.
    pub data_base: u64,
}

/// The value register of the expression just generated, with its ownership.
pub enum ValReg {
    /// A variable's home register; never released by the consumer.
    Var(Reg),
    /// A spillable temporary.
    Temp(TempReg),
    /// A caller-saved scratch register.
    Scratch(ScratchReg),
}

impl ValReg {
    pub fn reg(&self) -> Reg {
        match self {
            ValReg::Var(reg) => *reg,
            ValReg::Temp(t) => t.0,
            ValReg::Scratch(s) => s.0,
        }
    }

    pub fn is_owned(&self) -> bool {
        !matches!(self, ValReg::Var(_))
    }
}

/// Everything produced by code generation.
pub struct CodegenOutput {
    pub stream: InstructionStream,
    pub labels: LabelManager,
    pub data: DataGenerator,
}

pub struct CodeGenerator<'a> {
    pub(crate) options: CodegenOptions,
    pub(crate) stream: InstructionStream,
    pub(crate) registers: RegisterManager,
    pub(crate) labels: LabelManager,
    pub(crate) data: DataGenerator,
    pub(crate) symbols: &'a SymbolTable,
    pub(crate) metrics: &'a BTreeMap<String, FunctionMetrics>,
    pub(crate) runtime: &'a RuntimeRegistry,

    pub(crate) frame: Option<CallFrameManager>,
    pub(crate) allocation: FunctionAllocation,
    pub(crate) current_function: String,
    pub(crate) epilogue_label: String,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(
        options: CodegenOptions,
        symbols: &'a SymbolTable,
        metrics: &'a BTreeMap<String, FunctionMetrics>,
        runtime: &'a RuntimeRegistry,
    ) -> Self {
        CodeGenerator {
            options,
            stream: InstructionStream::new(),
            registers: RegisterManager::new(),
            labels: LabelManager::new(),
            data: DataGenerator::new(),
            symbols,
            metrics,
            runtime,
            frame: None,
            allocation: FunctionAllocation::new(),
            current_function: String::new(),
            epilogue_label: String::new(),
        }
    }

    /// Generate the whole program: globals first, then every function in
    /// deterministic name order, then the rodata and data sections.
    pub fn generate(
        mut self,
        program: &Program,
        cfgs: &BTreeMap<String, ControlFlowGraph>,
    ) -> CodegenResult<CodegenOutput> {
        self.collect_globals(program);

        for (name, cfg) in cfgs {
            self.generate_function(name, cfg)?;
        }

        let data = std::mem::take(&mut self.data);
        data.generate_rodata_section(&mut self.stream);
        data.generate_data_section(&mut self.stream);

        Ok(CodegenOutput {
            stream: self.stream,
            labels: self.labels,
            data,
        })
    }

    fn collect_globals(&mut self, program: &Program) {
        for decl in &program.declarations {
            match decl {
                Decl::Static { name, initializer } => {
                    self.data
                        .add_global_variable(name, first_integer_literal(initializer));
                }
                Decl::Global { entries } => {
                    for (name, _) in entries {
                        self.data.add_global_variable(name, 0);
                    }
                }
                Decl::GlobalVariable {
                    names,
                    initializers,
                    ..
                } => {
                    for (i, name) in names.iter().enumerate() {
                        let initial = initializers
                            .get(i)
                            .map(first_integer_literal)
                            .unwrap_or(0);
                        self.data.add_global_variable(name, initial);
                    }
                }
                _ => {}
            }
        }
        self.data.calculate_global_offsets();
    }

    pub(crate) fn function_metrics(&self) -> CodegenResult<&FunctionMetrics> {
        self.metrics.get(&self.current_function).ok_or_else(|| {
            CodegenError::Internal(format!("no metrics for {}", self.current_function))
        })
    }

    /// The inferred type of a variable in the current function.
    pub(crate) fn variable_type(&self, name: &str) -> VarType {
        self.metrics
            .get(&self.current_function)
            .map(|m| m.variable_type(name))
            .filter(|t| *t != VarType::UNKNOWN)
            .or_else(|| self.symbols.lookup(name).map(|s| s.var_type))
            .unwrap_or(VarType::UNKNOWN)
    }

    fn generate_function(&mut self, name: &str, cfg: &ControlFlowGraph) -> CodegenResult<()> {
        log::debug!("generating code for {}", name);
        self.current_function = name.to_string();
        let metrics = self.function_metrics()?.clone();
        let needs_data_base = metrics.needs_data_base();

        self.registers.reset_for_new_function(needs_data_base);

        // Frame: parameters in order, then every known local, then the
        // hidden names the CFG lowering introduced.
        let mut frame = CallFrameManager::new(name, self.options.enable_stack_canaries);
        let mut params: Vec<(&String, &usize)> = metrics.parameter_indices.iter().collect();
        params.sort_by_key(|(_, index)| **index);
        for (param, _) in &params {
            frame.add_parameter(param, metrics.variable_type(param));
        }
        for (var, var_type) in &metrics.variable_types {
            if !metrics.is_parameter(var) {
                frame.add_local(var, *var_type);
            }
        }
        // Hidden names introduced by the CFG lowering become locals too;
        // globals keep their data-segment home.
        for block in cfg.blocks.values() {
            for stmt in &block.statements {
                for var in bcpl_ast::visit::defined_variables(stmt) {
                    if !metrics.variable_types.contains_key(&var)
                        && self.data.global_word_offset(&var).is_none()
                    {
                        frame.add_local(&var, VarType::INTEGER);
                    }
                }
            }
        }

        // Allocation over the live intervals. Globals live in the data
        // segment and never compete for registers.
        let function_intervals: Vec<_> = intervals::compute(cfg)
            .into_iter()
            .filter(|i| self.data.global_word_offset(&i.var_name).is_none())
            .collect();
        self.allocation = linear_scan::allocate(
            &function_intervals,
            &metrics,
            self.registers.variable_pool(),
            self.registers.fp_variable_pool(),
        );

        frame.reserve_spill_slots(
            metrics.max_live_variables + 4,
            self.registers.variable_pool().len(),
        );
        frame.assign_slots();

        // The body is generated first; the prologue is spliced in front of
        // it once every callee-saved register the body touches is known.
        self.stream.define_label(name, Segment::Code);
        self.epilogue_label = format!("L_{}_epilogue", name);
        let body_start = self.stream.len();
        self.frame = Some(frame);

        if needs_data_base {
            self.emit_data_base_setup()?;
        }
        self.home_parameters(&params)?;
        self.bind_allocated_variables();

        // Blocks in sorted id order; the entry block is id 0.
        for id in cfg.sorted_ids() {
            self.generate_block(cfg, cfg.block(id))?;
        }

        // Callee-saved discipline: everything the body wrote in the
        // callee-saved file gets saved, plus X19/X28 when the data base is
        // established.
        let frame = self.frame.as_mut().expect("frame set above");
        for reg in self.registers.touched_callee_saved() {
            frame.force_save_register(reg);
        }
        if needs_data_base {
            frame.force_save_register(Reg::RUNTIME_TABLE);
            frame.force_save_register(Reg::DATA_BASE);
        }
        frame.finalize_layout();
        let prologue = frame.generate_prologue()?;
        self.stream.insert_at(body_start, prologue);

        // Epilogue.
        self.stream
            .define_label(&self.epilogue_label, Segment::Code);
        let ok_label = format!("L_{}_canary_ok", name);
        let epilogue = self
            .frame
            .as_mut()
            .expect("frame set above")
            .generate_epilogue(&ok_label)?;
        self.stream.extend(epilogue);

        self.frame = None;
        self.allocation.clear();
        Ok(())
    }

    /// X28 := data segment base; X19 := X28 + 524288 (runtime table).
    fn emit_data_base_setup(&mut self) -> CodegenResult<()> {
        if self.options.jit_mode {
            self.stream.extend(encoder::load_address_absolute(
                Reg::DATA_BASE,
                DATA_SEGMENT_BASE_LABEL,
            ));
        } else {
            self.stream.extend(encoder::load_address_adrp(
                Reg::DATA_BASE,
                DATA_SEGMENT_BASE_LABEL,
            ));
        }
        // 524288 = 128 << 12.
        self.stream
            .push(encoder::add_imm_shifted(Reg::RUNTIME_TABLE, Reg::DATA_BASE, 128)?);
        Ok(())
    }

    /// Store arriving arguments into their frame homes. Arguments past the
    /// eighth arrive on the caller's stack just above our frame record.
    fn home_parameters(&mut self, params: &[(&String, &usize)]) -> CodegenResult<()> {
        let metrics = self.function_metrics()?.clone();
        for (param, &index) in params {
            let is_float = metrics.variable_type(param).uses_fp_register();
            let frame = self.frame.as_mut().expect("frame");
            if index < 8 {
                let arrival = if is_float {
                    Reg::D(index as u8)
                } else {
                    Reg::X(index as u8)
                };
                let store = frame.store_to_slot(param, arrival)?;
                self.stream.push(store);
            } else {
                let caller_offset = 16 + 8 * (index as i32 - 8);
                self.stream
                    .push(encoder::ldr(Reg::X(16), Reg::FP, caller_offset)?);
                let store = frame.store_to_slot(param, Reg::X(16))?;
                self.stream.push(store);
            }
        }
        Ok(())
    }

    /// Give every register-allocated non-parameter variable its home
    /// binding in the register manager.
    fn bind_allocated_variables(&mut self) {
        let metrics = match self.metrics.get(&self.current_function) {
            Some(m) => m,
            None => return,
        };
        let bindings: Vec<(String, Reg)> = self
            .allocation
            .iter()
            .filter(|(name, alloc)| {
                !metrics.is_parameter(name)
                    && alloc.assigned_register.is_some()
                    && !alloc.is_spilled
            })
            .map(|(name, alloc)| (name.clone(), alloc.assigned_register.unwrap()))
            .filter(|(_, reg)| !reg.is_caller_saved())
            .collect();
        for (name, reg) in bindings {
            self.registers.bind_variable(&name, reg);
        }
    }

    fn generate_block(
        &mut self,
        cfg: &ControlFlowGraph,
        block: &BasicBlock,
    ) -> CodegenResult<()> {
        self.stream.define_label(&block.label, Segment::Code);

        let mut terminated = false;
        for stmt in &block.statements {
            terminated = self.generate_statement(cfg, block, stmt)?;
        }

        if !terminated {
            // Fallthrough: one successor gets an explicit branch; the exit
            // block (and any dead end) drains into the epilogue.
            match block.successors.first() {
                Some(&succ) => {
                    let label = cfg.block(succ).label.clone();
                    self.stream.push(encoder::b(&label));
                }
                None => {
                    let label = self.epilogue_label.clone();
                    self.stream.push(encoder::b(&label));
                }
            }
        }
        Ok(())
    }

    /// Generate one statement. Returns true when the statement emitted the
    /// block's terminating control flow.
    fn generate_statement(
        &mut self,
        cfg: &ControlFlowGraph,
        block: &BasicBlock,
        stmt: &Stmt,
    ) -> CodegenResult<bool> {
        match stmt {
            Stmt::Let {
                names,
                initializers,
                ..
            } => {
                for (i, name) in names.iter().enumerate() {
                    if let Some(init) = initializers.get(i) {
                        let value = self.gen_expr(init)?;
                        self.store_to_variable(name, value)?;
                    }
                }
                Ok(false)
            }
            Stmt::Assignment { lhs, rhs } => {
                // All RHS values first, then the stores.
                let mut values = Vec::with_capacity(rhs.len());
                for expr in rhs {
                    values.push(self.gen_expr(expr)?);
                }
                for (target, value) in lhs.iter().zip(values) {
                    self.gen_assignment_target(target, value)?;
                }
                Ok(false)
            }
            Stmt::RoutineCall { routine, arguments } => {
                let result = self.gen_call(routine, arguments, false)?;
                if let Some(value) = result {
                    self.release(value);
                }
                Ok(false)
            }
            Stmt::If { condition, .. } => {
                self.emit_conditional_terminator(cfg, block, condition, Cond::Eq)?;
                Ok(true)
            }
            Stmt::Unless { condition, .. } => {
                self.emit_conditional_terminator(cfg, block, condition, Cond::Ne)?;
                Ok(true)
            }
            Stmt::Test { condition, .. } => {
                self.emit_conditional_terminator(cfg, block, condition, Cond::Eq)?;
                Ok(true)
            }
            Stmt::While { condition, .. } => {
                self.emit_conditional_terminator(cfg, block, condition, Cond::Eq)?;
                Ok(true)
            }
            Stmt::Until { condition, .. } => {
                self.emit_conditional_terminator(cfg, block, condition, Cond::Ne)?;
                Ok(true)
            }
            Stmt::Repeat {
                kind, condition, ..
            } => {
                // successors[0] loops back, successors[1] exits.
                let condition = condition.as_ref().ok_or_else(|| {
                    CodegenError::Internal("conditionless REPEAT header".into())
                })?;
                let exit_on = match kind {
                    RepeatKind::RepeatWhile => Cond::Eq,
                    RepeatKind::RepeatUntil => Cond::Ne,
                    RepeatKind::Repeat => {
                        return Err(CodegenError::Internal(
                            "plain REPEAT has no header".into(),
                        ))
                    }
                };
                self.emit_conditional_terminator(cfg, block, condition, exit_on)?;
                Ok(true)
            }
            Stmt::For { .. } => {
                self.emit_for_terminator(cfg, block, stmt)?;
                Ok(true)
            }
            Stmt::CondBranch {
                condition,
                target,
                expr,
            } => {
                let value = self.gen_expr(expr)?;
                self.stream
                    .push(encoder::cmp_imm(value.reg(), 0)?);
                self.release(value);
                let cond = branch_condition_to_cond(*condition);
                self.stream.push(encoder::b_cond(cond, target));
                // Fall through to the other successor.
                let fallthrough = block
                    .successors
                    .iter()
                    .find(|&&s| cfg.block(s).label != *target)
                    .copied();
                if let Some(succ) = fallthrough {
                    let label = cfg.block(succ).label.clone();
                    self.stream.push(encoder::b(&label));
                }
                Ok(true)
            }
            Stmt::Switchon { .. } => {
                self.emit_switchon_terminator(cfg, block, stmt)?;
                Ok(true)
            }
            Stmt::Goto(_) | Stmt::Break | Stmt::Loop | Stmt::Endcase => {
                let succ = block.successors.first().copied().ok_or_else(|| {
                    CodegenError::Internal("jump statement in a block with no successor".into())
                })?;
                let label = cfg.block(succ).label.clone();
                self.stream.push(encoder::b(&label));
                Ok(true)
            }
            Stmt::Return => {
                let label = self.epilogue_label.clone();
                self.stream.push(encoder::b(&label));
                Ok(true)
            }
            Stmt::Finish => {
                let result = self.gen_runtime_call_with_values("FINISH", Vec::new())?;
                self.release(result);
                let label = self.epilogue_label.clone();
                self.stream.push(encoder::b(&label));
                Ok(true)
            }
            Stmt::Resultis(expr) => {
                let returns_float = self.function_metrics()?.returns_float;
                let value = self.gen_expr(expr)?;
                let value_is_fp = value.reg().is_fp();
                match (returns_float, value_is_fp) {
                    (true, true) => self.stream.push(encoder::fmov(Reg::D(0), value.reg())),
                    (true, false) => self.stream.push(encoder::scvtf(Reg::D(0), value.reg())),
                    (false, true) => self.stream.push(encoder::fcvtzs(Reg::X(0), value.reg())),
                    (false, false) => {
                        if value.reg() != Reg::X(0) {
                            self.stream.push(encoder::mov_reg(Reg::X(0), value.reg()));
                        }
                    }
                }
                self.release(value);
                let label = self.epilogue_label.clone();
                self.stream.push(encoder::b(&label));
                Ok(true)
            }
            Stmt::Free(expr) => {
                let value = self.gen_expr(expr)?;
                let result = self.gen_runtime_call_with_values("BCPL_FREE_LIST", vec![value])?;
                self.release(result);
                Ok(false)
            }
            Stmt::Brk => {
                self.stream.push(encoder::brk(0));
                Ok(false)
            }
            Stmt::LabelTarget(_) => Ok(false), // the block label already binds here
            Stmt::Compound(stmts) => {
                let mut terminated = false;
                for s in stmts {
                    terminated = self.generate_statement(cfg, block, s)?;
                }
                Ok(terminated)
            }
            Stmt::Block { statements, .. } => {
                let mut terminated = false;
                for s in statements {
                    terminated = self.generate_statement(cfg, block, s)?;
                }
                Ok(terminated)
            }
            Stmt::ForEach { .. } => Err(CodegenError::Internal(
                "FOREACH survived CFG lowering".into(),
            )),
        }
    }

    /// Shared two-way terminator: evaluate the condition, branch to
    /// successors[1] when `false_cond` holds against zero, fall through to
    /// successors[0].
    fn emit_conditional_terminator(
        &mut self,
        cfg: &ControlFlowGraph,
        block: &BasicBlock,
        condition: &Expr,
        false_cond: Cond,
    ) -> CodegenResult<()> {
        let value = self.gen_expr(condition)?;
        self.stream.push(encoder::cmp_imm(value.reg(), 0)?);
        self.release(value);

        let taken = block.successors.first().copied().ok_or_else(|| {
            CodegenError::Internal("conditional terminator without successors".into())
        })?;
        let not_taken = block.successors.get(1).copied().unwrap_or(taken);

        let not_taken_label = cfg.block(not_taken).label.clone();
        let taken_label = cfg.block(taken).label.clone();
        self.stream.push(encoder::b_cond(false_cond, &not_taken_label));
        self.stream.push(encoder::b(&taken_label));
        Ok(())
    }

    /// FOR header: continue while the loop variable has not passed the
    /// hoisted end value; the step's sign picks the comparison polarity.
    fn emit_for_terminator(
        &mut self,
        cfg: &ControlFlowGraph,
        block: &BasicBlock,
        stmt: &Stmt,
    ) -> CodegenResult<()> {
        let Stmt::For {
            loop_variable,
            unique_loop_variable,
            unique_end_variable,
            step,
            ..
        } = stmt
        else {
            unreachable!()
        };
        let var = unique_loop_variable
            .clone()
            .unwrap_or_else(|| loop_variable.clone());
        let end_var = unique_end_variable.clone().ok_or_else(|| {
            CodegenError::Internal("FOR header without a hoisted end name".into())
        })?;

        let negative_step = matches!(
            step,
            Some(Expr::Number(NumberLiteral::Integer(v))) if *v < 0
        ) || matches!(
            step,
            Some(Expr::Unary { op: bcpl_ast::UnaryOperator::Negate, .. })
        );
        let exit_cond = if negative_step { Cond::Lt } else { Cond::Gt };

        let current = self.load_variable(&var)?;
        let end = self.load_variable(&end_var)?;
        self.stream
            .push(encoder::cmp_reg(current.reg(), end.reg()));
        self.release(current);
        self.release(end);

        let body = block.successors[0];
        let exit = block.successors.get(1).copied().unwrap_or(body);
        let exit_label = cfg.block(exit).label.clone();
        let body_label = cfg.block(body).label.clone();
        self.stream.push(encoder::b_cond(exit_cond, &exit_label));
        self.stream.push(encoder::b(&body_label));
        Ok(())
    }

    /// SWITCHON: one CMP+B.EQ per case in source order, then the default
    /// (when present), then the join.
    fn emit_switchon_terminator(
        &mut self,
        cfg: &ControlFlowGraph,
        block: &BasicBlock,
        stmt: &Stmt,
    ) -> CodegenResult<()> {
        let Stmt::Switchon {
            expression, cases, ..
        } = stmt
        else {
            unreachable!()
        };

        let value = self.gen_expr(expression)?;
        for (i, arm) in cases.iter().enumerate() {
            let case_value = arm.resolved_value.ok_or_else(|| {
                CodegenError::Internal("unresolved CASE constant at codegen".into())
            })?;
            if (0..=0xFFF).contains(&case_value) {
                self.stream
                    .push(encoder::cmp_imm(value.reg(), case_value as u32)?);
            } else {
                let scratch = self.registers.acquire_scratch_reg()?;
                self.stream
                    .extend(encoder::load_integer(scratch.0, case_value));
                self.stream.push(encoder::cmp_reg(value.reg(), scratch.0));
                self.registers.release_scratch(scratch);
            }
            let target = cfg.block(block.successors[i]).label.clone();
            self.stream.push(encoder::b_cond(Cond::Eq, &target));
        }
        self.release(value);

        // After all cases: default if present, else the join (both are the
        // trailing successors, in that order).
        let fallback = block.successors[cases.len()];
        let label = cfg.block(fallback).label.clone();
        self.stream.push(encoder::b(&label));
        Ok(())
    }

    // --- Shared helpers used by the expression generator ---

    pub(crate) fn emit(&mut self, instr: Instruction) {
        self.stream.push(instr);
    }

    pub(crate) fn acquire_temp(&mut self, fp: bool) -> CodegenResult<TempReg> {
        let mut spill_code = Vec::new();
        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| CodegenError::Internal("no active frame".into()))?;
        let temp = if fp {
            self.registers
                .acquire_spillable_fp_temp_reg(frame, &mut spill_code)?
        } else {
            self.registers
                .acquire_spillable_temp_reg(frame, &mut spill_code)?
        };
        self.stream.extend(spill_code);
        Ok(temp)
    }

    pub(crate) fn release(&mut self, value: ValReg) {
        match value {
            ValReg::Var(_) => {}
            ValReg::Temp(t) => self.registers.release_temp(t),
            ValReg::Scratch(s) => self.registers.release_scratch(s),
        }
    }

    /// Load a variable's current value, wherever it lives.
    pub(crate) fn load_variable(&mut self, name: &str) -> CodegenResult<ValReg> {
        self.gen_expr(&Expr::variable(name))
    }

    /// Store a value into a variable's home (register or frame slot).
    pub(crate) fn store_to_variable(&mut self, name: &str, value: ValReg) -> CodegenResult<()> {
        let var_is_fp = self.variable_type(name).uses_fp_register();
        let value_reg = value.reg();

        // Int/float coercion on store.
        let coerced: ValReg = match (var_is_fp, value_reg.is_fp()) {
            (true, false) => {
                let temp = self.acquire_temp(true)?;
                self.emit(encoder::scvtf(temp.0, value_reg));
                self.release(value);
                ValReg::Temp(temp)
            }
            (false, true) => {
                let temp = self.acquire_temp(false)?;
                self.emit(encoder::fcvtzs(temp.0, value_reg));
                self.release(value);
                ValReg::Temp(temp)
            }
            _ => value,
        };

        if let Some(home) = self.registers.variable_register(name) {
            if home != coerced.reg() {
                if home.is_fp() {
                    self.emit(encoder::fmov(home, coerced.reg()));
                } else {
                    self.emit(encoder::mov_reg(home, coerced.reg()));
                }
            }
            self.registers.mark_dirty(home);
        } else {
            let frame = self
                .frame
                .as_mut()
                .ok_or_else(|| CodegenError::Internal("no active frame".into()))?;
            let store = frame.store_to_slot(name, coerced.reg())?;
            self.stream.push(store);
        }
        self.release(coerced);
        Ok(())
    }
}

fn branch_condition_to_cond(bc: BranchCondition) -> Cond {
    match bc {
        BranchCondition::Eq => Cond::Eq,
        BranchCondition::Ne => Cond::Ne,
        BranchCondition::Lt => Cond::Lt,
        BranchCondition::Le => Cond::Le,
        BranchCondition::Gt => Cond::Gt,
        BranchCondition::Ge => Cond::Ge,
    }
}

/// First integer literal of an initializer, or zero — the initial value
/// rule for global words.
fn first_integer_literal(expr: &Expr) -> i64 {
    match expr {
        Expr::Number(NumberLiteral::Integer(v)) => *v,
        Expr::CharLit(c) => *c as i64,
        Expr::BooleanLit(b) => {
            if *b {
                -1
            } else {
                0
            }
        }
        Expr::Binary { left, .. } => first_integer_literal(left),
        Expr::Unary { operand, .. } => first_integer_literal(operand),
        _ => 0,
    }
}
