//! Expression lowering.
//!
//! Every lowering leaves its result in the register carried by the returned
//! [`ValReg`]; the caller consumes and releases it. Evaluation order inside
//! binary operators is right then left, and mixed int/float arithmetic
//! promotes the integer side with SCVTF.

use super::{CodeGenerator, ValReg};
use crate::encoder;
use crate::instr::Segment;
use crate::reg::{Cond, Reg};
use crate::{CodegenError, CodegenResult};
use bcpl_analysis::analyzer::infer_expr;
use bcpl_ast::{BinaryOperator, Expr, NumberLiteral, Stmt, UnaryOperator, VarType};

impl<'a> CodeGenerator<'a> {
    /// The inferred type of an expression in the current function.
    pub(crate) fn infer_type(&self, expr: &Expr) -> VarType {
        infer_expr(expr, self.symbols, self.metrics.get(&self.current_function))
    }

    pub(crate) fn gen_expr(&mut self, expr: &Expr) -> CodegenResult<ValReg> {
        match expr {
            Expr::Number(NumberLiteral::Integer(value)) => {
                let temp = self.acquire_temp(false)?;
                self.stream.extend(encoder::load_integer(temp.0, *value));
                Ok(ValReg::Temp(temp))
            }
            Expr::Number(NumberLiteral::Float(value)) => {
                // Floats load from a rodata literal via ADRP/ADD + LDR.
                let label = self.data.add_float_literal(*value);
                let addr = self.registers.acquire_scratch_reg()?;
                self.stream.extend(encoder::load_address_adrp(addr.0, &label));
                let temp = self.acquire_temp(true)?;
                self.emit(encoder::ldr_fp(temp.0, addr.0, 0)?);
                self.registers.release_scratch(addr);
                Ok(ValReg::Temp(temp))
            }
            Expr::CharLit(c) => {
                let temp = self.acquire_temp(false)?;
                self.stream
                    .extend(encoder::load_integer(temp.0, *c as i64));
                Ok(ValReg::Temp(temp))
            }
            Expr::BooleanLit(b) => {
                let temp = self.acquire_temp(false)?;
                let value = if *b { -1 } else { 0 };
                self.stream.extend(encoder::load_integer(temp.0, value));
                Ok(ValReg::Temp(temp))
            }
            Expr::StringLit(value) => {
                // The label sits at the length word; the string value points
                // at the first code point, 8 bytes in.
                let label = self.data.add_string_literal(value);
                let temp = self.acquire_temp(false)?;
                self.stream.extend(encoder::load_address_adrp(temp.0, &label));
                self.emit(encoder::add_imm(temp.0, temp.0, 8)?);
                Ok(ValReg::Temp(temp))
            }
            Expr::Variable { .. } => {
                let name = expr.variable_name().expect("variable has a name");
                self.gen_variable_access(name)
            }
            Expr::Binary { op, left, right } => self.gen_binary(*op, left, right),
            Expr::Unary { op, operand } => self.gen_unary(*op, operand),
            Expr::VectorAccess { vector, index } => self.gen_vector_load(vector, index, 3),
            Expr::FloatVectorAccess { vector, index } => {
                let (base, idx) = self.gen_scaled_address(vector, index, 3)?;
                let temp = self.acquire_temp(true)?;
                self.emit(encoder::ldr_fp(temp.0, base.reg(), 0)?);
                self.release(base);
                if let Some(idx) = idx {
                    self.release(idx);
                }
                Ok(ValReg::Temp(temp))
            }
            Expr::CharIndirection { string, index } => {
                let (base, idx) = self.gen_scaled_address(string, index, 2)?;
                let temp = self.acquire_temp(false)?;
                self.emit(encoder::ldr32(temp.0, base.reg(), 0)?);
                self.release(base);
                if let Some(idx) = idx {
                    self.release(idx);
                }
                Ok(ValReg::Temp(temp))
            }
            Expr::Call {
                function,
                arguments,
            } => {
                // The BITFIELD intrinsic lowers inline; everything else is a
                // real call.
                if function.variable_name() == Some("BITFIELD") {
                    return self.gen_bitfield(arguments);
                }
                let result = self.gen_call(function, arguments, true)?;
                result.ok_or_else(|| {
                    CodegenError::Internal("call in expression position had no result".into())
                })
            }
            Expr::SysCall { number, arguments } => self.gen_syscall(number, arguments),
            Expr::Conditional {
                condition,
                true_expr,
                false_expr,
            } => self.gen_conditional(condition, true_expr, false_expr),
            Expr::Valof(body) => self.gen_valof_inline(body, false),
            Expr::FloatValof(body) => self.gen_valof_inline(body, true),
            Expr::VecAlloc { size } => {
                // VEC n allocates n+1 words.
                let size_val = self.gen_expr(size)?;
                let temp = self.acquire_temp(false)?;
                self.emit(encoder::add_imm(temp.0, size_val.reg(), 1)?);
                self.release(size_val);
                self.gen_runtime_call_with_values("BCPL_ALLOC_WORDS", vec![ValReg::Temp(temp)])
            }
            Expr::StringAlloc { size } => {
                let size_val = self.gen_expr(size)?;
                self.gen_runtime_call_with_values("BCPL_ALLOC_CHARS", vec![size_val])
            }
            Expr::Table {
                initializers,
                is_float,
            } => {
                let label = if *is_float {
                    let values = initializers
                        .iter()
                        .map(constant_float)
                        .collect::<Option<Vec<f64>>>()
                        .ok_or_else(|| {
                            CodegenError::Internal("FTABLE initializer is not constant".into())
                        })?;
                    self.data.add_float_table_literal(values)
                } else {
                    let values = initializers
                        .iter()
                        .map(constant_integer)
                        .collect::<Option<Vec<i64>>>()
                        .ok_or_else(|| {
                            CodegenError::Internal("TABLE initializer is not constant".into())
                        })?;
                    self.data.add_table_literal(values)
                };
                let temp = self.acquire_temp(false)?;
                self.stream.extend(encoder::load_address_adrp(temp.0, &label));
                Ok(ValReg::Temp(temp))
            }
            Expr::ListLit {
                initializers,
                is_manifest,
            } => self.gen_list_literal(initializers, *is_manifest),
        }
    }

    fn gen_variable_access(&mut self, name: &str) -> CodegenResult<ValReg> {
        // 1. Register-resident variable.
        if let Some(reg) = self.registers.variable_register(name) {
            return Ok(ValReg::Var(reg));
        }

        // 2. Frame-resident (parameter home, local slot, or spilled).
        let has_slot = self
            .frame
            .as_ref()
            .map(|f| f.has_slot(name))
            .unwrap_or(false);
        if has_slot {
            let is_fp = self.variable_type(name).uses_fp_register();
            let temp = self.acquire_temp(is_fp)?;
            let frame = self.frame.as_mut().expect("frame");
            let load = frame.load_from_slot(name, temp.0)?;
            self.stream.push(load);
            return Ok(ValReg::Temp(temp));
        }

        // 3. Globals and statics through the data-segment base.
        if let Some(offset) = self.data.global_word_offset(name) {
            let byte_offset = (offset * 8) as i32;
            let is_fp = self.variable_type(name).uses_fp_register();
            let temp = self.acquire_temp(is_fp)?;
            if is_fp {
                self.emit(encoder::ldr_fp(temp.0, Reg::DATA_BASE, byte_offset)?);
            } else {
                self.emit(encoder::ldr(temp.0, Reg::DATA_BASE, byte_offset)?);
            }
            return Ok(ValReg::Temp(temp));
        }

        // 4. Named functions and runtime entries used as values.
        if let Some(symbol) = self.symbols.lookup(name) {
            use bcpl_analysis::SymbolLocation;
            if let SymbolLocation::Absolute(value) = symbol.location {
                let temp = self.acquire_temp(false)?;
                self.stream.extend(encoder::load_integer(temp.0, value));
                return Ok(ValReg::Temp(temp));
            }
            if symbol.kind.is_function_like() && !symbol.kind.is_runtime() {
                let temp = self.acquire_temp(false)?;
                if self.options.jit_mode {
                    self.stream.extend(encoder::load_address_absolute(temp.0, name));
                } else {
                    self.stream.extend(encoder::load_address_adrp(temp.0, name));
                }
                return Ok(ValReg::Temp(temp));
            }
        }
        if let Ok(func) = self.runtime.get(name) {
            let temp = self.acquire_temp(false)?;
            self.emit(encoder::ldr(
                temp.0,
                Reg::RUNTIME_TABLE,
                func.table_offset as i32,
            )?);
            return Ok(ValReg::Temp(temp));
        }

        Err(CodegenError::UnknownVariable(
            name.to_string(),
            self.current_function.clone(),
        ))
    }

    fn gen_binary(
        &mut self,
        op: BinaryOperator,
        left: &Expr,
        right: &Expr,
    ) -> CodegenResult<ValReg> {
        if matches!(op, BinaryOperator::LogicalAnd | BinaryOperator::LogicalOr) {
            // & and | short-circuit with the result normalized to 0 or
            // all-ones. A literal operand marks a bit-mask use (the
            // strength-reduced REM shape among them), which stays a plain
            // bitwise instruction.
            let literal_operand =
                matches!(left, Expr::Number(_)) || matches!(right, Expr::Number(_));
            if !literal_operand {
                return self.gen_short_circuit(op, left, right);
            }
        }

        let float = op.is_float_op()
            || self.infer_type(left).uses_fp_register()
            || self.infer_type(right).uses_fp_register();

        if op.is_comparison() {
            return self.gen_comparison(op, left, right, float);
        }

        // Right first, then left.
        let right_val = self.gen_expr(right)?;
        let left_val = self.gen_expr(left)?;

        if float {
            let left_fp = self.promote_to_float(left_val)?;
            let right_fp = self.promote_to_float(right_val)?;
            let (dest_val, spare_left) = self.pick_destination(left_fp, true)?;
            let dest = dest_val.reg();
            let l = spare_left.as_ref().map(ValReg::reg).unwrap_or(dest);
            let r = right_fp.reg();
            let instr = match op {
                BinaryOperator::Add | BinaryOperator::FloatAdd => encoder::fadd(dest, l, r),
                BinaryOperator::Subtract | BinaryOperator::FloatSubtract => {
                    encoder::fsub(dest, l, r)
                }
                BinaryOperator::Multiply | BinaryOperator::FloatMultiply => {
                    encoder::fmul(dest, l, r)
                }
                BinaryOperator::Divide | BinaryOperator::FloatDivide => encoder::fdiv(dest, l, r),
                other => {
                    return Err(CodegenError::Internal(format!(
                        "operator {:?} has no float form",
                        other
                    )))
                }
            };
            self.emit(instr);
            if let Some(left) = spare_left {
                self.release(left);
            }
            self.release(right_fp);
            return Ok(dest_val);
        }

        let (dest_val, spare_left) = self.pick_destination(left_val, false)?;
        let dest = dest_val.reg();
        let l = spare_left.as_ref().map(ValReg::reg).unwrap_or(dest);
        let r = right_val.reg();
        match op {
            BinaryOperator::Add => self.emit(encoder::add_reg(dest, l, r)),
            BinaryOperator::Subtract => self.emit(encoder::sub_reg(dest, l, r)),
            BinaryOperator::Multiply => self.emit(encoder::mul(dest, l, r)),
            BinaryOperator::Divide => self.emit(encoder::sdiv(dest, l, r)),
            BinaryOperator::Remainder => {
                let scratch = self.registers.acquire_scratch_reg()?;
                self.emit(encoder::sdiv(scratch.0, l, r));
                self.emit(encoder::msub(dest, scratch.0, r, l));
                self.registers.release_scratch(scratch);
            }
            BinaryOperator::LogicalAnd => self.emit(encoder::and_reg(dest, l, r)),
            BinaryOperator::LogicalOr => self.emit(encoder::orr_reg(dest, l, r)),
            BinaryOperator::NotEquivalence => self.emit(encoder::eor_reg(dest, l, r)),
            BinaryOperator::Equivalence => {
                self.emit(encoder::eor_reg(dest, l, r));
                self.emit(encoder::mvn_reg(dest, dest));
            }
            BinaryOperator::LeftShift => self.emit(encoder::lslv(dest, l, r)),
            BinaryOperator::RightShift => self.emit(encoder::lsrv(dest, l, r)),
            other => {
                return Err(CodegenError::Internal(format!(
                    "unhandled integer operator {:?}",
                    other
                )))
            }
        }
        if let Some(left) = spare_left {
            self.release(left);
        }
        self.release(right_val);
        Ok(dest_val)
    }

    /// Pick the destination for a binary op: reuse the left operand's
    /// register when it is an owned temporary of the right bank (returning
    /// no spare), otherwise acquire a fresh temp and hand the left value
    /// back for the operand position.
    fn pick_destination(
        &mut self,
        left: ValReg,
        fp: bool,
    ) -> CodegenResult<(ValReg, Option<ValReg>)> {
        if left.is_owned() && left.reg().is_fp() == fp {
            Ok((left, None))
        } else {
            let temp = self.acquire_temp(fp)?;
            Ok((ValReg::Temp(temp), Some(left)))
        }
    }

    fn promote_to_float(&mut self, value: ValReg) -> CodegenResult<ValReg> {
        if value.reg().is_fp() {
            return Ok(value);
        }
        let temp = self.acquire_temp(true)?;
        self.emit(encoder::scvtf(temp.0, value.reg()));
        self.release(value);
        Ok(ValReg::Temp(temp))
    }

    fn gen_comparison(
        &mut self,
        op: BinaryOperator,
        left: &Expr,
        right: &Expr,
        float: bool,
    ) -> CodegenResult<ValReg> {
        let right_val = self.gen_expr(right)?;
        let left_val = self.gen_expr(left)?;

        let cond = comparison_cond(op);
        let dest = self.acquire_temp(false)?;
        if float {
            let left_fp = self.promote_to_float(left_val)?;
            let right_fp = self.promote_to_float(right_val)?;
            self.emit(encoder::fcmp(left_fp.reg(), right_fp.reg()));
            self.release(left_fp);
            self.release(right_fp);
        } else {
            self.emit(encoder::cmp_reg(left_val.reg(), right_val.reg()));
            self.release(left_val);
            self.release(right_val);
        }
        // BCPL truth values are all-ones / zero.
        self.emit(encoder::csetm(dest.0, cond));
        Ok(ValReg::Temp(dest))
    }

    /// Short-circuit && / ||, normalizing to 0 or all-ones.
    fn gen_short_circuit(
        &mut self,
        op: BinaryOperator,
        left: &Expr,
        right: &Expr,
    ) -> CodegenResult<ValReg> {
        let is_and = op == BinaryOperator::LogicalAnd;
        let short_label = self
            .labels
            .create_label(if is_and { "and_false" } else { "or_true" });
        let end_label = self.labels.create_label(if is_and { "and_end" } else { "or_end" });
        let dest = self.acquire_temp(false)?;

        let branch_cond = if is_and { Cond::Eq } else { Cond::Ne };
        let left_val = self.gen_expr(left)?;
        self.emit(encoder::cmp_imm(left_val.reg(), 0)?);
        self.release(left_val);
        self.emit(encoder::b_cond(branch_cond, &short_label));

        let right_val = self.gen_expr(right)?;
        self.emit(encoder::cmp_imm(right_val.reg(), 0)?);
        self.release(right_val);
        self.emit(encoder::b_cond(branch_cond, &short_label));

        // Fell through both tests.
        if is_and {
            self.emit(encoder::csetm(dest.0, Cond::Ne));
        } else {
            self.emit(encoder::movz(dest.0, 0, 0));
        }
        self.emit(encoder::b(&end_label));

        self.stream.define_label(&short_label, Segment::Code);
        if is_and {
            self.emit(encoder::movz(dest.0, 0, 0));
        } else {
            self.emit(encoder::csetm(dest.0, Cond::Ne));
        }
        self.stream.define_label(&end_label, Segment::Code);
        Ok(ValReg::Temp(dest))
    }

    fn gen_unary(&mut self, op: UnaryOperator, operand: &Expr) -> CodegenResult<ValReg> {
        match op {
            UnaryOperator::AddressOf => self.gen_address_of(operand),
            UnaryOperator::Indirection => {
                let ptr = self.gen_expr(operand)?;
                let temp = self.acquire_temp(false)?;
                self.emit(encoder::ldr(temp.0, ptr.reg(), 0)?);
                self.release(ptr);
                Ok(ValReg::Temp(temp))
            }
            UnaryOperator::Negate => {
                let value = self.gen_expr(operand)?;
                if value.reg().is_fp() {
                    let temp = self.acquire_temp(true)?;
                    self.emit(encoder::fneg(temp.0, value.reg()));
                    self.release(value);
                    Ok(ValReg::Temp(temp))
                } else {
                    let temp = self.acquire_temp(false)?;
                    self.emit(encoder::sub_reg(temp.0, Reg::Xzr, value.reg()));
                    self.release(value);
                    Ok(ValReg::Temp(temp))
                }
            }
            UnaryOperator::LogicalNot => {
                let value = self.gen_expr(operand)?;
                let temp = self.acquire_temp(false)?;
                self.emit(encoder::cmp_imm(value.reg(), 0)?);
                self.emit(encoder::csetm(temp.0, Cond::Eq));
                self.release(value);
                Ok(ValReg::Temp(temp))
            }
            UnaryOperator::FloatConvert => {
                let value = self.gen_expr(operand)?;
                if value.reg().is_fp() {
                    return Ok(value);
                }
                let temp = self.acquire_temp(true)?;
                self.emit(encoder::scvtf(temp.0, value.reg()));
                self.release(value);
                Ok(ValReg::Temp(temp))
            }
            UnaryOperator::LengthOf => {
                let operand_type = self.infer_type(operand);
                let value = self.gen_expr(operand)?;
                let temp = self.acquire_temp(false)?;
                if operand_type.is_list() {
                    // Header length field at offset 8.
                    self.emit(encoder::ldr(temp.0, value.reg(), 8)?);
                } else {
                    // Length word just below the value pointer.
                    self.emit(encoder::ldr(temp.0, value.reg(), -8)?);
                }
                self.release(value);
                Ok(ValReg::Temp(temp))
            }
            UnaryOperator::HeadOf => {
                let element = self.infer_type(operand).element_kind();
                let value = self.gen_expr(operand)?;
                let runtime_name = if element == VarType::FLOAT {
                    "BCPL_LIST_GET_HEAD_AS_FLOAT"
                } else {
                    "BCPL_LIST_GET_HEAD_AS_INT"
                };
                let result = self.gen_runtime_call_with_values(runtime_name, vec![value])?;
                if element == VarType::STRING {
                    // Node values hold string bases; the value is 8 past.
                    self.emit(encoder::add_imm(result.reg(), result.reg(), 8)?);
                }
                Ok(result)
            }
            UnaryOperator::TailOf => {
                let value = self.gen_expr(operand)?;
                self.gen_runtime_call_with_values("BCPL_LIST_GET_TAIL", vec![value])
            }
        }
    }

    fn gen_address_of(&mut self, operand: &Expr) -> CodegenResult<ValReg> {
        match operand {
            Expr::Variable { .. } => {
                let name = operand.variable_name().unwrap().to_string();
                // The frame slot becomes the authoritative home: flush and
                // drop any register binding first.
                if let Some(home) = self.registers.variable_register(&name) {
                    let frame = self.frame.as_mut().expect("frame");
                    let store = frame.store_to_slot(&name, home)?;
                    self.stream.push(store);
                    self.registers.release_register(home);
                }
                if let Some(offset) = self.data.global_word_offset(&name) {
                    let temp = self.acquire_temp(false)?;
                    self.emit(encoder::add_imm(
                        temp.0,
                        Reg::DATA_BASE,
                        (offset * 8) as u32,
                    )?);
                    return Ok(ValReg::Temp(temp));
                }
                let temp = self.acquire_temp(false)?;
                let frame = self.frame.as_mut().expect("frame");
                let addr = frame.slot_address(&name, temp.0)?;
                self.stream.push(addr);
                Ok(ValReg::Temp(temp))
            }
            Expr::VectorAccess { vector, index } => {
                let (addr, idx) = self.gen_scaled_address(vector, index, 3)?;
                if let Some(idx) = idx {
                    self.release(idx);
                }
                Ok(addr)
            }
            other => Err(CodegenError::Internal(format!(
                "cannot take the address of {:?}",
                other
            ))),
        }
    }

    /// Compute `base + (index << shift)` into an owned register. Returns
    /// the address value and (for symmetry with callers that keep it) the
    /// consumed index, already released.
    fn gen_scaled_address(
        &mut self,
        base: &Expr,
        index: &Expr,
        shift: u8,
    ) -> CodegenResult<(ValReg, Option<ValReg>)> {
        let base_val = self.gen_expr(base)?;
        let index_val = self.gen_expr(index)?;
        let addr = self.acquire_temp(false)?;
        self.emit(encoder::lsl_imm(addr.0, index_val.reg(), shift));
        self.emit(encoder::add_reg(addr.0, base_val.reg(), addr.0));
        self.release(base_val);
        self.release(index_val);
        Ok((ValReg::Temp(addr), None))
    }

    fn gen_vector_load(
        &mut self,
        vector: &Expr,
        index: &Expr,
        shift: u8,
    ) -> CodegenResult<ValReg> {
        let base_val = self.gen_expr(vector)?;
        let index_val = self.gen_expr(index)?;
        let temp = self.acquire_temp(false)?;
        self.emit(encoder::ldr_reg_offset(
            temp.0,
            base_val.reg(),
            index_val.reg(),
            shift,
        ));
        self.release(base_val);
        self.release(index_val);
        Ok(ValReg::Temp(temp))
    }

    /// BITFIELD(value, start, width): UBFX when start and width are integer
    /// literals, the LSR + mask fallback otherwise.
    fn gen_bitfield(&mut self, arguments: &[Expr]) -> CodegenResult<ValReg> {
        let [value, start, width] = arguments else {
            return Err(CodegenError::Internal(
                "BITFIELD takes (value, start, width)".into(),
            ));
        };
        let value_val = self.gen_expr(value)?;
        if let (Some(start_lit), Some(width_lit)) =
            (constant_integer(start), constant_integer(width))
        {
            let temp = self.acquire_temp(false)?;
            self.emit(encoder::ubfx(
                temp.0,
                value_val.reg(),
                start_lit as u8,
                width_lit as u8,
            ));
            self.release(value_val);
            return Ok(ValReg::Temp(temp));
        }

        // Fallback: (value >> start) & ((1 << width) - 1).
        let start_val = self.gen_expr(start)?;
        let width_val = self.gen_expr(width)?;
        let temp = self.acquire_temp(false)?;
        let mask = self.registers.acquire_scratch_reg()?;
        self.emit(encoder::lsrv(temp.0, value_val.reg(), start_val.reg()));
        self.stream.extend(encoder::load_integer(mask.0, 1));
        self.emit(encoder::lslv(mask.0, mask.0, width_val.reg()));
        self.emit(encoder::sub_imm(mask.0, mask.0, 1)?);
        self.emit(encoder::and_reg(temp.0, temp.0, mask.0));
        self.registers.release_scratch(mask);
        self.release(value_val);
        self.release(start_val);
        self.release(width_val);
        Ok(ValReg::Temp(temp))
    }

    fn gen_conditional(
        &mut self,
        condition: &Expr,
        true_expr: &Expr,
        false_expr: &Expr,
    ) -> CodegenResult<ValReg> {
        let result_type = self.infer_type(&Expr::Conditional {
            condition: Box::new(condition.clone()),
            true_expr: Box::new(true_expr.clone()),
            false_expr: Box::new(false_expr.clone()),
        });
        let fp = result_type.uses_fp_register();
        let dest = self.acquire_temp(fp)?;
        let else_label = self.labels.create_label("cond_else");
        let end_label = self.labels.create_label("cond_end");

        let cond_val = self.gen_expr(condition)?;
        self.emit(encoder::cmp_imm(cond_val.reg(), 0)?);
        self.release(cond_val);
        self.emit(encoder::b_cond(Cond::Eq, &else_label));

        let true_val = self.gen_expr(true_expr)?;
        self.move_into(dest.0, true_val)?;
        self.emit(encoder::b(&end_label));

        self.stream.define_label(&else_label, Segment::Code);
        let false_val = self.gen_expr(false_expr)?;
        self.move_into(dest.0, false_val)?;
        self.stream.define_label(&end_label, Segment::Code);
        Ok(ValReg::Temp(dest))
    }

    /// Move (with int/float conversion) into a fixed destination register.
    pub(crate) fn move_into(&mut self, dest: Reg, value: ValReg) -> CodegenResult<()> {
        let src = value.reg();
        match (dest.is_fp(), src.is_fp()) {
            (true, true) => {
                if dest != src {
                    self.emit(encoder::fmov(dest, src));
                }
            }
            (true, false) => self.emit(encoder::scvtf(dest, src)),
            (false, true) => self.emit(encoder::fcvtzs(dest, src)),
            (false, false) => {
                if dest != src {
                    self.emit(encoder::mov_reg(dest, src));
                }
            }
        }
        self.release(value);
        Ok(())
    }

    fn gen_list_literal(
        &mut self,
        initializers: &[Expr],
        is_manifest: bool,
    ) -> CodegenResult<ValReg> {
        let mut values = Vec::with_capacity(initializers.len());
        for init in initializers {
            let value = match init {
                Expr::Number(NumberLiteral::Integer(v)) => {
                    crate::data::TemplateValue::Int(*v)
                }
                Expr::Number(NumberLiteral::Float(v)) => {
                    crate::data::TemplateValue::Float(*v)
                }
                Expr::CharLit(c) => crate::data::TemplateValue::Int(*c as i64),
                Expr::BooleanLit(b) => {
                    crate::data::TemplateValue::Int(if *b { -1 } else { 0 })
                }
                Expr::StringLit(s) => {
                    let label = self.data.add_string_literal(s);
                    crate::data::TemplateValue::StringRef(label)
                }
                other => {
                    return Err(CodegenError::Internal(format!(
                        "list literal element must be a literal, got {:?}",
                        other
                    )))
                }
            };
            values.push(value);
        }
        let label = self.data.add_list_template(values);

        let temp = self.acquire_temp(false)?;
        self.stream.extend(encoder::load_address_adrp(temp.0, &label));
        if is_manifest {
            // Manifest lists are the rodata template itself.
            return Ok(ValReg::Temp(temp));
        }
        self.gen_runtime_call_with_values("DEEPCOPYLITERALLIST", vec![ValReg::Temp(temp)])
    }

    /// Inline VALOF in expression position. Structured statements only; the
    /// full CFG lowering applies to function-body VALOFs.
    fn gen_valof_inline(&mut self, body: &Stmt, float: bool) -> CodegenResult<ValReg> {
        let dest = self.acquire_temp(float)?;
        let end_label = self.labels.create_label("valof_end");
        let dest_reg = dest.0;
        self.gen_valof_stmt(body, dest_reg, &end_label)?;
        self.stream.define_label(&end_label, Segment::Code);
        Ok(ValReg::Temp(dest))
    }

    fn gen_valof_stmt(
        &mut self,
        stmt: &Stmt,
        dest: Reg,
        end_label: &str,
    ) -> CodegenResult<()> {
        match stmt {
            Stmt::Resultis(expr) => {
                let value = self.gen_expr(expr)?;
                self.move_into(dest, value)?;
                self.emit(encoder::b(end_label));
                Ok(())
            }
            Stmt::Compound(stmts) => {
                for s in stmts {
                    self.gen_valof_stmt(s, dest, end_label)?;
                }
                Ok(())
            }
            Stmt::Block { statements, .. } => {
                for s in statements {
                    self.gen_valof_stmt(s, dest, end_label)?;
                }
                Ok(())
            }
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
                Ok(())
            }
            Stmt::Assignment { lhs, rhs } => {
                let mut values = Vec::with_capacity(rhs.len());
                for expr in rhs {
                    values.push(self.gen_expr(expr)?);
                }
                for (target, value) in lhs.iter().zip(values) {
                    self.gen_assignment_target(target, value)?;
                }
                Ok(())
            }
            Stmt::RoutineCall { routine, arguments } => {
                if let Some(result) = self.gen_call(routine, arguments, false)? {
                    self.release(result);
                }
                Ok(())
            }
            Stmt::If {
                condition,
                then_branch,
            } => {
                let skip = self.labels.create_label("valof_skip");
                let value = self.gen_expr(condition)?;
                self.emit(encoder::cmp_imm(value.reg(), 0)?);
                self.release(value);
                self.emit(encoder::b_cond(Cond::Eq, &skip));
                self.gen_valof_stmt(then_branch, dest, end_label)?;
                self.stream.define_label(&skip, Segment::Code);
                Ok(())
            }
            Stmt::Unless {
                condition,
                then_branch,
            } => {
                let skip = self.labels.create_label("valof_skip");
                let value = self.gen_expr(condition)?;
                self.emit(encoder::cmp_imm(value.reg(), 0)?);
                self.release(value);
                self.emit(encoder::b_cond(Cond::Ne, &skip));
                self.gen_valof_stmt(then_branch, dest, end_label)?;
                self.stream.define_label(&skip, Segment::Code);
                Ok(())
            }
            Stmt::Test {
                condition,
                then_branch,
                else_branch,
            } => {
                let else_label = self.labels.create_label("valof_else");
                let join_label = self.labels.create_label("valof_join");
                let value = self.gen_expr(condition)?;
                self.emit(encoder::cmp_imm(value.reg(), 0)?);
                self.release(value);
                self.emit(encoder::b_cond(Cond::Eq, &else_label));
                self.gen_valof_stmt(then_branch, dest, end_label)?;
                self.emit(encoder::b(&join_label));
                self.stream.define_label(&else_label, Segment::Code);
                self.gen_valof_stmt(else_branch, dest, end_label)?;
                self.stream.define_label(&join_label, Segment::Code);
                Ok(())
            }
            Stmt::Free(expr) => {
                let value = self.gen_expr(expr)?;
                let result = self.gen_runtime_call_with_values("BCPL_FREE_LIST", vec![value])?;
                self.release(result);
                Ok(())
            }
            Stmt::Brk => {
                self.emit(encoder::brk(0));
                Ok(())
            }
            other => Err(CodegenError::Internal(format!(
                "unsupported statement inside expression VALOF: {:?}",
                other
            ))),
        }
    }

    /// Store an already-evaluated value through an assignment target.
    pub(crate) fn gen_assignment_target(
        &mut self,
        target: &Expr,
        value: ValReg,
    ) -> CodegenResult<()> {
        match target {
            Expr::Variable { .. } => {
                let name = target.variable_name().unwrap().to_string();
                // Globals are stores through the data base, locals through
                // their home.
                if self.registers.variable_register(&name).is_none()
                    && !self
                        .frame
                        .as_ref()
                        .map(|f| f.has_slot(&name))
                        .unwrap_or(false)
                {
                    if let Some(offset) = self.data.global_word_offset(&name) {
                        let byte_offset = (offset * 8) as i32;
                        if value.reg().is_fp() {
                            self.emit(encoder::str_fp(value.reg(), Reg::DATA_BASE, byte_offset)?);
                        } else {
                            self.emit(encoder::str(value.reg(), Reg::DATA_BASE, byte_offset)?);
                        }
                        self.release(value);
                        return Ok(());
                    }
                }
                self.store_to_variable(&name, value)
            }
            Expr::VectorAccess { vector, index } => {
                let base_val = self.gen_expr(vector)?;
                let index_val = self.gen_expr(index)?;
                self.emit(encoder::str_reg_offset(
                    value.reg(),
                    base_val.reg(),
                    index_val.reg(),
                    3,
                ));
                self.release(base_val);
                self.release(index_val);
                self.release(value);
                Ok(())
            }
            Expr::FloatVectorAccess { vector, index } => {
                let (addr, _) = self.gen_scaled_address(vector, index, 3)?;
                let fp_value = self.promote_to_float(value)?;
                self.emit(encoder::str_fp(fp_value.reg(), addr.reg(), 0)?);
                self.release(addr);
                self.release(fp_value);
                Ok(())
            }
            Expr::CharIndirection { string, index } => {
                let (addr, _) = self.gen_scaled_address(string, index, 2)?;
                self.emit(encoder::str32(value.reg(), addr.reg(), 0)?);
                self.release(addr);
                self.release(value);
                Ok(())
            }
            Expr::Unary {
                op: UnaryOperator::Indirection,
                operand,
            } => {
                let ptr = self.gen_expr(operand)?;
                self.emit(encoder::str(value.reg(), ptr.reg(), 0)?);
                self.release(ptr);
                self.release(value);
                Ok(())
            }
            Expr::Unary {
                op: UnaryOperator::HeadOf,
                operand,
            } => {
                // HD(l) := v — store into the head node's value field.
                let list = self.gen_expr(operand)?;
                let node = self.registers.acquire_scratch_reg()?;
                self.emit(encoder::ldr(node.0, list.reg(), 16)?);
                self.emit(encoder::str(value.reg(), node.0, 8)?);
                self.registers.release_scratch(node);
                self.release(list);
                self.release(value);
                Ok(())
            }
            other => Err(CodegenError::Internal(format!(
                "invalid assignment target {:?}",
                other
            ))),
        }
    }
}

fn comparison_cond(op: BinaryOperator) -> Cond {
    match op {
        BinaryOperator::Equal | BinaryOperator::FloatEqual => Cond::Eq,
        BinaryOperator::NotEqual | BinaryOperator::FloatNotEqual => Cond::Ne,
        BinaryOperator::Less | BinaryOperator::FloatLess => Cond::Lt,
        BinaryOperator::LessEqual | BinaryOperator::FloatLessEqual => Cond::Le,
        BinaryOperator::Greater | BinaryOperator::FloatGreater => Cond::Gt,
        BinaryOperator::GreaterEqual | BinaryOperator::FloatGreaterEqual => Cond::Ge,
        other => unreachable!("{:?} is not a comparison", other),
    }
}

pub(crate) fn constant_integer(expr: &Expr) -> Option<i64> {
    match expr {
        Expr::Number(NumberLiteral::Integer(v)) => Some(*v),
        Expr::CharLit(c) => Some(*c as i64),
        Expr::BooleanLit(b) => Some(if *b { -1 } else { 0 }),
        _ => None,
    }
}

fn constant_float(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Number(NumberLiteral::Float(v)) => Some(*v),
        Expr::Number(NumberLiteral::Integer(v)) => Some(*v as f64),
        _ => None,
    }
}
