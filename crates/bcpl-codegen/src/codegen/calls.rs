//! Call-site lowering and the runtime-call ABI.
//!
//! Arguments are evaluated into spillable temporaries first, never straight
//! into the ABI registers; homing into X0-X7 / D0-D7 happens just before
//! the branch, with int/float conversions where the callee expects them.
//! In-use caller-saved registers are pushed in pairs around the call.
//! Runtime functions within branch range of the code buffer get a direct
//! BL; everything else goes through the X19 function-pointer table with a
//! BLR tagged JitCall.

use super::{CodeGenerator, ValReg};
use crate::encoder;
use crate::instr::JitAttr;
use crate::reg::Reg;
use crate::{CodegenError, CodegenResult};
use bcpl_ast::{Expr, FunctionType};

/// Margin kept inside the ±128 MiB BL range when deciding direct calls.
const BL_RANGE_SLACK: i64 = 1 << 20;

impl<'a> CodeGenerator<'a> {
    /// Generate a call. Returns the result value (X0/D0 moved into a fresh
    /// temporary) when `want_result`, or for float-returning callees whose
    /// result register must be drained either way.
    pub(crate) fn gen_call(
        &mut self,
        target: &Expr,
        arguments: &[Expr],
        want_result: bool,
    ) -> CodegenResult<Option<ValReg>> {
        // Syscalls masquerade as calls in statement position.
        if let Expr::SysCall {
            number,
            arguments: sys_args,
        } = target
        {
            let result = self.gen_syscall(number, sys_args)?;
            return Ok(Some(result));
        }

        let name = target.variable_name().map(str::to_string);

        // Runtime call?
        if let Some(ref name) = name {
            if self.runtime.is_registered(name) {
                let mut values = Vec::with_capacity(arguments.len());
                for arg in arguments {
                    values.push(self.gen_expr(arg)?);
                }
                let result = self.finish_runtime_call(name, values)?;
                return Ok(Some(result));
            }
        }

        // User function or routine by name?
        let is_known_function = name
            .as_deref()
            .and_then(|n| self.symbols.lookup(n))
            .map(|s| s.kind.is_function_like())
            .unwrap_or(false)
            || name
                .as_deref()
                .map(|n| self.metrics.contains_key(n))
                .unwrap_or(false);

        let mut values = Vec::with_capacity(arguments.len());
        for arg in arguments {
            values.push(self.gen_expr(arg)?);
        }

        let returns_float = name
            .as_deref()
            .map(|n| {
                self.metrics
                    .get(n)
                    .map(|m| m.returns_float)
                    .unwrap_or_else(|| {
                        self.symbols
                            .lookup(n)
                            .map(|s| s.kind.is_float_function())
                            .unwrap_or(false)
                    })
            })
            .unwrap_or(false);

        // Evaluate an indirect target before SP moves: temp acquisition can
        // spill, and spill slots are SP-relative.
        let indirect_target = if is_known_function {
            None
        } else {
            let callee = self.gen_expr(target)?;
            self.emit(encoder::mov_reg(Reg::X(16), callee.reg()));
            self.release(callee);
            Some(())
        };

        let saved = self.push_caller_saved()?;
        let stack_bytes = self.home_user_arguments(values)?;

        if indirect_target.is_none() {
            let callee = name.expect("known function has a name");
            self.emit(encoder::bl(&callee));
        } else {
            self.emit(encoder::blr(Reg::X(16)));
        }

        if stack_bytes > 0 {
            self.emit(encoder::add_imm(Reg::Sp, Reg::Sp, stack_bytes)?);
        }
        self.pop_caller_saved(saved)?;

        let result = self.capture_result(returns_float)?;
        if want_result || returns_float {
            Ok(Some(result))
        } else {
            self.release(result);
            Ok(None)
        }
    }

    /// Runtime call with pre-evaluated argument values.
    pub(crate) fn gen_runtime_call_with_values(
        &mut self,
        name: &str,
        values: Vec<ValReg>,
    ) -> CodegenResult<ValReg> {
        self.finish_runtime_call(name, values)
    }

    fn finish_runtime_call(
        &mut self,
        name: &str,
        mut values: Vec<ValReg>,
    ) -> CodegenResult<ValReg> {
        let func = self.runtime.get(name)?.clone();
        self.labels.mark_runtime(&func.name);

        // Conversions acquire temporaries, which can spill to SP-relative
        // slots — do them before SP moves for the caller-saved pushes.
        if func.fn_type == FunctionType::Float {
            if let Some(last) = values.last() {
                if !last.reg().is_fp() {
                    let value = values.pop().unwrap();
                    let temp = self.acquire_temp(true)?;
                    self.emit(encoder::scvtf(temp.0, value.reg()));
                    self.release(value);
                    values.push(ValReg::Temp(temp));
                }
            }
        }

        let saved = self.push_caller_saved()?;
        self.home_runtime_arguments(&func, values)?;

        // Direct BL when the implementation is reachable from the code
        // buffer; the table-indirect BLR otherwise.
        let direct = if self.options.jit_mode {
            let delta = func.address as i64 - self.options.code_base as i64;
            delta.abs() < (128 << 20) - BL_RANGE_SLACK
        } else {
            true
        };
        if direct {
            self.emit(encoder::bl(&func.name));
        } else {
            self.emit(encoder::ldr(
                Reg::X(16),
                Reg::RUNTIME_TABLE,
                func.table_offset as i32,
            )?);
            self.emit(
                encoder::blr(Reg::X(16))
                    .with_jit_attr(JitAttr::JitCall)
                    .with_relocation(crate::instr::Relocation::None, func.name.clone()),
            );
        }

        self.pop_caller_saved(saved)?;
        self.capture_result(func.fn_type == FunctionType::Float)
    }

    /// Move the result out of the ABI register into a fresh temporary so
    /// later calls cannot clobber it.
    fn capture_result(&mut self, float: bool) -> CodegenResult<ValReg> {
        if float {
            let temp = self.acquire_temp(true)?;
            self.emit(encoder::fmov(temp.0, Reg::D(0)));
            Ok(ValReg::Temp(temp))
        } else {
            let temp = self.acquire_temp(false)?;
            self.emit(encoder::mov_reg(temp.0, Reg::X(0)));
            Ok(ValReg::Temp(temp))
        }
    }

    /// Home user-call arguments positionally into X0-X7; float-bank values
    /// move bit-for-bit. Arguments past the eighth go to the outgoing stack
    /// area; returns the bytes to pop after the call.
    fn home_user_arguments(&mut self, values: Vec<ValReg>) -> CodegenResult<u32> {
        let extra = values.len().saturating_sub(8);
        let stack_bytes = ((extra * 8 + 15) & !15) as u32;
        if stack_bytes > 0 {
            self.emit(encoder::sub_imm(Reg::Sp, Reg::Sp, stack_bytes)?);
        }

        for (i, value) in values.into_iter().enumerate() {
            if i < 8 {
                let dest = Reg::X(i as u8);
                if value.reg().is_fp() {
                    self.emit(encoder::fmov(dest, value.reg()));
                } else if value.reg() != dest {
                    self.emit(encoder::mov_reg(dest, value.reg()));
                }
            } else {
                let offset = ((i - 8) * 8) as i32;
                if value.reg().is_fp() {
                    self.emit(encoder::str_fp(value.reg(), Reg::Sp, offset)?);
                } else {
                    self.emit(encoder::str(value.reg(), Reg::Sp, offset)?);
                }
            }
            self.release(value);
        }
        Ok(stack_bytes)
    }

    /// Home runtime-call arguments with separate GP and FP counters (the C
    /// ABI). The WRITEF / FPND trailing-argument conversion has already
    /// happened by the time SP moves.
    fn home_runtime_arguments(
        &mut self,
        _func: &bcpl_runtime::RuntimeFunction,
        values: Vec<ValReg>,
    ) -> CodegenResult<()> {
        let mut next_gp: u8 = 0;
        let mut next_fp: u8 = 0;
        for value in values {
            if value.reg().is_fp() {
                let dest = Reg::D(next_fp);
                next_fp += 1;
                if value.reg() != dest {
                    self.emit(encoder::fmov(dest, value.reg()));
                }
            } else {
                let dest = Reg::X(next_gp);
                next_gp += 1;
                if value.reg() != dest {
                    self.emit(encoder::mov_reg(dest, value.reg()));
                }
            }
            self.release(value);
        }
        Ok(())
    }

    /// Push the in-use caller-saved registers in 16-byte pairs. Returns the
    /// restore list in push order.
    fn push_caller_saved(&mut self) -> CodegenResult<Vec<Reg>> {
        let mut regs = self.registers.in_use_caller_saved();
        regs.sort();
        let mut i = 0;
        while i < regs.len() {
            if i + 1 < regs.len() && regs[i].is_fp() == regs[i + 1].is_fp() {
                self.emit(
                    encoder::stp_pre(regs[i], regs[i + 1], Reg::Sp, -16)
                        .with_jit_attr(JitAttr::JitStore),
                );
                i += 2;
            } else {
                self.emit(encoder::sub_imm(Reg::Sp, Reg::Sp, 16)?);
                self.emit(
                    if regs[i].is_fp() {
                        encoder::str_fp(regs[i], Reg::Sp, 0)?
                    } else {
                        encoder::str(regs[i], Reg::Sp, 0)?
                    }
                    .with_jit_attr(JitAttr::JitStore),
                );
                i += 1;
            }
        }
        Ok(regs)
    }

    fn pop_caller_saved(&mut self, regs: Vec<Reg>) -> CodegenResult<()> {
        // Undo in reverse pair order.
        let mut pairs: Vec<(Reg, Option<Reg>)> = Vec::new();
        let mut i = 0;
        while i < regs.len() {
            if i + 1 < regs.len() && regs[i].is_fp() == regs[i + 1].is_fp() {
                pairs.push((regs[i], Some(regs[i + 1])));
                i += 2;
            } else {
                pairs.push((regs[i], None));
                i += 1;
            }
        }
        for (a, b) in pairs.into_iter().rev() {
            match b {
                Some(b) => self.emit(
                    encoder::ldp_post(a, b, Reg::Sp, 16).with_jit_attr(JitAttr::JitRestore),
                ),
                None => {
                    self.emit(
                        if a.is_fp() {
                            encoder::ldr_fp(a, Reg::Sp, 0)?
                        } else {
                            encoder::ldr(a, Reg::Sp, 0)?
                        }
                        .with_jit_attr(JitAttr::JitRestore),
                    );
                    self.emit(encoder::add_imm(Reg::Sp, Reg::Sp, 16)?);
                }
            }
        }
        Ok(())
    }

    /// SYSCALL(number, args...): arguments in X0.., the number in X16, SVC.
    pub(crate) fn gen_syscall(
        &mut self,
        number: &Expr,
        arguments: &[Expr],
    ) -> CodegenResult<ValReg> {
        if arguments.len() > 8 {
            return Err(CodegenError::Internal(
                "SYSCALL supports at most 8 arguments".into(),
            ));
        }
        let mut values = Vec::with_capacity(arguments.len());
        for arg in arguments {
            values.push(self.gen_expr(arg)?);
        }
        let number_val = self.gen_expr(number)?;

        let saved = self.push_caller_saved()?;
        for (i, value) in values.into_iter().enumerate() {
            let dest = Reg::X(i as u8);
            if value.reg() != dest {
                self.emit(encoder::mov_reg(dest, value.reg()));
            }
            self.release(value);
        }
        self.emit(encoder::mov_reg(Reg::X(16), number_val.reg()));
        self.release(number_val);
        self.emit(encoder::svc(0x80));
        self.pop_caller_saved(saved)?;

        self.capture_result(false)
    }
}
