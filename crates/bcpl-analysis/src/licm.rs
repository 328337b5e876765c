//! Loop-invariant code motion.
//!
//! Hoists assignment right-hand sides that are invariant in a WHILE, UNTIL,
//! REPEAT or FOR body into a `_licm_temp_<n>` binding placed before the
//! loop. An expression is invariant when it reads no variable the loop
//! defines and contains no call (calls may have effects).

use crate::metrics::MetricsMap;
use crate::symbols::{SymbolKind, SymbolTable};
use bcpl_ast::visit::{defined_variables, expr_variables};
use bcpl_ast::{Decl, Expr, Program, Stmt, VarType};
use rustc_hash::FxHashSet;

pub struct LoopInvariantCodeMotionPass {
    temp_counter: usize,
    hoisted: usize,
    current_function: String,
}

impl Default for LoopInvariantCodeMotionPass {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopInvariantCodeMotionPass {
    pub fn new() -> Self {
        LoopInvariantCodeMotionPass {
            temp_counter: 0,
            hoisted: 0,
            current_function: String::new(),
        }
    }

    pub fn run(
        mut self,
        program: &mut Program,
        table: &mut SymbolTable,
        metrics: &mut MetricsMap,
    ) -> usize {
        for decl in &mut program.declarations {
            match decl {
                Decl::Function { name, body, .. } => {
                    self.current_function = name.clone();
                    if let Expr::Valof(inner) | Expr::FloatValof(inner) = body {
                        self.process_stmt(inner, table, metrics);
                    }
                }
                Decl::Routine { name, body, .. } => {
                    self.current_function = name.clone();
                    self.process_stmt(body, table, metrics);
                }
                _ => {}
            }
        }
        log::debug!("LICM: {} expressions hoisted", self.hoisted);
        self.hoisted
    }

    /// Walk statement lists so hoisted bindings can be inserted before the
    /// loop they came out of.
    fn process_stmt(
        &mut self,
        stmt: &mut Stmt,
        table: &mut SymbolTable,
        metrics: &mut MetricsMap,
    ) {
        match stmt {
            Stmt::Block { statements, .. } | Stmt::Compound(statements) => {
                self.process_list(statements, table, metrics);
            }
            Stmt::If { then_branch, .. } | Stmt::Unless { then_branch, .. } => {
                self.process_stmt(then_branch, table, metrics)
            }
            Stmt::Test {
                then_branch,
                else_branch,
                ..
            } => {
                self.process_stmt(then_branch, table, metrics);
                self.process_stmt(else_branch, table, metrics);
            }
            Stmt::While { body, .. }
            | Stmt::Until { body, .. }
            | Stmt::Repeat { body, .. }
            | Stmt::For { body, .. }
            | Stmt::ForEach { body, .. } => self.process_stmt(body, table, metrics),
            Stmt::Switchon {
                cases,
                default_case,
                ..
            } => {
                for arm in cases {
                    self.process_stmt(&mut arm.command, table, metrics);
                }
                if let Some(default) = default_case {
                    self.process_stmt(default, table, metrics);
                }
            }
            _ => {}
        }
    }

    fn process_list(
        &mut self,
        statements: &mut Vec<Stmt>,
        table: &mut SymbolTable,
        metrics: &mut MetricsMap,
    ) {
        let mut index = 0;
        while index < statements.len() {
            if is_loop(&statements[index]) {
                let hoisted = self.hoist_from_loop(&mut statements[index], table, metrics);
                let count = hoisted.len();
                for (offset, binding) in hoisted.into_iter().enumerate() {
                    statements.insert(index + offset, binding);
                }
                index += count;
            }
            // Recurse after hoisting so nested loops inside are handled too.
            self.process_stmt(&mut statements[index], table, metrics);
            index += 1;
        }
    }

    /// Pull invariant assignment RHS values out of a loop body. Returns the
    /// `LET` bindings to insert before the loop.
    fn hoist_from_loop(
        &mut self,
        loop_stmt: &mut Stmt,
        table: &mut SymbolTable,
        metrics: &mut MetricsMap,
    ) -> Vec<Stmt> {
        let body = match loop_stmt {
            Stmt::While { body, .. }
            | Stmt::Until { body, .. }
            | Stmt::Repeat { body, .. }
            | Stmt::For { body, .. } => body,
            _ => return Vec::new(),
        };

        let defined: FxHashSet<String> = defined_variables(body).into_iter().collect();
        // FOR loop variables are defined by the loop itself.
        let defined = if let Stmt::For {
            loop_variable,
            unique_loop_variable,
            ..
        } = loop_stmt
        {
            let mut d = defined;
            d.insert(
                unique_loop_variable
                    .clone()
                    .unwrap_or_else(|| loop_variable.clone()),
            );
            d
        } else {
            defined
        };

        let body = match loop_stmt {
            Stmt::While { body, .. }
            | Stmt::Until { body, .. }
            | Stmt::Repeat { body, .. }
            | Stmt::For { body, .. } => body,
            _ => unreachable!(),
        };

        let mut bindings = Vec::new();
        self.hoist_in_stmt(body, &defined, &mut bindings, table, metrics);
        bindings
    }

    fn hoist_in_stmt(
        &mut self,
        stmt: &mut Stmt,
        loop_defs: &FxHashSet<String>,
        bindings: &mut Vec<Stmt>,
        table: &mut SymbolTable,
        metrics: &mut MetricsMap,
    ) {
        match stmt {
            Stmt::Assignment { rhs, .. } => {
                for expr in rhs.iter_mut() {
                    self.try_hoist_expr(expr, loop_defs, bindings, table, metrics);
                }
            }
            Stmt::Let { initializers, .. } => {
                for expr in initializers.iter_mut() {
                    self.try_hoist_expr(expr, loop_defs, bindings, table, metrics);
                }
            }
            Stmt::Compound(stmts) => {
                for s in stmts {
                    self.hoist_in_stmt(s, loop_defs, bindings, table, metrics);
                }
            }
            Stmt::Block { statements, .. } => {
                for s in statements {
                    self.hoist_in_stmt(s, loop_defs, bindings, table, metrics);
                }
            }
            Stmt::If { then_branch, .. } | Stmt::Unless { then_branch, .. } => {
                self.hoist_in_stmt(then_branch, loop_defs, bindings, table, metrics)
            }
            Stmt::Test {
                then_branch,
                else_branch,
                ..
            } => {
                self.hoist_in_stmt(then_branch, loop_defs, bindings, table, metrics);
                self.hoist_in_stmt(else_branch, loop_defs, bindings, table, metrics);
            }
            // Inner loops keep their own invariants; a later visit of the
            // inner loop hoists them to just outside it.
            _ => {}
        }
    }

    fn try_hoist_expr(
        &mut self,
        expr: &mut Expr,
        loop_defs: &FxHashSet<String>,
        bindings: &mut Vec<Stmt>,
        table: &mut SymbolTable,
        metrics: &mut MetricsMap,
    ) {
        if !is_hoistable(expr, loop_defs) {
            return;
        }

        let temp = format!("_licm_temp_{}", self.temp_counter);
        self.temp_counter += 1;

        let var_type = crate::analyzer::infer_expr(
            expr,
            table,
            metrics.get(&self.current_function),
        );
        let var_type = if var_type == VarType::UNKNOWN {
            VarType::INTEGER
        } else {
            var_type
        };
        table.add(&temp, SymbolKind::LocalVar, var_type);
        if let Some(m) = metrics.get_mut(&self.current_function) {
            m.add_local(&temp, var_type);
        }

        let invariant = std::mem::replace(expr, Expr::variable(temp.clone()));
        bindings.push(Stmt::Let {
            names: vec![temp],
            initializers: vec![invariant],
            is_float: var_type == VarType::FLOAT,
        });
        self.hoisted += 1;
    }
}

fn is_loop(stmt: &Stmt) -> bool {
    matches!(
        stmt,
        Stmt::While { .. } | Stmt::Until { .. } | Stmt::Repeat { .. } | Stmt::For { .. }
    )
}

/// Worth hoisting: a binary expression with no calls, reading only
/// variables the loop never defines.
fn is_hoistable(expr: &Expr, loop_defs: &FxHashSet<String>) -> bool {
    if !matches!(expr, Expr::Binary { .. }) {
        return false;
    }
    if contains_call(expr) {
        return false;
    }
    let used = expr_variables(expr);
    !used.is_empty() && used.iter().all(|v| !loop_defs.contains(v))
}

fn contains_call(expr: &Expr) -> bool {
    match expr {
        Expr::Call { .. } | Expr::SysCall { .. } => true,
        Expr::Binary { left, right, .. } => contains_call(left) || contains_call(right),
        Expr::Unary { operand, .. } => contains_call(operand),
        Expr::VectorAccess { vector, index }
        | Expr::FloatVectorAccess { vector, index } => {
            contains_call(vector) || contains_call(index)
        }
        Expr::CharIndirection { string, index } => contains_call(string) || contains_call(index),
        Expr::Conditional {
            condition,
            true_expr,
            false_expr,
        } => contains_call(condition) || contains_call(true_expr) || contains_call(false_expr),
        Expr::Valof(_) | Expr::FloatValof(_) => true,
        Expr::VecAlloc { .. } | Expr::StringAlloc { .. } | Expr::ListLit { .. } => true,
        _ => false,
    }
}
