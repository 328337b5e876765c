//! AST-level strength reduction.
//!
//! Multiplication and division by power-of-two literals become shifts, and
//! `x REM 2^k` becomes a mask. The peephole pass repeats the same idea at
//! machine level for values that only become constant after folding.

use bcpl_ast::{BinaryOperator, CaseArm, Decl, Expr, NumberLiteral, Program, Stmt};

pub struct StrengthReductionPass {
    rewrites: usize,
}

impl Default for StrengthReductionPass {
    fn default() -> Self {
        Self::new()
    }
}

impl StrengthReductionPass {
    pub fn new() -> Self {
        StrengthReductionPass { rewrites: 0 }
    }

    pub fn run(mut self, program: &mut Program) -> usize {
        for decl in &mut program.declarations {
            self.reduce_decl(decl);
        }
        log::debug!("strength reduction: {} rewrites", self.rewrites);
        self.rewrites
    }

    fn reduce_decl(&mut self, decl: &mut Decl) {
        match decl {
            Decl::Function { body, .. } => self.reduce_expr(body),
            Decl::Routine { body, .. } => self.reduce_stmt(body),
            Decl::Label { command, .. } => self.reduce_stmt(command),
            _ => {}
        }
    }

    fn reduce_stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::Let { initializers, .. } => {
                for init in initializers {
                    self.reduce_expr(init);
                }
            }
            Stmt::Assignment { lhs, rhs } => {
                for e in lhs.iter_mut().chain(rhs.iter_mut()) {
                    self.reduce_expr(e);
                }
            }
            Stmt::RoutineCall { routine, arguments } => {
                self.reduce_expr(routine);
                for arg in arguments {
                    self.reduce_expr(arg);
                }
            }
            Stmt::If {
                condition,
                then_branch,
            }
            | Stmt::Unless {
                condition,
                then_branch,
            } => {
                self.reduce_expr(condition);
                self.reduce_stmt(then_branch);
            }
            Stmt::Test {
                condition,
                then_branch,
                else_branch,
            } => {
                self.reduce_expr(condition);
                self.reduce_stmt(then_branch);
                self.reduce_stmt(else_branch);
            }
            Stmt::While { condition, body } | Stmt::Until { condition, body } => {
                self.reduce_expr(condition);
                self.reduce_stmt(body);
            }
            Stmt::Repeat {
                body, condition, ..
            } => {
                self.reduce_stmt(body);
                if let Some(cond) = condition {
                    self.reduce_expr(cond);
                }
            }
            Stmt::For {
                start,
                end,
                step,
                body,
                ..
            } => {
                self.reduce_expr(start);
                self.reduce_expr(end);
                if let Some(step) = step {
                    self.reduce_expr(step);
                }
                self.reduce_stmt(body);
            }
            Stmt::ForEach {
                collection, body, ..
            } => {
                self.reduce_expr(collection);
                self.reduce_stmt(body);
            }
            Stmt::Switchon {
                expression,
                cases,
                default_case,
            } => {
                self.reduce_expr(expression);
                for CaseArm { command, .. } in cases {
                    self.reduce_stmt(command);
                }
                if let Some(default) = default_case {
                    self.reduce_stmt(default);
                }
            }
            Stmt::Resultis(expr) | Stmt::Free(expr) | Stmt::Goto(expr) => {
                self.reduce_expr(expr)
            }
            Stmt::Compound(stmts) => {
                for s in stmts {
                    self.reduce_stmt(s);
                }
            }
            Stmt::Block {
                declarations,
                statements,
            } => {
                for decl in declarations.iter_mut() {
                    self.reduce_decl(decl);
                }
                for s in statements {
                    self.reduce_stmt(s);
                }
            }
            Stmt::CondBranch { expr, .. } => self.reduce_expr(expr),
            _ => {}
        }
    }

    fn reduce_expr(&mut self, expr: &mut Expr) {
        // Children first.
        match expr {
            Expr::Binary { left, right, .. } => {
                self.reduce_expr(left);
                self.reduce_expr(right);
            }
            Expr::Unary { operand, .. } => self.reduce_expr(operand),
            Expr::VectorAccess { vector, index }
            | Expr::FloatVectorAccess { vector, index } => {
                self.reduce_expr(vector);
                self.reduce_expr(index);
            }
            Expr::CharIndirection { string, index } => {
                self.reduce_expr(string);
                self.reduce_expr(index);
            }
            Expr::Call {
                function,
                arguments,
            } => {
                self.reduce_expr(function);
                for arg in arguments {
                    self.reduce_expr(arg);
                }
            }
            Expr::Conditional {
                condition,
                true_expr,
                false_expr,
            } => {
                self.reduce_expr(condition);
                self.reduce_expr(true_expr);
                self.reduce_expr(false_expr);
            }
            Expr::Valof(body) | Expr::FloatValof(body) => self.reduce_stmt(body),
            Expr::VecAlloc { size } | Expr::StringAlloc { size } => self.reduce_expr(size),
            Expr::Table { initializers, .. } | Expr::ListLit { initializers, .. } => {
                for init in initializers {
                    self.reduce_expr(init);
                }
            }
            _ => {}
        }

        let Expr::Binary { op, left, right } = expr else {
            return;
        };
        let Expr::Number(NumberLiteral::Integer(value)) = **right else {
            return;
        };
        if value <= 1 || !value.unsigned_abs().is_power_of_two() {
            return;
        }
        let shift = value.trailing_zeros() as i64;

        let replacement_op = match op {
            BinaryOperator::Multiply => Some((BinaryOperator::LeftShift, shift)),
            BinaryOperator::Divide => Some((BinaryOperator::RightShift, shift)),
            BinaryOperator::Remainder => Some((BinaryOperator::LogicalAnd, value - 1)),
            _ => None,
        };
        if let Some((new_op, operand)) = replacement_op {
            *op = new_op;
            *right = Box::new(Expr::integer(operand));
            let _ = left;
            self.rewrites += 1;
        }
    }
}
