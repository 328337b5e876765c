//! Variable use/def collection over statements and expressions.
//!
//! The liveness and live-interval passes consume these. A variable is "used"
//! by a statement when its value is read anywhere inside it, and "defined"
//! when it is the target of an assignment, a LET, or a loop-variable binding.

use crate::ast::{CaseArm, Expr, Stmt};

/// All variables read by the statement, in first-appearance order.
/// Duplicates are preserved; callers build sets as needed.
pub fn used_variables(stmt: &Stmt) -> Vec<String> {
    let mut out = Vec::new();
    collect_stmt_uses(stmt, &mut out);
    out
}

/// All variables written by the statement.
pub fn defined_variables(stmt: &Stmt) -> Vec<String> {
    let mut out = Vec::new();
    collect_stmt_defs(stmt, &mut out);
    out
}

/// All variables read by an expression.
pub fn expr_variables(expr: &Expr) -> Vec<String> {
    let mut out = Vec::new();
    collect_expr_uses(expr, &mut out);
    out
}

fn collect_expr_uses(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Variable { .. } => {
            if let Some(name) = expr.variable_name() {
                out.push(name.to_string());
            }
        }
        Expr::Binary { left, right, .. } => {
            collect_expr_uses(left, out);
            collect_expr_uses(right, out);
        }
        Expr::Unary { operand, .. } => collect_expr_uses(operand, out),
        Expr::VectorAccess { vector, index }
        | Expr::FloatVectorAccess { vector, index } => {
            collect_expr_uses(vector, out);
            collect_expr_uses(index, out);
        }
        Expr::CharIndirection { string, index } => {
            collect_expr_uses(string, out);
            collect_expr_uses(index, out);
        }
        Expr::Call {
            function,
            arguments,
        } => {
            // A direct call by name is not a variable use; an indirect call
            // through a variable is.
            if function.variable_name().is_none() {
                collect_expr_uses(function, out);
            }
            for arg in arguments {
                collect_expr_uses(arg, out);
            }
        }
        Expr::SysCall { number, arguments } => {
            collect_expr_uses(number, out);
            for arg in arguments {
                collect_expr_uses(arg, out);
            }
        }
        Expr::Conditional {
            condition,
            true_expr,
            false_expr,
        } => {
            collect_expr_uses(condition, out);
            collect_expr_uses(true_expr, out);
            collect_expr_uses(false_expr, out);
        }
        Expr::Valof(body) | Expr::FloatValof(body) => collect_stmt_uses(body, out),
        Expr::VecAlloc { size } | Expr::StringAlloc { size } => collect_expr_uses(size, out),
        Expr::Table { initializers, .. } | Expr::ListLit { initializers, .. } => {
            for init in initializers {
                collect_expr_uses(init, out);
            }
        }
        Expr::Number(_) | Expr::StringLit(_) | Expr::CharLit(_) | Expr::BooleanLit(_) => {}
    }
}

fn collect_stmt_uses(stmt: &Stmt, out: &mut Vec<String>) {
    match stmt {
        Stmt::Let { initializers, .. } => {
            for init in initializers {
                collect_expr_uses(init, out);
            }
        }
        Stmt::Assignment { lhs, rhs } => {
            for expr in rhs {
                collect_expr_uses(expr, out);
            }
            // A write through an lvalue that is not a plain variable still
            // reads the address expression.
            for expr in lhs {
                if expr.variable_name().is_none() {
                    collect_expr_uses(expr, out);
                }
            }
        }
        Stmt::RoutineCall { routine, arguments } => {
            if routine.variable_name().is_none() {
                collect_expr_uses(routine, out);
            }
            for arg in arguments {
                collect_expr_uses(arg, out);
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
            collect_expr_uses(condition, out);
            collect_stmt_uses(then_branch, out);
        }
        Stmt::Test {
            condition,
            then_branch,
            else_branch,
        } => {
            collect_expr_uses(condition, out);
            collect_stmt_uses(then_branch, out);
            collect_stmt_uses(else_branch, out);
        }
        Stmt::While { condition, body } | Stmt::Until { condition, body } => {
            collect_expr_uses(condition, out);
            collect_stmt_uses(body, out);
        }
        Stmt::Repeat {
            body, condition, ..
        } => {
            collect_stmt_uses(body, out);
            if let Some(cond) = condition {
                collect_expr_uses(cond, out);
            }
        }
        Stmt::For {
            start,
            end,
            step,
            body,
            ..
        } => {
            collect_expr_uses(start, out);
            collect_expr_uses(end, out);
            if let Some(step) = step {
                collect_expr_uses(step, out);
            }
            collect_stmt_uses(body, out);
        }
        Stmt::ForEach {
            collection, body, ..
        } => {
            collect_expr_uses(collection, out);
            collect_stmt_uses(body, out);
        }
        Stmt::Switchon {
            expression,
            cases,
            default_case,
        } => {
            collect_expr_uses(expression, out);
            for CaseArm {
                constant, command, ..
            } in cases
            {
                collect_expr_uses(constant, out);
                collect_stmt_uses(command, out);
            }
            if let Some(default) = default_case {
                collect_stmt_uses(default, out);
            }
        }
        Stmt::Goto(expr) => {
            if expr.variable_name().is_none() {
                collect_expr_uses(expr, out);
            }
        }
        Stmt::Resultis(expr) | Stmt::Free(expr) => collect_expr_uses(expr, out),
        Stmt::Compound(stmts) => {
            for s in stmts {
                collect_stmt_uses(s, out);
            }
        }
        Stmt::Block { statements, .. } => {
            for s in statements {
                collect_stmt_uses(s, out);
            }
        }
        Stmt::CondBranch { expr, .. } => collect_expr_uses(expr, out),
        Stmt::Return
        | Stmt::Finish
        | Stmt::Break
        | Stmt::Loop
        | Stmt::Endcase
        | Stmt::Brk
        | Stmt::LabelTarget(_) => {}
    }
}

fn collect_stmt_defs(stmt: &Stmt, out: &mut Vec<String>) {
    match stmt {
        Stmt::Let { names, .. } => out.extend(names.iter().cloned()),
        Stmt::Assignment { lhs, .. } => {
            for expr in lhs {
                if let Some(name) = expr.variable_name() {
                    out.push(name.to_string());
                }
            }
        }
        Stmt::For {
            loop_variable,
            unique_loop_variable,
            body,
            ..
        } => {
            out.push(
                unique_loop_variable
                    .clone()
                    .unwrap_or_else(|| loop_variable.clone()),
            );
            collect_stmt_defs(body, out);
        }
        Stmt::ForEach {
            value_name,
            pointer_name,
            body,
            ..
        } => {
            out.push(value_name.clone());
            if let Some(ptr) = pointer_name {
                out.push(ptr.clone());
            }
            collect_stmt_defs(body, out);
        }
        Stmt::If { then_branch, .. } | Stmt::Unless { then_branch, .. } => {
            collect_stmt_defs(then_branch, out)
        }
        Stmt::Test {
            then_branch,
            else_branch,
            ..
        } => {
            collect_stmt_defs(then_branch, out);
            collect_stmt_defs(else_branch, out);
        }
        Stmt::While { body, .. }
        | Stmt::Until { body, .. }
        | Stmt::Repeat { body, .. } => collect_stmt_defs(body, out),
        Stmt::Switchon {
            cases,
            default_case,
            ..
        } => {
            for arm in cases {
                collect_stmt_defs(&arm.command, out);
            }
            if let Some(default) = default_case {
                collect_stmt_defs(default, out);
            }
        }
        Stmt::Compound(stmts) => {
            for s in stmts {
                collect_stmt_defs(s, out);
            }
        }
        Stmt::Block { statements, .. } => {
            for s in statements {
                collect_stmt_defs(s, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::BinaryOperator;

    fn assign(name: &str, rhs: Expr) -> Stmt {
        Stmt::Assignment {
            lhs: vec![Expr::variable(name)],
            rhs: vec![rhs],
        }
    }

    #[test]
    fn test_assignment_use_def() {
        let stmt = assign(
            "x",
            Expr::Binary {
                op: BinaryOperator::Add,
                left: Box::new(Expr::variable("a")),
                right: Box::new(Expr::variable("b")),
            },
        );
        assert_eq!(used_variables(&stmt), vec!["a", "b"]);
        assert_eq!(defined_variables(&stmt), vec!["x"]);
    }

    #[test]
    fn test_store_through_pointer_uses_address() {
        let stmt = Stmt::Assignment {
            lhs: vec![Expr::VectorAccess {
                vector: Box::new(Expr::variable("v")),
                index: Box::new(Expr::variable("i")),
            }],
            rhs: vec![Expr::integer(0)],
        };
        let used = used_variables(&stmt);
        assert!(used.contains(&"v".to_string()));
        assert!(used.contains(&"i".to_string()));
        assert!(defined_variables(&stmt).is_empty());
    }

    #[test]
    fn test_for_defines_unique_loop_variable() {
        let stmt = Stmt::For {
            loop_variable: "i".to_string(),
            unique_loop_variable: Some("i_for_var_0".to_string()),
            unique_step_variable: None,
            unique_end_variable: None,
            start: Expr::integer(0),
            end: Expr::variable("n"),
            step: None,
            body: Box::new(Stmt::Compound(vec![])),
        };
        assert_eq!(defined_variables(&stmt), vec!["i_for_var_0"]);
        assert_eq!(used_variables(&stmt), vec!["n"]);
    }

    #[test]
    fn test_direct_call_name_is_not_a_use() {
        let stmt = Stmt::RoutineCall {
            routine: Expr::variable("WRITEN"),
            arguments: vec![Expr::variable("x")],
        };
        assert_eq!(used_variables(&stmt), vec!["x"]);
    }

    #[test]
    fn test_clone_preserves_use_def_sets() {
        let stmt = assign(
            "r",
            Expr::Binary {
                op: BinaryOperator::Multiply,
                left: Box::new(Expr::variable("p")),
                right: Box::new(Expr::variable("q")),
            },
        );
        let copy = stmt.clone();
        assert_eq!(used_variables(&stmt), used_variables(&copy));
        assert_eq!(defined_variables(&stmt), defined_variables(&copy));
    }
}
