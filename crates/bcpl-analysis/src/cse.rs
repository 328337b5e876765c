//! Local common-subexpression elimination.
//!
//! Runs per basic block in two sub-passes: first count every subexpression
//! under a canonical string key (commutative operators sort their operand
//! keys), then rewrite assignments whose RHS key occurs more than once into
//! a fresh `_cse_temp_<n>` binding inserted before the first occurrence.
//! Any assignment to a plain variable invalidates every available key that
//! mentions it.

use crate::analyzer::infer_expr;
use crate::cfg::ControlFlowGraph;
use crate::metrics::MetricsMap;
use crate::symbols::{SymbolKind, SymbolTable};
use bcpl_ast::{Expr, NumberLiteral, Stmt, VarType};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

pub struct LocalOptimizationPass {
    temp_counter: usize,
    expr_counts: FxHashMap<String, usize>,
    available: FxHashMap<String, String>,
    replacements: usize,
}

impl Default for LocalOptimizationPass {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalOptimizationPass {
    pub fn new() -> Self {
        LocalOptimizationPass {
            temp_counter: 0,
            expr_counts: FxHashMap::default(),
            available: FxHashMap::default(),
            replacements: 0,
        }
    }

    /// Run over every block of every CFG. Temps are registered in the
    /// symbol table and the owning function's metrics.
    pub fn run(
        mut self,
        cfgs: &mut BTreeMap<String, ControlFlowGraph>,
        table: &mut SymbolTable,
        metrics: &mut MetricsMap,
    ) -> usize {
        for (function_name, cfg) in cfgs.iter_mut() {
            let ids: Vec<u32> = cfg.blocks.keys().copied().collect();
            for id in ids {
                let block = cfg.blocks.get_mut(&id).unwrap();

                // Sub-pass 1: counting.
                self.expr_counts.clear();
                for stmt in &block.statements {
                    count_in_stmt(stmt, &mut self.expr_counts);
                }

                // Sub-pass 2: rewriting.
                self.available.clear();
                let mut index = 0;
                while index < block.statements.len() {
                    self.rewrite_statement(
                        &mut block.statements,
                        &mut index,
                        function_name,
                        table,
                        metrics,
                    );
                    index += 1;
                }
            }
        }
        log::debug!("CSE: {} subexpressions replaced", self.replacements);
        self.replacements
    }

    fn rewrite_statement(
        &mut self,
        statements: &mut Vec<Stmt>,
        index: &mut usize,
        function_name: &str,
        table: &mut SymbolTable,
        metrics: &mut MetricsMap,
    ) {
        let mut bindings: Vec<Stmt> = Vec::new();
        let mut assigned: Vec<String> = Vec::new();

        match statements.get_mut(*index) {
            Some(Stmt::Assignment { lhs, rhs }) => {
                for expr in rhs.iter_mut() {
                    self.rewrite_expr(expr, &mut bindings, function_name, table, metrics);
                }
                assigned = lhs
                    .iter()
                    .filter_map(|e| e.variable_name().map(str::to_string))
                    .collect();
            }
            Some(Stmt::Let {
                names,
                initializers,
                ..
            }) => {
                assigned = names.clone();
                for expr in initializers.iter_mut() {
                    self.rewrite_expr(expr, &mut bindings, function_name, table, metrics);
                }
            }
            Some(Stmt::Resultis(expr)) => {
                // Moved out so the borrow of `statements` ends before insert.
                let mut e = std::mem::replace(expr, Expr::integer(0));
                self.rewrite_expr(&mut e, &mut bindings, function_name, table, metrics);
                if let Some(Stmt::Resultis(slot)) = statements.get_mut(*index) {
                    *slot = e;
                }
            }
            _ => return,
        }

        // Invalidate keys mentioning any plainly assigned variable.
        for name in assigned {
            self.invalidate(&name);
        }

        // Insert the new bindings before the statement they feed, pushing
        // subsequent statements right.
        let count = bindings.len();
        for (offset, binding) in bindings.into_iter().enumerate() {
            statements.insert(*index + offset, binding);
        }
        *index += count;
    }

    /// Bottom-up rewrite of one expression tree: inner common
    /// subexpressions become temps before outer ones do.
    fn rewrite_expr(
        &mut self,
        expr: &mut Expr,
        bindings: &mut Vec<Stmt>,
        function_name: &str,
        table: &mut SymbolTable,
        metrics: &mut MetricsMap,
    ) {
        if let Expr::Binary { left, right, .. } = expr {
            self.rewrite_expr(left, bindings, function_name, table, metrics);
            self.rewrite_expr(right, bindings, function_name, table, metrics);
        }

        if !matches!(expr, Expr::Binary { .. }) {
            return;
        }
        let key = expr_key(expr);

        if let Some(temp) = self.available.get(&key) {
            *expr = Expr::variable(temp.clone());
            self.replacements += 1;
            return;
        }

        if self.expr_counts.get(&key).copied().unwrap_or(0) > 1 {
            let temp = format!("_cse_temp_{}", self.temp_counter);
            self.temp_counter += 1;
            self.available.insert(key, temp.clone());

            let var_type = infer_expr(expr, table, metrics.get(function_name));
            let var_type = if var_type == VarType::UNKNOWN {
                VarType::INTEGER
            } else {
                var_type
            };
            table.add(&temp, SymbolKind::LocalVar, var_type);
            if let Some(m) = metrics.get_mut(function_name) {
                m.add_local(&temp, var_type);
            }

            let hoisted = std::mem::replace(expr, Expr::variable(temp.clone()));
            bindings.push(Stmt::Let {
                names: vec![temp],
                initializers: vec![hoisted],
                is_float: var_type == VarType::FLOAT,
            });
            self.replacements += 1;
        }
    }

    fn invalidate(&mut self, var_name: &str) {
        let needle = format!("(VAR {})", var_name);
        self.available.retain(|key, _| !key.contains(&needle));
    }
}

/// Canonical string key for an expression. Commutative operators sort their
/// operand keys so `a+b` and `b+a` collide.
pub fn expr_key(expr: &Expr) -> String {
    match expr {
        Expr::Binary { op, left, right } => {
            let mut left_key = expr_key(left);
            let mut right_key = expr_key(right);
            if op.is_commutative() && left_key > right_key {
                std::mem::swap(&mut left_key, &mut right_key);
            }
            format!("(BIN_OP {:?} {} {})", op, left_key, right_key)
        }
        Expr::Unary { op, operand } => format!("(UN_OP {:?} {})", op, expr_key(operand)),
        Expr::Variable { .. } => format!("(VAR {})", expr.variable_name().unwrap_or("")),
        Expr::Number(NumberLiteral::Integer(v)) => format!("(INT {})", v),
        Expr::Number(NumberLiteral::Float(v)) => format!("(FLOAT {})", v),
        Expr::StringLit(s) => format!("(STR {:?})", s),
        Expr::CharLit(c) => format!("(CHAR {})", c),
        Expr::BooleanLit(b) => format!("(BOOL {})", if *b { 1 } else { 0 }),
        Expr::VectorAccess { vector, index } => {
            format!("(VECACC {} {})", expr_key(vector), expr_key(index))
        }
        Expr::CharIndirection { string, index } => {
            format!("(CHARIND {} {})", expr_key(string), expr_key(index))
        }
        Expr::FloatVectorAccess { vector, index } => {
            format!("(FVECACC {} {})", expr_key(vector), expr_key(index))
        }
        _ => "(EXPR)".to_string(),
    }
}

/// Count binary subexpressions reachable from a statement.
fn count_in_stmt(stmt: &Stmt, counts: &mut FxHashMap<String, usize>) {
    match stmt {
        Stmt::Assignment { rhs, .. } => {
            for expr in rhs {
                count_in_expr(expr, counts);
            }
        }
        Stmt::Let { initializers, .. } => {
            for expr in initializers {
                count_in_expr(expr, counts);
            }
        }
        Stmt::RoutineCall { arguments, .. } => {
            for arg in arguments {
                count_in_expr(arg, counts);
            }
        }
        Stmt::Resultis(expr) | Stmt::CondBranch { expr, .. } => count_in_expr(expr, counts),
        Stmt::If { condition, .. }
        | Stmt::Unless { condition, .. }
        | Stmt::Test { condition, .. }
        | Stmt::While { condition, .. }
        | Stmt::Until { condition, .. } => count_in_expr(condition, counts),
        _ => {}
    }
}

fn count_in_expr(expr: &Expr, counts: &mut FxHashMap<String, usize>) {
    if matches!(expr, Expr::Binary { .. }) {
        *counts.entry(expr_key(expr)).or_insert(0) += 1;
    }
    match expr {
        Expr::Binary { left, right, .. } => {
            count_in_expr(left, counts);
            count_in_expr(right, counts);
        }
        Expr::Unary { operand, .. } => count_in_expr(operand, counts),
        Expr::Call { arguments, .. } => {
            for arg in arguments {
                count_in_expr(arg, counts);
            }
        }
        Expr::VectorAccess { vector, index }
        | Expr::FloatVectorAccess { vector, index } => {
            count_in_expr(vector, counts);
            count_in_expr(index, counts);
        }
        Expr::CharIndirection { string, index } => {
            count_in_expr(string, counts);
            count_in_expr(index, counts);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::cfg::CfgBuilder;
    use bcpl_ast::BinaryOperator;
    use bcpl_parser::parse_source;

    fn run_cse(source: &str) -> (BTreeMap<String, ControlFlowGraph>, MetricsMap, usize) {
        let mut program = parse_source(source).unwrap();
        let mut table = SymbolTable::new();
        let output = Analyzer::new().analyze(&mut program, &mut table);
        let mut metrics = output.metrics;
        let mut cfgs = CfgBuilder::new().build(&program).unwrap();
        let count = LocalOptimizationPass::new().run(&mut cfgs, &mut table, &mut metrics);
        (cfgs, metrics, count)
    }

    #[test]
    fn test_commutative_keys_match() {
        let a_plus_b = Expr::Binary {
            op: BinaryOperator::Add,
            left: Box::new(Expr::variable("a")),
            right: Box::new(Expr::variable("b")),
        };
        let b_plus_a = Expr::Binary {
            op: BinaryOperator::Add,
            left: Box::new(Expr::variable("b")),
            right: Box::new(Expr::variable("a")),
        };
        assert_eq!(expr_key(&a_plus_b), expr_key(&b_plus_a));

        let a_minus_b = Expr::Binary {
            op: BinaryOperator::Subtract,
            left: Box::new(Expr::variable("a")),
            right: Box::new(Expr::variable("b")),
        };
        let b_minus_a = Expr::Binary {
            op: BinaryOperator::Subtract,
            left: Box::new(Expr::variable("b")),
            right: Box::new(Expr::variable("a")),
        };
        assert_ne!(expr_key(&a_minus_b), expr_key(&b_minus_a));
    }

    #[test]
    fn test_repeated_rhs_gets_temp() {
        let (cfgs, metrics, count) = run_cse(
            "LET F(a, b) BE $( \
               LET x = 0; LET y = 0; \
               x := a + b; \
               y := a + b \
             $)",
        );
        assert!(count >= 2, "expected replacements, got {}", count);
        // The temp is recorded as a local of F.
        assert!(metrics["F"]
            .variable_types
            .keys()
            .any(|k| k.starts_with("_cse_temp_")));
        // Exactly one binding statement carries the hoisted expression.
        let cfg = &cfgs["F"];
        let bindings: usize = cfg
            .blocks
            .values()
            .flat_map(|b| &b.statements)
            .filter(|s| {
                matches!(s, Stmt::Let { names, .. } if names[0].starts_with("_cse_temp_"))
            })
            .count();
        assert_eq!(bindings, 1);
    }

    #[test]
    fn test_assignment_invalidates_available() {
        let (cfgs, _, _) = run_cse(
            "LET F(a, b) BE $( \
               LET x = 0; LET y = 0; \
               x := a + b; \
               a := 0; \
               y := a + b \
             $)",
        );
        // After `a := 0` the temp bound before the store is dead: the
        // second `a + b` gets a fresh binding rather than reading
        // `_cse_temp_0`.
        let cfg = &cfgs["F"];
        let y_rhs_temp = cfg
            .blocks
            .values()
            .flat_map(|b| &b.statements)
            .filter_map(|s| match s {
                Stmt::Assignment { lhs, rhs } => {
                    lhs[0].variable_name().filter(|n| *n == "y")?;
                    rhs[0].variable_name().map(str::to_string)
                }
                _ => None,
            })
            .next_back()
            .unwrap();
        assert_ne!(y_rhs_temp, "_cse_temp_0");

        // Two distinct bindings exist, one per side of the store to `a`.
        let bindings: usize = cfg
            .blocks
            .values()
            .flat_map(|b| &b.statements)
            .filter(|s| {
                matches!(s, Stmt::Let { names, .. } if names[0].starts_with("_cse_temp_"))
            })
            .count();
        assert_eq!(bindings, 2);
    }

    #[test]
    fn test_nested_common_subexpression_in_resultis() {
        // (a+b)*(a+b)+(a+b) hoists exactly one temp for a+b.
        let (cfgs, metrics, _) = run_cse("LET F(a, b) = (a+b)*(a+b)+(a+b)");
        let temps: Vec<&String> = metrics["F"]
            .variable_types
            .keys()
            .filter(|k| k.starts_with("_cse_temp_"))
            .collect();
        assert_eq!(temps.len(), 1);

        // The RESULTIS no longer contains any a+b addition.
        let cfg = &cfgs["F"];
        let resultis_has_add_of_params = cfg
            .blocks
            .values()
            .flat_map(|b| &b.statements)
            .filter_map(|s| match s {
                Stmt::Resultis(e) => Some(contains_add_of(e, "a", "b")),
                _ => None,
            })
            .any(|x| x);
        assert!(!resultis_has_add_of_params);
    }

    fn contains_add_of(expr: &Expr, a: &str, b: &str) -> bool {
        match expr {
            Expr::Binary {
                op: BinaryOperator::Add,
                left,
                right,
            } => {
                let names = (left.variable_name(), right.variable_name());
                names == (Some(a), Some(b))
                    || names == (Some(b), Some(a))
                    || contains_add_of(left, a, b)
                    || contains_add_of(right, a, b)
            }
            Expr::Binary { left, right, .. } => {
                contains_add_of(left, a, b) || contains_add_of(right, a, b)
            }
            _ => false,
        }
    }

    #[test]
    fn test_single_occurrence_untouched() {
        let (cfgs, _, count) = run_cse("LET F(x) BE $( LET y = 0; y := x * x $)");
        assert_eq!(count, 0);
        let cfg = &cfgs["F"];
        let has_temp = cfg
            .blocks
            .values()
            .flat_map(|b| &b.statements)
            .any(|s| matches!(s, Stmt::Let { names, .. } if names[0].starts_with("_cse_temp_")));
        assert!(!has_temp);
    }
}
