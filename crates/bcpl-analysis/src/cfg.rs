//! Control-flow graph construction.
//!
//! Each function or routine body is lowered into a graph of basic blocks.
//! Structured statements keep their condition-bearing statement as the last
//! statement of the block that tests it; FOR and FOREACH are lowered into
//! explicit init/header/body/increment/exit blocks with hidden locals, so the
//! code generator only ever sees straight-line statements plus terminators.

use crate::{AnalysisError, AnalysisResult};
use bcpl_ast::{
    BinaryOperator, BranchCondition, CaseArm, Decl, Expr, Program, RepeatKind, Stmt,
    UnaryOperator, VarType,
};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// One basic block.
#[derive(Debug)]
pub struct BasicBlock {
    pub id: u32,
    /// Label the code generator binds at the block's start.
    pub label: String,
    pub statements: Vec<Stmt>,
    pub successors: Vec<u32>,
    pub predecessors: Vec<u32>,
    pub is_entry: bool,
    pub is_exit: bool,
}

impl BasicBlock {
    /// A block "ends with control flow" when its last statement transfers
    /// control; such blocks get no fallthrough edge.
    pub fn ends_with_control_flow(&self) -> bool {
        self.statements
            .last()
            .map(Stmt::ends_control_flow)
            .unwrap_or(false)
    }

    /// The statement the terminator-emission logic consumes, if any.
    pub fn terminator(&self) -> Option<&Stmt> {
        self.statements.last()
    }
}

/// Per-function control-flow graph. Blocks are keyed by id in a `BTreeMap`
/// so every traversal is in deterministic id order.
#[derive(Debug)]
pub struct ControlFlowGraph {
    pub function_name: String,
    pub blocks: BTreeMap<u32, BasicBlock>,
    pub entry: u32,
    pub exit: Option<u32>,
}

impl ControlFlowGraph {
    pub fn block(&self, id: u32) -> &BasicBlock {
        &self.blocks[&id]
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Block ids in deterministic (sorted) order.
    pub fn sorted_ids(&self) -> Vec<u32> {
        self.blocks.keys().copied().collect()
    }
}

/// Builds one CFG per function and routine in the program.
pub struct CfgBuilder {
    cfgs: BTreeMap<String, ControlFlowGraph>,
    hidden_counter: usize,
}

impl Default for CfgBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CfgBuilder {
    pub fn new() -> Self {
        CfgBuilder {
            cfgs: BTreeMap::new(),
            hidden_counter: 0,
        }
    }

    /// Build CFGs for every function-like declaration, nested ones included.
    pub fn build(mut self, program: &Program) -> AnalysisResult<BTreeMap<String, ControlFlowGraph>> {
        self.build_declarations(&program.declarations)?;
        Ok(self.cfgs)
    }

    fn build_declarations(&mut self, decls: &[Decl]) -> AnalysisResult<()> {
        for decl in decls {
            match decl {
                Decl::Function { name, body, .. } => {
                    // A function body is an expression; wrap it so the block
                    // machinery sees a RESULTIS.
                    let stmt = match body {
                        Expr::Valof(inner) | Expr::FloatValof(inner) => (**inner).clone(),
                        other => Stmt::Resultis(other.clone()),
                    };
                    self.build_function(name, &stmt)?;
                    self.build_nested(&stmt)?;
                }
                Decl::Routine { name, body, .. } => {
                    self.build_function(name, body)?;
                    self.build_nested(body)?;
                }
                Decl::Label { command, .. } => self.build_nested(command)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn build_nested(&mut self, stmt: &Stmt) -> AnalysisResult<()> {
        match stmt {
            Stmt::Block {
                declarations,
                statements,
            } => {
                self.build_declarations(declarations)?;
                for s in statements {
                    self.build_nested(s)?;
                }
            }
            Stmt::Compound(statements) => {
                for s in statements {
                    self.build_nested(s)?;
                }
            }
            Stmt::If { then_branch, .. } | Stmt::Unless { then_branch, .. } => {
                self.build_nested(then_branch)?
            }
            Stmt::Test {
                then_branch,
                else_branch,
                ..
            } => {
                self.build_nested(then_branch)?;
                self.build_nested(else_branch)?;
            }
            Stmt::While { body, .. }
            | Stmt::Until { body, .. }
            | Stmt::Repeat { body, .. }
            | Stmt::For { body, .. }
            | Stmt::ForEach { body, .. } => self.build_nested(body)?,
            Stmt::Switchon {
                cases,
                default_case,
                ..
            } => {
                for arm in cases {
                    self.build_nested(&arm.command)?;
                }
                if let Some(default) = default_case {
                    self.build_nested(default)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn build_function(&mut self, name: &str, body: &Stmt) -> AnalysisResult<()> {
        let mut ctx = FunctionCfgContext::new(name, &mut self.hidden_counter);
        ctx.visit_stmt(body);
        let cfg = ctx.finish()?;
        log::debug!(
            "built CFG for {}: {} blocks",
            name,
            cfg.block_count()
        );
        self.cfgs.insert(name.to_string(), cfg);
        Ok(())
    }
}

/// Per-function build state.
struct FunctionCfgContext<'a> {
    function_name: String,
    blocks: BTreeMap<u32, BasicBlock>,
    current: u32,
    next_id: u32,
    exit: Option<u32>,
    break_targets: Vec<u32>,
    loop_targets: Vec<u32>,
    endcase_targets: Vec<u32>,
    label_blocks: FxHashMap<String, u32>,
    unresolved_gotos: Vec<(String, u32)>,
    hidden_counter: &'a mut usize,
}

impl<'a> FunctionCfgContext<'a> {
    fn new(function_name: &str, hidden_counter: &'a mut usize) -> Self {
        let mut ctx = FunctionCfgContext {
            function_name: function_name.to_string(),
            blocks: BTreeMap::new(),
            current: 0,
            next_id: 0,
            exit: None,
            break_targets: Vec::new(),
            loop_targets: Vec::new(),
            endcase_targets: Vec::new(),
            label_blocks: FxHashMap::default(),
            unresolved_gotos: Vec::new(),
            hidden_counter,
        };
        let entry = ctx.new_block();
        ctx.blocks.get_mut(&entry).unwrap().is_entry = true;
        ctx.current = entry;
        ctx
    }

    fn new_block(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.blocks.insert(
            id,
            BasicBlock {
                id,
                label: format!("{}_BB_{}", self.function_name, id),
                statements: Vec::new(),
                successors: Vec::new(),
                predecessors: Vec::new(),
                is_entry: false,
                is_exit: false,
            },
        );
        id
    }

    fn exit_block(&mut self) -> u32 {
        match self.exit {
            Some(id) => id,
            None => {
                let id = self.new_block();
                self.blocks.get_mut(&id).unwrap().is_exit = true;
                self.exit = Some(id);
                id
            }
        }
    }

    fn push(&mut self, stmt: Stmt) {
        self.blocks
            .get_mut(&self.current)
            .unwrap()
            .statements
            .push(stmt);
    }

    fn add_edge(&mut self, from: u32, to: u32) {
        let block = self.blocks.get_mut(&from).unwrap();
        if !block.successors.contains(&to) {
            block.successors.push(to);
        }
    }

    /// End the current block with an edge to `target`, then continue in a
    /// fresh block so unreachable trailing code is still well-formed.
    fn terminate_to(&mut self, target: u32) {
        self.add_edge(self.current, target);
        self.current = self.new_block();
    }

    fn hidden_name(&mut self, base: &str) -> String {
        let n = *self.hidden_counter;
        *self.hidden_counter += 1;
        format!("_forEach_{}_{}", base, n)
    }

    fn block_label(&self, id: u32) -> String {
        self.blocks[&id].label.clone()
    }

    fn visit_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.visit_stmt(stmt);
        }
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Compound(stmts) => self.visit_stmts(stmts),
            Stmt::Block {
                declarations,
                statements,
            } => {
                // Nested function declarations become their own CFGs; what
                // executes here is the statement list.
                let _ = declarations;
                self.visit_stmts(statements);
            }
            Stmt::If {
                condition,
                then_branch,
            } => self.lower_if(condition, then_branch, /*unless=*/ false),
            Stmt::Unless {
                condition,
                then_branch,
            } => self.lower_if(condition, then_branch, /*unless=*/ true),
            Stmt::Test {
                condition,
                then_branch,
                else_branch,
            } => self.lower_test(condition, then_branch, else_branch),
            Stmt::While { condition, body } => {
                self.lower_loop(condition, body, /*until=*/ false)
            }
            Stmt::Until { condition, body } => {
                self.lower_loop(condition, body, /*until=*/ true)
            }
            Stmt::Repeat {
                kind,
                body,
                condition,
            } => self.lower_repeat(*kind, body, condition.as_ref()),
            Stmt::For { .. } => self.lower_for(stmt),
            Stmt::ForEach { .. } => self.lower_foreach(stmt),
            Stmt::Switchon {
                expression,
                cases,
                default_case,
            } => self.lower_switchon(expression, cases, default_case.as_deref()),
            Stmt::Goto(target) => {
                self.push(stmt.clone());
                if let Some(name) = target.variable_name() {
                    self.unresolved_gotos.push((name.to_string(), self.current));
                }
                self.current = self.new_block();
            }
            Stmt::Return | Stmt::Finish => {
                self.push(stmt.clone());
                let exit = self.exit_block();
                self.terminate_to(exit);
            }
            Stmt::Resultis(_) => {
                self.push(stmt.clone());
                let exit = self.exit_block();
                self.terminate_to(exit);
            }
            Stmt::Break => {
                self.push(Stmt::Break);
                match self.break_targets.last().copied() {
                    Some(target) => self.terminate_to(target),
                    None => self.current = self.new_block(),
                }
            }
            Stmt::Loop => {
                self.push(Stmt::Loop);
                match self.loop_targets.last().copied() {
                    Some(target) => self.terminate_to(target),
                    None => self.current = self.new_block(),
                }
            }
            Stmt::Endcase => {
                self.push(Stmt::Endcase);
                match self.endcase_targets.last().copied() {
                    Some(target) => self.terminate_to(target),
                    None => self.current = self.new_block(),
                }
            }
            Stmt::LabelTarget(name) => {
                // A label starts a new block reachable from the previous one.
                let target = self.new_block();
                self.add_edge(self.current, target);
                self.current = target;
                self.label_blocks.insert(name.clone(), target);
                self.push(Stmt::LabelTarget(name.clone()));
            }
            other => self.push(other.clone()),
        }
    }

    fn lower_if(&mut self, condition: &Expr, then_branch: &Stmt, unless: bool) {
        // The condition block keeps the if/unless itself as its terminator,
        // with the branch body detached.
        let header = self.current;
        let terminator = if unless {
            Stmt::Unless {
                condition: condition.clone(),
                then_branch: Box::new(Stmt::Compound(vec![])),
            }
        } else {
            Stmt::If {
                condition: condition.clone(),
                then_branch: Box::new(Stmt::Compound(vec![])),
            }
        };
        self.push(terminator);

        let then_block = self.new_block();
        let join_block = self.new_block();

        // successors[0] is the taken branch, successors[1] the join.
        self.add_edge(header, then_block);
        self.add_edge(header, join_block);

        self.current = then_block;
        self.visit_stmt(then_branch);
        if !self.blocks[&self.current].ends_with_control_flow() {
            self.add_edge(self.current, join_block);
        }
        self.current = join_block;
    }

    fn lower_test(&mut self, condition: &Expr, then_branch: &Stmt, else_branch: &Stmt) {
        let header = self.current;
        self.push(Stmt::Test {
            condition: condition.clone(),
            then_branch: Box::new(Stmt::Compound(vec![])),
            else_branch: Box::new(Stmt::Compound(vec![])),
        });

        let then_block = self.new_block();
        let else_block = self.new_block();
        let join_block = self.new_block();
        self.add_edge(header, then_block);
        self.add_edge(header, else_block);

        self.current = then_block;
        self.visit_stmt(then_branch);
        if !self.blocks[&self.current].ends_with_control_flow() {
            self.add_edge(self.current, join_block);
        }

        self.current = else_block;
        self.visit_stmt(else_branch);
        if !self.blocks[&self.current].ends_with_control_flow() {
            self.add_edge(self.current, join_block);
        }

        self.current = join_block;
    }

    fn lower_loop(&mut self, condition: &Expr, body: &Stmt, until: bool) {
        let header = self.new_block();
        self.add_edge(self.current, header);
        self.current = header;

        let terminator = if until {
            Stmt::Until {
                condition: condition.clone(),
                body: Box::new(Stmt::Compound(vec![])),
            }
        } else {
            Stmt::While {
                condition: condition.clone(),
                body: Box::new(Stmt::Compound(vec![])),
            }
        };
        self.push(terminator);

        let body_block = self.new_block();
        let exit_block = self.new_block();
        self.add_edge(header, body_block);
        self.add_edge(header, exit_block);

        self.break_targets.push(exit_block);
        self.loop_targets.push(header);
        self.current = body_block;
        self.visit_stmt(body);
        if !self.blocks[&self.current].ends_with_control_flow() {
            self.add_edge(self.current, header);
        }
        self.break_targets.pop();
        self.loop_targets.pop();

        self.current = exit_block;
    }

    fn lower_repeat(&mut self, kind: RepeatKind, body: &Stmt, condition: Option<&Expr>) {
        let body_block = self.new_block();
        let exit_block = self.new_block();
        // The conditional forms test at the bottom; LOOP jumps to the test,
        // so its block exists before the body is lowered.
        let header = match kind {
            RepeatKind::Repeat => None,
            _ => Some(self.new_block()),
        };
        self.add_edge(self.current, body_block);

        self.break_targets.push(exit_block);
        self.loop_targets.push(header.unwrap_or(body_block));
        self.current = body_block;
        self.visit_stmt(body);

        match header {
            None => {
                // Unconditional back edge; only BREAK or GOTO leaves.
                if !self.blocks[&self.current].ends_with_control_flow() {
                    self.add_edge(self.current, body_block);
                }
            }
            Some(header) => {
                if !self.blocks[&self.current].ends_with_control_flow() {
                    self.add_edge(self.current, header);
                }
                self.current = header;
                self.push(Stmt::Repeat {
                    kind,
                    body: Box::new(Stmt::Compound(vec![])),
                    condition: condition.cloned(),
                });
                // successors[0] loops, successors[1] exits.
                self.add_edge(header, body_block);
                self.add_edge(header, exit_block);
            }
        }
        self.break_targets.pop();
        self.loop_targets.pop();
        self.current = exit_block;
    }

    fn lower_for(&mut self, stmt: &Stmt) {
        let Stmt::For {
            loop_variable,
            unique_loop_variable,
            unique_step_variable,
            unique_end_variable,
            start,
            end,
            step,
            body,
        } = stmt
        else {
            unreachable!()
        };
        let var = unique_loop_variable
            .clone()
            .unwrap_or_else(|| loop_variable.clone());
        let step_var = unique_step_variable
            .clone()
            .unwrap_or_else(|| format!("{}_step", var));
        let end_var = unique_end_variable
            .clone()
            .unwrap_or_else(|| format!("{}_end", var));
        let step_expr = step.clone().unwrap_or(Expr::integer(1));

        // Initialization: loop variable, hoisted end, hoisted step.
        self.push(Stmt::Let {
            names: vec![var.clone()],
            initializers: vec![start.clone()],
            is_float: false,
        });
        self.push(Stmt::Let {
            names: vec![end_var.clone()],
            initializers: vec![end.clone()],
            is_float: false,
        });
        self.push(Stmt::Let {
            names: vec![step_var.clone()],
            initializers: vec![step_expr],
            is_float: false,
        });

        let header = self.new_block();
        self.add_edge(self.current, header);
        self.current = header;
        // The FOR carries the loop test; the generator reads the hoisted
        // names off the statement.
        self.push(Stmt::For {
            loop_variable: loop_variable.clone(),
            unique_loop_variable: Some(var.clone()),
            unique_step_variable: Some(step_var.clone()),
            unique_end_variable: Some(end_var.clone()),
            start: start.clone(),
            end: end.clone(),
            step: step.clone(),
            body: Box::new(Stmt::Compound(vec![])),
        });

        let body_block = self.new_block();
        let increment_block = self.new_block();
        let exit_block = self.new_block();
        self.add_edge(header, body_block);
        self.add_edge(header, exit_block);

        self.break_targets.push(exit_block);
        self.loop_targets.push(increment_block);
        self.current = body_block;
        self.visit_stmt(body);
        if !self.blocks[&self.current].ends_with_control_flow() {
            self.add_edge(self.current, increment_block);
        }
        self.break_targets.pop();
        self.loop_targets.pop();

        self.current = increment_block;
        self.push(Stmt::Assignment {
            lhs: vec![Expr::variable(var.clone())],
            rhs: vec![Expr::Binary {
                op: BinaryOperator::Add,
                left: Box::new(Expr::variable(var)),
                right: Box::new(Expr::variable(step_var)),
            }],
        });
        self.add_edge(increment_block, header);

        self.current = exit_block;
    }

    fn lower_foreach(&mut self, stmt: &Stmt) {
        let Stmt::ForEach {
            value_name,
            pointer_name,
            collection,
            element_type,
            collection_type,
            body,
        } = stmt
        else {
            unreachable!()
        };
        let is_list =
            collection_type.is_list() || matches!(collection, Expr::ListLit { .. });
        if is_list {
            self.lower_list_foreach(
                value_name,
                pointer_name.as_deref(),
                collection,
                *element_type,
                body,
            );
        } else {
            self.lower_vector_foreach(value_name, collection, *element_type, *collection_type, body);
        }
    }

    fn lower_vector_foreach(
        &mut self,
        value_name: &str,
        collection: &Expr,
        element_type: VarType,
        collection_type: VarType,
        body: &Stmt,
    ) {
        let collection_var = self.hidden_name("collection");
        let len_var = self.hidden_name("len");
        let idx_var = self.hidden_name("idx");

        // Pre-header: materialize the collection, its length and the index.
        self.push(Stmt::Let {
            names: vec![collection_var.clone()],
            initializers: vec![collection.clone()],
            is_float: false,
        });
        self.push(Stmt::Let {
            names: vec![len_var.clone()],
            initializers: vec![Expr::Unary {
                op: UnaryOperator::LengthOf,
                operand: Box::new(Expr::variable(collection_var.clone())),
            }],
            is_float: false,
        });
        self.push(Stmt::Let {
            names: vec![idx_var.clone()],
            initializers: vec![Expr::integer(0)],
            is_float: false,
        });

        let header = self.new_block();
        self.add_edge(self.current, header);

        let body_block = self.new_block();
        let increment_block = self.new_block();
        let exit_block = self.new_block();

        // Header: branch to the exit when _idx >= _len.
        self.current = header;
        let exit_label = self.block_label(exit_block);
        self.push(Stmt::CondBranch {
            condition: BranchCondition::Ge,
            target: exit_label,
            expr: Expr::Binary {
                op: BinaryOperator::Subtract,
                left: Box::new(Expr::variable(idx_var.clone())),
                right: Box::new(Expr::variable(len_var.clone())),
            },
        });
        self.add_edge(header, body_block);
        self.add_edge(header, exit_block);

        // Body: v := _collection ! _idx, in the access form the element
        // type dictates.
        self.current = body_block;
        let walks_string = collection_type.contains(VarType::STRING)
            && !collection_type.intersects(VarType::VEC | VarType::LIST | VarType::TABLE);
        let element_access = if element_type == VarType::FLOAT {
            Expr::FloatVectorAccess {
                vector: Box::new(Expr::variable(collection_var.clone())),
                index: Box::new(Expr::variable(idx_var.clone())),
            }
        } else if walks_string {
            // FOREACH over a string walks its 32-bit code points.
            Expr::CharIndirection {
                string: Box::new(Expr::variable(collection_var.clone())),
                index: Box::new(Expr::variable(idx_var.clone())),
            }
        } else {
            Expr::VectorAccess {
                vector: Box::new(Expr::variable(collection_var.clone())),
                index: Box::new(Expr::variable(idx_var.clone())),
            }
        };
        self.push(Stmt::Let {
            names: vec![value_name.to_string()],
            initializers: vec![element_access],
            is_float: element_type == VarType::FLOAT,
        });

        self.break_targets.push(exit_block);
        self.loop_targets.push(increment_block);
        self.visit_stmt(body);
        if !self.blocks[&self.current].ends_with_control_flow() {
            self.add_edge(self.current, increment_block);
        }
        self.break_targets.pop();
        self.loop_targets.pop();

        self.current = increment_block;
        self.push(Stmt::Assignment {
            lhs: vec![Expr::variable(idx_var.clone())],
            rhs: vec![Expr::Binary {
                op: BinaryOperator::Add,
                left: Box::new(Expr::variable(idx_var)),
                right: Box::new(Expr::integer(1)),
            }],
        });
        self.add_edge(increment_block, header);

        self.current = exit_block;
    }

    fn lower_list_foreach(
        &mut self,
        value_name: &str,
        pointer_name: Option<&str>,
        collection: &Expr,
        element_type: VarType,
        body: &Stmt,
    ) {
        let cursor_var = self.hidden_name("cursor");

        // Pre-header: _cursor := head field of the list header (offset 16).
        self.push(Stmt::Let {
            names: vec![cursor_var.clone()],
            initializers: vec![Expr::Unary {
                op: UnaryOperator::Indirection,
                operand: Box::new(Expr::Binary {
                    op: BinaryOperator::Add,
                    left: Box::new(collection.clone()),
                    right: Box::new(Expr::integer(16)),
                }),
            }],
            is_float: false,
        });

        let header = self.new_block();
        self.add_edge(self.current, header);

        let body_block = self.new_block();
        let advance_block = self.new_block();
        let exit_block = self.new_block();

        // Header: done when _cursor = 0.
        self.current = header;
        let exit_label = self.block_label(exit_block);
        self.push(Stmt::CondBranch {
            condition: BranchCondition::Eq,
            target: exit_label,
            expr: Expr::variable(cursor_var.clone()),
        });
        self.add_edge(header, body_block);
        self.add_edge(header, exit_block);

        // Body: load the node value (offset 8), or bind the node pointer in
        // the two-variable form. String payloads skip the length prefix.
        self.current = body_block;
        let node_value = Expr::Unary {
            op: UnaryOperator::Indirection,
            operand: Box::new(Expr::Binary {
                op: BinaryOperator::Add,
                left: Box::new(Expr::variable(cursor_var.clone())),
                right: Box::new(Expr::integer(8)),
            }),
        };
        let value_init = if element_type == VarType::STRING {
            Expr::Binary {
                op: BinaryOperator::Add,
                left: Box::new(node_value),
                right: Box::new(Expr::integer(8)),
            }
        } else {
            node_value
        };
        if let Some(ptr) = pointer_name {
            self.push(Stmt::Let {
                names: vec![ptr.to_string()],
                initializers: vec![Expr::variable(cursor_var.clone())],
                is_float: false,
            });
        }
        self.push(Stmt::Let {
            names: vec![value_name.to_string()],
            initializers: vec![value_init],
            is_float: element_type == VarType::FLOAT,
        });

        self.break_targets.push(exit_block);
        self.loop_targets.push(advance_block);
        self.visit_stmt(body);
        if !self.blocks[&self.current].ends_with_control_flow() {
            self.add_edge(self.current, advance_block);
        }
        self.break_targets.pop();
        self.loop_targets.pop();

        // Advance: _cursor := next field of the node (offset 16).
        self.current = advance_block;
        self.push(Stmt::Assignment {
            lhs: vec![Expr::variable(cursor_var.clone())],
            rhs: vec![Expr::Unary {
                op: UnaryOperator::Indirection,
                operand: Box::new(Expr::Binary {
                    op: BinaryOperator::Add,
                    left: Box::new(Expr::variable(cursor_var)),
                    right: Box::new(Expr::integer(16)),
                }),
            }],
        });
        self.add_edge(advance_block, header);

        self.current = exit_block;
    }

    fn lower_switchon(
        &mut self,
        expression: &Expr,
        cases: &[CaseArm],
        default_case: Option<&Stmt>,
    ) {
        let header = self.current;
        self.push(Stmt::Switchon {
            expression: expression.clone(),
            cases: cases
                .iter()
                .map(|arm| CaseArm {
                    constant: arm.constant.clone(),
                    resolved_value: arm.resolved_value,
                    command: Box::new(Stmt::Compound(vec![])),
                })
                .collect(),
            default_case: None,
        });

        let case_blocks: Vec<u32> = cases.iter().map(|_| self.new_block()).collect();
        let default_block = default_case.map(|_| self.new_block());
        let join_block = self.new_block();

        // Successor order is significant: cases in source order, then the
        // default, then the join.
        for &case_block in &case_blocks {
            self.add_edge(header, case_block);
        }
        if let Some(default_block) = default_block {
            self.add_edge(header, default_block);
        }
        self.add_edge(header, join_block);

        self.endcase_targets.push(join_block);
        for (index, arm) in cases.iter().enumerate() {
            self.current = case_blocks[index];
            self.visit_stmt(&arm.command);
            if !self.blocks[&self.current].ends_with_control_flow() {
                // Cases fall through in source order; the last one falls
                // into the default or the join.
                let next = case_blocks
                    .get(index + 1)
                    .copied()
                    .or(default_block)
                    .unwrap_or(join_block);
                self.add_edge(self.current, next);
            }
        }
        if let (Some(default_block), Some(default_stmt)) = (default_block, default_case) {
            self.current = default_block;
            self.visit_stmt(default_stmt);
            if !self.blocks[&self.current].ends_with_control_flow() {
                self.add_edge(self.current, join_block);
            }
        }
        self.endcase_targets.pop();
        self.current = join_block;
    }

    fn finish(mut self) -> AnalysisResult<ControlFlowGraph> {
        // The last open block drains into the exit.
        if !self.blocks[&self.current].ends_with_control_flow()
            && Some(self.current) != self.exit
        {
            let exit = self.exit_block();
            self.add_edge(self.current, exit);
        }

        // Resolve queued GOTO edges now every label has a block.
        for (label, block) in std::mem::take(&mut self.unresolved_gotos) {
            match self.label_blocks.get(&label) {
                Some(&target) => self.add_edge(block, target),
                None => {
                    return Err(AnalysisError::UnresolvedGoto(
                        label,
                        self.function_name.clone(),
                    ))
                }
            }
        }

        // Drop empty unreachable scratch blocks created after terminators.
        let reachable = self.reachable_set();
        let exit = self.exit;
        self.blocks.retain(|id, block| {
            reachable.contains(id)
                || Some(*id) == exit
                || !block.statements.is_empty()
        });
        // Edges into dropped blocks go with them.
        let live: Vec<u32> = self.blocks.keys().copied().collect();
        for block in self.blocks.values_mut() {
            block.successors.retain(|s| live.contains(s));
        }

        // Predecessor lists from the successor lists.
        let edges: Vec<(u32, u32)> = self
            .blocks
            .values()
            .flat_map(|b| b.successors.iter().map(move |&s| (b.id, s)))
            .collect();
        for (from, to) in edges {
            if let Some(block) = self.blocks.get_mut(&to) {
                if !block.predecessors.contains(&from) {
                    block.predecessors.push(from);
                }
            }
        }

        Ok(ControlFlowGraph {
            function_name: self.function_name,
            blocks: self.blocks,
            entry: 0,
            exit: self.exit,
        })
    }

    fn reachable_set(&self) -> Vec<u32> {
        let mut seen = vec![0u32];
        let mut work = vec![0u32];
        while let Some(id) = work.pop() {
            for &succ in &self.blocks[&id].successors {
                if !seen.contains(&succ) {
                    seen.push(succ);
                    work.push(succ);
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::symbols::SymbolTable;
    use bcpl_parser::parse_source;

    fn build(source: &str) -> BTreeMap<String, ControlFlowGraph> {
        let mut program = parse_source(source).unwrap();
        let mut table = SymbolTable::new();
        let _ = Analyzer::new().analyze(&mut program, &mut table);
        CfgBuilder::new().build(&program).unwrap()
    }

    #[test]
    fn test_straight_line_body() {
        let cfgs = build("LET START() BE $( WRITES(\"hi\"); FINISH $)");
        let cfg = &cfgs["START"];
        // One content block plus the exit.
        assert!(cfg.block_count() >= 2);
        assert!(cfg.block(cfg.entry).is_entry);
        let exit = cfg.exit.unwrap();
        assert!(cfg.block(exit).is_exit);
        assert!(cfg.block(cfg.entry).successors.contains(&exit));
    }

    #[test]
    fn test_if_has_two_successors() {
        let cfgs = build("LET F(x) BE IF x > 0 DO WRITEN(x)");
        let cfg = &cfgs["F"];
        let entry = cfg.block(cfg.entry);
        assert_eq!(entry.successors.len(), 2);
        assert!(matches!(entry.terminator(), Some(Stmt::If { .. })));
    }

    #[test]
    fn test_for_loop_shape() {
        let cfgs = build(
            "LET G() = VALOF $( LET v = VEC 3; FOR i = 0 TO 3 DO v!i := i*i; RESULTIS v!2 $)",
        );
        let cfg = &cfgs["G"];
        // init(entry), header, body, increment, exit-of-loop, resultis path,
        // function exit: at least 6 blocks.
        assert!(cfg.block_count() >= 6, "got {}", cfg.block_count());

        // The header carries the FOR as its terminator and branches two ways.
        let header = cfg
            .blocks
            .values()
            .find(|b| matches!(b.terminator(), Some(Stmt::For { .. })))
            .expect("no FOR header block");
        assert_eq!(header.successors.len(), 2);

        // The increment block assigns v := v + step and loops back.
        let increment = cfg
            .blocks
            .values()
            .find(|b| {
                b.successors.contains(&header.id)
                    && matches!(b.statements.last(), Some(Stmt::Assignment { .. }))
            })
            .expect("no increment block");
        assert_eq!(increment.successors, vec![header.id]);
    }

    #[test]
    fn test_while_break_targets_exit() {
        let cfgs = build(
            "LET W(x) BE WHILE x > 0 DO $( IF x = 1 DO BREAK; x := x - 1 $)",
        );
        let cfg = &cfgs["W"];
        let header = cfg
            .blocks
            .values()
            .find(|b| matches!(b.terminator(), Some(Stmt::While { .. })))
            .unwrap();
        let loop_exit = header.successors[1];
        // Some block ends in BREAK and has the loop exit as successor.
        let break_block = cfg
            .blocks
            .values()
            .find(|b| matches!(b.statements.last(), Some(Stmt::Break)))
            .expect("no break block");
        assert!(break_block.successors.contains(&loop_exit));
    }

    #[test]
    fn test_switchon_successor_order() {
        let cfgs = build(
            "LET S(x) BE SWITCHON x INTO $( \
               CASE 1: ENDCASE CASE 2: ENDCASE DEFAULT: RETURN $)",
        );
        let cfg = &cfgs["S"];
        let header = cfg
            .blocks
            .values()
            .find(|b| matches!(b.terminator(), Some(Stmt::Switchon { .. })))
            .unwrap();
        // 2 cases + default + join.
        assert_eq!(header.successors.len(), 4);
    }

    #[test]
    fn test_goto_resolved_to_label_block() {
        let cfgs = build("LET T() BE $( GOTO out; WRITEN(1); out: RETURN $)");
        let cfg = &cfgs["T"];
        let goto_block = cfg
            .blocks
            .values()
            .find(|b| matches!(b.statements.last(), Some(Stmt::Goto(_))))
            .unwrap();
        let label_block = cfg
            .blocks
            .values()
            .find(|b| matches!(b.statements.first(), Some(Stmt::LabelTarget(_))))
            .unwrap();
        assert!(goto_block.successors.contains(&label_block.id));
    }

    #[test]
    fn test_unresolved_goto_is_fatal() {
        let mut program = parse_source("LET T() BE GOTO nowhere").unwrap();
        let mut table = SymbolTable::new();
        let _ = Analyzer::new().analyze(&mut program, &mut table);
        let result = CfgBuilder::new().build(&program);
        assert!(matches!(result, Err(AnalysisError::UnresolvedGoto(_, _))));
    }

    #[test]
    fn test_list_foreach_lowering() {
        let cfgs = build(
            "LET P() BE $( LET l = LIST(1, 2, 3); FOREACH v IN l DO WRITEN(v) $)",
        );
        let cfg = &cfgs["P"];
        // The header tests the cursor against zero.
        let header = cfg
            .blocks
            .values()
            .find(|b| {
                matches!(
                    b.terminator(),
                    Some(Stmt::CondBranch {
                        condition: BranchCondition::Eq,
                        ..
                    })
                )
            })
            .expect("no cursor-test header");
        assert_eq!(header.successors.len(), 2);

        // The advance block reloads the cursor through offset 16.
        let advance = cfg
            .blocks
            .values()
            .find(|b| {
                b.successors.contains(&header.id)
                    && matches!(b.statements.last(), Some(Stmt::Assignment { .. }))
            })
            .expect("no advance block");
        let Some(Stmt::Assignment { rhs, .. }) = advance.statements.last() else {
            panic!()
        };
        assert!(matches!(
            &rhs[0],
            Expr::Unary {
                op: UnaryOperator::Indirection,
                ..
            }
        ));
    }

    #[test]
    fn test_vector_foreach_lowering() {
        let cfgs = build(
            "LET P() BE $( LET v = VEC 3; FOREACH x IN v DO WRITEN(x) $)",
        );
        let cfg = &cfgs["P"];
        let header = cfg
            .blocks
            .values()
            .find(|b| {
                matches!(
                    b.terminator(),
                    Some(Stmt::CondBranch {
                        condition: BranchCondition::Ge,
                        ..
                    })
                )
            })
            .expect("no bounds-test header");
        assert_eq!(header.successors.len(), 2);
    }

    #[test]
    fn test_every_block_reaches_or_is_exit() {
        let cfgs = build(
            "LET F(x) = VALOF $( TEST x > 0 THEN RESULTIS 1 ELSE RESULTIS 2 $)",
        );
        let cfg = &cfgs["F"];
        let exit = cfg.exit.unwrap();
        for block in cfg.blocks.values() {
            if block.id != exit {
                assert!(
                    !block.successors.is_empty(),
                    "block {} has no successors",
                    block.id
                );
            }
        }
    }

    #[test]
    fn test_rebuild_is_isomorphic() {
        let source = "LET F(x) = VALOF $( FOR i = 0 TO x DO WRITEN(i); RESULTIS 0 $)";
        let a = build(source);
        let b = build(source);
        let ca = &a["F"];
        let cb = &b["F"];
        assert_eq!(ca.sorted_ids(), cb.sorted_ids());
        for id in ca.sorted_ids() {
            assert_eq!(ca.block(id).successors, cb.block(id).successors);
            assert_eq!(ca.block(id).statements.len(), cb.block(id).statements.len());
        }
    }
}
