//! Semantic analyzer.
//!
//! Walks the AST once to discover functions, then walks each body to record
//! variable types, rename FOR-loop variables to globally unique names,
//! resolve CASE constants, annotate FOREACH element types and collect
//! semantic diagnostics. Diagnostics accumulate — the walk never aborts.

use crate::metrics::{FunctionMetrics, MetricsMap};
use crate::symbols::{SymbolKind, SymbolLocation, SymbolTable};
use bcpl_ast::{
    BinaryOperator, CaseArm, Decl, Expr, NumberLiteral, Program, Stmt, UnaryOperator, VarType,
};

/// One accumulated semantic error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemanticDiagnostic {
    pub function: Option<String>,
    pub message: String,
}

impl std::fmt::Display for SemanticDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.function {
            Some(name) => write!(f, "in {}: {}", name, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Result of the semantic walk.
#[derive(Debug, Default)]
pub struct AnalysisOutput {
    pub metrics: MetricsMap,
    pub diagnostics: Vec<SemanticDiagnostic>,
}

/// The analyzer. One instance per compilation.
pub struct Analyzer {
    metrics: MetricsMap,
    diagnostics: Vec<SemanticDiagnostic>,
    current_function: String,
    for_var_counter: usize,
}

/// List-modifying intrinsics that are illegal on `const` lists.
const LIST_MUTATORS: &[&str] = &[
    "REVERSE", "APND", "FPND", "SPND", "LPND", "FILTER", "CONCAT",
];

impl Analyzer {
    pub fn new() -> Self {
        Analyzer {
            metrics: MetricsMap::new(),
            diagnostics: Vec::new(),
            current_function: String::new(),
            for_var_counter: 0,
        }
    }

    /// Run the full analysis over a program, mutating it in place.
    pub fn analyze(mut self, program: &mut Program, table: &mut SymbolTable) -> AnalysisOutput {
        self.discover_declarations(&program.declarations, table);
        self.register_data_declarations(&program.declarations, table);

        for decl in &mut program.declarations {
            self.analyze_declaration(decl, table);
        }

        AnalysisOutput {
            metrics: self.metrics,
            diagnostics: self.diagnostics,
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        let function = if self.current_function.is_empty() {
            None
        } else {
            Some(self.current_function.clone())
        };
        self.diagnostics.push(SemanticDiagnostic {
            function,
            message: message.into(),
        });
    }

    // --- First pass: discover every function and routine, nested included ---

    fn discover_declarations(&mut self, decls: &[Decl], table: &mut SymbolTable) {
        for decl in decls {
            match decl {
                Decl::Function {
                    name,
                    parameters,
                    body,
                    returns_float,
                } => {
                    self.seed_function(name, parameters, *returns_float, table);
                    self.discover_in_expr(body, table);
                }
                Decl::Routine {
                    name,
                    parameters,
                    body,
                } => {
                    self.seed_function(name, parameters, false, table);
                    table.lookup_mut(name).unwrap().kind = SymbolKind::Routine;
                    self.discover_in_stmt(body, table);
                }
                Decl::Label { command, .. } => self.discover_in_stmt(command, table),
                _ => {}
            }
        }
    }

    fn seed_function(
        &mut self,
        name: &str,
        parameters: &[String],
        returns_float: bool,
        table: &mut SymbolTable,
    ) {
        let kind = if returns_float {
            SymbolKind::FloatFunction
        } else {
            SymbolKind::Function
        };
        let ret_type = if returns_float {
            VarType::FLOAT
        } else {
            VarType::INTEGER
        };
        let symbol = table.add(name, kind, ret_type);
        symbol.parameters = vec![VarType::INTEGER; parameters.len()];

        let mut metrics = FunctionMetrics {
            num_parameters: parameters.len(),
            returns_float,
            ..FunctionMetrics::default()
        };
        for (index, param) in parameters.iter().enumerate() {
            metrics.parameter_indices.insert(param.clone(), index);
            metrics
                .parameter_types
                .insert(param.clone(), VarType::INTEGER);
            metrics
                .variable_types
                .insert(param.clone(), VarType::INTEGER);
        }
        self.metrics.insert(name.to_string(), metrics);
    }

    fn discover_in_stmt(&mut self, stmt: &Stmt, table: &mut SymbolTable) {
        if let Stmt::Block { declarations, .. } = stmt {
            self.discover_declarations(declarations, table);
        }
        match stmt {
            Stmt::Block { statements, .. } | Stmt::Compound(statements) => {
                for s in statements {
                    self.discover_in_stmt(s, table);
                }
            }
            Stmt::If { then_branch, .. } | Stmt::Unless { then_branch, .. } => {
                self.discover_in_stmt(then_branch, table)
            }
            Stmt::Test {
                then_branch,
                else_branch,
                ..
            } => {
                self.discover_in_stmt(then_branch, table);
                self.discover_in_stmt(else_branch, table);
            }
            Stmt::While { body, .. }
            | Stmt::Until { body, .. }
            | Stmt::Repeat { body, .. }
            | Stmt::For { body, .. }
            | Stmt::ForEach { body, .. } => self.discover_in_stmt(body, table),
            Stmt::Switchon {
                cases,
                default_case,
                ..
            } => {
                for arm in cases {
                    self.discover_in_stmt(&arm.command, table);
                }
                if let Some(default) = default_case {
                    self.discover_in_stmt(default, table);
                }
            }
            Stmt::Resultis(expr) => self.discover_in_expr(expr, table),
            _ => {}
        }
    }

    fn discover_in_expr(&mut self, expr: &Expr, table: &mut SymbolTable) {
        if let Expr::Valof(body) | Expr::FloatValof(body) = expr {
            self.discover_in_stmt(body, table);
        }
    }

    // --- Data declarations: manifests, statics, globals ---

    fn register_data_declarations(&mut self, decls: &[Decl], table: &mut SymbolTable) {
        for decl in decls {
            match decl {
                Decl::Manifest { name, value } => {
                    let symbol = table.add(name, SymbolKind::Manifest, VarType::INTEGER);
                    symbol.location = SymbolLocation::Absolute(*value);
                }
                Decl::Static { name, initializer } => {
                    let var_type = literal_type(initializer);
                    table.add(name, SymbolKind::StaticVar, var_type);
                }
                Decl::Global { entries } => {
                    for (name, slot) in entries {
                        let symbol = table.add(name, SymbolKind::GlobalVar, VarType::INTEGER);
                        symbol.location = SymbolLocation::Data(*slot as u64);
                    }
                }
                Decl::GlobalVariable {
                    names,
                    initializers,
                    is_float,
                } => {
                    for (index, name) in names.iter().enumerate() {
                        let var_type = if *is_float {
                            VarType::FLOAT
                        } else {
                            initializers.get(index).map(literal_type).unwrap_or(VarType::INTEGER)
                        };
                        table.add(name, SymbolKind::GlobalVar, var_type);
                    }
                }
                _ => {}
            }
        }
    }

    // --- Second pass: the semantic walk proper ---

    fn analyze_declaration(&mut self, decl: &mut Decl, table: &mut SymbolTable) {
        match decl {
            Decl::Function {
                name,
                parameters,
                body,
                ..
            } => {
                self.current_function = name.clone();
                table.enter_scope();
                let params = parameters.clone();
                for param in &params {
                    table.add(param, SymbolKind::Parameter, VarType::INTEGER);
                }
                self.walk_expr(body, table);
                table.exit_scope();
                self.current_function.clear();
            }
            Decl::Routine {
                name,
                parameters,
                body,
                ..
            } => {
                self.current_function = name.clone();
                table.enter_scope();
                let params = parameters.clone();
                for param in &params {
                    table.add(param, SymbolKind::Parameter, VarType::INTEGER);
                }
                self.walk_stmt(body, table);
                table.exit_scope();
                self.current_function.clear();
            }
            Decl::Label { command, .. } => self.walk_stmt(command, table),
            _ => {}
        }
    }

    fn metrics_mut(&mut self) -> Option<&mut FunctionMetrics> {
        self.metrics.get_mut(&self.current_function)
    }

    fn record_local(&mut self, name: &str, var_type: VarType) {
        if let Some(metrics) = self.metrics_mut() {
            metrics.add_local(name, var_type);
        }
    }

    fn walk_stmt(&mut self, stmt: &mut Stmt, table: &mut SymbolTable) {
        match stmt {
            Stmt::Let {
                names,
                initializers,
                is_float,
            } => {
                for (index, name) in names.iter().enumerate() {
                    let inferred = match initializers.get_mut(index) {
                        Some(init) => {
                            self.walk_expr(init, table);
                            self.infer(init, table)
                        }
                        None => VarType::INTEGER,
                    };
                    let var_type = if *is_float { VarType::FLOAT } else { inferred };
                    let var_type = if var_type == VarType::UNKNOWN {
                        VarType::INTEGER
                    } else {
                        var_type
                    };
                    table.add(name, SymbolKind::LocalVar, var_type);
                    self.record_local(name, var_type);
                }
            }
            Stmt::Assignment { lhs, rhs } => {
                for expr in rhs.iter_mut() {
                    self.walk_expr(expr, table);
                }
                for expr in lhs.iter_mut() {
                    self.check_assignment_target(expr, table);
                    self.walk_expr(expr, table);
                }
                // Variables assigned before any LET still become locals.
                let pairs: Vec<(String, VarType)> = lhs
                    .iter()
                    .zip(rhs.iter())
                    .filter_map(|(l, r)| {
                        l.variable_name()
                            .filter(|name| table.lookup(name).is_none())
                            .map(|name| (name.to_string(), self.infer(r, table)))
                    })
                    .collect();
                for (name, inferred) in pairs {
                    let var_type = if inferred == VarType::UNKNOWN {
                        VarType::INTEGER
                    } else {
                        inferred
                    };
                    table.add(&name, SymbolKind::LocalVar, var_type);
                    self.record_local(&name, var_type);
                }
            }
            Stmt::RoutineCall { routine, arguments } => {
                self.note_call(routine, arguments, table);
                for arg in arguments.iter_mut() {
                    self.walk_expr(arg, table);
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
                self.walk_expr(condition, table);
                self.walk_stmt(then_branch, table);
            }
            Stmt::Test {
                condition,
                then_branch,
                else_branch,
            } => {
                self.walk_expr(condition, table);
                self.walk_stmt(then_branch, table);
                self.walk_stmt(else_branch, table);
            }
            Stmt::While { condition, body } | Stmt::Until { condition, body } => {
                self.walk_expr(condition, table);
                self.walk_stmt(body, table);
            }
            Stmt::Repeat {
                body, condition, ..
            } => {
                self.walk_stmt(body, table);
                if let Some(cond) = condition {
                    self.walk_expr(cond, table);
                }
            }
            Stmt::For { .. } => self.walk_for(stmt, table),
            Stmt::ForEach { .. } => self.walk_foreach(stmt, table),
            Stmt::Switchon {
                expression,
                cases,
                default_case,
            } => {
                self.walk_expr(expression, table);
                for CaseArm {
                    constant,
                    resolved_value,
                    command,
                } in cases.iter_mut()
                {
                    match const_eval(constant, table) {
                        Some(value) => *resolved_value = Some(value),
                        None => self.error("CASE constant does not fold to an integer"),
                    }
                    self.walk_stmt(command, table);
                }
                if let Some(default) = default_case {
                    self.walk_stmt(default, table);
                }
            }
            Stmt::Resultis(expr) | Stmt::Free(expr) | Stmt::Goto(expr) => {
                self.walk_expr(expr, table)
            }
            Stmt::Compound(stmts) => {
                for s in stmts {
                    self.walk_stmt(s, table);
                }
            }
            Stmt::Block {
                declarations,
                statements,
            } => {
                table.enter_scope();
                for decl in declarations.iter_mut() {
                    self.register_block_declaration(decl, table);
                }
                for s in statements.iter_mut() {
                    self.walk_stmt(s, table);
                }
                table.exit_scope();
            }
            Stmt::CondBranch { expr, .. } => self.walk_expr(expr, table),
            Stmt::Return
            | Stmt::Finish
            | Stmt::Break
            | Stmt::Loop
            | Stmt::Endcase
            | Stmt::Brk
            | Stmt::LabelTarget(_) => {}
        }
    }

    /// Nested function declarations are analyzed with their own metrics; any
    /// MANIFEST inside a block scopes like a constant binding.
    fn register_block_declaration(&mut self, decl: &mut Decl, table: &mut SymbolTable) {
        match decl {
            Decl::Manifest { name, value } => {
                let symbol = table.add(name.as_str(), SymbolKind::Manifest, VarType::INTEGER);
                symbol.location = SymbolLocation::Absolute(*value);
            }
            Decl::Function { .. } | Decl::Routine { .. } => {
                let saved = std::mem::take(&mut self.current_function);
                self.analyze_declaration(decl, table);
                self.current_function = saved;
            }
            _ => {}
        }
    }

    fn walk_for(&mut self, stmt: &mut Stmt, table: &mut SymbolTable) {
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

        let counter = self.for_var_counter;
        self.for_var_counter += 1;
        let unique = format!("{}_for_var_{}", loop_variable, counter);
        let step_name = format!("{}_for_step_{}", loop_variable, counter);
        let end_name = format!("{}_for_end_{}", loop_variable, counter);
        *unique_loop_variable = Some(unique.clone());
        *unique_step_variable = Some(step_name.clone());
        *unique_end_variable = Some(end_name.clone());

        self.walk_expr(start, table);
        self.walk_expr(end, table);
        if let Some(step) = step {
            self.walk_expr(step, table);
        }

        table.enter_scope();
        table.add(&unique, SymbolKind::LocalVar, VarType::INTEGER);
        table.add(&end_name, SymbolKind::LocalVar, VarType::INTEGER);
        table.add(&step_name, SymbolKind::LocalVar, VarType::INTEGER);
        self.record_local(&unique, VarType::INTEGER);
        self.record_local(&end_name, VarType::INTEGER);
        self.record_local(&step_name, VarType::INTEGER);

        rename_in_stmt(body, loop_variable, &unique);
        self.walk_stmt(body, table);
        table.exit_scope();
    }

    fn walk_foreach(&mut self, stmt: &mut Stmt, table: &mut SymbolTable) {
        let Stmt::ForEach {
            value_name,
            pointer_name,
            collection,
            element_type,
            collection_type: collection_type_slot,
            body,
        } = stmt
        else {
            unreachable!()
        };

        self.walk_expr(collection, table);
        let collection_type = self.infer(collection, table);
        *collection_type_slot = collection_type;

        // The inferred element type drives the access form the CFG builder
        // lowers the body with.
        let element = if collection_type.contains(VarType::LIST) {
            collection_type.element_kind()
        } else if collection_type.contains(VarType::VEC) {
            collection_type.element_kind()
        } else if collection_type.contains(VarType::STRING) {
            VarType::INTEGER
        } else if collection_type.contains(VarType::TABLE) {
            VarType::INTEGER
        } else {
            VarType::INTEGER
        };
        *element_type = if element == VarType::UNKNOWN {
            VarType::INTEGER
        } else {
            element
        };

        let value_type = match *element_type {
            t if t == VarType::FLOAT => VarType::FLOAT,
            t if t == VarType::STRING => VarType::STRING,
            _ => VarType::INTEGER,
        };

        table.enter_scope();
        table.add(value_name.as_str(), SymbolKind::LocalVar, value_type);
        self.record_local(value_name, value_type);
        if let Some(ptr) = pointer_name {
            table.add(ptr.as_str(), SymbolKind::LocalVar, VarType::POINTER_TO_LIST_NODE);
            let ptr = ptr.clone();
            self.record_local(&ptr, VarType::POINTER_TO_LIST_NODE);
        }
        self.walk_stmt(body, table);
        table.exit_scope();
    }

    fn walk_expr(&mut self, expr: &mut Expr, table: &mut SymbolTable) {
        match expr {
            Expr::Variable { name, unique_name } => {
                let effective = unique_name.as_deref().unwrap_or(name.as_str()).to_string();
                match table.lookup(&effective) {
                    Some(symbol) if symbol.kind.is_global() => {
                        if let Some(metrics) = self.metrics_mut() {
                            metrics.accesses_globals = true;
                        }
                    }
                    Some(_) => {}
                    None => {
                        // Function names in expression position resolve later;
                        // plain variables must exist.
                        if !self.metrics.contains_key(&effective) {
                            log::trace!("unresolved name '{}' left to codegen", effective);
                        }
                    }
                }
            }
            Expr::Binary { left, right, .. } => {
                self.walk_expr(left, table);
                self.walk_expr(right, table);
            }
            Expr::Unary { op, operand } => {
                if matches!(op, UnaryOperator::HeadOf | UnaryOperator::TailOf) {
                    // HD/TL go through the runtime.
                    if let Some(metrics) = self.metrics_mut() {
                        metrics.num_runtime_calls += 1;
                    }
                }
                self.walk_expr(operand, table);
            }
            Expr::VectorAccess { vector, index }
            | Expr::FloatVectorAccess { vector, index } => {
                self.walk_expr(vector, table);
                self.walk_expr(index, table);
            }
            Expr::CharIndirection { string, index } => {
                self.walk_expr(string, table);
                self.walk_expr(index, table);
            }
            Expr::Call {
                function,
                arguments,
            } => {
                let routine = function.as_ref().clone();
                self.note_call(&routine, arguments, table);
                for arg in arguments.iter_mut() {
                    self.walk_expr(arg, table);
                }
            }
            Expr::SysCall { number, arguments } => {
                self.walk_expr(number, table);
                for arg in arguments.iter_mut() {
                    self.walk_expr(arg, table);
                }
            }
            Expr::Conditional {
                condition,
                true_expr,
                false_expr,
            } => {
                self.walk_expr(condition, table);
                self.walk_expr(true_expr, table);
                self.walk_expr(false_expr, table);
            }
            Expr::Valof(body) | Expr::FloatValof(body) => self.walk_stmt(body, table),
            Expr::VecAlloc { size } => {
                if let Some(metrics) = self.metrics_mut() {
                    metrics.has_vector_allocations = true;
                    metrics.num_runtime_calls += 1;
                }
                self.walk_expr(size, table);
            }
            Expr::StringAlloc { size } => {
                if let Some(metrics) = self.metrics_mut() {
                    metrics.num_runtime_calls += 1;
                }
                self.walk_expr(size, table);
            }
            Expr::Table {
                initializers,
                is_float,
            } => {
                let mut saw_int = false;
                let mut saw_float = false;
                for init in initializers.iter_mut() {
                    self.walk_expr(init, table);
                    match self.infer(init, table) {
                        t if t == VarType::FLOAT => saw_float = true,
                        _ => saw_int = true,
                    }
                }
                if saw_int && saw_float && !*is_float {
                    self.error("heterogeneous vector initializer");
                }
            }
            Expr::ListLit {
                initializers,
                is_manifest,
            } => {
                if !*is_manifest {
                    // Materialized through the runtime copy of the template.
                    if let Some(metrics) = self.metrics_mut() {
                        metrics.num_runtime_calls += 1;
                    }
                }
                for init in initializers.iter_mut() {
                    self.walk_expr(init, table);
                }
            }
            Expr::Number(_) | Expr::StringLit(_) | Expr::CharLit(_) | Expr::BooleanLit(_) => {}
        }
    }

    /// Classify a call target and update the counters; also diagnose
    /// const-list misuse of the modifying intrinsics and SETTYPE.
    fn note_call(&mut self, target: &Expr, arguments: &[Expr], table: &mut SymbolTable) {
        let Some(name) = target.variable_name() else {
            return;
        };
        let name = name.to_string();

        if name == "SETTYPE" {
            let arg_type = arguments
                .first()
                .map(|a| self.infer(a, table))
                .unwrap_or(VarType::UNKNOWN);
            if !arg_type.is_list() {
                self.error("SETTYPE requires a list operand");
            }
        }

        if LIST_MUTATORS.contains(&name.as_str()) {
            if let Some(first) = arguments.first() {
                if self.infer(first, table).is_const_list() {
                    self.error(format!("{} cannot modify a const list", name));
                }
            }
        }

        match table.lookup(&name).map(|s| s.kind) {
            Some(kind) if kind.is_runtime() => {
                if let Some(metrics) = self.metrics_mut() {
                    metrics.num_runtime_calls += 1;
                }
            }
            Some(SymbolKind::Function) | Some(SymbolKind::FloatFunction) => {
                if let Some(metrics) = self.metrics_mut() {
                    metrics.num_local_function_calls += 1;
                }
            }
            Some(SymbolKind::Routine) => {
                if let Some(metrics) = self.metrics_mut() {
                    metrics.num_local_routine_calls += 1;
                }
            }
            _ => {
                // Intrinsics resolved by name even without registration.
                if is_intrinsic(&name) {
                    if let Some(metrics) = self.metrics_mut() {
                        metrics.num_runtime_calls += 1;
                    }
                }
            }
        }
    }

    fn check_assignment_target(&mut self, target: &Expr, table: &mut SymbolTable) {
        if let Expr::Unary {
            op: UnaryOperator::HeadOf | UnaryOperator::TailOf,
            operand,
        } = target
        {
            if self.infer(operand, table).is_const_list() {
                self.error("cannot assign through HD/TL of a const list");
            }
        }
    }

    // --- Type inference ---

    /// Infer the type of an expression. Total: unknown inputs give
    /// `VarType::UNKNOWN`, never an error.
    pub fn infer(&self, expr: &Expr, table: &SymbolTable) -> VarType {
        infer_expr(expr, table, self.metrics.get(&self.current_function))
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Intrinsics understood by name before any registration.
fn is_intrinsic(name: &str) -> bool {
    matches!(
        name,
        "SPLIT"
            | "JOIN"
            | "FIND"
            | "AS_INT"
            | "AS_FLOAT"
            | "AS_STRING"
            | "AS_LIST"
            | "REVERSE"
            | "CONCAT"
            | "FILTER"
            | "COPYLIST"
            | "DEEPCOPYLIST"
            | "APND"
            | "FPND"
            | "SPND"
            | "LPND"
    )
}

fn literal_type(expr: &Expr) -> VarType {
    match expr {
        Expr::Number(NumberLiteral::Float(_)) => VarType::FLOAT,
        Expr::StringLit(_) => VarType::STRING,
        _ => VarType::INTEGER,
    }
}

/// Standalone inference so passes without an `Analyzer` can reuse it.
pub fn infer_expr(
    expr: &Expr,
    table: &SymbolTable,
    metrics: Option<&FunctionMetrics>,
) -> VarType {
    match expr {
        Expr::Number(NumberLiteral::Integer(_)) => VarType::INTEGER,
        Expr::Number(NumberLiteral::Float(_)) => VarType::FLOAT,
        Expr::StringLit(_) => VarType::STRING,
        Expr::CharLit(_) => VarType::INTEGER,
        Expr::BooleanLit(_) => VarType::INTEGER,
        Expr::Variable { .. } => {
            let name = expr.variable_name().unwrap();
            if let Some(metrics) = metrics {
                let t = metrics.variable_type(name);
                if t != VarType::UNKNOWN {
                    return t;
                }
            }
            table
                .lookup(name)
                .map(|s| s.var_type)
                .unwrap_or(VarType::UNKNOWN)
        }
        Expr::Binary { op, left, right } => {
            if op.is_comparison() {
                return VarType::INTEGER;
            }
            if op.is_float_op() {
                return VarType::FLOAT;
            }
            let lt = infer_expr(left, table, metrics);
            let rt = infer_expr(right, table, metrics);
            if lt == VarType::FLOAT || rt == VarType::FLOAT {
                VarType::FLOAT
            } else {
                VarType::INTEGER
            }
        }
        Expr::Unary { op, operand } => match op {
            UnaryOperator::AddressOf => {
                infer_expr(operand, table, metrics) | VarType::POINTER_TO
            }
            UnaryOperator::Indirection => {
                let inner = infer_expr(operand, table, metrics);
                if inner.contains(VarType::POINTER_TO) {
                    inner & !VarType::POINTER_TO
                } else {
                    VarType::INTEGER
                }
            }
            UnaryOperator::LogicalNot | UnaryOperator::Negate => {
                let inner = infer_expr(operand, table, metrics);
                if inner == VarType::FLOAT {
                    VarType::FLOAT
                } else {
                    VarType::INTEGER
                }
            }
            UnaryOperator::FloatConvert => VarType::FLOAT,
            UnaryOperator::LengthOf => VarType::INTEGER,
            UnaryOperator::HeadOf => {
                let inner = infer_expr(operand, table, metrics);
                if inner.is_list() {
                    let kind = inner.element_kind();
                    if kind == VarType::UNKNOWN || kind == VarType::ANY {
                        VarType::INTEGER
                    } else {
                        kind
                    }
                } else {
                    VarType::INTEGER
                }
            }
            UnaryOperator::TailOf => {
                let inner = infer_expr(operand, table, metrics);
                if inner.is_list() {
                    inner
                } else {
                    VarType::POINTER_TO_ANY_LIST
                }
            }
        },
        Expr::VectorAccess { vector, .. } => {
            let base = infer_expr(vector, table, metrics);
            if base.contains(VarType::VEC) && base.element_kind() == VarType::FLOAT {
                VarType::FLOAT
            } else {
                VarType::INTEGER
            }
        }
        Expr::CharIndirection { .. } => VarType::INTEGER,
        Expr::FloatVectorAccess { .. } => VarType::FLOAT,
        Expr::Call {
            function,
            arguments,
        } => {
            let Some(name) = function.variable_name() else {
                return VarType::INTEGER;
            };
            match name {
                "SPLIT" => VarType::POINTER_TO_STRING_LIST,
                "JOIN" => VarType::STRING,
                "FIND" => VarType::POINTER_TO_ANY_LIST,
                "AS_INT" => VarType::INTEGER,
                "AS_FLOAT" => VarType::FLOAT,
                "AS_STRING" => VarType::STRING,
                "AS_LIST" => VarType::POINTER_TO_ANY_LIST,
                "COPYLIST" | "DEEPCOPYLIST" | "REVERSE" | "CONCAT" | "FILTER" => {
                    let arg_type = arguments
                        .first()
                        .map(|a| infer_expr(a, table, metrics))
                        .unwrap_or(VarType::POINTER_TO_ANY_LIST);
                    if arg_type.is_list() {
                        arg_type & !VarType::CONST
                    } else {
                        VarType::POINTER_TO_ANY_LIST
                    }
                }
                _ => match table.lookup(name) {
                    Some(symbol) if symbol.kind.is_float_function() => VarType::FLOAT,
                    Some(symbol) if symbol.kind.is_function_like() => VarType::INTEGER,
                    Some(symbol) => symbol.var_type,
                    None => VarType::INTEGER,
                },
            }
        }
        Expr::SysCall { .. } => VarType::INTEGER,
        Expr::Conditional {
            true_expr,
            false_expr,
            ..
        } => {
            let tt = infer_expr(true_expr, table, metrics);
            let ft = infer_expr(false_expr, table, metrics);
            if tt == VarType::FLOAT || ft == VarType::FLOAT {
                VarType::FLOAT
            } else {
                tt
            }
        }
        Expr::Valof(_) => VarType::INTEGER,
        Expr::FloatValof(_) => VarType::FLOAT,
        Expr::VecAlloc { .. } => VarType::POINTER_TO_INT_VEC,
        Expr::StringAlloc { .. } => VarType::STRING,
        Expr::Table { is_float, .. } => {
            if *is_float {
                VarType::POINTER_TO_FLOAT_VEC
            } else {
                VarType::POINTER_TO_TABLE
            }
        }
        Expr::ListLit {
            initializers,
            is_manifest,
        } => {
            let mut kinds = initializers
                .iter()
                .map(|e| infer_expr(e, table, metrics).element_kind());
            let first = kinds.next().unwrap_or(VarType::ANY);
            let element = if kinds.all(|k| k == first) && first != VarType::UNKNOWN {
                first
            } else {
                VarType::ANY
            };
            let list = VarType::list_of(element);
            if *is_manifest {
                list | VarType::CONST
            } else {
                list
            }
        }
    }
}

/// Set the unique name on every access to `from` inside a subtree.
fn rename_in_stmt(stmt: &mut Stmt, from: &str, to: &str) {
    match stmt {
        Stmt::Let { initializers, .. } => {
            for init in initializers {
                rename_in_expr(init, from, to);
            }
        }
        Stmt::Assignment { lhs, rhs } => {
            for e in lhs.iter_mut().chain(rhs.iter_mut()) {
                rename_in_expr(e, from, to);
            }
        }
        Stmt::RoutineCall { routine, arguments } => {
            rename_in_expr(routine, from, to);
            for arg in arguments {
                rename_in_expr(arg, from, to);
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
            rename_in_expr(condition, from, to);
            rename_in_stmt(then_branch, from, to);
        }
        Stmt::Test {
            condition,
            then_branch,
            else_branch,
        } => {
            rename_in_expr(condition, from, to);
            rename_in_stmt(then_branch, from, to);
            rename_in_stmt(else_branch, from, to);
        }
        Stmt::While { condition, body } | Stmt::Until { condition, body } => {
            rename_in_expr(condition, from, to);
            rename_in_stmt(body, from, to);
        }
        Stmt::Repeat {
            body, condition, ..
        } => {
            rename_in_stmt(body, from, to);
            if let Some(cond) = condition {
                rename_in_expr(cond, from, to);
            }
        }
        Stmt::For {
            loop_variable,
            start,
            end,
            step,
            body,
            ..
        } => {
            rename_in_expr(start, from, to);
            rename_in_expr(end, from, to);
            if let Some(step) = step {
                rename_in_expr(step, from, to);
            }
            // An inner FOR over the same source name shadows; stop there.
            if loop_variable != from {
                rename_in_stmt(body, from, to);
            }
        }
        Stmt::ForEach {
            value_name,
            collection,
            body,
            ..
        } => {
            rename_in_expr(collection, from, to);
            if value_name != from {
                rename_in_stmt(body, from, to);
            }
        }
        Stmt::Switchon {
            expression,
            cases,
            default_case,
        } => {
            rename_in_expr(expression, from, to);
            for arm in cases {
                rename_in_stmt(&mut arm.command, from, to);
            }
            if let Some(default) = default_case {
                rename_in_stmt(default, from, to);
            }
        }
        Stmt::Resultis(expr) | Stmt::Free(expr) | Stmt::Goto(expr) => {
            rename_in_expr(expr, from, to)
        }
        Stmt::Compound(stmts) => {
            for s in stmts {
                rename_in_stmt(s, from, to);
            }
        }
        Stmt::Block { statements, .. } => {
            for s in statements {
                rename_in_stmt(s, from, to);
            }
        }
        Stmt::CondBranch { expr, .. } => rename_in_expr(expr, from, to),
        _ => {}
    }
}

fn rename_in_expr(expr: &mut Expr, from: &str, to: &str) {
    match expr {
        Expr::Variable { name, unique_name } => {
            if name == from && unique_name.is_none() {
                *unique_name = Some(to.to_string());
            }
        }
        Expr::Binary { left, right, .. } => {
            rename_in_expr(left, from, to);
            rename_in_expr(right, from, to);
        }
        Expr::Unary { operand, .. } => rename_in_expr(operand, from, to),
        Expr::VectorAccess { vector, index }
        | Expr::FloatVectorAccess { vector, index } => {
            rename_in_expr(vector, from, to);
            rename_in_expr(index, from, to);
        }
        Expr::CharIndirection { string, index } => {
            rename_in_expr(string, from, to);
            rename_in_expr(index, from, to);
        }
        Expr::Call {
            function,
            arguments,
        } => {
            rename_in_expr(function, from, to);
            for arg in arguments {
                rename_in_expr(arg, from, to);
            }
        }
        Expr::SysCall { number, arguments } => {
            rename_in_expr(number, from, to);
            for arg in arguments {
                rename_in_expr(arg, from, to);
            }
        }
        Expr::Conditional {
            condition,
            true_expr,
            false_expr,
        } => {
            rename_in_expr(condition, from, to);
            rename_in_expr(true_expr, from, to);
            rename_in_expr(false_expr, from, to);
        }
        Expr::Valof(body) | Expr::FloatValof(body) => rename_in_stmt(body, from, to),
        Expr::VecAlloc { size } | Expr::StringAlloc { size } => rename_in_expr(size, from, to),
        Expr::Table { initializers, .. } | Expr::ListLit { initializers, .. } => {
            for init in initializers {
                rename_in_expr(init, from, to);
            }
        }
        _ => {}
    }
}

/// Fold a constant expression to an integer, resolving manifests.
pub fn const_eval(expr: &Expr, table: &SymbolTable) -> Option<i64> {
    match expr {
        Expr::Number(NumberLiteral::Integer(v)) => Some(*v),
        Expr::CharLit(c) => Some(*c as i64),
        Expr::BooleanLit(b) => Some(if *b { -1 } else { 0 }),
        Expr::Variable { .. } => {
            let name = expr.variable_name()?;
            match table.lookup(name) {
                Some(symbol) if symbol.kind == SymbolKind::Manifest => {
                    match symbol.location {
                        SymbolLocation::Absolute(v) => Some(v),
                        _ => None,
                    }
                }
                _ => None,
            }
        }
        Expr::Unary { op, operand } => {
            let v = const_eval(operand, table)?;
            match op {
                UnaryOperator::Negate => Some(v.wrapping_neg()),
                UnaryOperator::LogicalNot => Some(!v),
                _ => None,
            }
        }
        Expr::Binary { op, left, right } => {
            let l = const_eval(left, table)?;
            let r = const_eval(right, table)?;
            Some(match op {
                BinaryOperator::Add => l.wrapping_add(r),
                BinaryOperator::Subtract => l.wrapping_sub(r),
                BinaryOperator::Multiply => l.wrapping_mul(r),
                BinaryOperator::Divide => {
                    if r == 0 {
                        return None;
                    }
                    l.wrapping_div(r)
                }
                BinaryOperator::Remainder => {
                    if r == 0 {
                        return None;
                    }
                    l.wrapping_rem(r)
                }
                BinaryOperator::LeftShift => l.wrapping_shl(r as u32),
                BinaryOperator::RightShift => ((l as u64) >> (r as u32 & 63)) as i64,
                BinaryOperator::LogicalAnd => l & r,
                BinaryOperator::LogicalOr => l | r,
                BinaryOperator::Equivalence => !(l ^ r),
                BinaryOperator::NotEquivalence => l ^ r,
                BinaryOperator::Equal => bool_word(l == r),
                BinaryOperator::NotEqual => bool_word(l != r),
                BinaryOperator::Less => bool_word(l < r),
                BinaryOperator::LessEqual => bool_word(l <= r),
                BinaryOperator::Greater => bool_word(l > r),
                BinaryOperator::GreaterEqual => bool_word(l >= r),
                _ => return None,
            })
        }
        _ => None,
    }
}

/// BCPL truth values: all ones for true, zero for false.
fn bool_word(b: bool) -> i64 {
    if b {
        -1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcpl_parser::parse_source;

    fn analyze(source: &str) -> (bcpl_ast::Program, SymbolTable, AnalysisOutput) {
        let mut program = parse_source(source).unwrap();
        let mut table = SymbolTable::new();
        let output = Analyzer::new().analyze(&mut program, &mut table);
        (program, table, output)
    }

    #[test]
    fn test_discovery_seeds_metrics() {
        let (_, _, output) = analyze("LET F(x, y) = x + y  LET START() BE FINISH");
        let f = &output.metrics["F"];
        assert_eq!(f.num_parameters, 2);
        assert_eq!(f.parameter_indices["x"], 0);
        assert_eq!(f.parameter_indices["y"], 1);
        assert!(output.metrics.contains_key("START"));
    }

    #[test]
    fn test_for_loop_variable_renamed() {
        let (program, _, output) = analyze(
            "LET G() BE $( LET v = VEC 3; FOR i = 0 TO 3 DO v!i := i $)",
        );
        let Decl::Routine { body, .. } = &program.declarations[0] else {
            panic!()
        };
        let Stmt::Block { statements, .. } = body else {
            panic!()
        };
        let Stmt::For {
            unique_loop_variable,
            body: for_body,
            ..
        } = &statements[1]
        else {
            panic!("expected FOR, got {:?}", statements[1]);
        };
        let unique = unique_loop_variable.as_deref().unwrap();
        assert!(unique.starts_with("i_for_var_"));
        // Accesses inside the body carry the unique name.
        let used = bcpl_ast::visit::used_variables(for_body);
        assert!(used.iter().any(|v| v == unique));
        // And the unique name is a recorded local.
        assert!(output.metrics["G"].variable_types.contains_key(unique));
    }

    #[test]
    fn test_float_inference_via_let() {
        let (_, _, output) = analyze("LET H() BE $( LET f = 1.5; LET g = f #+ 2.0 $)");
        let metrics = &output.metrics["H"];
        assert_eq!(metrics.variable_type("f"), VarType::FLOAT);
        assert_eq!(metrics.variable_type("g"), VarType::FLOAT);
        assert_eq!(metrics.num_float_variables, 2);
        assert_eq!(metrics.num_variables, 0);
    }

    #[test]
    fn test_accesses_globals_flag() {
        let (_, _, output) = analyze(
            "GLOBAL $( counter : 1 $) \
             LET BUMP() BE counter := counter + 1 \
             LET PURE(x) = x + 1",
        );
        assert!(output.metrics["BUMP"].accesses_globals);
        assert!(!output.metrics["PURE"].accesses_globals);
    }

    #[test]
    fn test_case_constants_resolved() {
        let (program, _, output) = analyze(
            "MANIFEST $( TWO = 2 $) \
             LET S(x) BE SWITCHON x INTO $( CASE 1: RETURN CASE TWO: RETURN $)",
        );
        assert!(output.diagnostics.is_empty());
        let Decl::Routine { body, .. } = &program.declarations[1] else {
            panic!()
        };
        let Stmt::Switchon { cases, .. } = body else {
            panic!()
        };
        assert_eq!(cases[0].resolved_value, Some(1));
        assert_eq!(cases[1].resolved_value, Some(2));
    }

    #[test]
    fn test_const_list_mutation_diagnosed() {
        let (_, _, output) = analyze(
            "LET F() BE $( LET l = MANIFESTLIST(1, 2); REVERSE(l) $)",
        );
        assert!(output
            .diagnostics
            .iter()
            .any(|d| d.message.contains("const list")));
    }

    #[test]
    fn test_settype_on_non_list_diagnosed() {
        let (_, _, output) = analyze("LET F() BE $( LET x = 1; SETTYPE(x, 2) $)");
        assert!(output
            .diagnostics
            .iter()
            .any(|d| d.message.contains("SETTYPE")));
    }

    #[test]
    fn test_heterogeneous_table_diagnosed() {
        let (_, _, output) = analyze("LET F() = TABLE 1, 2.5, 3");
        assert!(output
            .diagnostics
            .iter()
            .any(|d| d.message.contains("heterogeneous")));
    }

    #[test]
    fn test_list_literal_element_types() {
        let table = SymbolTable::new();
        let homogeneous = Expr::ListLit {
            initializers: vec![Expr::integer(1), Expr::integer(2)],
            is_manifest: false,
        };
        assert_eq!(
            infer_expr(&homogeneous, &table, None),
            VarType::POINTER_TO_INT_LIST
        );

        let mixed = Expr::ListLit {
            initializers: vec![Expr::integer(1), Expr::Number(NumberLiteral::Float(2.0))],
            is_manifest: false,
        };
        assert_eq!(
            infer_expr(&mixed, &table, None),
            VarType::POINTER_TO_ANY_LIST
        );

        let manifest = Expr::ListLit {
            initializers: vec![Expr::integer(1)],
            is_manifest: true,
        };
        assert!(infer_expr(&manifest, &table, None).is_const_list());
    }

    #[test]
    fn test_intrinsic_return_types() {
        let table = SymbolTable::new();
        let call = |name: &str| Expr::Call {
            function: Box::new(Expr::variable(name)),
            arguments: vec![],
        };
        assert_eq!(
            infer_expr(&call("SPLIT"), &table, None),
            VarType::POINTER_TO_STRING_LIST
        );
        assert_eq!(infer_expr(&call("JOIN"), &table, None), VarType::STRING);
        assert_eq!(infer_expr(&call("AS_FLOAT"), &table, None), VarType::FLOAT);
        assert_eq!(
            infer_expr(&call("FIND"), &table, None),
            VarType::POINTER_TO_ANY_LIST
        );
    }

    #[test]
    fn test_runtime_call_counting() {
        let mut table = SymbolTable::new();
        let mut sym = Symbol::new("WRITEN", SymbolKind::RuntimeRoutine, VarType::INTEGER, 0);
        sym.parameters = vec![VarType::INTEGER];
        table.add_global(sym);

        let mut program =
            parse_source("LET F(x) BE $( WRITEN(x); WRITEN(x + 1) $)").unwrap();
        let output = Analyzer::new().analyze(&mut program, &mut table);
        assert_eq!(output.metrics["F"].num_runtime_calls, 2);
    }

    use crate::symbols::Symbol;

    #[test]
    fn test_clone_walk_is_stable() {
        // Cloning a subtree then collecting names gives the same pairs.
        let (program, _, _) = analyze("LET F(x) = VALOF $( RESULTIS x * 2 $)");
        let Decl::Function { body, .. } = &program.declarations[0] else {
            panic!()
        };
        let copy = body.clone();
        assert_eq!(
            bcpl_ast::visit::expr_variables(body),
            bcpl_ast::visit::expr_variables(&copy)
        );
    }
}
