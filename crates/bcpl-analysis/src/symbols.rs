//! Symbols and the lexically scoped symbol table.

use bcpl_ast::{FunctionType, VarType};
use rustc_hash::FxHashMap;

/// The kinds of symbols that can exist in a BCPL program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    LocalVar,
    StaticVar,
    GlobalVar,
    Parameter,
    /// Function returning an integer value.
    Function,
    /// Function returning a float value.
    FloatFunction,
    /// Routine with no return value.
    Routine,
    Label,
    Manifest,
    RuntimeFunction,
    RuntimeFloatFunction,
    RuntimeRoutine,
    RuntimeFloatRoutine,
}

impl SymbolKind {
    pub fn is_local(self) -> bool {
        matches!(self, SymbolKind::LocalVar | SymbolKind::Parameter)
    }

    pub fn is_global(self) -> bool {
        matches!(self, SymbolKind::GlobalVar | SymbolKind::StaticVar)
    }

    pub fn is_runtime(self) -> bool {
        matches!(
            self,
            SymbolKind::RuntimeFunction
                | SymbolKind::RuntimeFloatFunction
                | SymbolKind::RuntimeRoutine
                | SymbolKind::RuntimeFloatRoutine
        )
    }

    pub fn is_function_like(self) -> bool {
        matches!(
            self,
            SymbolKind::Function | SymbolKind::FloatFunction | SymbolKind::Routine
        ) || self.is_runtime()
    }

    pub fn is_float_function(self) -> bool {
        matches!(
            self,
            SymbolKind::FloatFunction
                | SymbolKind::RuntimeFloatFunction
                | SymbolKind::RuntimeFloatRoutine
        )
    }
}

/// Where a symbol's value lives once layout has happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymbolLocation {
    /// Frame-pointer-relative offset.
    Stack(i32),
    /// Word offset into the data segment.
    Data(u64),
    /// Manifest constant value.
    Absolute(i64),
    /// A code label; the symbol's name is the label.
    Label,
    #[default]
    Unknown,
}

/// One symbol record.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub var_type: VarType,
    pub scope_level: u32,
    pub location: SymbolLocation,
    /// Element count for arrays/vectors, when declared with one.
    pub size: Option<u64>,
    /// Parameter types for function-like symbols.
    pub parameters: Vec<VarType>,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind, var_type: VarType, scope_level: u32) -> Self {
        Symbol {
            name: name.into(),
            kind,
            var_type,
            scope_level,
            location: SymbolLocation::Unknown,
            size: None,
            parameters: Vec::new(),
        }
    }

    pub fn function_type(&self) -> FunctionType {
        if self.kind.is_float_function() {
            FunctionType::Float
        } else {
            FunctionType::Standard
        }
    }
}

/// Lexically scoped name-to-symbol map. Scope 0 is the global scope and is
/// never popped; inner scopes shadow outer ones.
#[derive(Debug)]
pub struct SymbolTable {
    scopes: Vec<FxHashMap<String, Symbol>>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable {
            scopes: vec![FxHashMap::default()],
        }
    }

    pub fn scope_level(&self) -> u32 {
        (self.scopes.len() - 1) as u32
    }

    pub fn enter_scope(&mut self) {
        self.scopes.push(FxHashMap::default());
    }

    pub fn exit_scope(&mut self) {
        debug_assert!(self.scopes.len() > 1, "cannot pop the global scope");
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Insert into the current scope, shadowing any outer binding.
    pub fn add(&mut self, name: impl Into<String>, kind: SymbolKind, var_type: VarType) -> &mut Symbol {
        let level = self.scope_level();
        let name = name.into();
        let scope = self.scopes.last_mut().expect("at least the global scope");
        scope.insert(name.clone(), Symbol::new(name.clone(), kind, var_type, level));
        scope.get_mut(&name).unwrap()
    }

    /// Insert a fully built symbol into the current scope.
    pub fn add_symbol(&mut self, symbol: Symbol) {
        let scope = self.scopes.last_mut().expect("at least the global scope");
        scope.insert(symbol.name.clone(), symbol);
    }

    /// Insert into the global scope regardless of the current nesting.
    pub fn add_global(&mut self, symbol: Symbol) {
        self.scopes[0].insert(symbol.name.clone(), symbol);
    }

    /// Innermost binding for `name`.
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut Symbol> {
        self.scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.get_mut(name))
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Update a symbol's location once layout is known.
    pub fn set_location(&mut self, name: &str, location: SymbolLocation) -> bool {
        match self.lookup_mut(name) {
            Some(symbol) => {
                symbol.location = location;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadowing_and_scope_exit() {
        let mut table = SymbolTable::new();
        table.add("x", SymbolKind::GlobalVar, VarType::INTEGER);
        table.enter_scope();
        table.add("x", SymbolKind::LocalVar, VarType::FLOAT);

        assert_eq!(table.lookup("x").unwrap().kind, SymbolKind::LocalVar);
        table.exit_scope();
        assert_eq!(table.lookup("x").unwrap().kind, SymbolKind::GlobalVar);
    }

    #[test]
    fn test_manifest_location() {
        let mut table = SymbolTable::new();
        let sym = table.add("SIZE", SymbolKind::Manifest, VarType::INTEGER);
        sym.location = SymbolLocation::Absolute(10);
        assert_eq!(
            table.lookup("SIZE").unwrap().location,
            SymbolLocation::Absolute(10)
        );
    }

    #[test]
    fn test_runtime_kind_queries() {
        assert!(SymbolKind::RuntimeFloatFunction.is_runtime());
        assert!(SymbolKind::RuntimeFloatFunction.is_float_function());
        assert!(SymbolKind::Function.is_function_like());
        assert!(!SymbolKind::LocalVar.is_function_like());
    }
}
