//! Per-function analysis metrics.
//!
//! Populated by the semantic analyzer, amended by the optimizer passes (CSE
//! temporaries) and the liveness pass (peak register pressure), and consumed
//! by the call-frame manager and the code generator.

use bcpl_ast::VarType;
use std::collections::BTreeMap;

/// Everything the back end needs to know about one function.
#[derive(Debug, Clone, Default)]
pub struct FunctionMetrics {
    pub num_parameters: usize,
    /// Parameter name to positional index.
    pub parameter_indices: BTreeMap<String, usize>,
    pub parameter_types: BTreeMap<String, VarType>,

    /// Integer-bank locals (everything that is not a bare float).
    pub num_variables: usize,
    pub num_float_variables: usize,
    /// Inferred type per variable name, parameters included.
    pub variable_types: BTreeMap<String, VarType>,

    /// Peak `max(|live-in|, |live-out|)` over the function's blocks.
    pub max_live_variables: usize,

    pub num_runtime_calls: usize,
    pub num_local_function_calls: usize,
    pub num_local_routine_calls: usize,
    pub has_vector_allocations: bool,
    pub accesses_globals: bool,

    /// Float-valued function (result in D0).
    pub returns_float: bool,
}

impl FunctionMetrics {
    pub fn is_parameter(&self, name: &str) -> bool {
        self.parameter_indices.contains_key(name)
    }

    /// Inferred type of a variable, parameter or local.
    pub fn variable_type(&self, name: &str) -> VarType {
        self.variable_types
            .get(name)
            .copied()
            .unwrap_or(VarType::UNKNOWN)
    }

    /// Record a local with its type, keeping the int/float counters in step.
    pub fn add_local(&mut self, name: &str, var_type: VarType) {
        let newly_added = !self.variable_types.contains_key(name);
        self.variable_types.insert(name.to_string(), var_type);
        if newly_added && !self.is_parameter(name) {
            if var_type.uses_fp_register() {
                self.num_float_variables += 1;
            } else {
                self.num_variables += 1;
            }
        }
    }

    /// True when the function needs the data-segment base register: it
    /// touches globals or calls into the runtime.
    pub fn needs_data_base(&self) -> bool {
        self.accesses_globals || self.num_runtime_calls > 0
    }
}

/// The process-wide map, keyed and iterated in name order so downstream
/// output is reproducible.
pub type MetricsMap = BTreeMap<String, FunctionMetrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_local_counts_banks() {
        let mut m = FunctionMetrics::default();
        m.add_local("a", VarType::INTEGER);
        m.add_local("f", VarType::FLOAT);
        m.add_local("a", VarType::INTEGER); // re-recording is idempotent
        assert_eq!(m.num_variables, 1);
        assert_eq!(m.num_float_variables, 1);
    }

    #[test]
    fn test_parameters_not_double_counted() {
        let mut m = FunctionMetrics::default();
        m.parameter_indices.insert("x".to_string(), 0);
        m.add_local("x", VarType::INTEGER);
        assert_eq!(m.num_variables, 0);
        assert_eq!(m.variable_type("x"), VarType::INTEGER);
    }

    #[test]
    fn test_needs_data_base() {
        let mut m = FunctionMetrics::default();
        assert!(!m.needs_data_base());
        m.num_runtime_calls = 1;
        assert!(m.needs_data_base());
        m.num_runtime_calls = 0;
        m.accesses_globals = true;
        assert!(m.needs_data_base());
    }
}
