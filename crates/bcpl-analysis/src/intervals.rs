//! Live-interval construction.
//!
//! Linearizes each CFG by sorted block id, numbers statements in that order,
//! and records the first and last instruction number at which each variable
//! appears. One interval per variable per function; the linear-scan
//! allocator consumes them.

use crate::cfg::ControlFlowGraph;
use bcpl_ast::visit::{defined_variables, used_variables};
use std::collections::BTreeMap;

/// The lifetime of one variable, in linearized statement numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveInterval {
    pub var_name: String,
    pub start_point: u32,
    pub end_point: u32,
}

impl LiveInterval {
    pub fn new(var_name: impl Into<String>, start: u32, end: u32) -> Self {
        LiveInterval {
            var_name: var_name.into(),
            start_point: start,
            end_point: end,
        }
    }
}

/// Compute the intervals for one function. The result is sorted by
/// variable name; the allocator re-sorts by start point.
pub fn compute(cfg: &ControlFlowGraph) -> Vec<LiveInterval> {
    let mut intervals: BTreeMap<String, LiveInterval> = BTreeMap::new();
    let mut number: u32 = 0;

    // Deterministic linearization: sorted block ids, statements in order.
    for id in cfg.sorted_ids() {
        for stmt in &cfg.block(id).statements {
            let mut touch = |name: String| {
                intervals
                    .entry(name.clone())
                    .and_modify(|interval| interval.end_point = number)
                    .or_insert_with(|| LiveInterval::new(name, number, number));
            };
            for var in used_variables(stmt) {
                touch(var);
            }
            for var in defined_variables(stmt) {
                touch(var);
            }
            number += 1;
        }
    }

    intervals.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::cfg::CfgBuilder;
    use crate::symbols::SymbolTable;
    use bcpl_parser::parse_source;

    fn intervals_for(source: &str, function: &str) -> Vec<LiveInterval> {
        let mut program = parse_source(source).unwrap();
        let mut table = SymbolTable::new();
        let _ = Analyzer::new().analyze(&mut program, &mut table);
        let cfgs = CfgBuilder::new().build(&program).unwrap();
        compute(&cfgs[function])
    }

    fn find<'a>(intervals: &'a [LiveInterval], name: &str) -> &'a LiveInterval {
        intervals
            .iter()
            .find(|i| i.var_name == name)
            .unwrap_or_else(|| panic!("no interval for {}", name))
    }

    #[test]
    fn test_start_not_after_end() {
        let intervals = intervals_for(
            "LET F(a, b) = VALOF $( LET t = a + b; LET u = t * 2; RESULTIS u $)",
            "F",
        );
        for interval in &intervals {
            assert!(interval.start_point <= interval.end_point, "{:?}", interval);
        }
    }

    #[test]
    fn test_ordering_follows_statement_order() {
        let intervals = intervals_for(
            "LET F(a) = VALOF $( LET t = a + 1; LET u = t + 1; RESULTIS u $)",
            "F",
        );
        let t = find(&intervals, "t");
        let u = find(&intervals, "u");
        assert!(t.start_point < u.start_point);
        // t's last use is u's definition.
        assert_eq!(t.end_point, u.start_point);
    }

    #[test]
    fn test_deterministic_across_runs() {
        let source = "LET F(a, b) = VALOF $( LET x = a * b; RESULTIS x $)";
        assert_eq!(intervals_for(source, "F"), intervals_for(source, "F"));
    }
}
