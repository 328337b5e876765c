//! Liveness analysis over the CFG.
//!
//! Computes per-block use/def sets from the statement-level helpers, then
//! solves the backward data-flow equations to a fixed point:
//! `in[b] = use[b] ∪ (out[b] \ def[b])`, `out[b] = ∪ in[s]`.

use crate::cfg::ControlFlowGraph;
use bcpl_ast::visit::{defined_variables, used_variables};
use rustc_hash::{FxHashMap, FxHashSet};

/// Per-block in/out sets for one function.
#[derive(Debug, Default)]
pub struct LivenessInfo {
    pub use_sets: FxHashMap<u32, FxHashSet<String>>,
    pub def_sets: FxHashMap<u32, FxHashSet<String>>,
    pub in_sets: FxHashMap<u32, FxHashSet<String>>,
    pub out_sets: FxHashMap<u32, FxHashSet<String>>,
}

impl LivenessInfo {
    pub fn live_in(&self, block: u32) -> Option<&FxHashSet<String>> {
        self.in_sets.get(&block)
    }

    pub fn live_out(&self, block: u32) -> Option<&FxHashSet<String>> {
        self.out_sets.get(&block)
    }

    /// Peak `max(|in|, |out|)` over all blocks — the register-pressure
    /// metric the frame manager sizes spill slots from.
    pub fn register_pressure(&self) -> usize {
        self.in_sets
            .keys()
            .map(|id| {
                let in_size = self.in_sets.get(id).map(|s| s.len()).unwrap_or(0);
                let out_size = self.out_sets.get(id).map(|s| s.len()).unwrap_or(0);
                in_size.max(out_size)
            })
            .max()
            .unwrap_or(0)
    }
}

/// Run the analysis for one function.
pub fn analyze(cfg: &ControlFlowGraph) -> LivenessInfo {
    let mut info = LivenessInfo::default();

    // Phase 1: use/def per block, statements in order. A variable already
    // defined earlier in the block is not upward-exposed.
    for (id, block) in &cfg.blocks {
        let mut uses = FxHashSet::default();
        let mut defs: FxHashSet<String> = FxHashSet::default();
        for stmt in &block.statements {
            for var in used_variables(stmt) {
                if !defs.contains(&var) {
                    uses.insert(var);
                }
            }
            for var in defined_variables(stmt) {
                defs.insert(var);
            }
        }
        info.use_sets.insert(*id, uses);
        info.def_sets.insert(*id, defs);
        info.in_sets.insert(*id, FxHashSet::default());
        info.out_sets.insert(*id, FxHashSet::default());
    }

    // Phase 2: iterate to a fixed point, visiting blocks in reverse id
    // order so the backward flow converges quickly.
    let ids: Vec<u32> = cfg.blocks.keys().rev().copied().collect();
    loop {
        let mut changed = false;
        for &id in &ids {
            let mut out = FxHashSet::default();
            for &succ in &cfg.blocks[&id].successors {
                if let Some(succ_in) = info.in_sets.get(&succ) {
                    out.extend(succ_in.iter().cloned());
                }
            }

            let mut new_in = info.use_sets[&id].clone();
            for var in &out {
                if !info.def_sets[&id].contains(var) {
                    new_in.insert(var.clone());
                }
            }

            if out != info.out_sets[&id] {
                info.out_sets.insert(id, out);
                changed = true;
            }
            if new_in != info.in_sets[&id] {
                info.in_sets.insert(id, new_in);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    log::trace!(
        "liveness({}): pressure {}",
        cfg.function_name,
        info.register_pressure()
    );
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::cfg::CfgBuilder;
    use crate::symbols::SymbolTable;
    use bcpl_parser::parse_source;

    fn liveness_for(source: &str, function: &str) -> (ControlFlowGraph, LivenessInfo) {
        let mut program = parse_source(source).unwrap();
        let mut table = SymbolTable::new();
        let _ = Analyzer::new().analyze(&mut program, &mut table);
        let mut cfgs = CfgBuilder::new().build(&program).unwrap();
        let cfg = cfgs.remove(function).unwrap();
        let info = analyze(&cfg);
        (cfg, info)
    }

    #[test]
    fn test_loop_variable_live_around_backedge() {
        let (cfg, info) = liveness_for(
            "LET F(n) = VALOF $( LET s = 0; FOR i = 1 TO n DO s := s + i; RESULTIS s $)",
            "F",
        );
        // `s` is live into the loop header: used in the body, defined before.
        let header = cfg
            .blocks
            .values()
            .find(|b| matches!(b.terminator(), Some(bcpl_ast::Stmt::For { .. })))
            .unwrap();
        assert!(info.live_in(header.id).unwrap().contains("s"));
    }

    #[test]
    fn test_dead_after_last_use() {
        let (cfg, info) = liveness_for(
            "LET F(a, b) = VALOF $( LET t = a + b; WRITEN(t); RESULTIS 0 $)",
            "F",
        );
        // Nothing is live out of the exit block.
        let exit = cfg.exit.unwrap();
        assert!(info.live_out(exit).unwrap().is_empty());
    }

    #[test]
    fn test_pressure_counts_simultaneous_lives() {
        let (_, info) = liveness_for(
            "LET F(a, b, c) = VALOF $( \
               LET x = a + b; LET y = b + c; LET z = x + y; RESULTIS z $)",
            "F",
        );
        assert!(info.register_pressure() >= 2);
    }

    #[test]
    fn test_branch_merges_union_of_uses() {
        let (cfg, info) = liveness_for(
            "LET F(p, a, b) = VALOF $( \
               TEST p THEN RESULTIS a ELSE RESULTIS b $)",
            "F",
        );
        // At the entry both a and b are potentially needed.
        let entry_in = info.live_in(cfg.entry).unwrap();
        assert!(entry_in.contains("a"));
        assert!(entry_in.contains("b"));
        assert!(entry_in.contains("p"));
    }
}
