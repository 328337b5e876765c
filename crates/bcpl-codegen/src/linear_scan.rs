//! Linear-scan register allocation.
//!
//! Intervals are sorted by start point and walked once, with separate
//! active sets for the GP and FP register files. Parameters are primed
//! first: the first eight arrive in X0-X7 / D0-D7 (the code generator homes
//! them into their frame slots at entry), the rest are spilled by
//! construction. Everything else competes for the callee-saved variable
//! pools; when a pool is full the active interval with the farthest end
//! point is spilled.

use crate::reg::Reg;
use bcpl_analysis::intervals::LiveInterval;
use bcpl_analysis::FunctionMetrics;
use std::collections::BTreeMap;

/// One interval with its allocation decision.
#[derive(Debug, Clone)]
pub struct AllocatedInterval {
    pub interval: LiveInterval,
    pub assigned_register: Option<Reg>,
    pub is_spilled: bool,
    /// Frame offset once known; -1 while the frame is not laid out.
    pub stack_offset: i32,
}

impl AllocatedInterval {
    fn in_register(interval: LiveInterval, reg: Reg) -> Self {
        AllocatedInterval {
            interval,
            assigned_register: Some(reg),
            is_spilled: false,
            stack_offset: -1,
        }
    }

    fn spilled(interval: LiveInterval) -> Self {
        AllocatedInterval {
            interval,
            assigned_register: None,
            is_spilled: true,
            stack_offset: -1,
        }
    }
}

/// Variable name to allocation decision for one function.
pub type FunctionAllocation = BTreeMap<String, AllocatedInterval>;

/// Run the allocator for one function.
pub fn allocate(
    intervals: &[LiveInterval],
    metrics: &FunctionMetrics,
    gp_pool: &[Reg],
    fp_pool: &[Reg],
) -> FunctionAllocation {
    let mut allocation = FunctionAllocation::new();

    // Prime the parameters: their interval records where the value arrives.
    for (name, &index) in &metrics.parameter_indices {
        let interval = intervals
            .iter()
            .find(|i| &i.var_name == name)
            .cloned()
            .unwrap_or_else(|| LiveInterval::new(name.clone(), 0, 0));
        let is_float = metrics.variable_type(name).uses_fp_register();
        if index < 8 {
            let reg = if is_float {
                Reg::D(index as u8)
            } else {
                Reg::X(index as u8)
            };
            allocation.insert(name.clone(), AllocatedInterval::in_register(interval, reg));
        } else {
            allocation.insert(name.clone(), AllocatedInterval::spilled(interval));
        }
    }

    // Sort the remaining intervals by start point (ties by name for
    // determinism) and scan.
    let mut worklist: Vec<&LiveInterval> = intervals
        .iter()
        .filter(|i| !metrics.is_parameter(&i.var_name))
        .collect();
    worklist.sort_by(|a, b| {
        a.start_point
            .cmp(&b.start_point)
            .then_with(|| a.var_name.cmp(&b.var_name))
    });

    let mut gp_active: Vec<(LiveInterval, Reg)> = Vec::new();
    let mut fp_active: Vec<(LiveInterval, Reg)> = Vec::new();
    let mut gp_free: Vec<Reg> = gp_pool.to_vec();
    let mut fp_free: Vec<Reg> = fp_pool.to_vec();

    for interval in worklist {
        let is_float = metrics.variable_type(&interval.var_name).uses_fp_register();
        let (active, free) = if is_float {
            (&mut fp_active, &mut fp_free)
        } else {
            (&mut gp_active, &mut gp_free)
        };

        // Expire intervals that ended before this one starts.
        let start = interval.start_point;
        active.retain(|(old, reg)| {
            if old.end_point < start {
                free.push(*reg);
                false
            } else {
                true
            }
        });
        free.sort(); // keep the pool order deterministic after returns

        if let Some(reg) = pop_first(free) {
            active.push((interval.clone(), reg));
            allocation.insert(
                interval.var_name.clone(),
                AllocatedInterval::in_register(interval.clone(), reg),
            );
            continue;
        }

        // Pool exhausted: spill whichever of the candidates ends last.
        let (victim_index, _) = active
            .iter()
            .enumerate()
            .max_by_key(|(_, (i, _))| i.end_point)
            .expect("active set non-empty when the pool is exhausted");
        let victim_ends_later = active[victim_index].0.end_point > interval.end_point;

        if victim_ends_later {
            let (victim, reg) = active.remove(victim_index);
            log::trace!(
                "spilling {} (ends {}) for {} (ends {})",
                victim.var_name,
                victim.end_point,
                interval.var_name,
                interval.end_point
            );
            allocation.insert(victim.var_name.clone(), AllocatedInterval::spilled(victim));
            active.push((interval.clone(), reg));
            allocation.insert(
                interval.var_name.clone(),
                AllocatedInterval::in_register(interval.clone(), reg),
            );
        } else {
            allocation.insert(
                interval.var_name.clone(),
                AllocatedInterval::spilled(interval.clone()),
            );
        }
    }

    allocation
}

fn pop_first(pool: &mut Vec<Reg>) -> Option<Reg> {
    if pool.is_empty() {
        None
    } else {
        Some(pool.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::{FP_VARIABLE_REGS, VARIABLE_REGS};
    use bcpl_ast::VarType;

    fn metrics_with(params: &[&str], floats: &[&str]) -> FunctionMetrics {
        let mut metrics = FunctionMetrics::default();
        for (i, p) in params.iter().enumerate() {
            metrics.parameter_indices.insert(p.to_string(), i);
            metrics
                .variable_types
                .insert(p.to_string(), VarType::INTEGER);
        }
        for f in floats {
            metrics.variable_types.insert(f.to_string(), VarType::FLOAT);
        }
        metrics
    }

    fn interval(name: &str, start: u32, end: u32) -> LiveInterval {
        LiveInterval::new(name, start, end)
    }

    #[test]
    fn test_parameters_primed_to_argument_registers() {
        let metrics = metrics_with(&["a", "b"], &[]);
        let intervals = vec![interval("a", 0, 5), interval("b", 0, 3)];
        let allocation = allocate(&intervals, &metrics, &VARIABLE_REGS, &FP_VARIABLE_REGS);
        assert_eq!(allocation["a"].assigned_register, Some(Reg::X(0)));
        assert_eq!(allocation["b"].assigned_register, Some(Reg::X(1)));
    }

    #[test]
    fn test_disjoint_intervals_share_a_register() {
        let metrics = metrics_with(&[], &[]);
        let pool = [Reg::X(20)];
        let intervals = vec![interval("x", 0, 2), interval("y", 3, 5)];
        let allocation = allocate(&intervals, &metrics, &pool, &FP_VARIABLE_REGS);
        assert_eq!(allocation["x"].assigned_register, Some(Reg::X(20)));
        assert_eq!(allocation["y"].assigned_register, Some(Reg::X(20)));
    }

    #[test]
    fn test_farthest_end_spills() {
        let metrics = metrics_with(&[], &[]);
        let pool = [Reg::X(20)];
        // `long` is active and ends last, so the new short interval takes
        // its register.
        let intervals = vec![interval("long", 0, 100), interval("short", 1, 2)];
        let allocation = allocate(&intervals, &metrics, &pool, &FP_VARIABLE_REGS);
        assert!(allocation["long"].is_spilled);
        assert_eq!(allocation["short"].assigned_register, Some(Reg::X(20)));
    }

    #[test]
    fn test_current_spills_when_it_ends_last() {
        let metrics = metrics_with(&[], &[]);
        let pool = [Reg::X(20)];
        let intervals = vec![interval("short", 0, 2), interval("long", 1, 100)];
        let allocation = allocate(&intervals, &metrics, &pool, &FP_VARIABLE_REGS);
        assert_eq!(allocation["short"].assigned_register, Some(Reg::X(20)));
        assert!(allocation["long"].is_spilled);
    }

    #[test]
    fn test_float_variables_use_fp_pool() {
        let metrics = metrics_with(&[], &["f"]);
        let intervals = vec![interval("f", 0, 4), interval("i", 0, 4)];
        let allocation = allocate(&intervals, &metrics, &VARIABLE_REGS, &FP_VARIABLE_REGS);
        assert!(allocation["f"].assigned_register.unwrap().is_fp());
        assert!(!allocation["i"].assigned_register.unwrap().is_fp());
    }

    #[test]
    fn test_pool_capacity_never_exceeded() {
        let metrics = metrics_with(&[], &[]);
        let pool = [Reg::X(20), Reg::X(21)];
        let intervals: Vec<LiveInterval> = (0..6)
            .map(|i| interval(&format!("v{}", i), 0, 10))
            .collect();
        let allocation = allocate(&intervals, &metrics, &pool, &FP_VARIABLE_REGS);
        let in_regs = allocation
            .values()
            .filter(|a| a.assigned_register.is_some())
            .count();
        assert_eq!(in_regs, 2);
        let spilled = allocation.values().filter(|a| a.is_spilled).count();
        assert_eq!(spilled, 4);
    }

    #[test]
    fn test_ninth_parameter_spilled_by_construction() {
        let params: Vec<String> = (0..9).map(|i| format!("p{}", i)).collect();
        let param_refs: Vec<&str> = params.iter().map(|s| s.as_str()).collect();
        let metrics = metrics_with(&param_refs, &[]);
        let intervals: Vec<LiveInterval> =
            params.iter().map(|p| interval(p, 0, 4)).collect();
        let allocation = allocate(&intervals, &metrics, &VARIABLE_REGS, &FP_VARIABLE_REGS);
        assert!(allocation["p8"].is_spilled);
        assert_eq!(allocation["p0"].assigned_register, Some(Reg::X(0)));
    }
}
