//! Peephole optimization over the encoded instruction stream.
//!
//! Each pattern owns a fixed window size, a matcher over the semantic
//! fields of the instructions, and a transformer producing the replacement.
//! Patterns run in order at every position, repeating whole passes until
//! the stream is stable or the pass cap is hit. A window containing a label
//! definition is never rewritten, so every label binding that existed
//! before the pass still exists after it.

use crate::instr::{Instruction, Opcode, Relocation};
use crate::reg::Cond;
use rustc_hash::FxHashMap;

/// Upper bound on full passes over the stream.
pub const MAX_PASSES: usize = 20;

type Matcher = fn(&[Instruction], usize) -> bool;
type Transformer = fn(&[Instruction], usize) -> Vec<Instruction>;

pub struct InstructionPattern {
    pub description: &'static str,
    pub window: usize,
    matcher: Matcher,
    transformer: Transformer,
}

impl InstructionPattern {
    fn new(
        description: &'static str,
        window: usize,
        matcher: Matcher,
        transformer: Transformer,
    ) -> Self {
        InstructionPattern {
            description,
            window,
            matcher,
            transformer,
        }
    }

    pub fn matches(&self, instructions: &[Instruction], position: usize) -> bool {
        position + self.window <= instructions.len() && (self.matcher)(instructions, position)
    }

    pub fn transform(&self, instructions: &[Instruction], position: usize) -> Vec<Instruction> {
        (self.transformer)(instructions, position)
    }
}

#[derive(Debug, Default)]
pub struct PeepholeStats {
    pub passes: usize,
    pub rewrites: usize,
    pub pattern_matches: FxHashMap<&'static str, usize>,
}

pub struct PeepholeOptimizer {
    patterns: Vec<InstructionPattern>,
    pub stats: PeepholeStats,
}

impl Default for PeepholeOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl PeepholeOptimizer {
    pub fn new() -> Self {
        let patterns = vec![
            redundant_move_pattern(),
            load_after_store_pattern(),
            dead_store_pattern(),
            redundant_load_pattern(),
            redundant_compare_pattern(),
            constant_fold_pattern(),
            identity_operation_pattern(),
            multiply_strength_pattern(),
            divide_strength_pattern(),
            branch_chain_pattern(),
            compare_zero_branch_pattern(),
        ];
        PeepholeOptimizer {
            patterns,
            stats: PeepholeStats::default(),
        }
    }

    /// Run until stable or the pass cap.
    pub fn optimize(&mut self, instructions: &mut Vec<Instruction>) {
        for pass in 0..MAX_PASSES {
            self.stats.passes = pass + 1;
            if !self.run_pass(instructions) {
                break;
            }
        }
        log::debug!(
            "peephole: {} rewrites in {} passes",
            self.stats.rewrites,
            self.stats.passes
        );
    }

    fn run_pass(&mut self, instructions: &mut Vec<Instruction>) -> bool {
        let mut changed = false;
        let mut position = 0;
        while position < instructions.len() {
            let mut applied = false;
            for pattern in &self.patterns {
                if !pattern.matches(instructions, position) {
                    continue;
                }
                if window_has_label(instructions, position, pattern.window) {
                    continue;
                }
                let replacement = pattern.transform(instructions, position);
                if same_sequence(&instructions[position..position + pattern.window], &replacement)
                {
                    continue;
                }
                instructions.splice(position..position + pattern.window, replacement);
                *self
                    .stats
                    .pattern_matches
                    .entry(pattern.description)
                    .or_insert(0) += 1;
                self.stats.rewrites += 1;
                changed = true;
                applied = true;
                break;
            }
            if !applied {
                position += 1;
            }
        }
        changed
    }
}

fn window_has_label(instructions: &[Instruction], position: usize, window: usize) -> bool {
    instructions[position..position + window]
        .iter()
        .any(|i| i.is_label_definition)
}

fn same_sequence(a: &[Instruction], b: &[Instruction]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.encoding == y.encoding && x.opcode == y.opcode && x.target_label == y.target_label
        })
}

fn is_relocated(instr: &Instruction) -> bool {
    instr.relocation != Relocation::None
}

// --- Patterns ---

/// `mov Rd1, Rn ; mov Rd2, Rd1` collapses to `mov Rd2, Rn`; the
/// intermediate register is a consumed temporary in generated code.
fn redundant_move_pattern() -> InstructionPattern {
    InstructionPattern::new(
        "redundant move chain",
        2,
        |instrs, pos| {
            let (a, b) = (&instrs[pos], &instrs[pos + 1]);
            a.opcode == Opcode::MovReg
                && b.opcode == Opcode::MovReg
                && a.dest.is_some()
                && a.dest == b.src1
                && a.dest != b.dest
                && a.src1 != a.dest
        },
        |instrs, pos| {
            let (a, b) = (&instrs[pos], &instrs[pos + 1]);
            vec![crate::encoder::mov_reg(b.dest.unwrap(), a.src1.unwrap())]
        },
    )
}

/// A load straight after a store to the same memory becomes a register
/// move. The store is kept; the loaded register is assumed live.
fn load_after_store_pattern() -> InstructionPattern {
    InstructionPattern::new(
        "load after store",
        2,
        |instrs, pos| {
            let (a, b) = (&instrs[pos], &instrs[pos + 1]);
            a.opcode == Opcode::Str
                && b.opcode == Opcode::Ldr
                && a.mem.is_some()
                && a.mem == b.mem
                && a.src1.is_some()
                && b.dest.is_some()
        },
        |instrs, pos| {
            let (a, b) = (&instrs[pos], &instrs[pos + 1]);
            let mut out = vec![a.clone()];
            let src = a.src1.unwrap();
            let dst = b.dest.unwrap();
            if src != dst {
                out.push(crate::encoder::mov_reg(dst, src));
            }
            out
        },
    )
}

/// Two stores to identical memory with nothing in between: the first is
/// dead.
fn dead_store_pattern() -> InstructionPattern {
    InstructionPattern::new(
        "dead store",
        2,
        |instrs, pos| {
            let (a, b) = (&instrs[pos], &instrs[pos + 1]);
            a.opcode == Opcode::Str && b.opcode == Opcode::Str && a.mem.is_some() && a.mem == b.mem
        },
        |instrs, pos| vec![instrs[pos + 1].clone()],
    )
}

/// Two identical loads in sequence.
fn redundant_load_pattern() -> InstructionPattern {
    InstructionPattern::new(
        "redundant load",
        2,
        |instrs, pos| {
            let (a, b) = (&instrs[pos], &instrs[pos + 1]);
            matches!(a.opcode, Opcode::Ldr | Opcode::LdrFp)
                && a.opcode == b.opcode
                && a.mem.is_some()
                && a.mem == b.mem
                && a.dest == b.dest
        },
        |instrs, pos| vec![instrs[pos].clone()],
    )
}

/// The same compare twice in a row.
fn redundant_compare_pattern() -> InstructionPattern {
    InstructionPattern::new(
        "redundant compare",
        2,
        |instrs, pos| {
            let (a, b) = (&instrs[pos], &instrs[pos + 1]);
            matches!(a.opcode, Opcode::CmpReg | Opcode::CmpImm)
                && a.opcode == b.opcode
                && a.src1 == b.src1
                && a.src2 == b.src2
                && a.imm == b.imm
        },
        |instrs, pos| vec![instrs[pos].clone()],
    )
}

/// `movz Rd, #a ; add Rd, Rd, #b` folds to `movz Rd, #(a+b)` while the sum
/// still fits 16 bits.
fn constant_fold_pattern() -> InstructionPattern {
    InstructionPattern::new(
        "movz/add constant fold",
        2,
        |instrs, pos| {
            let (a, b) = (&instrs[pos], &instrs[pos + 1]);
            a.opcode == Opcode::Movz
                && !is_relocated(a)
                && b.opcode == Opcode::AddImm
                && !is_relocated(b)
                && a.dest.is_some()
                && a.dest == b.dest
                && b.src1 == a.dest
                && a.imm.unwrap_or(0) + b.imm.unwrap_or(0) <= 0xFFFF
                // Only a plain low-half movz can absorb the addition.
                && (a.encoding >> 21) & 0b11 == 0
        },
        |instrs, pos| {
            let (a, b) = (&instrs[pos], &instrs[pos + 1]);
            let sum = (a.imm.unwrap_or(0) + b.imm.unwrap_or(0)) as u16;
            vec![crate::encoder::movz(a.dest.unwrap(), sum, 0)]
        },
    )
}

/// `add/sub Rd, Rn, #0` becomes a plain move (or disappears entirely when
/// the destination already holds the value).
fn identity_operation_pattern() -> InstructionPattern {
    InstructionPattern::new(
        "identity operation",
        1,
        |instrs, pos| {
            let a = &instrs[pos];
            matches!(a.opcode, Opcode::AddImm | Opcode::SubImm)
                && !is_relocated(a)
                && a.imm == Some(0)
                && a.dest.is_some()
                && a.src1.is_some()
                // sp adjustments keep their exact shape
                && a.dest != Some(crate::reg::Reg::Sp)
                && a.src1 != Some(crate::reg::Reg::Sp)
        },
        |instrs, pos| {
            let a = &instrs[pos];
            let (dest, src) = (a.dest.unwrap(), a.src1.unwrap());
            if dest == src {
                vec![]
            } else {
                vec![crate::encoder::mov_reg(dest, src)]
            }
        },
    )
}

/// `movz Rt, #2^k ; mul Rd, Rn, Rt` — multiply by two becomes an ADD of the
/// operand with itself, larger powers a left shift.
fn multiply_strength_pattern() -> InstructionPattern {
    InstructionPattern::new(
        "multiply by power of two",
        2,
        |instrs, pos| {
            let (a, b) = (&instrs[pos], &instrs[pos + 1]);
            a.opcode == Opcode::Movz
                && !is_relocated(a)
                && b.opcode == Opcode::Mul
                && a.dest == b.src2
                && a.imm.map(|v| v > 1 && (v as u64).is_power_of_two()).unwrap_or(false)
        },
        |instrs, pos| {
            let (a, b) = (&instrs[pos], &instrs[pos + 1]);
            let value = a.imm.unwrap();
            let dest = b.dest.unwrap();
            let operand = b.src1.unwrap();
            if value == 2 {
                vec![crate::encoder::add_reg(dest, operand, operand)]
            } else {
                vec![crate::encoder::lsl_imm(
                    dest,
                    operand,
                    value.trailing_zeros() as u8,
                )]
            }
        },
    )
}

/// `movz Rt, #2^k ; sdiv Rd, Rn, Rt` becomes an arithmetic shift right.
fn divide_strength_pattern() -> InstructionPattern {
    InstructionPattern::new(
        "divide by power of two",
        2,
        |instrs, pos| {
            let (a, b) = (&instrs[pos], &instrs[pos + 1]);
            a.opcode == Opcode::Movz
                && !is_relocated(a)
                && b.opcode == Opcode::Div
                && a.dest == b.src2
                && a.imm.map(|v| v > 1 && (v as u64).is_power_of_two()).unwrap_or(false)
        },
        |instrs, pos| {
            let (a, b) = (&instrs[pos], &instrs[pos + 1]);
            vec![crate::encoder::asr_imm(
                b.dest.unwrap(),
                b.src1.unwrap(),
                a.imm.unwrap().trailing_zeros() as u8,
            )]
        },
    )
}

/// `b L1` where `L1:` is immediately followed by `b L2` rewrites to
/// `b L2`.
fn branch_chain_pattern() -> InstructionPattern {
    InstructionPattern::new(
        "branch chaining",
        1,
        |instrs, pos| branch_chain_target(instrs, pos).is_some(),
        |instrs, pos| {
            let target = branch_chain_target(instrs, pos).unwrap();
            vec![crate::encoder::b(&target)]
        },
    )
}

fn branch_chain_target(instrs: &[Instruction], pos: usize) -> Option<String> {
    let branch = &instrs[pos];
    if branch.opcode != Opcode::B {
        return None;
    }
    let label = branch.target_label.as_deref()?;
    // Find the label's definition and the first real instruction after it.
    let def = instrs
        .iter()
        .position(|i| i.is_label_definition && i.target_label.as_deref() == Some(label))?;
    let next = instrs[def + 1..].iter().find(|i| !i.is_label_definition)?;
    if next.opcode == Opcode::B {
        let chained = next.target_label.clone()?;
        if chained != label {
            return Some(chained);
        }
    }
    None
}

/// `csetm Rd, cond ; cmp Rd, #0 ; b.ne L` fuses to `b.cond L` (and `b.eq`
/// to the inverted condition).
fn compare_zero_branch_pattern() -> InstructionPattern {
    InstructionPattern::new(
        "compare-zero branch with cset",
        3,
        |instrs, pos| {
            let (a, b, c) = (&instrs[pos], &instrs[pos + 1], &instrs[pos + 2]);
            matches!(a.opcode, Opcode::Cset | Opcode::Csetm)
                && b.opcode == Opcode::CmpImm
                && b.imm == Some(0)
                && b.src1 == a.dest
                && c.opcode == Opcode::Bcond
                && matches!(c.cond, Some(Cond::Eq) | Some(Cond::Ne))
        },
        |instrs, pos| {
            let (a, c) = (&instrs[pos], &instrs[pos + 2]);
            let set_cond = a.cond.unwrap();
            let branch_cond = match c.cond.unwrap() {
                Cond::Ne => set_cond,
                _ => set_cond.invert(),
            };
            let label = c.target_label.clone().unwrap();
            // The flag value may still be read through the register; keep
            // the set and replace only the compare-and-branch.
            vec![
                a.clone(),
                crate::encoder::b_cond(branch_cond, &label),
            ]
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder;
    use crate::instr::Segment;
    use crate::reg::Reg;

    fn optimize(mut instrs: Vec<Instruction>) -> (Vec<Instruction>, PeepholeStats) {
        let mut opt = PeepholeOptimizer::new();
        opt.optimize(&mut instrs);
        (instrs, opt.stats)
    }

    #[test]
    fn test_move_chain_collapses() {
        let instrs = vec![
            encoder::mov_reg(Reg::X(1), Reg::X(2)),
            encoder::mov_reg(Reg::X(3), Reg::X(1)),
        ];
        let (out, stats) = optimize(instrs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dest, Some(Reg::X(3)));
        assert_eq!(out[0].src1, Some(Reg::X(2)));
        assert!(stats.rewrites >= 1);
    }

    #[test]
    fn test_load_after_store_becomes_move() {
        let instrs = vec![
            encoder::str(Reg::X(1), Reg::Sp, 16).unwrap(),
            encoder::ldr(Reg::X(2), Reg::Sp, 16).unwrap(),
        ];
        let (out, _) = optimize(instrs);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].opcode, Opcode::Str);
        assert_eq!(out[1].opcode, Opcode::MovReg);
        assert_eq!(out[1].dest, Some(Reg::X(2)));
    }

    #[test]
    fn test_dead_store_dropped() {
        let instrs = vec![
            encoder::str(Reg::X(1), Reg::Sp, 8).unwrap(),
            encoder::str(Reg::X(2), Reg::Sp, 8).unwrap(),
        ];
        let (out, _) = optimize(instrs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].src1, Some(Reg::X(2)));
    }

    #[test]
    fn test_constant_fold() {
        let instrs = vec![
            encoder::movz(Reg::X(0), 40, 0),
            encoder::add_imm(Reg::X(0), Reg::X(0), 2).unwrap(),
        ];
        let (out, _) = optimize(instrs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].opcode, Opcode::Movz);
        assert_eq!(out[0].imm, Some(42));
    }

    #[test]
    fn test_multiply_by_two_becomes_add() {
        let instrs = vec![
            encoder::movz(Reg::X(9), 2, 0),
            encoder::mul(Reg::X(0), Reg::X(1), Reg::X(9)),
        ];
        let (out, _) = optimize(instrs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].opcode, Opcode::AddReg);
        assert_eq!(out[0].src1, Some(Reg::X(1)));
        assert_eq!(out[0].src2, Some(Reg::X(1)));
    }

    #[test]
    fn test_multiply_by_eight_becomes_shift() {
        let instrs = vec![
            encoder::movz(Reg::X(9), 8, 0),
            encoder::mul(Reg::X(0), Reg::X(1), Reg::X(9)),
        ];
        let (out, _) = optimize(instrs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].opcode, Opcode::Shift);
        assert!(out[0].assembly.starts_with("lsl"));
    }

    #[test]
    fn test_branch_chain_follows_to_final_target() {
        let instrs = vec![
            encoder::b("L1"),
            encoder::nop(),
            Instruction::label("L1", Segment::Code),
            encoder::b("L2"),
            Instruction::label("L2", Segment::Code),
            encoder::ret(),
        ];
        let (out, _) = optimize(instrs);
        assert_eq!(out[0].target_label.as_deref(), Some("L2"));
        // Label definitions are all retained.
        let labels: Vec<_> = out.iter().filter(|i| i.is_label_definition).collect();
        assert_eq!(labels.len(), 2);
    }

    #[test]
    fn test_compare_zero_branch_fuses() {
        let instrs = vec![
            encoder::csetm(Reg::X(0), Cond::Lt),
            encoder::cmp_imm(Reg::X(0), 0).unwrap(),
            encoder::b_cond(Cond::Eq, "L_exit"),
        ];
        let (out, _) = optimize(instrs);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].opcode, Opcode::Bcond);
        // b.eq on a false condition value branches when `lt` did NOT hold.
        assert_eq!(out[1].cond, Some(Cond::Ge));
        assert_eq!(out[1].target_label.as_deref(), Some("L_exit"));
    }

    #[test]
    fn test_windows_with_labels_are_skipped() {
        let instrs = vec![
            encoder::str(Reg::X(1), Reg::Sp, 8).unwrap(),
            Instruction::label("L_mid", Segment::Code),
            encoder::str(Reg::X(2), Reg::Sp, 8).unwrap(),
        ];
        let (out, _) = optimize(instrs);
        // The label splits the window: both stores survive.
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_stable_after_optimization() {
        // After one optimize() call, a second pass finds nothing.
        let instrs = vec![
            encoder::movz(Reg::X(9), 2, 0),
            encoder::mul(Reg::X(0), Reg::X(1), Reg::X(9)),
            encoder::str(Reg::X(0), Reg::Sp, 8).unwrap(),
        ];
        let (out, _) = optimize(instrs);
        let (out2, stats2) = optimize(out.clone());
        assert_eq!(out.len(), out2.len());
        assert_eq!(stats2.rewrites, 0);
    }

    #[test]
    fn test_identity_add_zero_removed() {
        let instrs = vec![encoder::add_imm(Reg::X(0), Reg::X(1), 0).unwrap()];
        let (out, _) = optimize(instrs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].opcode, Opcode::MovReg);
    }
}
