//! Mach-O-compatible assembly output.
//!
//! Code is written from the instruction stream; rodata and data come from
//! the data generator so the sections read as `.quad`/`.long` directives
//! rather than raw words. Local labels gain an `L_` prefix, the entry point
//! becomes `_start`, runtime references become `_NAME` externs, and
//! JIT-attributed MOVZ/MOVK absolute-address sequences are re-emitted as
//! the equivalent ADRP/ADD pair so one stream serves both outputs.

use crate::data::{DataGenerator, DATA_SEGMENT_BASE_LABEL};
use crate::instr::{Instruction, JitAttr, Opcode, Relocation, Segment};
use bcpl_runtime::RuntimeRegistry;
use std::collections::BTreeSet;
use std::fmt::Write;

/// The BCPL entry-point routine.
pub const ENTRY_POINT: &str = "START";

pub struct AssemblyWriter<'a> {
    runtime: &'a RuntimeRegistry,
}

impl<'a> AssemblyWriter<'a> {
    pub fn new(runtime: &'a RuntimeRegistry) -> Self {
        AssemblyWriter { runtime }
    }

    /// Render the whole module.
    pub fn write(&self, instructions: &[Instruction], data: &DataGenerator) -> String {
        let mut out = String::new();
        let referenced_runtime = self.referenced_runtime(instructions);

        writeln!(out, ".section __TEXT,__text,regular,pure_instructions").unwrap();
        writeln!(out, ".globl _start").unwrap();
        writeln!(out, ".globl _START").unwrap();
        for name in &referenced_runtime {
            writeln!(out, ".globl _{}", name).unwrap();
        }
        writeln!(out, ".p2align 2").unwrap();

        let code: Vec<&Instruction> = instructions
            .iter()
            .filter(|i| i.segment == Segment::Code)
            .collect();
        let mut index = 0;
        while index < code.len() {
            let instr = code[index];
            if instr.is_label_definition {
                let name = instr.target_label.as_deref().unwrap_or("");
                if name == ENTRY_POINT {
                    writeln!(out, "_start:").unwrap();
                    writeln!(out, "_START:").unwrap();
                } else {
                    writeln!(out, "{}:", self.rename_label(name)).unwrap();
                }
                index += 1;
                continue;
            }

            // A JitAddress MOVZ/MOVK run becomes one ADRP/ADD pair.
            if instr.jit_attr == JitAttr::JitAddress && instr.opcode == Opcode::Movz {
                let run_len = code[index..]
                    .iter()
                    .take_while(|i| i.jit_attr == JitAttr::JitAddress)
                    .count();
                let label = instr.target_label.as_deref().unwrap_or("");
                let dest = instr
                    .dest
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "x0".to_string());
                let renamed = self.rename_label(label);
                writeln!(out, "    adrp {}, {}@PAGE", dest, renamed).unwrap();
                writeln!(out, "    add {}, {}, {}@PAGEOFF", dest, dest, renamed).unwrap();
                index += run_len;
                continue;
            }

            writeln!(out, "    {}", self.render_code_line(instr)).unwrap();
            index += 1;
        }

        self.write_rodata(&mut out, data);
        self.write_data(&mut out, data);
        out
    }

    /// Runtime functions actually referenced by the stream, name-sorted.
    fn referenced_runtime(&self, instructions: &[Instruction]) -> BTreeSet<String> {
        instructions
            .iter()
            .filter(|i| !i.is_label_definition)
            .filter_map(|i| i.target_label.as_deref())
            .filter(|label| self.runtime.is_registered(label))
            .map(|label| label.to_string())
            .collect()
    }

    fn rename_label(&self, name: &str) -> String {
        if self.runtime.is_registered(name) {
            format!("_{}", name)
        } else if name == ENTRY_POINT {
            "_start".to_string()
        } else if name.starts_with("L_") || name.starts_with('_') {
            name.to_string()
        } else {
            format!("L_{}", name)
        }
    }

    fn render_code_line(&self, instr: &Instruction) -> String {
        let Some(label) = instr.target_label.as_deref() else {
            return instr.assembly.clone();
        };
        let renamed = self.rename_label(label);
        match instr.relocation {
            Relocation::Page21 => {
                // "adrp xN, label" -> "adrp xN, label@PAGE"
                let prefix = instr.assembly.rsplit_once(' ').map(|(p, _)| p).unwrap_or("adrp");
                format!("{} {}@PAGE", prefix, renamed)
            }
            Relocation::AddLo12 => {
                let dest = instr
                    .dest
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "x0".to_string());
                format!("add {}, {}, {}@PAGEOFF", dest, dest, renamed)
            }
            Relocation::PcRel26 | Relocation::PcRel19 => {
                let mnemonic = instr
                    .assembly
                    .split_whitespace()
                    .next()
                    .unwrap_or("b");
                match instr.opcode {
                    Opcode::Cbz | Opcode::Cbnz => {
                        let reg = instr
                            .src1
                            .map(|r| r.to_string())
                            .unwrap_or_else(|| "x0".to_string());
                        format!("{} {}, {}", mnemonic, reg, renamed)
                    }
                    _ => format!("{} {}", mnemonic, renamed),
                }
            }
            _ => instr.assembly.clone(),
        }
    }

    fn write_rodata(&self, out: &mut String, data: &DataGenerator) {
        writeln!(out).unwrap();
        writeln!(out, ".section __TEXT,__const").unwrap();

        for (label, chars) in data_strings(data) {
            writeln!(out, ".p2align 4").unwrap();
            writeln!(out, "{}:", label).unwrap();
            writeln!(out, "    .quad {}", chars.len()).unwrap();
            for c in &chars {
                writeln!(out, "    .long {:#x}", c).unwrap();
            }
            writeln!(out, "    .long 0, 0, 0, 0").unwrap();
        }

        for (label, value) in data_floats(data) {
            writeln!(out, ".p2align 3").unwrap();
            writeln!(out, "{}:", label).unwrap();
            writeln!(out, "    .quad {:#018x} // {}", value.to_bits(), value).unwrap();
        }

        // Tables and list-literal templates render generically from the
        // stream: labels, address slots as symbolic .quad, raw words as
        // .long pairs.
        self.write_generic_rodata(out, data);
    }

    fn write_generic_rodata(&self, out: &mut String, data: &DataGenerator) {
        let mut stream = crate::instr::InstructionStream::new();
        data.generate_rodata_section(&mut stream);
        let instrs = stream.instructions();

        let mut in_generic = false;
        let mut i = 0;
        while i < instrs.len() {
            let instr = &instrs[i];
            if instr.is_label_definition {
                let label = instr.target_label.as_deref().unwrap_or("");
                // Strings and floats were already rendered above.
                in_generic = !(label.starts_with("L_str") || label.starts_with("L_float"));
                if in_generic {
                    writeln!(out, ".p2align 3").unwrap();
                    writeln!(out, "{}:", label).unwrap();
                }
                i += 1;
                continue;
            }
            if !in_generic {
                i += 1;
                continue;
            }
            if instr.relocation == Relocation::AbsoluteLo32 {
                let label = instr.target_label.as_deref().unwrap_or("");
                writeln!(out, "    .quad {}", self.rename_label(label)).unwrap();
                i += 2; // skip the hi32 half
                continue;
            }
            writeln!(out, "    .long {:#x}", instr.encoding).unwrap();
            i += 1;
        }
    }

    fn write_data(&self, out: &mut String, data: &DataGenerator) {
        if data.global_count() == 0 {
            return;
        }
        writeln!(out).unwrap();
        writeln!(out, ".section __DATA,__data").unwrap();
        writeln!(out, ".p2align 3").unwrap();
        // The runtime function-pointer table is JIT-only and never appears
        // in assembly output.
        writeln!(out, "{}:", DATA_SEGMENT_BASE_LABEL).unwrap();
        for global in data.globals() {
            writeln!(out, "{}:", global.label).unwrap();
            writeln!(out, "    .quad {}", global.initial_value).unwrap();
        }
    }
}

// The data generator exposes its pools for stream emission; the writer
// wants the typed values, recovered here from the emitted stream layout.
fn data_strings(data: &DataGenerator) -> Vec<(String, Vec<u32>)> {
    let mut stream = crate::instr::InstructionStream::new();
    data.generate_rodata_section(&mut stream);
    let instrs = stream.instructions();
    let mut out = Vec::new();
    let mut i = 0;
    while i < instrs.len() {
        let instr = &instrs[i];
        if instr.is_label_definition {
            if let Some(label) = instr.target_label.as_deref() {
                if label.starts_with("L_str") {
                    // length (2 words) then the code points.
                    let len = instrs[i + 1].encoding as usize;
                    let chars: Vec<u32> = (0..len)
                        .map(|k| instrs[i + 3 + k].encoding)
                        .collect();
                    out.push((label.to_string(), chars));
                }
            }
        }
        i += 1;
    }
    out
}

fn data_floats(data: &DataGenerator) -> Vec<(String, f64)> {
    let mut stream = crate::instr::InstructionStream::new();
    data.generate_rodata_section(&mut stream);
    let instrs = stream.instructions();
    let mut out = Vec::new();
    let mut i = 0;
    while i < instrs.len() {
        let instr = &instrs[i];
        if instr.is_label_definition {
            if let Some(label) = instr.target_label.as_deref() {
                if label.starts_with("L_float") {
                    let lo = instrs[i + 1].encoding as u64;
                    let hi = instrs[i + 2].encoding as u64;
                    out.push((label.to_string(), f64::from_bits(lo | (hi << 32))));
                }
            }
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder;
    use crate::reg::Reg;

    fn writer_output(build: impl FnOnce(&mut Vec<Instruction>, &mut DataGenerator)) -> String {
        let runtime = bcpl_runtime::standard_registry();
        let mut instructions = Vec::new();
        let mut data = DataGenerator::new();
        build(&mut instructions, &mut data);
        AssemblyWriter::new(&runtime).write(&instructions, &data)
    }

    #[test]
    fn test_sections_and_entry_globl() {
        let asm = writer_output(|instrs, _| {
            instrs.push(Instruction::label("START", Segment::Code));
            instrs.push(encoder::ret());
        });
        assert!(asm.contains(".section __TEXT,__text,regular,pure_instructions"));
        assert!(asm.contains(".globl _start"));
        assert!(asm.contains(".globl _START"));
        assert!(asm.contains("_start:"));
    }

    #[test]
    fn test_runtime_reference_declared_and_renamed() {
        let asm = writer_output(|instrs, _| {
            instrs.push(Instruction::label("START", Segment::Code));
            instrs.push(encoder::bl("WRITES"));
            instrs.push(encoder::ret());
        });
        assert!(asm.contains(".globl _WRITES"));
        assert!(asm.contains("bl _WRITES"));
    }

    #[test]
    fn test_local_labels_gain_prefix() {
        let asm = writer_output(|instrs, _| {
            instrs.push(Instruction::label("F", Segment::Code));
            instrs.push(Instruction::label("F_BB_0", Segment::Code));
            instrs.push(encoder::b("F_BB_0"));
        });
        assert!(asm.contains("L_F_BB_0:"));
        assert!(asm.contains("b L_F_BB_0"));
    }

    #[test]
    fn test_jit_address_sequence_rewritten_to_adrp() {
        let asm = writer_output(|instrs, _| {
            instrs.push(Instruction::label("START", Segment::Code));
            instrs.extend(encoder::load_address_absolute(
                Reg::DATA_BASE,
                DATA_SEGMENT_BASE_LABEL,
            ));
            instrs.push(encoder::ret());
        });
        assert!(asm.contains("adrp x28, L__data_segment_base@PAGE"));
        assert!(asm.contains("add x28, x28, L__data_segment_base@PAGEOFF"));
        assert!(!asm.contains("movk x28"));
    }

    #[test]
    fn test_string_literal_rendering() {
        let asm = writer_output(|instrs, data| {
            instrs.push(Instruction::label("START", Segment::Code));
            instrs.push(encoder::ret());
            data.add_string_literal("hi");
        });
        assert!(asm.contains(".section __TEXT,__const"));
        assert!(asm.contains("L_str0:"));
        assert!(asm.contains(".quad 2"));
        assert!(asm.contains(".long 0x68"));
        assert!(asm.contains(".long 0, 0, 0, 0"));
    }

    #[test]
    fn test_globals_in_data_section() {
        let asm = writer_output(|instrs, data| {
            instrs.push(Instruction::label("START", Segment::Code));
            instrs.push(encoder::ret());
            data.add_global_variable("counter", 5);
            data.calculate_global_offsets();
        });
        assert!(asm.contains(".section __DATA,__data"));
        assert!(asm.contains("L_g_counter:"));
        assert!(asm.contains(".quad 5"));
    }

    #[test]
    fn test_adrp_add_page_suffixes() {
        let asm = writer_output(|instrs, data| {
            instrs.push(Instruction::label("START", Segment::Code));
            instrs.extend(encoder::load_address_adrp(Reg::X(0), "L_str0"));
            instrs.push(encoder::ret());
            data.add_string_literal("x");
        });
        assert!(asm.contains("adrp x0, L_str0@PAGE"));
        assert!(asm.contains("add x0, x0, L_str0@PAGEOFF"));
    }
}
