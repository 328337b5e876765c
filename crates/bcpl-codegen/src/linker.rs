//! Two-pass linker.
//!
//! Pass 1 walks the stream with one cursor per segment, assigning an
//! address to every instruction and binding every label. The rodata cursor
//! starts one 4 KiB page past `code_base + code_size + 16 KiB` of slack.
//! Pass 2 resolves every relocation's target — runtime labels through the
//! registry, everything else through the label manager — and patches the
//! encodings. Undefined labels and out-of-range PC-relative targets are
//! fatal.

use crate::instr::{Instruction, InstructionStream, Relocation, Segment};
use crate::labels::LabelManager;
use crate::{CodegenError, CodegenResult};
use bcpl_runtime::RuntimeRegistry;

/// Gap left between the end of code and the first rodata page.
pub const CODE_RODATA_GAP: u64 = 16 * 1024;

pub struct Linker;

impl Default for Linker {
    fn default() -> Self {
        Linker
    }
}

impl Linker {
    pub fn new() -> Self {
        Linker
    }

    /// Run both passes, returning the finalized instruction list.
    pub fn process(
        &self,
        stream: InstructionStream,
        labels: &mut LabelManager,
        runtime: &RuntimeRegistry,
        code_base: u64,
        data_base: u64,
    ) -> CodegenResult<Vec<Instruction>> {
        let mut instructions =
            self.assign_addresses(stream.into_instructions(), labels, code_base, data_base);
        self.perform_relocations(&mut instructions, labels, runtime)?;
        Ok(instructions)
    }

    /// Pass 1: cursor-per-segment address assignment and label binding.
    fn assign_addresses(
        &self,
        mut instructions: Vec<Instruction>,
        labels: &mut LabelManager,
        code_base: u64,
        data_base: u64,
    ) -> Vec<Instruction> {
        let code_size: u64 = instructions
            .iter()
            .filter(|i| i.segment == Segment::Code)
            .map(Instruction::byte_width)
            .sum();

        let mut code_cursor = code_base;
        let mut rodata_cursor = (code_base + code_size + CODE_RODATA_GAP + 0xFFF) & !0xFFF;
        let mut data_cursor = data_base;
        log::debug!(
            "linker pass 1: code {:#x}..{:#x}, rodata from {:#x}, data from {:#x}",
            code_base,
            code_base + code_size,
            rodata_cursor,
            data_cursor
        );

        for instr in &mut instructions {
            let cursor = match instr.segment {
                Segment::Code => &mut code_cursor,
                Segment::Rodata => &mut rodata_cursor,
                Segment::Data => &mut data_cursor,
            };
            if instr.is_label_definition {
                let name = instr
                    .target_label
                    .clone()
                    .expect("label definition carries its name");
                labels.define_label(&name, *cursor);
                instr.address = *cursor;
            } else {
                instr.address = *cursor;
                *cursor += 4;
            }
        }
        instructions
    }

    /// Pass 2: patch every relocated instruction.
    fn perform_relocations(
        &self,
        instructions: &mut [Instruction],
        labels: &LabelManager,
        runtime: &RuntimeRegistry,
    ) -> CodegenResult<()> {
        for instr in instructions.iter_mut() {
            if instr.relocation == Relocation::None || instr.is_label_definition {
                continue;
            }
            let label = instr.target_label.clone().ok_or_else(|| {
                CodegenError::Internal(format!(
                    "relocated instruction without a target: {}",
                    instr.assembly
                ))
            })?;

            // Runtime functions resolve via the registry; everything else
            // must be a bound label.
            let target = if runtime.is_registered(&label) {
                runtime.get(&label)?.address as u64
            } else {
                labels.address_of(&label)?
            };

            instr.encoding = match instr.relocation {
                Relocation::PcRel26 => {
                    patch_pc_rel26(instr.encoding, instr.address, target, &label)?
                }
                Relocation::PcRel19 => {
                    patch_pc_rel19(instr.encoding, instr.address, target, &label)?
                }
                Relocation::Page21 => patch_page21(instr.encoding, instr.address, target),
                Relocation::AddLo12 => patch_add_lo12(instr.encoding, target),
                Relocation::MovzMovk0 => patch_movz_movk(instr.encoding, target, 0),
                Relocation::MovzMovk16 => patch_movz_movk(instr.encoding, target, 16),
                Relocation::MovzMovk32 => patch_movz_movk(instr.encoding, target, 32),
                Relocation::MovzMovk48 => patch_movz_movk(instr.encoding, target, 48),
                Relocation::AbsoluteLo32 => target as u32,
                Relocation::AbsoluteHi32 => (target >> 32) as u32,
                Relocation::None => unreachable!(),
            };
        }
        Ok(())
    }
}

fn patch_pc_rel26(
    encoding: u32,
    address: u64,
    target: u64,
    label: &str,
) -> CodegenResult<u32> {
    let offset = target.wrapping_sub(address) as i64;
    if offset % 4 != 0 || !(-(1 << 27)..(1 << 27)).contains(&offset) {
        return Err(CodegenError::BranchOutOfRange {
            label: label.to_string(),
            offset,
        });
    }
    let imm26 = ((offset >> 2) as u32) & 0x03FF_FFFF;
    Ok((encoding & 0xFC00_0000) | imm26)
}

fn patch_pc_rel19(
    encoding: u32,
    address: u64,
    target: u64,
    label: &str,
) -> CodegenResult<u32> {
    let offset = target.wrapping_sub(address) as i64;
    if offset % 4 != 0 || !(-(1 << 20)..(1 << 20)).contains(&offset) {
        return Err(CodegenError::BranchOutOfRange {
            label: label.to_string(),
            offset,
        });
    }
    let imm19 = ((offset >> 2) as u32) & 0x7_FFFF;
    Ok((encoding & !(0x7_FFFF << 5)) | (imm19 << 5))
}

fn patch_page21(encoding: u32, address: u64, target: u64) -> u32 {
    let page_delta = ((target >> 12) as i64).wrapping_sub((address >> 12) as i64);
    let immlo = (page_delta as u32 & 0b11) << 29;
    let immhi = (((page_delta >> 2) as u32) & 0x7_FFFF) << 5;
    (encoding & 0x9F00_001F) | immlo | immhi
}

fn patch_add_lo12(encoding: u32, target: u64) -> u32 {
    let imm12 = (target & 0xFFF) as u32;
    (encoding & !(0xFFF << 10)) | (imm12 << 10)
}

fn patch_movz_movk(encoding: u32, target: u64, shift: u32) -> u32 {
    let slice = ((target >> shift) & 0xFFFF) as u32;
    (encoding & !(0xFFFF << 5)) | (slice << 5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder;
    use crate::reg::Reg;

    fn link(
        stream: InstructionStream,
        code_base: u64,
        data_base: u64,
    ) -> CodegenResult<(Vec<Instruction>, LabelManager)> {
        let mut labels = LabelManager::new();
        let runtime = bcpl_runtime::RuntimeRegistry::new();
        let linked = Linker::new().process(stream, &mut labels, &runtime, code_base, data_base)?;
        Ok((linked, labels))
    }

    #[test]
    fn test_pass1_addresses_are_sequential_per_segment() {
        let mut stream = InstructionStream::new();
        stream.define_label("start", Segment::Code);
        stream.push(encoder::nop());
        stream.push(encoder::ret());
        stream.add_data32(7, Segment::Rodata);
        stream.add_data64(9, Segment::Data);

        let (linked, labels) = link(stream, 0x10000, 0x200000).unwrap();
        assert_eq!(labels.address_of("start").unwrap(), 0x10000);
        assert_eq!(linked[1].address, 0x10000);
        assert_eq!(linked[2].address, 0x10004);
        // rodata starts a page past code end + 16K slack.
        assert_eq!(linked[3].address, (0x10008 + CODE_RODATA_GAP + 0xFFF) & !0xFFF);
        assert_eq!(linked[4].address, 0x200000);
    }

    #[test]
    fn test_branch_patching_forward_and_back() {
        let mut stream = InstructionStream::new();
        stream.push(encoder::b("fwd"));
        stream.push(encoder::nop());
        stream.define_label("fwd", Segment::Code);
        stream.push(encoder::b("back"));
        stream.define_label("back", Segment::Code);
        stream.push(encoder::ret());

        let (linked, _) = link(stream, 0x1000, 0x2000).unwrap();
        // b fwd: +8 bytes => imm26 = 2.
        assert_eq!(linked[0].encoding, 0x1400_0002);
        // b back: +4 bytes => imm26 = 1.
        assert_eq!(linked[3].encoding, 0x1400_0001);
    }

    #[test]
    fn test_conditional_branch_19bit() {
        let mut stream = InstructionStream::new();
        stream.push(encoder::b_cond(crate::reg::Cond::Eq, "target"));
        stream.push(encoder::nop());
        stream.define_label("target", Segment::Code);
        stream.push(encoder::ret());

        let (linked, _) = link(stream, 0, 0x10000).unwrap();
        // +8 bytes => imm19 = 2 at bit 5, cond eq.
        assert_eq!(linked[0].encoding, 0x5400_0000 | (2 << 5));
    }

    #[test]
    fn test_adrp_add_pair() {
        let mut stream = InstructionStream::new();
        stream.extend(encoder::load_address_adrp(Reg::X(0), "L_str0"));
        stream.push(encoder::ret());
        stream.pad_segment_to(Segment::Rodata, 16);
        stream.define_label("L_str0", Segment::Rodata);
        stream.add_data32(1, Segment::Rodata);

        let (linked, labels) = link(stream, 0x1000, 0x80000).unwrap();
        let target = labels.address_of("L_str0").unwrap();
        // The ADD low 12 bits match the target.
        let add = &linked[1];
        assert_eq!((add.encoding >> 10) & 0xFFF, (target & 0xFFF) as u32);
        // The ADRP page delta reconstructs the target page.
        let adrp = &linked[0];
        let immlo = (adrp.encoding >> 29) & 0b11;
        let immhi = (adrp.encoding >> 5) & 0x7_FFFF;
        let delta = ((immhi << 2) | immlo) as i64;
        assert_eq!(
            (0x1000u64 >> 12).wrapping_add(delta as u64) << 12,
            target & !0xFFF
        );
    }

    #[test]
    fn test_movz_movk_absolute_sequence() {
        let mut stream = InstructionStream::new();
        stream.extend(encoder::load_address_absolute(Reg::X(28), "L_base"));
        stream.push(encoder::ret());
        stream.define_label("L_base", Segment::Data);
        stream.add_data64(0, Segment::Data);

        let data_base = 0x1234_5678_9ABC_0000u64;
        let (linked, _) = link(stream, 0, data_base).unwrap();
        let slice = |i: usize| (linked[i].encoding >> 5) & 0xFFFF;
        assert_eq!(slice(0) as u64, data_base & 0xFFFF);
        assert_eq!(slice(1) as u64, (data_base >> 16) & 0xFFFF);
        assert_eq!(slice(2) as u64, (data_base >> 32) & 0xFFFF);
        assert_eq!(slice(3) as u64, (data_base >> 48) & 0xFFFF);
    }

    #[test]
    fn test_absolute_data_words() {
        let mut stream = InstructionStream::new();
        stream.push(encoder::ret());
        stream.define_label("L_target", Segment::Rodata);
        stream.add_data32(0xAA, Segment::Rodata);
        stream.add_address_slot("L_target", Segment::Rodata);

        let (linked, labels) = link(stream, 0, 0x10000).unwrap();
        let target = labels.address_of("L_target").unwrap();
        let lo = linked.iter().find(|i| i.relocation == Relocation::AbsoluteLo32).unwrap();
        let hi = linked.iter().find(|i| i.relocation == Relocation::AbsoluteHi32).unwrap();
        assert_eq!(lo.encoding as u64, target & 0xFFFF_FFFF);
        assert_eq!(hi.encoding as u64, target >> 32);
    }

    #[test]
    fn test_undefined_label_is_fatal() {
        let mut stream = InstructionStream::new();
        stream.push(encoder::b("nowhere"));
        let result = link(stream, 0, 0x1000);
        assert!(matches!(result, Err(CodegenError::UndefinedLabel(_))));
    }

    #[test]
    fn test_runtime_label_resolves_through_registry() {
        let mut stream = InstructionStream::new();
        stream.push(encoder::bl("NEARBY"));

        let mut labels = LabelManager::new();
        let mut runtime = bcpl_runtime::RuntimeRegistry::new();
        runtime
            .register("NEARBY", 0, 0x2000, bcpl_ast::FunctionType::Standard)
            .unwrap();
        let linked = Linker::new()
            .process(stream, &mut labels, &runtime, 0x1000, 0x10000)
            .unwrap();
        // bl from 0x1000 to 0x2000: imm26 = 0x1000 >> 2.
        assert_eq!(linked[0].encoding, 0x9400_0000 | (0x1000 >> 2));
    }

    #[test]
    fn test_branch_out_of_range_is_fatal() {
        let mut stream = InstructionStream::new();
        stream.push(encoder::bl("FAR"));

        let mut labels = LabelManager::new();
        let mut runtime = bcpl_runtime::RuntimeRegistry::new();
        runtime
            .register("FAR", 0, 0x2000_0000_0000, bcpl_ast::FunctionType::Standard)
            .unwrap();
        let result = Linker::new().process(stream, &mut labels, &runtime, 0, 0x1000);
        assert!(matches!(
            result,
            Err(CodegenError::BranchOutOfRange { .. })
        ));
    }

    #[test]
    fn test_deterministic_addresses() {
        let build = || {
            let mut stream = InstructionStream::new();
            stream.define_label("f", Segment::Code);
            stream.push(encoder::nop());
            stream.push(encoder::ret());
            stream.add_data32(1, Segment::Rodata);
            stream
        };
        let (a, _) = link(build(), 0x4000, 0x9000).unwrap();
        let (b, _) = link(build(), 0x4000, 0x9000).unwrap();
        let addrs_a: Vec<u64> = a.iter().map(|i| i.address).collect();
        let addrs_b: Vec<u64> = b.iter().map(|i| i.address).collect();
        assert_eq!(addrs_a, addrs_b);
    }
}
