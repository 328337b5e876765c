//! Read-only and initialized data collection.
//!
//! String and float literals are pooled (unique per distinct value / bit
//! pattern), word tables and list-literal templates get labelled rodata
//! blocks, and global variables become 8-byte words in the data segment
//! behind `L__data_segment_base`. Emission order is insertion order, so the
//! layout is reproducible for identical input.

use crate::instr::{InstructionStream, Segment};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// Label of the first data-segment word; X28 points here at run time.
pub const DATA_SEGMENT_BASE_LABEL: &str = "L__data_segment_base";

#[derive(Debug, Clone)]
pub struct StringLiteralInfo {
    pub label: String,
    /// Code points, without the two NUL terminators.
    pub value: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct FloatLiteralInfo {
    pub label: String,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub label: String,
    pub values: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct FloatTableInfo {
    pub label: String,
    pub values: Vec<f64>,
}

/// One element of a list-literal template.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    Int(i64),
    Float(f64),
    /// Label of a pooled string literal; the node stores the base address.
    StringRef(String),
}

impl TemplateValue {
    fn type_tag(&self) -> i64 {
        match self {
            TemplateValue::Int(_) => bcpl_runtime::ATOM_INT,
            TemplateValue::Float(_) => bcpl_runtime::ATOM_FLOAT,
            TemplateValue::StringRef(_) => bcpl_runtime::ATOM_STRING,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListTemplateInfo {
    pub header_label: String,
    pub values: Vec<TemplateValue>,
}

#[derive(Debug, Clone)]
pub struct GlobalVariableInfo {
    pub name: String,
    pub label: String,
    pub initial_value: i64,
}

#[derive(Debug, Default)]
pub struct DataGenerator {
    strings: Vec<StringLiteralInfo>,
    string_map: FxHashMap<Vec<u32>, String>,
    next_string_id: usize,

    floats: Vec<FloatLiteralInfo>,
    float_map: FxHashMap<u64, String>,
    next_float_id: usize,

    tables: Vec<TableInfo>,
    float_tables: Vec<FloatTableInfo>,
    next_table_id: usize,

    list_templates: Vec<ListTemplateInfo>,
    list_map: FxHashMap<String, String>,
    next_list_id: usize,

    globals: Vec<GlobalVariableInfo>,
    global_offsets: BTreeMap<String, u64>,
}

impl DataGenerator {
    pub fn new() -> Self {
        DataGenerator::default()
    }

    /// Pool a string literal; one rodata entry per distinct value.
    pub fn add_string_literal(&mut self, value: &str) -> String {
        let chars: Vec<u32> = value.chars().map(|c| c as u32).collect();
        if let Some(label) = self.string_map.get(&chars) {
            return label.clone();
        }
        let label = format!("L_str{}", self.next_string_id);
        self.next_string_id += 1;
        self.string_map.insert(chars.clone(), label.clone());
        self.strings.push(StringLiteralInfo {
            label: label.clone(),
            value: chars,
        });
        label
    }

    /// Pool a float literal; one entry per distinct bit pattern.
    pub fn add_float_literal(&mut self, value: f64) -> String {
        let bits = value.to_bits();
        if let Some(label) = self.float_map.get(&bits) {
            return label.clone();
        }
        let label = format!("L_float{}", self.next_float_id);
        self.next_float_id += 1;
        self.float_map.insert(bits, label.clone());
        self.floats.push(FloatLiteralInfo {
            label: label.clone(),
            value,
        });
        label
    }

    pub fn add_table_literal(&mut self, values: Vec<i64>) -> String {
        let label = format!("L_table{}", self.next_table_id);
        self.next_table_id += 1;
        self.tables.push(TableInfo {
            label: label.clone(),
            values,
        });
        label
    }

    pub fn add_float_table_literal(&mut self, values: Vec<f64>) -> String {
        let label = format!("L_ftable{}", self.next_table_id);
        self.next_table_id += 1;
        self.float_tables.push(FloatTableInfo {
            label: label.clone(),
            values,
        });
        label
    }

    /// Pool a list-literal template, memoized on its shape.
    pub fn add_list_template(&mut self, values: Vec<TemplateValue>) -> String {
        let key = format!("{:?}", values);
        if let Some(label) = self.list_map.get(&key) {
            return label.clone();
        }
        let label = format!("L_list{}", self.next_list_id);
        self.next_list_id += 1;
        self.list_map.insert(key, label.clone());
        self.list_templates.push(ListTemplateInfo {
            header_label: label.clone(),
            values,
        });
        label
    }

    /// Register a global variable with its initial word.
    pub fn add_global_variable(&mut self, name: &str, initial_value: i64) {
        if self.globals.iter().any(|g| g.name == name) {
            return;
        }
        self.globals.push(GlobalVariableInfo {
            name: name.to_string(),
            label: format!("L_g_{}", name),
            initial_value,
        });
    }

    /// Fix the word offset of every global, in registration order.
    pub fn calculate_global_offsets(&mut self) {
        self.global_offsets = self
            .globals
            .iter()
            .enumerate()
            .map(|(i, g)| (g.name.clone(), i as u64))
            .collect();
    }

    pub fn is_global_variable(&self, name: &str) -> bool {
        self.global_offsets.contains_key(name)
    }

    pub fn global_word_offset(&self, name: &str) -> Option<u64> {
        self.global_offsets.get(name).copied()
    }

    pub fn global_count(&self) -> usize {
        self.globals.len()
    }

    pub fn globals(&self) -> &[GlobalVariableInfo] {
        &self.globals
    }

    /// Emit every pooled literal into the rodata segment.
    pub fn generate_rodata_section(&self, stream: &mut InstructionStream) {
        for info in &self.strings {
            // 16-byte alignment, label at the length word, two trailing NULs.
            stream.pad_segment_to(Segment::Rodata, 16);
            stream.push(crate::instr::Instruction::label(&info.label, Segment::Rodata));
            stream.add_data64(info.value.len() as u64, Segment::Rodata);
            for &c in &info.value {
                stream.add_data32(c, Segment::Rodata);
            }
            stream.add_data32(0, Segment::Rodata);
            stream.add_data32(0, Segment::Rodata);
        }

        for info in &self.floats {
            stream.pad_segment_to(Segment::Rodata, 8);
            stream.push(crate::instr::Instruction::label(&info.label, Segment::Rodata));
            stream.add_data64(info.value.to_bits(), Segment::Rodata);
        }

        for info in &self.tables {
            stream.pad_segment_to(Segment::Rodata, 8);
            stream.push(crate::instr::Instruction::label(&info.label, Segment::Rodata));
            for &value in &info.values {
                stream.add_data64(value as u64, Segment::Rodata);
            }
        }

        for info in &self.float_tables {
            stream.pad_segment_to(Segment::Rodata, 8);
            stream.push(crate::instr::Instruction::label(&info.label, Segment::Rodata));
            for &value in &info.values {
                stream.add_data64(value.to_bits(), Segment::Rodata);
            }
        }

        for info in &self.list_templates {
            self.emit_list_template(stream, info);
        }
    }

    /// Nodes first, then the header that points at them. Layout mirrors the
    /// runtime's ListAtom/ListHeader structs exactly.
    fn emit_list_template(&self, stream: &mut InstructionStream, info: &ListTemplateInfo) {
        stream.pad_segment_to(Segment::Rodata, 16);

        let node_label = |i: usize| format!("{}_node{}", info.header_label, i);
        for (i, value) in info.values.iter().enumerate() {
            stream.push(crate::instr::Instruction::label(
                node_label(i),
                Segment::Rodata,
            ));
            stream.add_data64(value.type_tag() as u64, Segment::Rodata);
            match value {
                TemplateValue::Int(v) => stream.add_data64(*v as u64, Segment::Rodata),
                TemplateValue::Float(v) => stream.add_data64(v.to_bits(), Segment::Rodata),
                TemplateValue::StringRef(label) => {
                    stream.add_address_slot(label, Segment::Rodata)
                }
            }
            if i + 1 < info.values.len() {
                stream.add_address_slot(&node_label(i + 1), Segment::Rodata);
            } else {
                stream.add_data64(0, Segment::Rodata);
            }
        }

        stream.push(crate::instr::Instruction::label(
            &info.header_label,
            Segment::Rodata,
        ));
        stream.add_data64(bcpl_runtime::ATOM_LIST as u64, Segment::Rodata);
        stream.add_data64(info.values.len() as u64, Segment::Rodata);
        if info.values.is_empty() {
            stream.add_data64(0, Segment::Rodata);
            stream.add_data64(0, Segment::Rodata);
        } else {
            stream.add_address_slot(&node_label(0), Segment::Rodata);
            stream.add_address_slot(&node_label(info.values.len() - 1), Segment::Rodata);
        }
    }

    /// Emit the data segment: the base label, then one word per global.
    pub fn generate_data_section(&self, stream: &mut InstructionStream) {
        stream.push(crate::instr::Instruction::label(
            DATA_SEGMENT_BASE_LABEL,
            Segment::Data,
        ));
        for info in &self.globals {
            stream.push(crate::instr::Instruction::label(&info.label, Segment::Data));
            stream.add_data64(info.initial_value as u64, Segment::Data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::Relocation;

    #[test]
    fn test_string_pooling_is_unique_per_value() {
        let mut data = DataGenerator::new();
        let a = data.add_string_literal("hi");
        let b = data.add_string_literal("hi");
        let c = data.add_string_literal("ho");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_float_pooling_by_bit_pattern() {
        let mut data = DataGenerator::new();
        let a = data.add_float_literal(1.5);
        let b = data.add_float_literal(1.5);
        let c = data.add_float_literal(-1.5);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_global_offsets_in_registration_order() {
        let mut data = DataGenerator::new();
        data.add_global_variable("counter", 0);
        data.add_global_variable("limit", 10);
        data.calculate_global_offsets();
        assert_eq!(data.global_word_offset("counter"), Some(0));
        assert_eq!(data.global_word_offset("limit"), Some(1));
        assert!(data.global_word_offset("missing").is_none());
    }

    #[test]
    fn test_rodata_string_layout() {
        let mut data = DataGenerator::new();
        data.add_string_literal("ab");
        let mut stream = InstructionStream::new();
        data.generate_rodata_section(&mut stream);

        let instrs = stream.instructions();
        // Label, 2 length words, 2 chars, 2 NULs.
        assert!(instrs[0].is_label_definition);
        assert_eq!(instrs[1].encoding, 2); // length low word
        assert_eq!(instrs[2].encoding, 0); // length high word
        assert_eq!(instrs[3].encoding, 'a' as u32);
        assert_eq!(instrs[4].encoding, 'b' as u32);
        assert_eq!(instrs[5].encoding, 0);
        assert_eq!(instrs[6].encoding, 0);
    }

    #[test]
    fn test_list_template_nodes_and_header() {
        let mut data = DataGenerator::new();
        let label = data.add_list_template(vec![
            TemplateValue::Int(1),
            TemplateValue::Int(2),
        ]);
        let mut stream = InstructionStream::new();
        data.generate_rodata_section(&mut stream);

        // The header label exists and its head slot is a relocation to the
        // first node.
        let instrs = stream.instructions();
        let header_pos = instrs
            .iter()
            .position(|i| i.is_label_definition && i.target_label.as_deref() == Some(&*label))
            .expect("header label missing");
        // tag (2 words), length (2 words), then the head address slot.
        let head_slot = &instrs[header_pos + 5];
        assert_eq!(head_slot.relocation, Relocation::AbsoluteLo32);
        assert_eq!(
            head_slot.target_label.as_deref(),
            Some(format!("{}_node0", label).as_str())
        );
    }

    #[test]
    fn test_template_memoization() {
        let mut data = DataGenerator::new();
        let a = data.add_list_template(vec![TemplateValue::Int(1)]);
        let b = data.add_list_template(vec![TemplateValue::Int(1)]);
        let c = data.add_list_template(vec![TemplateValue::Int(2)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_data_section_base_label_first() {
        let mut data = DataGenerator::new();
        data.add_global_variable("g", 7);
        let mut stream = InstructionStream::new();
        data.generate_data_section(&mut stream);
        let instrs = stream.instructions();
        assert_eq!(
            instrs[0].target_label.as_deref(),
            Some(DATA_SEGMENT_BASE_LABEL)
        );
        // g's initial value follows.
        assert_eq!(instrs[2].encoding, 7);
    }
}
