//! Runtime function registration.
//!
//! Each registered function gets a fixed 8-byte slot in the JIT
//! function-pointer table (X19-relative in generated code). Registration is
//! done once by the driver; the linker and code generator treat the
//! registry as read-only afterwards. Lookup is case-insensitive: names are
//! folded to upper case on the way in.

use bcpl_ast::FunctionType;
use std::collections::BTreeMap;
use thiserror::Error;

/// The table holds at most this many 8-byte entries.
pub const MAX_TABLE_ENTRIES: usize = 256;

/// Byte offset of the table from the data-segment base (X28).
pub const TABLE_BASE_OFFSET: usize = 524_288;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("runtime function '{0}' already registered")]
    Duplicate(String),

    #[error("runtime function table full ({MAX_TABLE_ENTRIES} entries)")]
    TableFull,

    #[error("runtime function '{0}' not found")]
    NotFound(String),
}

/// One registered runtime function.
#[derive(Debug, Clone)]
pub struct RuntimeFunction {
    pub name: String,
    pub num_args: usize,
    /// Absolute address of the implementation; written into the table slot
    /// before JIT execution.
    pub address: usize,
    pub fn_type: FunctionType,
    /// Byte offset of this function's slot within the table.
    pub table_offset: usize,
}

/// The process-global registration list, built once by the driver.
#[derive(Debug, Default)]
pub struct RuntimeRegistry {
    functions: BTreeMap<String, RuntimeFunction>,
    next_offset: usize,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        RuntimeRegistry::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        num_args: usize,
        address: usize,
        fn_type: FunctionType,
    ) -> Result<(), RegistryError> {
        let key = name.to_uppercase();
        if self.functions.contains_key(&key) {
            return Err(RegistryError::Duplicate(key));
        }
        if self.next_offset / 8 >= MAX_TABLE_ENTRIES {
            return Err(RegistryError::TableFull);
        }
        let table_offset = self.next_offset;
        self.next_offset += 8;
        self.functions.insert(
            key.clone(),
            RuntimeFunction {
                name: key,
                num_args,
                address,
                fn_type,
                table_offset,
            },
        );
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.functions.contains_key(&name.to_uppercase())
    }

    pub fn get(&self, name: &str) -> Result<&RuntimeFunction, RegistryError> {
        self.functions
            .get(&name.to_uppercase())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn table_offset(&self, name: &str) -> Result<usize, RegistryError> {
        self.get(name).map(|f| f.table_offset)
    }

    /// All functions in name order.
    pub fn iter(&self) -> impl Iterator<Item = &RuntimeFunction> {
        self.functions.values()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Write every function's absolute address into its slot of the JIT
    /// table.
    ///
    /// # Safety
    /// `table_base` must point at a writable region of at least
    /// `MAX_TABLE_ENTRIES * 8` bytes.
    pub unsafe fn populate_table(&self, table_base: *mut u8) {
        for func in self.functions.values() {
            let slot = table_base.add(func.table_offset) as *mut u64;
            slot.write(func.address as u64);
        }
        log::debug!("runtime table populated with {} entries", self.functions.len());
    }
}

/// The standard registration set, mirroring what the generated code can
/// name from source.
pub fn standard_registry() -> RuntimeRegistry {
    use crate::{heap, io, lists, strings};
    let mut registry = RuntimeRegistry::new();
    let mut add = |name: &str, args: usize, address: usize, fn_type: FunctionType| {
        registry
            .register(name, args, address, fn_type)
            .expect("standard registry is duplicate-free");
    };

    // Core I/O.
    add("WRITES", 1, io::bcpl_writes as usize, FunctionType::Standard);
    add("WRITEN", 1, io::bcpl_writen as usize, FunctionType::Standard);
    add("WRITEF", 1, io::bcpl_writef as usize, FunctionType::Float);
    add("WRITEC", 1, io::bcpl_writec as usize, FunctionType::Standard);
    add("RDCH", 0, io::bcpl_rdch as usize, FunctionType::Standard);
    add("FINISH", 0, io::bcpl_finish as usize, FunctionType::Standard);

    // Heap.
    add("BCPL_ALLOC_WORDS", 1, heap::bcpl_alloc_words as usize, FunctionType::Standard);
    add("BCPL_ALLOC_CHARS", 1, heap::bcpl_alloc_chars as usize, FunctionType::Standard);
    add("MALLOC", 1, heap::bcpl_alloc_words as usize, FunctionType::Standard);
    add("FREEVEC", 1, heap::bcpl_free as usize, FunctionType::Standard);

    // Lists.
    add("BCPL_LIST_CREATE_EMPTY", 0, lists::bcpl_list_create_empty as usize, FunctionType::Standard);
    add("BCPL_LIST_APPEND_INT", 2, lists::bcpl_list_append_int as usize, FunctionType::Standard);
    add("BCPL_LIST_APPEND_FLOAT", 2, lists::bcpl_list_append_float as usize, FunctionType::Float);
    add("BCPL_LIST_APPEND_STRING", 2, lists::bcpl_list_append_string as usize, FunctionType::Standard);
    add("BCPL_LIST_APPEND_LIST", 2, lists::bcpl_list_append_list as usize, FunctionType::Standard);
    add("BCPL_LIST_GET_HEAD_AS_INT", 1, lists::bcpl_list_get_head_as_int as usize, FunctionType::Standard);
    add("BCPL_LIST_GET_HEAD_AS_FLOAT", 1, lists::bcpl_list_get_head_as_float as usize, FunctionType::Float);
    add("BCPL_LIST_GET_TAIL", 1, lists::bcpl_list_get_tail as usize, FunctionType::Standard);
    add("BCPL_GET_ATOM_TYPE", 1, lists::bcpl_get_atom_type as usize, FunctionType::Standard);
    add("BCPL_LIST_GET_NTH", 2, lists::bcpl_list_get_nth as usize, FunctionType::Standard);
    add("BCPL_FREE_LIST", 1, lists::bcpl_free_list as usize, FunctionType::Standard);

    // Source-level aliases.
    add("APND", 2, lists::bcpl_list_append_int as usize, FunctionType::Standard);
    add("FPND", 2, lists::bcpl_list_append_float as usize, FunctionType::Float);
    add("SPND", 2, lists::bcpl_list_append_string as usize, FunctionType::Standard);
    add("LPND", 2, lists::bcpl_list_append_list as usize, FunctionType::Standard);
    add("CONCAT", 2, lists::bcpl_concat_lists as usize, FunctionType::Standard);
    add("REVERSE", 1, lists::bcpl_reverse_list as usize, FunctionType::Standard);
    add("FIND", 3, lists::bcpl_find_in_list as usize, FunctionType::Standard);
    add("FILTER", 2, lists::bcpl_list_filter as usize, FunctionType::Standard);
    add("COPYLIST", 1, lists::bcpl_shallow_copy_list as usize, FunctionType::Standard);
    add("DEEPCOPYLIST", 1, lists::bcpl_deep_copy_list as usize, FunctionType::Standard);
    add("DEEPCOPYLITERALLIST", 1, lists::bcpl_deep_copy_literal_list as usize, FunctionType::Standard);

    // Typed extraction. AS_FLOAT returns in D0.
    add("AS_INT", 1, lists::bcpl_as_int as usize, FunctionType::Standard);
    add("AS_FLOAT", 1, lists::bcpl_as_float as usize, FunctionType::Float);
    add("AS_STRING", 1, lists::bcpl_as_string as usize, FunctionType::Standard);
    add("AS_LIST", 1, lists::bcpl_as_list as usize, FunctionType::Standard);

    // SETTYPE is resolved by the analyzer; the slot exists so calls keep a
    // stable shape if one survives to codegen.
    add("SETTYPE", 2, 0, FunctionType::Standard);

    // Strings.
    add("SPLIT", 2, strings::bcpl_split as usize, FunctionType::Standard);
    add("JOIN", 2, strings::bcpl_join as usize, FunctionType::Standard);
    add("STRLEN", 1, strings::bcpl_strlen as usize, FunctionType::Standard);
    add("STRCMP", 2, strings::bcpl_strcmp as usize, FunctionType::Standard);
    add("STRCOPY", 2, strings::bcpl_strcopy as usize, FunctionType::Standard);
    add("PACKSTRING", 1, strings::bcpl_packstring as usize, FunctionType::Standard);
    add("UNPACKSTRING", 1, strings::bcpl_unpackstring as usize, FunctionType::Standard);
    add("SLURP", 1, strings::bcpl_slurp as usize, FunctionType::Standard);
    add("SPIT", 2, strings::bcpl_spit as usize, FunctionType::Standard);

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_sequential_8_bytes() {
        let mut registry = RuntimeRegistry::new();
        registry.register("A", 0, 1, FunctionType::Standard).unwrap();
        registry.register("B", 0, 2, FunctionType::Standard).unwrap();
        registry.register("C", 0, 3, FunctionType::Standard).unwrap();
        assert_eq!(registry.table_offset("A").unwrap(), 0);
        assert_eq!(registry.table_offset("B").unwrap(), 8);
        assert_eq!(registry.table_offset("C").unwrap(), 16);
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let registry = standard_registry();
        assert!(registry.is_registered("writes"));
        assert!(registry.is_registered("WRITES"));
        assert_eq!(
            registry.get("writes").unwrap().table_offset,
            registry.get("WRITES").unwrap().table_offset
        );
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = RuntimeRegistry::new();
        registry.register("F", 0, 1, FunctionType::Standard).unwrap();
        assert!(matches!(
            registry.register("f", 0, 2, FunctionType::Standard),
            Err(RegistryError::Duplicate(_))
        ));
    }

    #[test]
    fn test_table_capacity_enforced() {
        let mut registry = RuntimeRegistry::new();
        for i in 0..MAX_TABLE_ENTRIES {
            registry
                .register(&format!("F{}", i), 0, i, FunctionType::Standard)
                .unwrap();
        }
        assert!(matches!(
            registry.register("OVERFLOW", 0, 0, FunctionType::Standard),
            Err(RegistryError::TableFull)
        ));
    }

    #[test]
    fn test_populate_table_writes_addresses() {
        let registry = standard_registry();
        let mut table = vec![0u8; MAX_TABLE_ENTRIES * 8];
        unsafe { registry.populate_table(table.as_mut_ptr()) };
        let writes = registry.get("WRITES").unwrap();
        let slot = u64::from_le_bytes(
            table[writes.table_offset..writes.table_offset + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(slot, writes.address as u64);
    }

    #[test]
    fn test_standard_set_under_capacity() {
        let registry = standard_registry();
        assert!(registry.len() <= MAX_TABLE_ENTRIES);
        assert!(registry.len() >= 30);
    }
}
