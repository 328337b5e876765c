//! Label management.
//!
//! Maps symbolic labels to final addresses (written by linker pass 1) and
//! distinguishes runtime-function labels, which resolve through the runtime
//! registry instead.

use crate::{CodegenError, CodegenResult};
use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Debug, Default)]
pub struct LabelManager {
    addresses: FxHashMap<String, u64>,
    runtime_labels: FxHashSet<String>,
    next_id: usize,
}

impl LabelManager {
    pub fn new() -> Self {
        LabelManager::default()
    }

    /// A fresh label with the given prefix, unique within this compilation.
    pub fn create_label(&mut self, prefix: &str) -> String {
        let label = format!("L_{}_{}", prefix, self.next_id);
        self.next_id += 1;
        label
    }

    pub fn define_label(&mut self, name: &str, address: u64) {
        self.addresses.insert(name.to_string(), address);
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.addresses.contains_key(name)
    }

    pub fn address_of(&self, name: &str) -> CodegenResult<u64> {
        self.addresses
            .get(name)
            .copied()
            .ok_or_else(|| CodegenError::UndefinedLabel(name.to_string()))
    }

    /// Mark a label as naming a runtime function; the linker resolves it
    /// through the registry.
    pub fn mark_runtime(&mut self, name: &str) {
        self.runtime_labels.insert(name.to_string());
    }

    pub fn is_runtime_label(&self, name: &str) -> bool {
        self.runtime_labels.contains(name)
    }

    /// All defined labels, for listings and the assembly writer.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.addresses.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_and_resolve() {
        let mut labels = LabelManager::new();
        labels.define_label("F_BB_0", 0x1000);
        assert_eq!(labels.address_of("F_BB_0").unwrap(), 0x1000);
        assert!(matches!(
            labels.address_of("missing"),
            Err(CodegenError::UndefinedLabel(_))
        ));
    }

    #[test]
    fn test_created_labels_are_unique() {
        let mut labels = LabelManager::new();
        let a = labels.create_label("then");
        let b = labels.create_label("then");
        assert_ne!(a, b);
    }

    #[test]
    fn test_runtime_marking() {
        let mut labels = LabelManager::new();
        labels.mark_runtime("WRITES");
        assert!(labels.is_runtime_label("WRITES"));
        assert!(!labels.is_runtime_label("F_BB_0"));
    }
}
