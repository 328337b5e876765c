//! Type descriptors for BCPL values.
//!
//! BCPL is typeless at the word level, but the compiler tracks an inferred
//! `VarType` per expression so it can pick register banks, access widths and
//! runtime entry points. The descriptor is a bitfield: one primitive kind,
//! optionally crossed with a container flag and attribute modifiers.

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Bit-coded type descriptor for a BCPL value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VarType: u32 {
        // Primitive kinds
        const INTEGER = 1 << 0;
        const FLOAT   = 1 << 1;
        const STRING  = 1 << 2;
        const ANY     = 1 << 3;

        // Container kinds
        const VEC   = 1 << 8;
        const LIST  = 1 << 9;
        const TABLE = 1 << 10;

        // Modifiers
        const POINTER_TO = 1 << 12;
        const CONST      = 1 << 13;
    }
}

impl VarType {
    pub const UNKNOWN: VarType = VarType::empty();

    pub const POINTER_TO_INT_LIST: VarType = VarType::POINTER_TO
        .union(VarType::LIST)
        .union(VarType::INTEGER);
    pub const POINTER_TO_FLOAT_LIST: VarType = VarType::POINTER_TO
        .union(VarType::LIST)
        .union(VarType::FLOAT);
    pub const POINTER_TO_STRING_LIST: VarType = VarType::POINTER_TO
        .union(VarType::LIST)
        .union(VarType::STRING);
    pub const POINTER_TO_ANY_LIST: VarType = VarType::POINTER_TO
        .union(VarType::LIST)
        .union(VarType::ANY);
    pub const CONST_POINTER_TO_INT_LIST: VarType =
        VarType::CONST.union(VarType::POINTER_TO_INT_LIST);
    pub const CONST_POINTER_TO_FLOAT_LIST: VarType =
        VarType::CONST.union(VarType::POINTER_TO_FLOAT_LIST);
    pub const CONST_POINTER_TO_STRING_LIST: VarType =
        VarType::CONST.union(VarType::POINTER_TO_STRING_LIST);
    pub const CONST_POINTER_TO_ANY_LIST: VarType =
        VarType::CONST.union(VarType::POINTER_TO_ANY_LIST);

    pub const POINTER_TO_INT_VEC: VarType = VarType::POINTER_TO
        .union(VarType::VEC)
        .union(VarType::INTEGER);
    pub const POINTER_TO_FLOAT_VEC: VarType = VarType::POINTER_TO
        .union(VarType::VEC)
        .union(VarType::FLOAT);
    pub const POINTER_TO_STRING: VarType = VarType::POINTER_TO.union(VarType::STRING);
    pub const POINTER_TO_TABLE: VarType = VarType::POINTER_TO.union(VarType::TABLE);
    pub const POINTER_TO_FLOAT: VarType = VarType::POINTER_TO.union(VarType::FLOAT);
    pub const POINTER_TO_INT: VarType = VarType::POINTER_TO.union(VarType::INTEGER);
    pub const POINTER_TO_LIST_NODE: VarType = VarType::POINTER_TO.union(VarType::LIST);

    /// True for any `const` list type. Modifying intrinsics reject these.
    pub fn is_const_list(self) -> bool {
        self.contains(VarType::CONST) && self.contains(VarType::LIST)
    }

    pub fn is_list(self) -> bool {
        self.contains(VarType::LIST)
    }

    pub fn is_vec(self) -> bool {
        self.contains(VarType::VEC)
    }

    /// A value that lives in the floating-point register bank.
    ///
    /// Pointers to float containers are still addresses, so only a bare
    /// FLOAT kind counts.
    pub fn uses_fp_register(self) -> bool {
        self.contains(VarType::FLOAT)
            && !self.contains(VarType::POINTER_TO)
            && !self.contains(VarType::VEC)
            && !self.contains(VarType::LIST)
            && !self.contains(VarType::TABLE)
    }

    /// Any container a `lengthof` applies to.
    pub fn is_container(self) -> bool {
        self.intersects(VarType::VEC | VarType::LIST | VarType::TABLE)
            || self.contains(VarType::STRING)
    }

    /// The element kind of a container type, with modifiers stripped.
    pub fn element_kind(self) -> VarType {
        self & (VarType::INTEGER | VarType::FLOAT | VarType::STRING | VarType::ANY)
    }

    /// Build the list type whose elements have the given kind.
    pub fn list_of(kind: VarType) -> VarType {
        VarType::POINTER_TO | VarType::LIST | kind.element_kind()
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "UNKNOWN");
        }
        let mut parts = Vec::new();
        if self.contains(VarType::CONST) {
            parts.push("CONST");
        }
        if self.contains(VarType::POINTER_TO) {
            parts.push("POINTER_TO");
        }
        if self.contains(VarType::LIST) {
            parts.push("LIST");
        }
        if self.contains(VarType::VEC) {
            parts.push("VEC");
        }
        if self.contains(VarType::TABLE) {
            parts.push("TABLE");
        }
        if self.contains(VarType::INTEGER) {
            parts.push("INTEGER");
        }
        if self.contains(VarType::FLOAT) {
            parts.push("FLOAT");
        }
        if self.contains(VarType::STRING) {
            parts.push("STRING");
        }
        if self.contains(VarType::ANY) {
            parts.push("ANY");
        }
        write!(f, "{}", parts.join("|"))
    }
}

/// Which register bank a function returns its result in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FunctionType {
    /// Integer or pointer result in X0.
    #[default]
    Standard,
    /// Float result in D0.
    Float,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_list_detection() {
        assert!(VarType::CONST_POINTER_TO_INT_LIST.is_const_list());
        assert!(VarType::CONST_POINTER_TO_ANY_LIST.is_const_list());
        assert!(!VarType::POINTER_TO_INT_LIST.is_const_list());
        assert!(!(VarType::CONST | VarType::INTEGER).is_const_list());
    }

    #[test]
    fn test_fp_bank_selection() {
        assert!(VarType::FLOAT.uses_fp_register());
        assert!(!VarType::POINTER_TO_FLOAT_VEC.uses_fp_register());
        assert!(!VarType::POINTER_TO_FLOAT_LIST.uses_fp_register());
        assert!(!VarType::INTEGER.uses_fp_register());
    }

    #[test]
    fn test_element_kind() {
        assert_eq!(
            VarType::POINTER_TO_STRING_LIST.element_kind(),
            VarType::STRING
        );
        assert_eq!(VarType::POINTER_TO_INT_VEC.element_kind(), VarType::INTEGER);
    }

    #[test]
    fn test_display_matches_flag_order() {
        assert_eq!(
            VarType::CONST_POINTER_TO_INT_LIST.to_string(),
            "CONST|POINTER_TO|LIST|INTEGER"
        );
        assert_eq!(VarType::UNKNOWN.to_string(), "UNKNOWN");
    }

    #[test]
    fn test_bit_values_are_stable() {
        // The bit layout is part of the compiler's metadata format.
        assert_eq!(VarType::INTEGER.bits(), 1);
        assert_eq!(VarType::FLOAT.bits(), 2);
        assert_eq!(VarType::VEC.bits(), 256);
        assert_eq!(VarType::LIST.bits(), 512);
        assert_eq!(VarType::POINTER_TO.bits(), 4096);
        assert_eq!(VarType::CONST.bits(), 8192);
        assert_eq!(VarType::POINTER_TO_INT_LIST.bits(), 4609);
        assert_eq!(VarType::CONST_POINTER_TO_ANY_LIST.bits(), 12808);
    }
}
