//! Heap-allocated lists with runtime type tags.
//!
//! The layout is ABI: generated code reaches into these structs by byte
//! offset. `ListHeader.head` sits at offset 16 (the FOREACH lowering loads
//! it directly); atoms put the tag at 0, the payload at 8 and the next
//! pointer at 16.

use std::alloc::{alloc_zeroed, dealloc, Layout};

pub const ATOM_INT: i64 = 1;
pub const ATOM_FLOAT: i64 = 2;
pub const ATOM_STRING: i64 = 3;
pub const ATOM_LIST: i64 = 4;

/// List header. `head` must stay at byte offset 16.
#[repr(C)]
pub struct ListHeader {
    pub type_tag: i64,
    pub length: i64,
    pub head: *mut ListAtom,
    pub tail: *mut ListAtom,
}

/// One list node. Tag at 0, payload at 8, next at 16.
#[repr(C)]
pub struct ListAtom {
    pub type_tag: i64,
    pub value: u64,
    pub next: *mut ListAtom,
}

fn header_layout() -> Layout {
    Layout::new::<ListHeader>()
}

fn atom_layout() -> Layout {
    Layout::new::<ListAtom>()
}

unsafe fn new_atom(tag: i64, value: u64) -> *mut ListAtom {
    let atom = alloc_zeroed(atom_layout()) as *mut ListAtom;
    (*atom).type_tag = tag;
    (*atom).value = value;
    (*atom).next = std::ptr::null_mut();
    atom
}

unsafe fn append_atom(header: *mut ListHeader, atom: *mut ListAtom) {
    if (*header).tail.is_null() {
        (*header).head = atom;
    } else {
        (*(*header).tail).next = atom;
    }
    (*header).tail = atom;
    (*header).length += 1;
}

fn tag_mismatch(wanted: i64, got: i64) -> ! {
    // Failed type-tag checks are runtime faults, mirroring the BRK the
    // generated code would raise.
    eprintln!("runtime: list atom tag check failed (wanted {}, got {})", wanted, got);
    std::process::abort();
}

// --- Creation and append ---

/// # Safety
/// Result is owned by BCPL code; release with [`bcpl_free_list`].
#[no_mangle]
pub unsafe extern "C" fn bcpl_list_create_empty() -> *mut ListHeader {
    let header = alloc_zeroed(header_layout()) as *mut ListHeader;
    (*header).type_tag = ATOM_LIST;
    header
}

/// # Safety
/// `header` must be a live list header.
#[no_mangle]
pub unsafe extern "C" fn bcpl_list_append_int(header: *mut ListHeader, value: i64) {
    append_atom(header, new_atom(ATOM_INT, value as u64));
}

/// # Safety
/// `header` must be a live list header.
#[no_mangle]
pub unsafe extern "C" fn bcpl_list_append_float(header: *mut ListHeader, value: f64) {
    append_atom(header, new_atom(ATOM_FLOAT, value.to_bits()));
}

/// Append a string payload. `value` is the string *value* (char pointer);
/// the atom stores the base pointer (the length word).
///
/// # Safety
/// `header` live; `value` a live string value.
#[no_mangle]
pub unsafe extern "C" fn bcpl_list_append_string(header: *mut ListHeader, value: *const u32) {
    let base = (value as *const u8).sub(8);
    append_atom(header, new_atom(ATOM_STRING, base as u64));
}

/// # Safety
/// Both pointers must be live list headers.
#[no_mangle]
pub unsafe extern "C" fn bcpl_list_append_list(header: *mut ListHeader, nested: *mut ListHeader) {
    append_atom(header, new_atom(ATOM_LIST, nested as u64));
}

// --- Accessors ---

/// # Safety
/// `header` must be a live, non-empty list header.
#[no_mangle]
pub unsafe extern "C" fn bcpl_list_get_head_as_int(header: *const ListHeader) -> i64 {
    let head = (*header).head;
    if head.is_null() {
        eprintln!("runtime: HD of empty list");
        std::process::abort();
    }
    (*head).value as i64
}

/// # Safety
/// `header` must be a live, non-empty list header.
#[no_mangle]
pub unsafe extern "C" fn bcpl_list_get_head_as_float(header: *const ListHeader) -> f64 {
    let head = (*header).head;
    if head.is_null() {
        eprintln!("runtime: HD of empty list");
        std::process::abort();
    }
    f64::from_bits((*head).value)
}

/// TL: a fresh header over the rest of the chain. The nodes are shared.
///
/// # Safety
/// `header` must be a live list header.
#[no_mangle]
pub unsafe extern "C" fn bcpl_list_get_tail(header: *const ListHeader) -> *mut ListHeader {
    let rest = bcpl_list_create_empty();
    if !(*header).head.is_null() {
        (*rest).head = (*(*header).head).next;
        (*rest).tail = (*header).tail;
        (*rest).length = ((*header).length - 1).max(0);
        if (*rest).head.is_null() {
            (*rest).tail = std::ptr::null_mut();
            (*rest).length = 0;
        }
    }
    rest
}

/// # Safety
/// `atom` must be a live atom.
#[no_mangle]
pub unsafe extern "C" fn bcpl_get_atom_type(atom: *const ListAtom) -> i64 {
    (*atom).type_tag
}

/// The n-th atom (0-based), or null past the end.
///
/// # Safety
/// `header` must be a live list header.
#[no_mangle]
pub unsafe extern "C" fn bcpl_list_get_nth(header: *const ListHeader, n: i64) -> *mut ListAtom {
    let mut cursor = (*header).head;
    let mut remaining = n;
    while !cursor.is_null() && remaining > 0 {
        cursor = (*cursor).next;
        remaining -= 1;
    }
    cursor
}

// --- Typed extraction (the AS_* intrinsics) ---

/// # Safety
/// `atom` must be a live atom.
#[no_mangle]
pub unsafe extern "C" fn bcpl_as_int(atom: *const ListAtom) -> i64 {
    if (*atom).type_tag != ATOM_INT {
        tag_mismatch(ATOM_INT, (*atom).type_tag);
    }
    (*atom).value as i64
}

/// # Safety
/// `atom` must be a live atom.
#[no_mangle]
pub unsafe extern "C" fn bcpl_as_float(atom: *const ListAtom) -> f64 {
    if (*atom).type_tag != ATOM_FLOAT {
        tag_mismatch(ATOM_FLOAT, (*atom).type_tag);
    }
    f64::from_bits((*atom).value)
}

/// Returns the string value (char pointer), not the stored base.
///
/// # Safety
/// `atom` must be a live atom.
#[no_mangle]
pub unsafe extern "C" fn bcpl_as_string(atom: *const ListAtom) -> *const u32 {
    if (*atom).type_tag != ATOM_STRING {
        tag_mismatch(ATOM_STRING, (*atom).type_tag);
    }
    ((*atom).value as *const u8).add(8) as *const u32
}

/// # Safety
/// `atom` must be a live atom.
#[no_mangle]
pub unsafe extern "C" fn bcpl_as_list(atom: *const ListAtom) -> *mut ListHeader {
    if (*atom).type_tag != ATOM_LIST {
        tag_mismatch(ATOM_LIST, (*atom).type_tag);
    }
    (*atom).value as *mut ListHeader
}

// --- Structural operations ---

/// Reverse the node chain in place; returns the same header.
///
/// # Safety
/// `header` must be a live list header.
#[no_mangle]
pub unsafe extern "C" fn bcpl_reverse_list(header: *mut ListHeader) -> *mut ListHeader {
    let mut prev: *mut ListAtom = std::ptr::null_mut();
    let mut cursor = (*header).head;
    (*header).tail = cursor;
    while !cursor.is_null() {
        let next = (*cursor).next;
        (*cursor).next = prev;
        prev = cursor;
        cursor = next;
    }
    (*header).head = prev;
    header
}

/// Append every atom of `b` onto `a` (sharing payloads); returns `a`.
///
/// # Safety
/// Both must be live list headers.
#[no_mangle]
pub unsafe extern "C" fn bcpl_concat_lists(a: *mut ListHeader, b: *const ListHeader) -> *mut ListHeader {
    let mut cursor = (*b).head;
    while !cursor.is_null() {
        append_atom(a, new_atom((*cursor).type_tag, (*cursor).value));
        cursor = (*cursor).next;
    }
    a
}

/// Shallow copy: fresh header and nodes, shared payloads.
///
/// # Safety
/// `header` must be a live list header.
#[no_mangle]
pub unsafe extern "C" fn bcpl_shallow_copy_list(header: *const ListHeader) -> *mut ListHeader {
    let copy = bcpl_list_create_empty();
    let mut cursor = (*header).head;
    while !cursor.is_null() {
        append_atom(copy, new_atom((*cursor).type_tag, (*cursor).value));
        cursor = (*cursor).next;
    }
    copy
}

/// Deep copy: nested lists are copied recursively. String payloads are
/// shared (they are immutable once built).
///
/// # Safety
/// `header` must be a live list header.
#[no_mangle]
pub unsafe extern "C" fn bcpl_deep_copy_list(header: *const ListHeader) -> *mut ListHeader {
    let copy = bcpl_list_create_empty();
    let mut cursor = (*header).head;
    while !cursor.is_null() {
        let value = if (*cursor).type_tag == ATOM_LIST {
            bcpl_deep_copy_list((*cursor).value as *const ListHeader) as u64
        } else {
            (*cursor).value
        };
        append_atom(copy, new_atom((*cursor).type_tag, value));
        cursor = (*cursor).next;
    }
    copy
}

/// Materialize a rodata list-literal template as a heap list. Templates use
/// the same header/atom layout, so this is a deep copy.
///
/// # Safety
/// `template` must point at a well-formed template.
#[no_mangle]
pub unsafe extern "C" fn bcpl_deep_copy_literal_list(template: *const ListHeader) -> *mut ListHeader {
    bcpl_deep_copy_list(template)
}

/// Find the first atom with the given tag and payload bits. Returns the
/// node, or null.
///
/// # Safety
/// `header` must be a live list header.
#[no_mangle]
pub unsafe extern "C" fn bcpl_find_in_list(
    header: *const ListHeader,
    value: u64,
    tag: i64,
) -> *mut ListAtom {
    let mut cursor = (*header).head;
    while !cursor.is_null() {
        if (*cursor).type_tag == tag && (*cursor).value == value {
            return cursor;
        }
        cursor = (*cursor).next;
    }
    std::ptr::null_mut()
}

/// New list keeping only atoms of the given tag.
///
/// # Safety
/// `header` must be a live list header.
#[no_mangle]
pub unsafe extern "C" fn bcpl_list_filter(header: *const ListHeader, tag: i64) -> *mut ListHeader {
    let filtered = bcpl_list_create_empty();
    let mut cursor = (*header).head;
    while !cursor.is_null() {
        if (*cursor).type_tag == tag {
            append_atom(filtered, new_atom((*cursor).type_tag, (*cursor).value));
        }
        cursor = (*cursor).next;
    }
    filtered
}

/// Release a list's nodes and header. Payloads are not freed (strings may
/// live in rodata; nested lists are freed recursively).
///
/// # Safety
/// `header` must be a live heap list header, not a rodata template.
#[no_mangle]
pub unsafe extern "C" fn bcpl_free_list(header: *mut ListHeader) {
    if header.is_null() {
        return;
    }
    let mut cursor = (*header).head;
    while !cursor.is_null() {
        let next = (*cursor).next;
        if (*cursor).type_tag == ATOM_LIST {
            bcpl_free_list((*cursor).value as *mut ListHeader);
        }
        dealloc(cursor as *mut u8, atom_layout());
        cursor = next;
    }
    dealloc(header as *mut u8, header_layout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_field_offsets_are_abi() {
        assert_eq!(std::mem::offset_of!(ListHeader, head), 16);
        assert_eq!(std::mem::offset_of!(ListAtom, type_tag), 0);
        assert_eq!(std::mem::offset_of!(ListAtom, value), 8);
        assert_eq!(std::mem::offset_of!(ListAtom, next), 16);
    }

    #[test]
    fn test_append_and_walk() {
        unsafe {
            let list = bcpl_list_create_empty();
            bcpl_list_append_int(list, 1);
            bcpl_list_append_int(list, 2);
            bcpl_list_append_int(list, 3);
            assert_eq!((*list).length, 3);
            assert_eq!(bcpl_list_get_head_as_int(list), 1);
            let second = bcpl_list_get_nth(list, 1);
            assert_eq!((*second).value as i64, 2);
            bcpl_free_list(list);
        }
    }

    #[test]
    fn test_reverse_in_place() {
        unsafe {
            let list = bcpl_list_create_empty();
            for v in [1i64, 2, 3] {
                bcpl_list_append_int(list, v);
            }
            let reversed = bcpl_reverse_list(list);
            assert_eq!(bcpl_list_get_head_as_int(reversed), 3);
            assert_eq!((*reversed).length, 3);
            bcpl_free_list(reversed);
        }
    }

    #[test]
    fn test_tail_shares_nodes() {
        unsafe {
            let list = bcpl_list_create_empty();
            bcpl_list_append_int(list, 10);
            bcpl_list_append_int(list, 20);
            let tail = bcpl_list_get_tail(list);
            assert_eq!((*tail).length, 1);
            assert_eq!(bcpl_list_get_head_as_int(tail), 20);
            // Only the extra header needs releasing; nodes belong to `list`.
            dealloc(tail as *mut u8, header_layout());
            bcpl_free_list(list);
        }
    }

    #[test]
    fn test_concat_and_filter() {
        unsafe {
            let a = bcpl_list_create_empty();
            bcpl_list_append_int(a, 1);
            bcpl_list_append_float(a, 2.5);
            let b = bcpl_list_create_empty();
            bcpl_list_append_int(b, 3);

            bcpl_concat_lists(a, b);
            assert_eq!((*a).length, 3);

            let ints = bcpl_list_filter(a, ATOM_INT);
            assert_eq!((*ints).length, 2);

            bcpl_free_list(ints);
            bcpl_free_list(a);
            bcpl_free_list(b);
        }
    }

    #[test]
    fn test_find_by_tag_and_value() {
        unsafe {
            let list = bcpl_list_create_empty();
            bcpl_list_append_int(list, 7);
            bcpl_list_append_int(list, 9);
            let found = bcpl_find_in_list(list, 9, ATOM_INT);
            assert!(!found.is_null());
            assert_eq!((*found).value as i64, 9);
            let missing = bcpl_find_in_list(list, 9, ATOM_FLOAT);
            assert!(missing.is_null());
            bcpl_free_list(list);
        }
    }

    #[test]
    fn test_deep_copy_is_independent() {
        unsafe {
            let inner = bcpl_list_create_empty();
            bcpl_list_append_int(inner, 1);
            let outer = bcpl_list_create_empty();
            bcpl_list_append_list(outer, inner);

            let copy = bcpl_deep_copy_list(outer);
            let copied_inner = bcpl_as_list((*copy).head);
            assert_ne!(copied_inner as usize, inner as usize);
            assert_eq!(bcpl_list_get_head_as_int(copied_inner), 1);

            bcpl_free_list(copy);
            bcpl_free_list(outer); // frees inner too
        }
    }
}
