//! String primitives over the length-prefixed UTF-32 layout.
//!
//! A string value points at its first code point; the 64-bit length is at
//! `value - 8`. New strings come from [`crate::heap::bcpl_alloc_chars`].

use crate::heap::{bcpl_alloc_chars, bcpl_length};
use crate::lists::{bcpl_list_create_empty, ListAtom, ListHeader, ATOM_STRING};

unsafe fn string_len(value: *const u32) -> usize {
    bcpl_length(value as *const u8).max(0) as usize
}

unsafe fn string_chars(value: *const u32) -> Vec<u32> {
    let len = string_len(value);
    (0..len).map(|i| value.add(i).read()).collect()
}

unsafe fn make_string(chars: &[u32]) -> *mut u32 {
    let out = bcpl_alloc_chars(chars.len() as i64);
    for (i, &c) in chars.iter().enumerate() {
        out.add(i).write(c);
    }
    out
}

/// Rust-side helper for tests and the JIT driver.
///
/// # Safety
/// `value` must be a live string value.
pub unsafe fn to_rust_string(value: *const u32) -> String {
    string_chars(value)
        .into_iter()
        .map(|c| char::from_u32(c).unwrap_or('\u{FFFD}'))
        .collect()
}

/// Build a fresh BCPL string from a Rust string. Used by SLURP and tests.
pub unsafe fn from_rust_string(s: &str) -> *mut u32 {
    let chars: Vec<u32> = s.chars().map(|c| c as u32).collect();
    make_string(&chars)
}

/// # Safety
/// `value` must be a live string value.
#[no_mangle]
pub unsafe extern "C" fn bcpl_strlen(value: *const u32) -> i64 {
    string_len(value) as i64
}

/// Lexicographic comparison, returning negative/zero/positive.
///
/// # Safety
/// Both arguments must be live string values.
#[no_mangle]
pub unsafe extern "C" fn bcpl_strcmp(a: *const u32, b: *const u32) -> i64 {
    let (a, b) = (string_chars(a), string_chars(b));
    match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

/// Copy `src` into `dest` up to dest's capacity; returns the copied count.
///
/// # Safety
/// Both arguments must be live string values.
#[no_mangle]
pub unsafe extern "C" fn bcpl_strcopy(dest: *mut u32, src: *const u32) -> i64 {
    let capacity = string_len(dest as *const u32);
    let chars = string_chars(src);
    let count = chars.len().min(capacity);
    for (i, &c) in chars.iter().take(count).enumerate() {
        dest.add(i).write(c);
    }
    count as i64
}

/// Pack 32-bit code points into bytes (one per word, truncating).
///
/// # Safety
/// `value` must be a live string value. The result is a word vector whose
/// first word is the length, classic packed-string style.
#[no_mangle]
pub unsafe extern "C" fn bcpl_packstring(value: *const u32) -> *mut i64 {
    let chars = string_chars(value);
    let words = chars.len().div_ceil(8) + 1;
    let out = crate::heap::bcpl_alloc_words(words as i64);
    out.write(chars.len() as i64);
    let bytes = (out.add(1)) as *mut u8;
    for (i, &c) in chars.iter().enumerate() {
        bytes.add(i).write(c as u8);
    }
    out
}

/// Reverse of [`bcpl_packstring`].
///
/// # Safety
/// `packed` must come from `bcpl_packstring`.
#[no_mangle]
pub unsafe extern "C" fn bcpl_unpackstring(packed: *const i64) -> *mut u32 {
    let len = packed.read().max(0) as usize;
    let bytes = packed.add(1) as *const u8;
    let chars: Vec<u32> = (0..len).map(|i| bytes.add(i).read() as u32).collect();
    make_string(&chars)
}

/// Split `value` on every occurrence of `separator`, returning a list of
/// string atoms. Empty fields are kept: `SPLIT("a,,b", ",")` has 3 atoms.
///
/// # Safety
/// Both arguments must be live string values.
#[no_mangle]
pub unsafe extern "C" fn bcpl_split(value: *const u32, separator: *const u32) -> *mut ListHeader {
    let haystack = string_chars(value);
    let needle = string_chars(separator);
    let list = bcpl_list_create_empty();

    let mut fields: Vec<Vec<u32>> = Vec::new();
    if needle.is_empty() {
        fields.push(haystack);
    } else {
        let mut current = Vec::new();
        let mut i = 0;
        while i < haystack.len() {
            if haystack[i..].starts_with(&needle) {
                fields.push(std::mem::take(&mut current));
                i += needle.len();
            } else {
                current.push(haystack[i]);
                i += 1;
            }
        }
        fields.push(current);
    }

    for field in fields {
        let s = make_string(&field);
        crate::lists::bcpl_list_append_string(list, s);
    }
    list
}

/// Join a list of string atoms with a separator, returning a new string.
/// Non-string atoms are skipped.
///
/// # Safety
/// `list` must be a live list header; `separator` a live string value.
#[no_mangle]
pub unsafe extern "C" fn bcpl_join(list: *const ListHeader, separator: *const u32) -> *mut u32 {
    let sep = string_chars(separator);
    let mut out: Vec<u32> = Vec::new();
    let mut cursor: *const ListAtom = (*list).head;
    let mut first = true;
    while !cursor.is_null() {
        if (*cursor).type_tag == ATOM_STRING {
            if !first {
                out.extend_from_slice(&sep);
            }
            first = false;
            let value = ((*cursor).value as *const u8).add(8) as *const u32;
            out.extend(string_chars(value));
        }
        cursor = (*cursor).next;
    }
    make_string(&out)
}

/// Read a whole file as a string value, or 0 on failure.
///
/// # Safety
/// `filename` must be a live string value.
#[no_mangle]
pub unsafe extern "C" fn bcpl_slurp(filename: *const u32) -> *mut u32 {
    let name = to_rust_string(filename);
    match std::fs::read_to_string(&name) {
        Ok(contents) => from_rust_string(&contents),
        Err(err) => {
            log::warn!("SLURP {}: {}", name, err);
            std::ptr::null_mut()
        }
    }
}

/// Write a string value to a file; returns non-zero on success.
///
/// # Safety
/// Both arguments must be live string values.
#[no_mangle]
pub unsafe extern "C" fn bcpl_spit(value: *const u32, filename: *const u32) -> i64 {
    let name = to_rust_string(filename);
    match std::fs::write(&name, to_rust_string(value)) {
        Ok(()) => -1,
        Err(err) => {
            log::warn!("SPIT {}: {}", name, err);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lists::bcpl_free_list;

    #[test]
    fn test_split_keeps_empty_fields() {
        unsafe {
            let s = from_rust_string("a,b,,c");
            let sep = from_rust_string(",");
            let list = bcpl_split(s, sep);
            assert_eq!((*list).length, 4);

            let joined = bcpl_join(list, from_rust_string("-"));
            assert_eq!(to_rust_string(joined), "a-b--c");
            assert_eq!(bcpl_strlen(joined), 6);
            bcpl_free_list(list);
        }
    }

    #[test]
    fn test_strcmp_ordering() {
        unsafe {
            let a = from_rust_string("abc");
            let b = from_rust_string("abd");
            assert!(bcpl_strcmp(a, b) < 0);
            assert!(bcpl_strcmp(b, a) > 0);
            assert_eq!(bcpl_strcmp(a, a), 0);
        }
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        unsafe {
            let s = from_rust_string("hello");
            let packed = bcpl_packstring(s);
            let unpacked = bcpl_unpackstring(packed);
            assert_eq!(to_rust_string(unpacked), "hello");
        }
    }

    #[test]
    fn test_strcopy_respects_capacity() {
        unsafe {
            let dest = crate::heap::bcpl_alloc_chars(3);
            let src = from_rust_string("abcdef");
            assert_eq!(bcpl_strcopy(dest, src), 3);
            assert_eq!(dest.read(), 'a' as u32);
            assert_eq!(dest.add(2).read(), 'c' as u32);
        }
    }
}
