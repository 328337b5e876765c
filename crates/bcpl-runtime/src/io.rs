//! Console I/O for compiled code.

use crate::strings::to_rust_string;
use std::io::{Read, Write};

/// End-of-stream marker RDCH returns, as in classic BCPL.
pub const ENDSTREAMCH: i64 = -1;

/// Write a string value to stdout.
///
/// # Safety
/// `value` must be a live string value.
#[no_mangle]
pub unsafe extern "C" fn bcpl_writes(value: *const u32) {
    if value.is_null() {
        return;
    }
    let out = to_rust_string(value);
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    let _ = lock.write_all(out.as_bytes());
    let _ = lock.flush();
}

/// Write a decimal integer.
#[no_mangle]
pub extern "C" fn bcpl_writen(value: i64) {
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    let _ = write!(lock, "{}", value);
    let _ = lock.flush();
}

/// Write a float.
#[no_mangle]
pub extern "C" fn bcpl_writef(value: f64) {
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    let _ = write!(lock, "{}", value);
    let _ = lock.flush();
}

/// Write one code point.
#[no_mangle]
pub extern "C" fn bcpl_writec(value: i64) {
    let c = char::from_u32(value as u32).unwrap_or('\u{FFFD}');
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    let _ = write!(lock, "{}", c);
    let _ = lock.flush();
}

/// Read one byte from stdin, or [`ENDSTREAMCH`] at end of input.
#[no_mangle]
pub extern "C" fn bcpl_rdch() -> i64 {
    let mut byte = [0u8; 1];
    match std::io::stdin().read(&mut byte) {
        Ok(1) => byte[0] as i64,
        _ => ENDSTREAMCH,
    }
}

/// FINISH: terminate the process successfully.
#[no_mangle]
pub extern "C" fn bcpl_finish() {
    std::process::exit(0);
}
