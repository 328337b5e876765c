//! JIT memory and in-process execution.
//!
//! The code buffer is mmap'd read-write, filled from the linked instruction
//! stream (code and rodata both live inside it, at the addresses linker
//! pass 1 assigned), then flipped to read-execute with the instruction
//! cache invalidated. The data buffer holds the global words, a 512 KiB
//! gap, and the runtime function-pointer table at offset 524288 — X28
//! points at its base and X19 at the table.

use crate::instr::{Instruction, Segment};
use crate::labels::LabelManager;
use crate::{CodegenError, CodegenResult};
use bcpl_runtime::registry::TABLE_BASE_OFFSET;
use bcpl_runtime::RuntimeRegistry;

/// Size of the data buffer: globals region + gap + 256-entry table.
pub const DATA_BUFFER_SIZE: usize = TABLE_BASE_OFFSET + 256 * 8;

/// Default code buffer size (code + rodata + slack).
pub const CODE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// An mmap'd memory region.
pub struct JitBuffer {
    base: *mut u8,
    size: usize,
}

// The buffer is only used from the compiler's own thread.
unsafe impl Send for JitBuffer {}

impl JitBuffer {
    #[cfg(unix)]
    pub fn allocate(size: usize) -> CodegenResult<Self> {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(CodegenError::JitUnavailable(
                "mmap of the JIT buffer failed".into(),
            ));
        }
        Ok(JitBuffer {
            base: base as *mut u8,
            size,
        })
    }

    #[cfg(not(unix))]
    pub fn allocate(_size: usize) -> CodegenResult<Self> {
        Err(CodegenError::JitUnavailable(
            "JIT execution requires a unix host".into(),
        ))
    }

    pub fn base_address(&self) -> u64 {
        self.base as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy every encoded word of the given segments to its linked address.
    pub fn write_instructions(
        &mut self,
        instructions: &[Instruction],
        segments: &[Segment],
    ) -> CodegenResult<()> {
        let lo = self.base_address();
        let hi = lo + self.size as u64;
        for instr in instructions {
            if instr.is_label_definition || !segments.contains(&instr.segment) {
                continue;
            }
            if instr.address < lo || instr.address + 4 > hi {
                return Err(CodegenError::Internal(format!(
                    "instruction at {:#x} falls outside the JIT buffer {:#x}..{:#x}",
                    instr.address, lo, hi
                )));
            }
            unsafe {
                let dest = (instr.address - lo) as usize;
                (self.base.add(dest) as *mut u32).write_unaligned(instr.encoding.to_le());
            }
        }
        Ok(())
    }

    /// Flip the buffer to read-execute and invalidate the icache.
    #[cfg(unix)]
    pub fn make_executable(&mut self) -> CodegenResult<()> {
        let result = unsafe {
            libc::mprotect(
                self.base as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(CodegenError::JitUnavailable("mprotect failed".into()));
        }
        flush_icache(self.base, self.size);
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn make_executable(&mut self) -> CodegenResult<()> {
        Err(CodegenError::JitUnavailable(
            "JIT execution requires a unix host".into(),
        ))
    }
}

impl Drop for JitBuffer {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(all(unix, target_arch = "aarch64"))]
fn flush_icache(base: *mut u8, size: usize) {
    // Clean the data cache to the point of unification and invalidate the
    // instruction cache line by line, then synchronize.
    unsafe {
        let line = 64usize;
        let start = base as usize & !(line - 1);
        let end = base as usize + size;
        let mut addr = start;
        while addr < end {
            std::arch::asm!("dc cvau, {0}", in(reg) addr);
            addr += line;
        }
        std::arch::asm!("dsb ish");
        let mut addr = start;
        while addr < end {
            std::arch::asm!("ic ivau, {0}", in(reg) addr);
            addr += line;
        }
        std::arch::asm!("dsb ish", "isb");
    }
}

#[cfg(not(all(unix, target_arch = "aarch64")))]
fn flush_icache(_base: *mut u8, _size: usize) {}

/// The assembled JIT image: executable code+rodata, writable data, and the
/// populated runtime table.
pub struct JitImage {
    pub code: JitBuffer,
    pub data: JitBuffer,
}

impl JitImage {
    /// Reserve both buffers before code generation, so the generator knows
    /// the real base addresses.
    pub fn reserve() -> CodegenResult<Self> {
        Ok(JitImage {
            code: JitBuffer::allocate(CODE_BUFFER_SIZE)?,
            data: JitBuffer::allocate(DATA_BUFFER_SIZE)?,
        })
    }

    /// Load a linked instruction stream: code and rodata into the code
    /// buffer, data words into the data buffer, runtime addresses into the
    /// table.
    pub fn load(
        &mut self,
        instructions: &[Instruction],
        runtime: &RuntimeRegistry,
    ) -> CodegenResult<()> {
        self.code
            .write_instructions(instructions, &[Segment::Code, Segment::Rodata])?;
        self.data
            .write_instructions(instructions, &[Segment::Data])?;
        unsafe {
            let table = (self.data.base_address() as usize + TABLE_BASE_OFFSET) as *mut u8;
            runtime.populate_table(table);
        }
        self.code.make_executable()
    }

    /// Call a compiled entry point synchronously on this thread.
    ///
    /// # Safety
    /// The image must contain a valid function at `entry` with the standard
    /// zero-argument signature.
    #[cfg(target_arch = "aarch64")]
    pub unsafe fn call(&self, entry: u64) -> i64 {
        let f: extern "C" fn() -> i64 = std::mem::transmute(entry as usize);
        f()
    }

    #[cfg(not(target_arch = "aarch64"))]
    pub unsafe fn call(&self, _entry: u64) -> i64 {
        panic!("JIT execution is only available on aarch64 hosts");
    }

    /// Resolve an entry label to its linked address.
    pub fn entry_address(&self, labels: &LabelManager, name: &str) -> CodegenResult<u64> {
        labels.address_of(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder;

    #[cfg(unix)]
    #[test]
    fn test_buffer_roundtrip() {
        let mut buffer = JitBuffer::allocate(4096).unwrap();
        let base = buffer.base_address();
        let mut instr = encoder::ret();
        instr.address = base;
        buffer
            .write_instructions(&[instr], &[Segment::Code])
            .unwrap();
        unsafe {
            let word = *(base as *const u32);
            assert_eq!(word, 0xD65F_03C0);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_out_of_range_write_rejected() {
        let mut buffer = JitBuffer::allocate(4096).unwrap();
        let mut instr = encoder::ret();
        instr.address = buffer.base_address() + 8192;
        assert!(buffer
            .write_instructions(&[instr], &[Segment::Code])
            .is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_data_buffer_table_population() {
        let mut image = JitImage::reserve().unwrap();
        let runtime = bcpl_runtime::standard_registry();
        image.load(&[], &runtime).unwrap();

        let writes = runtime.get("WRITES").unwrap();
        unsafe {
            let slot = (image.data.base_address() as usize
                + TABLE_BASE_OFFSET
                + writes.table_offset) as *const u64;
            assert_eq!(*slot, writes.address as u64);
        }
    }
}
