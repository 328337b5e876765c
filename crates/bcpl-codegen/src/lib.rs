//! AArch64 back end.
//!
//! The code generator walks each function's CFG in deterministic block
//! order, emitting encoded instructions into a flat stream. The linker then
//! assigns addresses across the three segments and patches relocations, and
//! the result is either written as assembly or copied into executable
//! memory and run in-process.

pub mod asm;
pub mod codegen;
pub mod data;
pub mod encoder;
pub mod frame;
pub mod instr;
pub mod jit;
pub mod labels;
pub mod linear_scan;
pub mod linker;
pub mod peephole;
pub mod reg;

pub use codegen::{CodeGenerator, CodegenOptions, CodegenOutput};
pub use instr::{Instruction, InstructionStream, JitAttr, Opcode, Relocation, Segment};
pub use labels::LabelManager;
pub use linker::Linker;
pub use reg::{Cond, Reg, RegisterManager};

use thiserror::Error;

/// Internal-consistency failures in the back end. All fatal.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("all scratch registers are in use")]
    ScratchExhausted,

    #[error("no spill candidate available in the {0} pool")]
    NoSpillCandidate(&'static str),

    #[error("stack offset for '{0}' requested before the frame was laid out")]
    FrameNotLaidOut(String),

    #[error("undefined label '{0}' encountered during linking")]
    UndefinedLabel(String),

    #[error("PC-relative target for '{label}' out of range: offset {offset:#x}")]
    BranchOutOfRange { label: String, offset: i64 },

    #[error("immediate {0:#x} does not fit the instruction field")]
    ImmediateOverflow(i64),

    #[error("unknown variable '{0}' in function '{1}'")]
    UnknownVariable(String, String),

    #[error("runtime error: {0}")]
    Runtime(#[from] bcpl_runtime::RegistryError),

    #[error("JIT unavailable: {0}")]
    JitUnavailable(String),

    #[error("internal code generation error: {0}")]
    Internal(String),
}

pub type CodegenResult<T> = Result<T, CodegenError>;
