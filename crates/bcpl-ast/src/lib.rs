//! AST definitions for the BCPL compiler.
//!
//! The tree is a set of plain tagged unions (`Decl`, `Expr`, `Stmt`) with
//! owned `Box` children. Deep cloning is `#[derive(Clone)]` — passes that
//! rewrite a subtree clone it and splice the copy back in.

pub mod ast;
pub mod types;
pub mod visit;

pub use ast::{
    BinaryOperator, BranchCondition, CaseArm, Decl, Expr, NumberLiteral, Program, RepeatKind,
    Stmt, UnaryOperator,
};
pub use types::{FunctionType, VarType};
