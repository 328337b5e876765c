//! The BCPL abstract syntax tree.
//!
//! Nodes own their children exclusively; `clone()` produces a fully
//! independent subtree. Control-flow statements carry their sub-statements as
//! owned children, and the loop variable of FOR/FOREACH carries both its
//! source name and the unique name assigned by the semantic analyzer.

use crate::types::VarType;

/// A whole compilation unit.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub declarations: Vec<Decl>,
}

/// Top-level declarations.
#[derive(Debug, Clone)]
pub enum Decl {
    /// `MANIFEST $( NAME = value $)` — compile-time integer constant.
    Manifest { name: String, value: i64 },
    /// `STATIC $( NAME = init $)` — one data-segment word.
    Static { name: String, initializer: Expr },
    /// `GLOBAL $( NAME : slot $)` — named global cells.
    Global { entries: Vec<(String, usize)> },
    /// Top-level `LET`/`FLET` of plain values (globals with initializers).
    GlobalVariable {
        names: Vec<String>,
        initializers: Vec<Expr>,
        is_float: bool,
    },
    /// `LET NAME(args) = expr` — value-returning function. `FLET` marks the
    /// result as living in the float bank.
    Function {
        name: String,
        parameters: Vec<String>,
        body: Expr,
        returns_float: bool,
    },
    /// `LET NAME(args) BE command` — routine.
    Routine {
        name: String,
        parameters: Vec<String>,
        body: Stmt,
    },
    /// `name: command` at declaration level.
    Label { name: String, command: Box<Stmt> },
}

/// Integer or float literal payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumberLiteral {
    Integer(i64),
    Float(f64),
}

/// Binary operators, including the explicit float forms the analyzer
/// rewrites mixed arithmetic into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    LogicalAnd,
    LogicalOr,
    Equivalence,
    NotEquivalence,
    LeftShift,
    RightShift,
    FloatAdd,
    FloatSubtract,
    FloatMultiply,
    FloatDivide,
    FloatEqual,
    FloatNotEqual,
    FloatLess,
    FloatLessEqual,
    FloatGreater,
    FloatGreaterEqual,
}

impl BinaryOperator {
    /// Operand order does not matter; CSE sorts the operand keys of these.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinaryOperator::Add
                | BinaryOperator::Multiply
                | BinaryOperator::LogicalAnd
                | BinaryOperator::LogicalOr
                | BinaryOperator::Equal
                | BinaryOperator::NotEqual
                | BinaryOperator::FloatAdd
                | BinaryOperator::FloatMultiply
                | BinaryOperator::FloatEqual
                | BinaryOperator::FloatNotEqual
        )
    }

    /// Comparisons always produce an integer truth value.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOperator::Equal
                | BinaryOperator::NotEqual
                | BinaryOperator::Less
                | BinaryOperator::LessEqual
                | BinaryOperator::Greater
                | BinaryOperator::GreaterEqual
                | BinaryOperator::FloatEqual
                | BinaryOperator::FloatNotEqual
                | BinaryOperator::FloatLess
                | BinaryOperator::FloatLessEqual
                | BinaryOperator::FloatGreater
                | BinaryOperator::FloatGreaterEqual
        )
    }

    pub fn is_float_op(self) -> bool {
        matches!(
            self,
            BinaryOperator::FloatAdd
                | BinaryOperator::FloatSubtract
                | BinaryOperator::FloatMultiply
                | BinaryOperator::FloatDivide
                | BinaryOperator::FloatEqual
                | BinaryOperator::FloatNotEqual
                | BinaryOperator::FloatLess
                | BinaryOperator::FloatLessEqual
                | BinaryOperator::FloatGreater
                | BinaryOperator::FloatGreaterEqual
        )
    }

    /// The float form of an integer arithmetic/comparison operator.
    pub fn float_form(self) -> Option<BinaryOperator> {
        Some(match self {
            BinaryOperator::Add => BinaryOperator::FloatAdd,
            BinaryOperator::Subtract => BinaryOperator::FloatSubtract,
            BinaryOperator::Multiply => BinaryOperator::FloatMultiply,
            BinaryOperator::Divide => BinaryOperator::FloatDivide,
            BinaryOperator::Equal => BinaryOperator::FloatEqual,
            BinaryOperator::NotEqual => BinaryOperator::FloatNotEqual,
            BinaryOperator::Less => BinaryOperator::FloatLess,
            BinaryOperator::LessEqual => BinaryOperator::FloatLessEqual,
            BinaryOperator::Greater => BinaryOperator::FloatGreater,
            BinaryOperator::GreaterEqual => BinaryOperator::FloatGreaterEqual,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    /// `@e`
    AddressOf,
    /// `!e`
    Indirection,
    /// `~e`
    LogicalNot,
    /// `-e`
    Negate,
    /// `FLOAT e` — int-to-float conversion.
    FloatConvert,
    /// `LEN e` — container length.
    LengthOf,
    /// `HD e` — head of a list.
    HeadOf,
    /// `TL e` — tail of a list.
    TailOf,
}

/// Expressions. Literals are leaves.
#[derive(Debug, Clone)]
pub enum Expr {
    Number(NumberLiteral),
    StringLit(String),
    /// A character is a 32-bit code point.
    CharLit(u32),
    BooleanLit(bool),
    Variable {
        name: String,
        /// Set by the analyzer for renamed FOR-loop variables.
        unique_name: Option<String>,
    },
    Binary {
        op: BinaryOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOperator,
        operand: Box<Expr>,
    },
    /// `v!i` — word-indexed access.
    VectorAccess {
        vector: Box<Expr>,
        index: Box<Expr>,
    },
    /// `s%i` — 32-bit character access.
    CharIndirection {
        string: Box<Expr>,
        index: Box<Expr>,
    },
    /// `v#!i` — float-vector element access.
    FloatVectorAccess {
        vector: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        function: Box<Expr>,
        arguments: Vec<Expr>,
    },
    SysCall {
        number: Box<Expr>,
        arguments: Vec<Expr>,
    },
    /// `cond -> a, b`
    Conditional {
        condition: Box<Expr>,
        true_expr: Box<Expr>,
        false_expr: Box<Expr>,
    },
    Valof(Box<Stmt>),
    FloatValof(Box<Stmt>),
    /// `VEC n` — heap vector of n+1 words.
    VecAlloc { size: Box<Expr> },
    /// `STRING n` — heap character buffer.
    StringAlloc { size: Box<Expr> },
    /// `TABLE a, b, c` — rodata word table.
    Table {
        initializers: Vec<Expr>,
        is_float: bool,
    },
    /// `LIST(...)` / `MANIFESTLIST(...)` — heap or rodata list literal.
    ListLit {
        initializers: Vec<Expr>,
        is_manifest: bool,
    },
}

impl Expr {
    pub fn variable(name: impl Into<String>) -> Expr {
        Expr::Variable {
            name: name.into(),
            unique_name: None,
        }
    }

    pub fn integer(value: i64) -> Expr {
        Expr::Number(NumberLiteral::Integer(value))
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            Expr::Number(_) | Expr::StringLit(_) | Expr::CharLit(_) | Expr::BooleanLit(_)
        )
    }

    /// The effective variable name: the analyzer-assigned unique name when
    /// present, the source name otherwise.
    pub fn variable_name(&self) -> Option<&str> {
        match self {
            Expr::Variable { name, unique_name } => {
                Some(unique_name.as_deref().unwrap_or(name.as_str()))
            }
            _ => None,
        }
    }
}

/// The three REPEAT forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatKind {
    Repeat,
    RepeatWhile,
    RepeatUntil,
}

/// Condition codes for the low-level conditional branch statement the CFG
/// builder emits when lowering FOREACH headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCondition {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BranchCondition {
    pub fn mnemonic(self) -> &'static str {
        match self {
            BranchCondition::Eq => "EQ",
            BranchCondition::Ne => "NE",
            BranchCondition::Lt => "LT",
            BranchCondition::Le => "LE",
            BranchCondition::Gt => "GT",
            BranchCondition::Ge => "GE",
        }
    }
}

/// One arm of a SWITCHON.
#[derive(Debug, Clone)]
pub struct CaseArm {
    pub constant: Expr,
    /// Written by the analyzer's constant-expression evaluation.
    pub resolved_value: Option<i64>,
    pub command: Box<Stmt>,
}

/// Statements.
#[derive(Debug, Clone)]
pub enum Stmt {
    /// `LET a, b = e1, e2` in statement position.
    Let {
        names: Vec<String>,
        initializers: Vec<Expr>,
        is_float: bool,
    },
    Assignment {
        lhs: Vec<Expr>,
        rhs: Vec<Expr>,
    },
    RoutineCall {
        routine: Expr,
        arguments: Vec<Expr>,
    },
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
    },
    Unless {
        condition: Expr,
        then_branch: Box<Stmt>,
    },
    Test {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Box<Stmt>,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
    },
    Until {
        condition: Expr,
        body: Box<Stmt>,
    },
    Repeat {
        kind: RepeatKind,
        body: Box<Stmt>,
        condition: Option<Expr>,
    },
    For {
        loop_variable: String,
        /// Unique internal name, `<orig>_for_var_<n>`, assigned by the analyzer.
        unique_loop_variable: Option<String>,
        unique_step_variable: Option<String>,
        unique_end_variable: Option<String>,
        start: Expr,
        end: Expr,
        step: Option<Expr>,
        body: Box<Stmt>,
    },
    ForEach {
        /// The element value variable.
        value_name: String,
        /// Two-variable form: the node-pointer variable.
        pointer_name: Option<String>,
        collection: Expr,
        /// Element type inferred by the analyzer, consumed by the CFG builder.
        element_type: VarType,
        /// Inferred type of the collection itself; decides the list-cursor
        /// versus indexed lowering.
        collection_type: VarType,
        body: Box<Stmt>,
    },
    Switchon {
        expression: Expr,
        cases: Vec<CaseArm>,
        default_case: Option<Box<Stmt>>,
    },
    Goto(Expr),
    Return,
    Finish,
    Break,
    Loop,
    Endcase,
    /// `BRK` — debugger breakpoint.
    Brk,
    Resultis(Expr),
    Compound(Vec<Stmt>),
    Block {
        declarations: Vec<Decl>,
        statements: Vec<Stmt>,
    },
    /// `FREE e` — release a heap list.
    Free(Expr),
    /// A named jump target inside a function body.
    LabelTarget(String),
    /// Low-level compare-and-branch emitted by the CFG builder.
    CondBranch {
        condition: BranchCondition,
        target: String,
        expr: Expr,
    },
}

impl Stmt {
    /// Whether this statement transfers control away from the current block.
    pub fn ends_control_flow(&self) -> bool {
        matches!(
            self,
            Stmt::Return
                | Stmt::Finish
                | Stmt::Goto(_)
                | Stmt::Break
                | Stmt::Loop
                | Stmt::Endcase
                | Stmt::Resultis(_)
                | Stmt::CondBranch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_is_deep() {
        let original = Stmt::While {
            condition: Expr::Binary {
                op: BinaryOperator::Less,
                left: Box::new(Expr::variable("i")),
                right: Box::new(Expr::integer(10)),
            },
            body: Box::new(Stmt::Assignment {
                lhs: vec![Expr::variable("i")],
                rhs: vec![Expr::Binary {
                    op: BinaryOperator::Add,
                    left: Box::new(Expr::variable("i")),
                    right: Box::new(Expr::integer(1)),
                }],
            }),
        };

        let mut copy = original.clone();
        if let Stmt::While { condition, .. } = &mut copy {
            *condition = Expr::BooleanLit(true);
        }
        // The original condition is untouched.
        assert!(matches!(original, Stmt::While { condition: Expr::Binary { .. }, .. }));
    }

    #[test]
    fn test_effective_variable_name() {
        let plain = Expr::variable("i");
        assert_eq!(plain.variable_name(), Some("i"));

        let renamed = Expr::Variable {
            name: "i".to_string(),
            unique_name: Some("i_for_var_3".to_string()),
        };
        assert_eq!(renamed.variable_name(), Some("i_for_var_3"));
    }

    #[test]
    fn test_commutativity_table() {
        assert!(BinaryOperator::Add.is_commutative());
        assert!(BinaryOperator::Multiply.is_commutative());
        assert!(!BinaryOperator::Subtract.is_commutative());
        assert!(!BinaryOperator::LeftShift.is_commutative());
    }

    #[test]
    fn test_control_flow_enders() {
        assert!(Stmt::Return.ends_control_flow());
        assert!(Stmt::Resultis(Expr::integer(0)).ends_control_flow());
        assert!(!Stmt::Compound(vec![]).ends_control_flow());
    }
}
