//! Recursive-descent parser producing the `bcpl-ast` tree.
//!
//! Statements are self-delimiting; semicolons are accepted and ignored
//! anywhere a statement boundary is legal. Declarations and commands follow
//! the classic BCPL grammar: `LET f(a, b) = E` is a function, `LET r() BE C`
//! a routine, and any other `LET` a variable binding.

use crate::lexer::{SpannedToken, Token};
use bcpl_ast::{
    BinaryOperator, CaseArm, Decl, Expr, NumberLiteral, Program, RepeatKind, Stmt, UnaryOperator,
    VarType,
};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("parse error at byte {offset}: {message}")]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
}

/// Parse a token stream into a `Program`.
pub fn parse_program(tokens: &[SpannedToken]) -> Result<Program, ParseError> {
    let mut parser = Parser::new(tokens);
    let mut program = Program::default();
    while !parser.at_end() {
        parser.skip_semicolons();
        if parser.at_end() {
            break;
        }
        let decls = parser.parse_declaration()?;
        program.declarations.extend(decls);
    }
    Ok(program)
}

struct Parser<'a> {
    tokens: &'a [SpannedToken],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [SpannedToken]) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, o)| *o)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    fn accept(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ParseError> {
        if self.accept(&token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}, found {:?}", token, self.peek())))
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.advance() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(self.error(format!("expected identifier, found {:?}", other))),
        }
    }

    fn error(&self, message: String) -> ParseError {
        ParseError {
            message,
            offset: self.offset(),
        }
    }

    fn skip_semicolons(&mut self) {
        while self.accept(&Token::Semicolon) {}
    }

    // --- Declarations ---

    fn parse_declaration(&mut self) -> Result<Vec<Decl>, ParseError> {
        match self.peek() {
            Some(Token::Manifest) => self.parse_manifest(),
            Some(Token::Static) => self.parse_static(),
            Some(Token::Global) => self.parse_global(),
            Some(Token::Let) | Some(Token::Flet) | Some(Token::And) => {
                let is_float = self.check(&Token::Flet);
                self.advance();
                self.parse_let_declaration(is_float)
            }
            other => Err(self.error(format!("expected a declaration, found {:?}", other))),
        }
    }

    fn parse_manifest(&mut self) -> Result<Vec<Decl>, ParseError> {
        self.expect(Token::Manifest)?;
        self.expect(Token::SectionOpen)?;
        let mut decls = Vec::new();
        loop {
            self.skip_semicolons();
            if self.accept(&Token::SectionClose) {
                break;
            }
            let name = self.expect_ident()?;
            self.expect(Token::Eq)?;
            let value = self.parse_constant_integer()?;
            decls.push(Decl::Manifest { name, value });
        }
        Ok(decls)
    }

    /// A manifest value must fold to an integer at parse time: literals,
    /// negation, and char literals are enough for the sources we accept.
    fn parse_constant_integer(&mut self) -> Result<i64, ParseError> {
        let negative = self.accept(&Token::Minus);
        let value = match self.advance() {
            Some(Token::IntLit(v)) => v,
            Some(Token::CharLit(c)) => c as i64,
            Some(Token::True) => -1,
            Some(Token::False) => 0,
            other => return Err(self.error(format!("expected constant, found {:?}", other))),
        };
        Ok(if negative { -value } else { value })
    }

    fn parse_static(&mut self) -> Result<Vec<Decl>, ParseError> {
        self.expect(Token::Static)?;
        self.expect(Token::SectionOpen)?;
        let mut decls = Vec::new();
        loop {
            self.skip_semicolons();
            if self.accept(&Token::SectionClose) {
                break;
            }
            let name = self.expect_ident()?;
            self.expect(Token::Eq)?;
            let initializer = self.parse_expression()?;
            decls.push(Decl::Static { name, initializer });
        }
        Ok(decls)
    }

    fn parse_global(&mut self) -> Result<Vec<Decl>, ParseError> {
        self.expect(Token::Global)?;
        self.expect(Token::SectionOpen)?;
        let mut entries = Vec::new();
        loop {
            self.skip_semicolons();
            if self.accept(&Token::SectionClose) {
                break;
            }
            let name = self.expect_ident()?;
            self.expect(Token::Colon)?;
            let slot = match self.advance() {
                Some(Token::IntLit(v)) if v >= 0 => v as usize,
                other => return Err(self.error(format!("expected slot number, found {:?}", other))),
            };
            entries.push((name, slot));
        }
        Ok(vec![Decl::Global { entries }])
    }

    fn parse_let_declaration(&mut self, is_float: bool) -> Result<Vec<Decl>, ParseError> {
        // LET name ( ... is function-like; anything else binds variables.
        if matches!(self.peek(), Some(Token::Ident(_)))
            && self.peek_at(1) == Some(&Token::LParen)
        {
            let name = self.expect_ident()?;
            self.expect(Token::LParen)?;
            let mut parameters = Vec::new();
            if !self.accept(&Token::RParen) {
                loop {
                    parameters.push(self.expect_ident()?);
                    if !self.accept(&Token::Comma) {
                        break;
                    }
                }
                self.expect(Token::RParen)?;
            }
            if self.accept(&Token::Be) {
                let body = self.parse_statement()?;
                return Ok(vec![Decl::Routine {
                    name,
                    parameters,
                    body,
                }]);
            }
            self.expect(Token::Eq)?;
            let body = self.parse_expression()?;
            return Ok(vec![Decl::Function {
                name,
                parameters,
                body,
                returns_float: is_float,
            }]);
        }

        // Top-level variable LET: globals with initializers.
        let mut names = vec![self.expect_ident()?];
        while self.accept(&Token::Comma) {
            names.push(self.expect_ident()?);
        }
        self.expect(Token::Eq)?;
        let mut initializers = vec![self.parse_expression()?];
        while self.accept(&Token::Comma) {
            initializers.push(self.parse_expression()?);
        }
        Ok(vec![Decl::GlobalVariable {
            names,
            initializers,
            is_float,
        }])
    }

    // --- Statements ---

    fn parse_statement(&mut self) -> Result<Stmt, ParseError> {
        let stmt = self.parse_statement_no_repeat()?;
        self.parse_repeat_suffix(stmt)
    }

    /// `C REPEAT`, `C REPEATWHILE E`, `C REPEATUNTIL E` are postfix.
    fn parse_repeat_suffix(&mut self, stmt: Stmt) -> Result<Stmt, ParseError> {
        let mut stmt = stmt;
        loop {
            if self.accept(&Token::Repeat) {
                stmt = Stmt::Repeat {
                    kind: RepeatKind::Repeat,
                    body: Box::new(stmt),
                    condition: None,
                };
            } else if self.accept(&Token::RepeatWhile) {
                let condition = self.parse_expression()?;
                stmt = Stmt::Repeat {
                    kind: RepeatKind::RepeatWhile,
                    body: Box::new(stmt),
                    condition: Some(condition),
                };
            } else if self.accept(&Token::RepeatUntil) {
                let condition = self.parse_expression()?;
                stmt = Stmt::Repeat {
                    kind: RepeatKind::RepeatUntil,
                    body: Box::new(stmt),
                    condition: Some(condition),
                };
            } else {
                return Ok(stmt);
            }
        }
    }

    fn parse_statement_no_repeat(&mut self) -> Result<Stmt, ParseError> {
        match self.peek() {
            Some(Token::SectionOpen) => self.parse_block(),
            Some(Token::If) => {
                self.advance();
                let condition = self.parse_expression()?;
                self.accept_then_or_do();
                let then_branch = Box::new(self.parse_statement()?);
                Ok(Stmt::If {
                    condition,
                    then_branch,
                })
            }
            Some(Token::Unless) => {
                self.advance();
                let condition = self.parse_expression()?;
                self.accept_then_or_do();
                let then_branch = Box::new(self.parse_statement()?);
                Ok(Stmt::Unless {
                    condition,
                    then_branch,
                })
            }
            Some(Token::Test) => {
                self.advance();
                let condition = self.parse_expression()?;
                self.accept_then_or_do();
                let then_branch = Box::new(self.parse_statement()?);
                if !self.accept(&Token::Else) {
                    self.expect(Token::Or)?;
                }
                let else_branch = Box::new(self.parse_statement()?);
                Ok(Stmt::Test {
                    condition,
                    then_branch,
                    else_branch,
                })
            }
            Some(Token::While) => {
                self.advance();
                let condition = self.parse_expression()?;
                self.accept_then_or_do();
                let body = Box::new(self.parse_statement()?);
                Ok(Stmt::While { condition, body })
            }
            Some(Token::Until) => {
                self.advance();
                let condition = self.parse_expression()?;
                self.accept_then_or_do();
                let body = Box::new(self.parse_statement()?);
                Ok(Stmt::Until { condition, body })
            }
            Some(Token::For) => {
                self.advance();
                let loop_variable = self.expect_ident()?;
                self.expect(Token::Eq)?;
                let start = self.parse_expression()?;
                self.expect(Token::To)?;
                let end = self.parse_expression()?;
                let step = if self.accept(&Token::By) {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                self.accept_then_or_do();
                let body = Box::new(self.parse_statement()?);
                Ok(Stmt::For {
                    loop_variable,
                    unique_loop_variable: None,
                    unique_step_variable: None,
                    unique_end_variable: None,
                    start,
                    end,
                    step,
                    body,
                })
            }
            Some(Token::ForEach) => {
                self.advance();
                let value_name = self.expect_ident()?;
                let pointer_name = if self.accept(&Token::Comma) {
                    Some(self.expect_ident()?)
                } else {
                    None
                };
                self.expect(Token::In)?;
                let collection = self.parse_expression()?;
                self.accept_then_or_do();
                let body = Box::new(self.parse_statement()?);
                Ok(Stmt::ForEach {
                    value_name,
                    pointer_name,
                    collection,
                    element_type: VarType::UNKNOWN,
                    collection_type: VarType::UNKNOWN,
                    body,
                })
            }
            Some(Token::Switchon) => self.parse_switchon(),
            Some(Token::Goto) => {
                self.advance();
                let target = self.parse_expression()?;
                Ok(Stmt::Goto(target))
            }
            Some(Token::Resultis) => {
                self.advance();
                let expr = self.parse_expression()?;
                Ok(Stmt::Resultis(expr))
            }
            Some(Token::Return) => {
                self.advance();
                Ok(Stmt::Return)
            }
            Some(Token::Finish) => {
                self.advance();
                Ok(Stmt::Finish)
            }
            Some(Token::Break) => {
                self.advance();
                Ok(Stmt::Break)
            }
            Some(Token::Loop) => {
                self.advance();
                Ok(Stmt::Loop)
            }
            Some(Token::Endcase) => {
                self.advance();
                Ok(Stmt::Endcase)
            }
            Some(Token::Brk) => {
                self.advance();
                Ok(Stmt::Brk)
            }
            Some(Token::Free) => {
                self.advance();
                let expr = self.parse_expression()?;
                Ok(Stmt::Free(expr))
            }
            Some(Token::Let) | Some(Token::Flet) => {
                let is_float = self.check(&Token::Flet);
                self.advance();
                self.parse_let_statement(is_float)
            }
            // `name:` introduces a jump target.
            Some(Token::Ident(_)) if self.peek_at(1) == Some(&Token::Colon) => {
                let name = self.expect_ident()?;
                self.expect(Token::Colon)?;
                Ok(Stmt::LabelTarget(name))
            }
            _ => self.parse_assignment_or_call(),
        }
    }

    fn accept_then_or_do(&mut self) {
        if !self.accept(&Token::Then) {
            self.accept(&Token::Do);
        }
    }

    fn parse_let_statement(&mut self, is_float: bool) -> Result<Stmt, ParseError> {
        let mut names = vec![self.expect_ident()?];
        while self.accept(&Token::Comma) {
            names.push(self.expect_ident()?);
        }
        self.expect(Token::Eq)?;
        let mut initializers = vec![self.parse_expression()?];
        while self.accept(&Token::Comma) {
            initializers.push(self.parse_expression()?);
        }
        Ok(Stmt::Let {
            names,
            initializers,
            is_float,
        })
    }

    fn parse_block(&mut self) -> Result<Stmt, ParseError> {
        self.expect(Token::SectionOpen)?;
        let mut declarations = Vec::new();
        let mut statements = Vec::new();
        loop {
            self.skip_semicolons();
            if self.accept(&Token::SectionClose) {
                break;
            }
            // Nested function/routine declarations land in the block's
            // declaration list; variable LETs execute in sequence.
            if matches!(self.peek(), Some(Token::Let) | Some(Token::Flet))
                && matches!(self.peek_at(1), Some(Token::Ident(_)))
                && self.peek_at(2) == Some(&Token::LParen)
            {
                let is_float = self.check(&Token::Flet);
                self.advance();
                declarations.extend(self.parse_let_declaration(is_float)?);
                continue;
            }
            if matches!(self.peek(), Some(Token::Manifest)) {
                declarations.extend(self.parse_manifest()?);
                continue;
            }
            statements.push(self.parse_statement()?);
        }
        Ok(Stmt::Block {
            declarations,
            statements,
        })
    }

    fn parse_switchon(&mut self) -> Result<Stmt, ParseError> {
        self.expect(Token::Switchon)?;
        let expression = self.parse_expression()?;
        self.expect(Token::Into)?;
        self.expect(Token::SectionOpen)?;

        let mut cases: Vec<CaseArm> = Vec::new();
        let mut default_case: Option<Box<Stmt>> = None;
        let mut current: Option<(Option<Expr>, Vec<Stmt>)> = None;

        loop {
            self.skip_semicolons();
            if self.accept(&Token::SectionClose) {
                break;
            }
            if self.accept(&Token::Case) {
                if let Some(arm) = current.take() {
                    Self::push_arm(&mut cases, &mut default_case, arm);
                }
                let constant = self.parse_expression()?;
                self.expect(Token::Colon)?;
                current = Some((Some(constant), Vec::new()));
            } else if self.accept(&Token::Default) {
                if let Some(arm) = current.take() {
                    Self::push_arm(&mut cases, &mut default_case, arm);
                }
                self.expect(Token::Colon)?;
                current = Some((None, Vec::new()));
            } else {
                let stmt = self.parse_statement()?;
                match &mut current {
                    Some((_, body)) => body.push(stmt),
                    None => {
                        return Err(
                            self.error("statement before first CASE in SWITCHON".to_string())
                        )
                    }
                }
            }
        }
        if let Some(arm) = current.take() {
            Self::push_arm(&mut cases, &mut default_case, arm);
        }

        Ok(Stmt::Switchon {
            expression,
            cases,
            default_case,
        })
    }

    fn push_arm(
        cases: &mut Vec<CaseArm>,
        default_case: &mut Option<Box<Stmt>>,
        (constant, body): (Option<Expr>, Vec<Stmt>),
    ) {
        let command = Box::new(Stmt::Compound(body));
        match constant {
            Some(constant) => cases.push(CaseArm {
                constant,
                resolved_value: None,
                command,
            }),
            None => *default_case = Some(command),
        }
    }

    fn parse_assignment_or_call(&mut self) -> Result<Stmt, ParseError> {
        let first = self.parse_expression()?;

        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            let mut lhs = vec![first];
            while self.accept(&Token::Comma) {
                lhs.push(self.parse_expression()?);
            }
            self.expect(Token::Assign)?;
            let mut rhs = vec![self.parse_expression()?];
            while self.accept(&Token::Comma) {
                rhs.push(self.parse_expression()?);
            }
            if lhs.len() != rhs.len() {
                return Err(self.error(format!(
                    "assignment arity mismatch: {} targets, {} values",
                    lhs.len(),
                    rhs.len()
                )));
            }
            return Ok(Stmt::Assignment { lhs, rhs });
        }

        match first {
            Expr::Call {
                function,
                arguments,
            } => Ok(Stmt::RoutineCall {
                routine: *function,
                arguments,
            }),
            Expr::SysCall { number, arguments } => Ok(Stmt::RoutineCall {
                routine: Expr::SysCall { number, arguments },
                arguments: vec![],
            }),
            other => Err(self.error(format!(
                "expression {:?} is not a statement",
                other
            ))),
        }
    }

    // --- Expressions, by descending precedence ---

    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.parse_conditional()
    }

    fn parse_conditional(&mut self) -> Result<Expr, ParseError> {
        let condition = self.parse_or()?;
        if self.accept(&Token::Arrow) {
            let true_expr = self.parse_conditional()?;
            self.expect(Token::Comma)?;
            let false_expr = self.parse_conditional()?;
            return Ok(Expr::Conditional {
                condition: Box::new(condition),
                true_expr: Box::new(true_expr),
                false_expr: Box::new(false_expr),
            });
        }
        Ok(condition)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.accept(&Token::Bar) {
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOperator::LogicalOr,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_equiv()?;
        while self.accept(&Token::Amp) {
            let right = self.parse_equiv()?;
            left = Expr::Binary {
                op: BinaryOperator::LogicalAnd,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_equiv(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_relation()?;
        loop {
            let op = if self.accept(&Token::Eqv) {
                BinaryOperator::Equivalence
            } else if self.accept(&Token::Neqv) {
                BinaryOperator::NotEquivalence
            } else {
                return Ok(left);
            };
            let right = self.parse_relation()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_relation(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_shift()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOperator::Equal,
                Some(Token::Ne) => BinaryOperator::NotEqual,
                Some(Token::Lt) => BinaryOperator::Less,
                Some(Token::Le) => BinaryOperator::LessEqual,
                Some(Token::Gt) => BinaryOperator::Greater,
                Some(Token::Ge) => BinaryOperator::GreaterEqual,
                Some(Token::FEq) => BinaryOperator::FloatEqual,
                Some(Token::FNe) => BinaryOperator::FloatNotEqual,
                Some(Token::FLt) => BinaryOperator::FloatLess,
                Some(Token::FLe) => BinaryOperator::FloatLessEqual,
                Some(Token::FGt) => BinaryOperator::FloatGreater,
                Some(Token::FGe) => BinaryOperator::FloatGreaterEqual,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_shift()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_shift(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Shl) => BinaryOperator::LeftShift,
                Some(Token::Shr) => BinaryOperator::RightShift,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOperator::Add,
                Some(Token::Minus) => BinaryOperator::Subtract,
                Some(Token::FPlus) => BinaryOperator::FloatAdd,
                Some(Token::FMinus) => BinaryOperator::FloatSubtract,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOperator::Multiply,
                Some(Token::Slash) => BinaryOperator::Divide,
                Some(Token::Rem) => BinaryOperator::Remainder,
                Some(Token::FStar) => BinaryOperator::FloatMultiply,
                Some(Token::FSlash) => BinaryOperator::FloatDivide,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            Some(Token::Minus) => Some(UnaryOperator::Negate),
            Some(Token::Tilde) => Some(UnaryOperator::LogicalNot),
            Some(Token::At) => Some(UnaryOperator::AddressOf),
            Some(Token::Bang) => Some(UnaryOperator::Indirection),
            Some(Token::FloatConvert) => Some(UnaryOperator::FloatConvert),
            Some(Token::Len) => Some(UnaryOperator::LengthOf),
            Some(Token::Hd) => Some(UnaryOperator::HeadOf),
            Some(Token::Tl) => Some(UnaryOperator::TailOf),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Bang) => {
                    self.advance();
                    let index = self.parse_primary_or_unary_index()?;
                    expr = Expr::VectorAccess {
                        vector: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Some(Token::Percent) => {
                    self.advance();
                    let index = self.parse_primary_or_unary_index()?;
                    expr = Expr::CharIndirection {
                        string: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Some(Token::FBang) => {
                    self.advance();
                    let index = self.parse_primary_or_unary_index()?;
                    expr = Expr::FloatVectorAccess {
                        vector: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Some(Token::LParen) => {
                    self.advance();
                    let mut arguments = Vec::new();
                    if !self.accept(&Token::RParen) {
                        loop {
                            arguments.push(self.parse_expression()?);
                            if !self.accept(&Token::Comma) {
                                break;
                            }
                        }
                        self.expect(Token::RParen)?;
                    }
                    expr = Expr::Call {
                        function: Box::new(expr),
                        arguments,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Index position of `!`/`%`: binds tighter than arithmetic, so only a
    /// primary (optionally negated) is consumed.
    fn parse_primary_or_unary_index(&mut self) -> Result<Expr, ParseError> {
        if self.accept(&Token::Minus) {
            let operand = self.parse_primary()?;
            return Ok(Expr::Unary {
                op: UnaryOperator::Negate,
                operand: Box::new(operand),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek().cloned() {
            Some(Token::IntLit(v)) => {
                self.advance();
                Ok(Expr::Number(NumberLiteral::Integer(v)))
            }
            Some(Token::FloatLit(v)) => {
                self.advance();
                Ok(Expr::Number(NumberLiteral::Float(v)))
            }
            Some(Token::StringLit(s)) => {
                self.advance();
                Ok(Expr::StringLit(s))
            }
            Some(Token::CharLit(c)) => {
                self.advance();
                Ok(Expr::CharLit(c))
            }
            Some(Token::True) => {
                self.advance();
                Ok(Expr::BooleanLit(true))
            }
            Some(Token::False) => {
                self.advance();
                Ok(Expr::BooleanLit(false))
            }
            Some(Token::Ident(name)) => {
                self.advance();
                Ok(Expr::variable(name))
            }
            Some(Token::LParen) => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(Token::Valof) => {
                self.advance();
                let body = self.parse_statement()?;
                Ok(Expr::Valof(Box::new(body)))
            }
            Some(Token::Fvalof) => {
                self.advance();
                let body = self.parse_statement()?;
                Ok(Expr::FloatValof(Box::new(body)))
            }
            Some(Token::Vec) => {
                self.advance();
                let size = self.parse_primary()?;
                Ok(Expr::VecAlloc {
                    size: Box::new(size),
                })
            }
            Some(Token::StringAlloc) => {
                self.advance();
                let size = self.parse_primary()?;
                Ok(Expr::StringAlloc {
                    size: Box::new(size),
                })
            }
            Some(Token::Table) | Some(Token::FloatTable) => {
                let is_float = self.check(&Token::FloatTable);
                self.advance();
                let mut initializers = vec![self.parse_expression()?];
                while self.accept(&Token::Comma) {
                    initializers.push(self.parse_expression()?);
                }
                Ok(Expr::Table {
                    initializers,
                    is_float,
                })
            }
            Some(Token::List) | Some(Token::ManifestList) => {
                let is_manifest = self.check(&Token::ManifestList);
                self.advance();
                self.expect(Token::LParen)?;
                let mut initializers = Vec::new();
                if !self.accept(&Token::RParen) {
                    loop {
                        initializers.push(self.parse_expression()?);
                        if !self.accept(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(Token::RParen)?;
                }
                Ok(Expr::ListLit {
                    initializers,
                    is_manifest,
                })
            }
            Some(Token::SysCall) => {
                self.advance();
                self.expect(Token::LParen)?;
                let number = self.parse_expression()?;
                let mut arguments = Vec::new();
                while self.accept(&Token::Comma) {
                    arguments.push(self.parse_expression()?);
                }
                self.expect(Token::RParen)?;
                Ok(Expr::SysCall {
                    number: Box::new(number),
                    arguments,
                })
            }
            other => Err(self.error(format!("expected expression, found {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    fn parse(source: &str) -> Program {
        parse_program(&lex(source).unwrap()).unwrap()
    }

    #[test]
    fn test_routine_declaration() {
        let program = parse(r#"LET START() BE $( WRITES("hi*n"); FINISH $)"#);
        assert_eq!(program.declarations.len(), 1);
        match &program.declarations[0] {
            Decl::Routine { name, body, .. } => {
                assert_eq!(name, "START");
                match body {
                    Stmt::Block { statements, .. } => assert_eq!(statements.len(), 2),
                    other => panic!("expected block, got {:?}", other),
                }
            }
            other => panic!("expected routine, got {:?}", other),
        }
    }

    #[test]
    fn test_function_with_valof() {
        let program = parse("LET F(x) = VALOF $( RESULTIS x*x+x $)");
        match &program.declarations[0] {
            Decl::Function {
                name,
                parameters,
                body,
                ..
            } => {
                assert_eq!(name, "F");
                assert_eq!(parameters, &["x".to_string()]);
                assert!(matches!(body, Expr::Valof(_)));
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let program = parse("LET F(x) = x*x+x");
        let Decl::Function { body, .. } = &program.declarations[0] else {
            panic!()
        };
        // (x*x)+x
        match body {
            Expr::Binary {
                op: BinaryOperator::Add,
                left,
                ..
            } => assert!(matches!(
                **left,
                Expr::Binary {
                    op: BinaryOperator::Multiply,
                    ..
                }
            )),
            other => panic!("unexpected shape {:?}", other),
        }
    }

    #[test]
    fn test_vector_access_binds_tight() {
        let program = parse("LET F(v, i) = v!i + 1");
        let Decl::Function { body, .. } = &program.declarations[0] else {
            panic!()
        };
        match body {
            Expr::Binary {
                op: BinaryOperator::Add,
                left,
                ..
            } => assert!(matches!(**left, Expr::VectorAccess { .. })),
            other => panic!("unexpected shape {:?}", other),
        }
    }

    #[test]
    fn test_for_loop() {
        let program = parse("LET G() BE FOR i = 0 TO 3 DO v!i := i*i");
        let Decl::Routine { body, .. } = &program.declarations[0] else {
            panic!()
        };
        match body {
            Stmt::For {
                loop_variable,
                step,
                body,
                ..
            } => {
                assert_eq!(loop_variable, "i");
                assert!(step.is_none());
                assert!(matches!(**body, Stmt::Assignment { .. }));
            }
            other => panic!("expected FOR, got {:?}", other),
        }
    }

    #[test]
    fn test_switchon_cases_and_default() {
        let program = parse(
            "LET H(x) BE SWITCHON x INTO $( \
               CASE 1: WRITEN(1); ENDCASE \
               CASE 2: WRITEN(2); ENDCASE \
               DEFAULT: WRITEN(0) \
             $)",
        );
        let Decl::Routine { body, .. } = &program.declarations[0] else {
            panic!()
        };
        match body {
            Stmt::Switchon {
                cases,
                default_case,
                ..
            } => {
                assert_eq!(cases.len(), 2);
                assert!(default_case.is_some());
            }
            other => panic!("expected SWITCHON, got {:?}", other),
        }
    }

    #[test]
    fn test_multi_assignment() {
        let program = parse("LET S() BE a, b := 1, 2");
        let Decl::Routine { body, .. } = &program.declarations[0] else {
            panic!()
        };
        match body {
            Stmt::Assignment { lhs, rhs } => {
                assert_eq!(lhs.len(), 2);
                assert_eq!(rhs.len(), 2);
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_repeat_suffix_forms() {
        let program = parse("LET R() BE $( x := x - 1 $) REPEATUNTIL x = 0");
        let Decl::Routine { body, .. } = &program.declarations[0] else {
            panic!()
        };
        assert!(matches!(
            body,
            Stmt::Repeat {
                kind: RepeatKind::RepeatUntil,
                condition: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn test_foreach_two_variable_form() {
        let program = parse("LET P(l) BE FOREACH v, n IN l DO WRITEN(v)");
        let Decl::Routine { body, .. } = &program.declarations[0] else {
            panic!()
        };
        match body {
            Stmt::ForEach {
                value_name,
                pointer_name,
                ..
            } => {
                assert_eq!(value_name, "v");
                assert_eq!(pointer_name.as_deref(), Some("n"));
            }
            other => panic!("expected FOREACH, got {:?}", other),
        }
    }

    #[test]
    fn test_conditional_expression() {
        let program = parse("LET M(a, b) = a > b -> a, b");
        let Decl::Function { body, .. } = &program.declarations[0] else {
            panic!()
        };
        assert!(matches!(body, Expr::Conditional { .. }));
    }

    #[test]
    fn test_list_literal_and_manifest_list() {
        let program = parse("LET L() = LIST(1, 2, 3)");
        let Decl::Function { body, .. } = &program.declarations[0] else {
            panic!()
        };
        match body {
            Expr::ListLit {
                initializers,
                is_manifest,
            } => {
                assert_eq!(initializers.len(), 3);
                assert!(!is_manifest);
            }
            other => panic!("expected list literal, got {:?}", other),
        }
    }

    #[test]
    fn test_goto_and_label() {
        let program = parse("LET T() BE $( GOTO out; WRITEN(1); out: RETURN $)");
        let Decl::Routine { body, .. } = &program.declarations[0] else {
            panic!()
        };
        let Stmt::Block { statements, .. } = body else {
            panic!()
        };
        assert!(matches!(statements[0], Stmt::Goto(_)));
        assert!(matches!(statements[2], Stmt::LabelTarget(_)));
    }

    #[test]
    fn test_manifest_block() {
        let program = parse("MANIFEST $( SIZE = 10; FLAG = #x1F $) LET F() = SIZE");
        assert!(matches!(
            program.declarations[0],
            Decl::Manifest { ref name, value: 10 } if name == "SIZE"
        ));
        assert!(matches!(
            program.declarations[1],
            Decl::Manifest { value: 31, .. }
        ));
    }
}
