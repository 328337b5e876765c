//! Lexer for BCPL source text.
//!
//! Built on the logos library. Keywords are case-sensitive upper case as in
//! classic BCPL; `$(`/`$)` and `{`/`}` both delimit sections. String and
//! character escapes accept both the BCPL `*` forms (`*N`, `*T`, `*"`) and
//! C-style `\` forms. `#` prefixes radix literals (`#x1F`, `#b101`, `#17`)
//! and also forms the explicit float operators (`#+`, `#<`, `#!`, ...).

use logos::Logos;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("lex error at byte {offset}: {message}")]
pub struct LexError {
    pub message: String,
    pub offset: usize,
}

/// One BCPL token.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"\|\|[^\n]*")]
pub enum Token {
    #[regex(r"/\*", lex_block_comment)]
    BlockComment,

    // --- Declaration keywords ---
    #[token("LET")]
    Let,
    #[token("FLET")]
    Flet,
    #[token("AND")]
    And,
    #[token("BE")]
    Be,
    #[token("MANIFEST")]
    Manifest,
    #[token("STATIC")]
    Static,
    #[token("GLOBAL")]
    Global,

    // --- Statement keywords ---
    #[token("VALOF")]
    Valof,
    #[token("FVALOF")]
    Fvalof,
    #[token("RESULTIS")]
    Resultis,
    #[token("RETURN")]
    Return,
    #[token("FINISH")]
    Finish,
    #[token("IF")]
    If,
    #[token("UNLESS")]
    Unless,
    #[token("TEST")]
    Test,
    #[token("THEN")]
    Then,
    #[token("ELSE")]
    Else,
    #[token("DO")]
    Do,
    #[token("OR")]
    Or,
    #[token("WHILE")]
    While,
    #[token("UNTIL")]
    Until,
    #[token("REPEAT")]
    Repeat,
    #[token("REPEATWHILE")]
    RepeatWhile,
    #[token("REPEATUNTIL")]
    RepeatUntil,
    #[token("FOR")]
    For,
    #[token("TO")]
    To,
    #[token("BY")]
    By,
    #[token("FOREACH")]
    ForEach,
    #[token("IN")]
    In,
    #[token("SWITCHON")]
    Switchon,
    #[token("INTO")]
    Into,
    #[token("CASE")]
    Case,
    #[token("DEFAULT")]
    Default,
    #[token("ENDCASE")]
    Endcase,
    #[token("GOTO")]
    Goto,
    #[token("BREAK")]
    Break,
    #[token("LOOP")]
    Loop,
    #[token("BRK")]
    Brk,
    #[token("FREE")]
    Free,

    // --- Value keywords ---
    #[token("VEC")]
    Vec,
    #[token("STRINGV")]
    StringAlloc,
    #[token("TABLE")]
    Table,
    #[token("FTABLE")]
    FloatTable,
    #[token("LIST")]
    List,
    #[token("MANIFESTLIST")]
    ManifestList,
    #[token("TRUE")]
    True,
    #[token("FALSE")]
    False,
    #[token("SYSCALL")]
    SysCall,

    // --- Operator keywords ---
    #[token("REM")]
    Rem,
    #[token("EQV")]
    Eqv,
    #[token("NEQV")]
    Neqv,
    #[token("FLOAT")]
    FloatConvert,
    #[token("LEN")]
    Len,
    #[token("HD")]
    Hd,
    #[token("TL")]
    Tl,

    // --- Punctuation ---
    #[token("$(")]
    #[token("{")]
    SectionOpen,
    #[token("$)")]
    #[token("}")]
    SectionClose,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
    #[token(":")]
    Colon,
    #[token(":=")]
    Assign,
    #[token("->")]
    Arrow,

    // --- Integer operators ---
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("=")]
    Eq,
    #[token("~=")]
    Ne,
    #[token("<=")]
    Le,
    #[token("<")]
    Lt,
    #[token(">=")]
    Ge,
    #[token(">")]
    Gt,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("&")]
    Amp,
    #[token("|")]
    Bar,
    #[token("~")]
    Tilde,
    #[token("@")]
    At,
    #[token("!")]
    Bang,
    #[token("%")]
    Percent,

    // --- Explicit float operators ---
    #[token("#+")]
    FPlus,
    #[token("#-")]
    FMinus,
    #[token("#*")]
    FStar,
    #[token("#/")]
    FSlash,
    #[token("#=")]
    FEq,
    #[token("#~=")]
    FNe,
    #[token("#<=")]
    FLe,
    #[token("#<")]
    FLt,
    #[token("#>=")]
    FGe,
    #[token("#>")]
    FGt,
    #[token("#!")]
    FBang,

    // --- Literals ---
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    FloatLit(f64),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    #[regex(r"#[xX][0-9a-fA-F]+", |lex| i64::from_str_radix(&lex.slice()[2..], 16).ok())]
    #[regex(r"#[bB][01]+", |lex| i64::from_str_radix(&lex.slice()[2..], 2).ok())]
    #[regex(r"#[0-7]+", |lex| i64::from_str_radix(&lex.slice()[1..], 8).ok())]
    IntLit(i64),

    #[regex(r#""([^"*\\]|\*.|\\.)*""#, lex_string)]
    StringLit(String),

    #[regex(r"'([^'*\\]|\*.|\\.)'", lex_char)]
    CharLit(u32),

    #[regex(r"[A-Za-z_][A-Za-z0-9_.]*", |lex| lex.slice().to_string())]
    Ident(String),
}

fn lex_block_comment(lex: &mut logos::Lexer<Token>) -> logos::FilterResult<(), ()> {
    let remainder = lex.remainder();
    match remainder.find("*/") {
        Some(end) => {
            lex.bump(end + 2);
            logos::FilterResult::Skip
        }
        None => logos::FilterResult::Error(()),
    }
}

fn unescape(ch: char) -> u32 {
    match ch.to_ascii_uppercase() {
        'N' => '\n' as u32,
        'T' => '\t' as u32,
        'S' => ' ' as u32,
        'B' => 0x08,
        'P' => 0x0C,
        'C' => '\r' as u32,
        'E' => 0x1B,
        '0' => 0,
        _ => ch as u32,
    }
}

fn lex_string(lex: &mut logos::Lexer<Token>) -> Option<String> {
    let raw = lex.slice();
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::new();
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' | '\\' => {
                let esc = chars.next()?;
                match esc {
                    '*' if c == '*' => out.push('*'),
                    '\\' if c == '\\' => out.push('\\'),
                    'n' if c == '\\' => out.push('\n'),
                    't' if c == '\\' => out.push('\t'),
                    'r' if c == '\\' => out.push('\r'),
                    '"' => out.push('"'),
                    _ => out.push(char::from_u32(unescape(esc))?),
                }
            }
            _ => out.push(c),
        }
    }
    Some(out)
}

fn lex_char(lex: &mut logos::Lexer<Token>) -> Option<u32> {
    let raw = lex.slice();
    let inner = &raw[1..raw.len() - 1];
    let mut chars = inner.chars();
    let first = chars.next()?;
    if first == '*' || first == '\\' {
        let esc = chars.next()?;
        Some(match esc {
            'n' if first == '\\' => '\n' as u32,
            't' if first == '\\' => '\t' as u32,
            _ => unescape(esc),
        })
    } else {
        Some(first as u32)
    }
}

/// A token paired with its byte offset in the source.
pub type SpannedToken = (Token, usize);

/// Tokenize a whole source file.
pub fn lex(source: &str) -> Result<Vec<SpannedToken>, LexError> {
    let mut out = Vec::new();
    let mut lexer = Token::lexer(source);
    while let Some(result) = lexer.next() {
        let offset = lexer.span().start;
        match result {
            Ok(Token::BlockComment) => {}
            Ok(token) => out.push((token, offset)),
            Err(()) => {
                return Err(LexError {
                    message: format!("unrecognized input {:?}", lexer.slice()),
                    offset,
                })
            }
        }
    }
    log::trace!("lexed {} tokens", out.len());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        lex(source).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_keywords_and_sections() {
        assert_eq!(
            kinds("LET START() BE $( FINISH $)"),
            vec![
                Token::Let,
                Token::Ident("START".to_string()),
                Token::LParen,
                Token::RParen,
                Token::Be,
                Token::SectionOpen,
                Token::Finish,
                Token::SectionClose,
            ]
        );
    }

    #[test]
    fn test_braces_are_sections() {
        assert_eq!(
            kinds("{ RETURN }"),
            vec![Token::SectionOpen, Token::Return, Token::SectionClose]
        );
    }

    #[test]
    fn test_radix_literals() {
        assert_eq!(kinds("#x1F"), vec![Token::IntLit(31)]);
        assert_eq!(kinds("#b101"), vec![Token::IntLit(5)]);
        assert_eq!(kinds("#17"), vec![Token::IntLit(15)]);
        assert_eq!(kinds("42"), vec![Token::IntLit(42)]);
    }

    #[test]
    fn test_float_operators_vs_radix() {
        assert_eq!(
            kinds("a #+ b"),
            vec![
                Token::Ident("a".to_string()),
                Token::FPlus,
                Token::Ident("b".to_string()),
            ]
        );
        assert_eq!(kinds("1.5"), vec![Token::FloatLit(1.5)]);
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""hi*n""#),
            vec![Token::StringLit("hi\n".to_string())]
        );
        assert_eq!(
            kinds(r#""a\nb""#),
            vec![Token::StringLit("a\nb".to_string())]
        );
    }

    #[test]
    fn test_char_literal_is_code_point() {
        assert_eq!(kinds("'A'"), vec![Token::CharLit(65)]);
        assert_eq!(kinds("'*n'"), vec![Token::CharLit(10)]);
    }

    #[test]
    fn test_assign_vs_colon() {
        assert_eq!(
            kinds("x := 1"),
            vec![
                Token::Ident("x".to_string()),
                Token::Assign,
                Token::IntLit(1),
            ]
        );
        assert_eq!(
            kinds("lab: RETURN"),
            vec![
                Token::Ident("lab".to_string()),
                Token::Colon,
                Token::Return,
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("1 // line\n/* block */ 2"),
            vec![Token::IntLit(1), Token::IntLit(2)]
        );
    }
}
