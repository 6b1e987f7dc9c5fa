use crate::span::Span;

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    Ident(String),
    /// `--name`, stored without the leading dashes.
    Var(String),
    /// `@name`, stored without the `@`.
    At(String),
    /// Verbatim `@database` body, braces stripped.
    RawBlock(String),
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    Keyword(Keyword),
    Punct(Punct),
    Eof,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Keyword {
    And,
    Or,
    Not,
    Else,
}

impl Keyword {
    pub fn from_str(text: &str) -> Option<Self> {
        match text {
            "and" => Some(Keyword::And),
            "or" => Some(Keyword::Or),
            "not" => Some(Keyword::Not),
            "else" => Some(Keyword::Else),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Punct {
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Colon,
    Semi,
    Comma,
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
}

#[derive(Clone, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}
