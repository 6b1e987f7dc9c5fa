use serde::{Deserialize, Serialize};

use crate::span::Span;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Program {
    pub server: Option<ServerDecl>,
    pub schema: Option<SchemaDecl>,
    pub routes: Vec<Route>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StringLit {
    pub value: String,
    pub span: Span,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerDecl {
    pub entries: Vec<ServerEntry>,
    pub span: Span,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerEntry {
    pub key: Ident,
    pub value: Expr,
    pub span: Span,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaDecl {
    pub sql: String,
    pub span: Span,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "PATCH" => Some(Method::Patch),
            "DELETE" => Some(Method::Delete),
            "HEAD" => Some(Method::Head),
            "OPTIONS" => Some(Method::Options),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Route {
    pub method: Method,
    pub path: StringLit,
    pub bindings: Vec<Binding>,
    pub status: Option<Expr>,
    pub ret: ReturnDecl,
    pub span: Span,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Binding {
    pub name: Ident,
    pub expr: Expr,
    pub span: Span,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ReturnFormat {
    Json,
    Html,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReturnDecl {
    pub format: ReturnFormat,
    pub expr: Expr,
    pub span: Span,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ExprKind {
    Literal(Literal),
    /// `{...}` object literal; values may be arbitrary expressions.
    Object(Vec<(String, Expr)>),
    /// `[...]` array literal.
    Array(Vec<Expr>),
    /// `param(:name)` route capture lookup.
    Param(String),
    /// `query(name)` URL query parameter lookup.
    Query(String),
    /// `body(name)` request body field lookup.
    Body(String),
    /// `header(name)` case-insensitive request header lookup.
    Header(String),
    /// `var(--name)` or bare `--name`.
    VarRef(String),
    /// `env(NAME, default)`, resolved at load time.
    Env {
        name: String,
        default: Option<Box<Expr>>,
    },
    /// `sql("template", args...)`; templates are static strings so the
    /// prepared-statement cache can key on them.
    Sql {
        template: String,
        args: Vec<Expr>,
    },
    If {
        arms: Vec<(Cond, Expr)>,
        else_arm: Option<Box<Expr>>,
    },
    Json(Box<Expr>),
    Html(Box<Expr>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Null,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cond {
    pub kind: CondKind,
    pub span: Span,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CondKind {
    Truthy(String),
    Cmp {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Cond>, Box<Cond>),
    Or(Box<Cond>, Box<Cond>),
    Not(Box<Cond>),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}
