use crate::ast::*;
use crate::diag::Diagnostics;
use crate::span::Span;
use crate::token::{Keyword, Punct, Token, TokenKind};

pub struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    diags: &'a mut Diagnostics,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token], diags: &'a mut Diagnostics) -> Self {
        Self {
            tokens,
            pos: 0,
            diags,
        }
    }

    pub fn parse_program(&mut self) -> Program {
        let mut server = None;
        let mut schema: Option<SchemaDecl> = None;
        let mut routes = Vec::new();
        while !self.at_eof() {
            match self.peek_kind().clone() {
                TokenKind::At(name) => match name.as_str() {
                    "server" => {
                        let decl = self.parse_server_decl();
                        if server.is_some() {
                            self.diags.error(decl.span, "duplicate @server block");
                        } else {
                            server = Some(decl);
                        }
                    }
                    "database" => {
                        let decl = self.parse_database_decl();
                        if let Some(decl) = decl {
                            if schema.is_some() {
                                self.diags.error(decl.span, "duplicate @database block");
                            } else {
                                schema = Some(decl);
                            }
                        }
                    }
                    other => {
                        self.error_here(format!("unknown at-rule '@{other}'"));
                        self.bump();
                        self.sync_to_next_item();
                    }
                },
                TokenKind::Punct(Punct::LBracket) => {
                    if let Some(route) = self.parse_route() {
                        routes.push(route);
                    }
                }
                _ => {
                    self.error_here("expected '@server', '@database', or a route rule");
                    self.bump();
                    self.sync_to_next_item();
                }
            }
        }
        Program {
            server,
            schema,
            routes,
        }
    }

    fn parse_server_decl(&mut self) -> ServerDecl {
        let start = self.bump().span;
        self.expect_punct(Punct::LBrace, "expected '{' after @server");
        let mut entries = Vec::new();
        while !self.at_punct(Punct::RBrace) && !self.at_eof() {
            let key = self.expect_ident("expected property name in @server");
            if !matches!(key.name.as_str(), "port" | "host" | "database") {
                self.diags
                    .error(key.span, format!("unknown property '{}' in @server", key.name));
            }
            self.expect_punct(Punct::Colon, "expected ':' after property name");
            let value = self.parse_expr();
            self.expect_punct(Punct::Semi, "expected ';' after property value");
            let span = key.span.merge(value.span);
            entries.push(ServerEntry { key, value, span });
        }
        let end = self.expect_punct(Punct::RBrace, "expected '}' to close @server");
        ServerDecl {
            entries,
            span: start.merge(end),
        }
    }

    fn parse_database_decl(&mut self) -> Option<SchemaDecl> {
        let start = self.bump().span;
        match self.peek_kind().clone() {
            TokenKind::RawBlock(sql) => {
                let end = self.bump().span;
                Some(SchemaDecl {
                    sql,
                    span: start.merge(end),
                })
            }
            // The lexer already reported a missing or unterminated block.
            _ => None,
        }
    }

    fn parse_route(&mut self) -> Option<Route> {
        let start = self.bump().span;
        let key = self.expect_ident("expected 'path' in route selector");
        if key.name != "path" {
            self.diags
                .error(key.span, "route selector must be [path=\"...\"]");
        }
        self.expect_punct(Punct::Eq, "expected '=' after 'path'");
        let path = self.expect_string_lit("expected a quoted path pattern");
        self.expect_punct(Punct::RBracket, "expected ']' to close route selector");
        self.expect_punct(Punct::Colon, "expected ':' before the route method");
        let method_ident = self.expect_ident("expected an HTTP method after ':'");
        let method = match Method::parse(&method_ident.name) {
            Some(method) => method,
            None => {
                self.diags.error(
                    method_ident.span,
                    format!("unsupported method '{}'", method_ident.name),
                );
                Method::Get
            }
        };
        self.expect_punct(Punct::LBrace, "expected '{' to open the route body");

        let mut bindings: Vec<Binding> = Vec::new();
        let mut status: Option<Expr> = None;
        let mut ret: Option<ReturnDecl> = None;
        while !self.at_punct(Punct::RBrace) && !self.at_eof() {
            match self.peek_kind().clone() {
                TokenKind::Var(name) => {
                    let name_span = self.bump().span;
                    self.expect_punct(Punct::Colon, "expected ':' after variable name");
                    let expr = self.parse_expr();
                    self.expect_punct(Punct::Semi, "expected ';' after variable binding");
                    if bindings.iter().any(|b| b.name.name == name) {
                        self.diags
                            .error(name_span, format!("duplicate variable '--{name}' in route"));
                        continue;
                    }
                    let span = name_span.merge(expr.span);
                    bindings.push(Binding {
                        name: Ident {
                            name,
                            span: name_span,
                        },
                        expr,
                        span,
                    });
                }
                TokenKind::Ident(name) if name == "status" => {
                    let key_span = self.bump().span;
                    self.expect_punct(Punct::Colon, "expected ':' after 'status'");
                    let expr = self.parse_expr();
                    self.expect_punct(Punct::Semi, "expected ';' after status expression");
                    if status.is_some() {
                        self.diags.error(key_span, "duplicate status declaration");
                    } else {
                        status = Some(expr);
                    }
                }
                TokenKind::At(name) if name == "return" => {
                    let decl = self.parse_return_decl();
                    if ret.is_some() {
                        self.diags.error(decl.span, "duplicate @return in route");
                    } else {
                        ret = Some(decl);
                    }
                }
                _ => {
                    self.error_here("expected '--name:', 'status:', or '@return' in route body");
                    self.sync_route_body();
                }
            }
        }
        let end = self.expect_punct(Punct::RBrace, "expected '}' to close the route body");
        let span = start.merge(end);
        let ret = match ret {
            Some(ret) => ret,
            None => {
                self.diags.error(span, "route is missing @return");
                ReturnDecl {
                    format: ReturnFormat::Json,
                    expr: Expr {
                        kind: ExprKind::Literal(Literal::Null),
                        span,
                    },
                    span,
                }
            }
        };
        Some(Route {
            method,
            path,
            bindings,
            status,
            ret,
            span,
        })
    }

    fn parse_return_decl(&mut self) -> ReturnDecl {
        let start = self.bump().span;
        let callee = self.expect_ident("@return expects json(...) or html(...)");
        let format = match callee.name.as_str() {
            "json" => ReturnFormat::Json,
            "html" => ReturnFormat::Html,
            _ => {
                self.diags
                    .error(callee.span, "@return expects json(...) or html(...)");
                ReturnFormat::Json
            }
        };
        self.expect_punct(Punct::LParen, "expected '(' after @return function");
        let expr = self.parse_expr();
        self.expect_punct(Punct::RParen, "expected ')' to close @return");
        let end = self.expect_punct(Punct::Semi, "expected ';' after @return");
        ReturnDecl {
            format,
            expr,
            span: start.merge(end),
        }
    }

    pub fn parse_expr(&mut self) -> Expr {
        let start = self.peek_span();
        match self.peek_kind().clone() {
            TokenKind::Int(v) => {
                self.bump();
                self.literal(Literal::Int(v), start)
            }
            TokenKind::Float(v) => {
                self.bump();
                self.literal(Literal::Float(v), start)
            }
            TokenKind::Bool(v) => {
                self.bump();
                self.literal(Literal::Bool(v), start)
            }
            TokenKind::Null => {
                self.bump();
                self.literal(Literal::Null, start)
            }
            TokenKind::Str(v) => {
                self.bump();
                self.literal(Literal::String(v), start)
            }
            TokenKind::Var(name) => {
                self.bump();
                Expr {
                    kind: ExprKind::VarRef(name),
                    span: start,
                }
            }
            TokenKind::Punct(Punct::LBrace) => self.parse_object(),
            TokenKind::Punct(Punct::LBracket) => self.parse_array(),
            TokenKind::Ident(name) => {
                self.bump();
                if self.at_punct(Punct::LParen) {
                    self.parse_call(&name, start)
                } else {
                    // CSS keyword values: a bare identifier is a string.
                    self.literal(Literal::String(name), start)
                }
            }
            _ => {
                self.error_here("expected expression");
                self.bump();
                self.literal(Literal::Null, start)
            }
        }
    }

    fn parse_object(&mut self) -> Expr {
        let start = self.bump().span;
        let mut fields = Vec::new();
        while !self.at_punct(Punct::RBrace) && !self.at_eof() {
            let key = match self.peek_kind().clone() {
                TokenKind::Ident(name) => {
                    self.bump();
                    name
                }
                TokenKind::Str(value) => {
                    self.bump();
                    value
                }
                _ => {
                    self.error_here("expected object key");
                    self.bump();
                    continue;
                }
            };
            self.expect_punct(Punct::Colon, "expected ':' after object key");
            let value = self.parse_expr();
            fields.push((key, value));
            if self.eat_punct(Punct::Comma).is_none() {
                break;
            }
        }
        let end = self.expect_punct(Punct::RBrace, "expected '}' to close object literal");
        Expr {
            kind: ExprKind::Object(fields),
            span: start.merge(end),
        }
    }

    fn parse_array(&mut self) -> Expr {
        let start = self.bump().span;
        let mut items = Vec::new();
        while !self.at_punct(Punct::RBracket) && !self.at_eof() {
            items.push(self.parse_expr());
            if self.eat_punct(Punct::Comma).is_none() {
                break;
            }
        }
        let end = self.expect_punct(Punct::RBracket, "expected ']' to close array literal");
        Expr {
            kind: ExprKind::Array(items),
            span: start.merge(end),
        }
    }

    fn parse_call(&mut self, name: &str, start: Span) -> Expr {
        self.expect_punct(Punct::LParen, "expected '('");
        let kind = match name {
            "param" => {
                self.expect_punct(Punct::Colon, "param expects a path parameter like :id");
                let ident = self.expect_ident("param expects a path parameter like :id");
                ExprKind::Param(ident.name)
            }
            "query" => ExprKind::Query(self.parse_name_arg("query")),
            "body" => ExprKind::Body(self.parse_name_arg("body")),
            "header" => ExprKind::Header(self.parse_name_arg("header")),
            "var" => {
                let name = match self.peek_kind().clone() {
                    TokenKind::Var(name) => {
                        self.bump();
                        name
                    }
                    _ => {
                        self.error_here("var expects a variable like --name");
                        self.bump();
                        String::new()
                    }
                };
                ExprKind::VarRef(name)
            }
            "env" => {
                let env_name = self.parse_name_arg("env");
                let default = if self.eat_punct(Punct::Comma).is_some() {
                    Some(Box::new(self.parse_expr()))
                } else {
                    None
                };
                ExprKind::Env {
                    name: env_name,
                    default,
                }
            }
            "sql" => {
                let template = match self.peek_kind().clone() {
                    TokenKind::Str(template) => {
                        self.bump();
                        template
                    }
                    _ => {
                        self.error_here("sql expects a string template");
                        self.bump();
                        String::new()
                    }
                };
                let mut args = Vec::new();
                while self.eat_punct(Punct::Comma).is_some() {
                    args.push(self.parse_expr());
                }
                ExprKind::Sql { template, args }
            }
            "json" => ExprKind::Json(Box::new(self.parse_expr())),
            "html" => ExprKind::Html(Box::new(self.parse_expr())),
            "if" => return self.parse_if(start),
            _ => {
                self.error_here(format!("unknown function '{name}'"));
                // Consume the arguments so one bad call yields one error.
                let mut depth = 1usize;
                while depth > 0 && !self.at_eof() {
                    match self.bump().kind {
                        TokenKind::Punct(Punct::LParen) => depth += 1,
                        TokenKind::Punct(Punct::RParen) => depth -= 1,
                        _ => {}
                    }
                }
                return self.literal(Literal::Null, start.merge(self.prev_span()));
            }
        };
        let end = self.expect_punct(Punct::RParen, "expected ')' to close call");
        Expr {
            kind,
            span: start.merge(end),
        }
    }

    fn parse_name_arg(&mut self, callee: &str) -> String {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                self.bump();
                name
            }
            TokenKind::Str(value) => {
                self.bump();
                value
            }
            _ => {
                self.error_here(format!("{callee} expects a name argument"));
                self.bump();
                String::new()
            }
        }
    }

    fn parse_if(&mut self, start: Span) -> Expr {
        let mut arms = Vec::new();
        let mut else_arm = None;
        loop {
            if self.eat_keyword(Keyword::Else).is_some() {
                self.expect_punct(Punct::Colon, "expected ':' after else");
                else_arm = Some(Box::new(self.parse_expr()));
                self.eat_punct(Punct::Semi);
                break;
            }
            if self.at_punct(Punct::RParen) {
                break;
            }
            let cond = self.parse_cond();
            self.expect_punct(Punct::Colon, "expected ':' after condition");
            let expr = self.parse_expr();
            arms.push((cond, expr));
            if self.eat_punct(Punct::Semi).is_none() {
                break;
            }
        }
        let end = self.expect_punct(Punct::RParen, "expected ')' to close if");
        Expr {
            kind: ExprKind::If { arms, else_arm },
            span: start.merge(end),
        }
    }

    fn parse_cond(&mut self) -> Cond {
        self.parse_cond_or()
    }

    fn parse_cond_or(&mut self) -> Cond {
        let mut cond = self.parse_cond_and();
        while self.eat_keyword(Keyword::Or).is_some() {
            let right = self.parse_cond_and();
            let span = cond.span.merge(right.span);
            cond = Cond {
                kind: CondKind::Or(Box::new(cond), Box::new(right)),
                span,
            };
        }
        cond
    }

    fn parse_cond_and(&mut self) -> Cond {
        let mut cond = self.parse_cond_unary();
        while self.eat_keyword(Keyword::And).is_some() {
            let right = self.parse_cond_unary();
            let span = cond.span.merge(right.span);
            cond = Cond {
                kind: CondKind::And(Box::new(cond), Box::new(right)),
                span,
            };
        }
        cond
    }

    fn parse_cond_unary(&mut self) -> Cond {
        let start = self.peek_span();
        if self.eat_keyword(Keyword::Not).is_some() {
            let inner = match self.peek_kind().clone() {
                TokenKind::Punct(Punct::LParen) => {
                    self.bump();
                    let cond = self.parse_cond_or();
                    self.expect_punct(Punct::RParen, "expected ')' to close condition group");
                    cond
                }
                TokenKind::Var(name) => {
                    let span = self.bump().span;
                    Cond {
                        kind: CondKind::Truthy(name),
                        span,
                    }
                }
                _ => {
                    self.error_here("not expects a variable or a parenthesized condition");
                    self.bump();
                    Cond {
                        kind: CondKind::Truthy(String::new()),
                        span: start,
                    }
                }
            };
            let span = start.merge(inner.span);
            return Cond {
                kind: CondKind::Not(Box::new(inner)),
                span,
            };
        }
        if self.at_punct(Punct::LParen) {
            self.bump();
            let cond = self.parse_cond_or();
            self.expect_punct(Punct::RParen, "expected ')' to close condition group");
            return cond;
        }
        self.parse_cond_cmp()
    }

    fn parse_cond_cmp(&mut self) -> Cond {
        let left = self.parse_expr();
        let op = match self.peek_kind() {
            TokenKind::Punct(Punct::Eq) => Some(CmpOp::Eq),
            TokenKind::Punct(Punct::NotEq) => Some(CmpOp::NotEq),
            TokenKind::Punct(Punct::Lt) => Some(CmpOp::Lt),
            TokenKind::Punct(Punct::LtEq) => Some(CmpOp::LtEq),
            TokenKind::Punct(Punct::Gt) => Some(CmpOp::Gt),
            TokenKind::Punct(Punct::GtEq) => Some(CmpOp::GtEq),
            _ => None,
        };
        match op {
            Some(op) => {
                self.bump();
                let right = self.parse_expr();
                let span = left.span.merge(right.span);
                Cond {
                    kind: CondKind::Cmp {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    span,
                }
            }
            None => match &left.kind {
                ExprKind::VarRef(name) => Cond {
                    kind: CondKind::Truthy(name.clone()),
                    span: left.span,
                },
                _ => {
                    self.diags
                        .error(left.span, "expected a comparison or a variable condition");
                    Cond {
                        kind: CondKind::Truthy(String::new()),
                        span: left.span,
                    }
                }
            },
        }
    }

    fn literal(&self, lit: Literal, start: Span) -> Expr {
        Expr {
            kind: ExprKind::Literal(lit),
            span: start.merge(self.prev_span()),
        }
    }

    fn sync_route_body(&mut self) {
        let mut depth = 0usize;
        while !self.at_eof() {
            match self.peek_kind() {
                TokenKind::Punct(Punct::Semi) if depth == 0 => {
                    self.bump();
                    return;
                }
                TokenKind::Punct(Punct::LBrace) => depth += 1,
                TokenKind::Punct(Punct::RBrace) => {
                    if depth == 0 {
                        return;
                    }
                    depth -= 1;
                }
                _ => {}
            }
            self.bump();
        }
    }

    fn sync_to_next_item(&mut self) {
        let mut depth = 0usize;
        while !self.at_eof() {
            match self.peek_kind() {
                TokenKind::At(_) if depth == 0 => return,
                TokenKind::Punct(Punct::LBracket) if depth == 0 => return,
                TokenKind::Punct(Punct::LBrace) => depth += 1,
                TokenKind::Punct(Punct::RBrace) => depth = depth.saturating_sub(1),
                _ => {}
            }
            self.bump();
        }
    }

    fn error_here<S: Into<String>>(&mut self, message: S) {
        let span = self.peek_span();
        self.diags.error(span, message);
    }

    fn expect_ident(&mut self, message: &str) -> Ident {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                let span = self.bump().span;
                Ident { name, span }
            }
            _ => {
                self.error_here(message);
                let span = self.peek_span();
                self.bump();
                Ident {
                    name: "_".to_string(),
                    span,
                }
            }
        }
    }

    fn expect_string_lit(&mut self, message: &str) -> StringLit {
        match self.peek_kind().clone() {
            TokenKind::Str(value) => {
                let span = self.bump().span;
                StringLit { value, span }
            }
            _ => {
                self.error_here(message);
                let span = self.peek_span();
                self.bump();
                StringLit {
                    value: String::new(),
                    span,
                }
            }
        }
    }

    fn expect_punct(&mut self, punct: Punct, message: &str) -> Span {
        if self.at_punct(punct) {
            self.bump().span
        } else {
            self.error_here(message);
            self.peek_span()
        }
    }

    fn eat_punct(&mut self, punct: Punct) -> Option<Token> {
        if self.at_punct(punct) {
            Some(self.bump())
        } else {
            None
        }
    }

    fn eat_keyword(&mut self, kw: Keyword) -> Option<Token> {
        if matches!(self.peek_kind(), TokenKind::Keyword(k) if *k == kw) {
            Some(self.bump())
        } else {
            None
        }
    }

    fn at_punct(&self, punct: Punct) -> bool {
        matches!(self.peek_kind(), TokenKind::Punct(p) if *p == punct)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .unwrap_or_else(|| self.tokens.last().expect("token stream ends with Eof"))
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_span(&self) -> Span {
        self.peek().span
    }

    fn prev_span(&self) -> Span {
        if self.pos == 0 {
            self.peek().span
        } else {
            self.tokens[self.pos - 1].span
        }
    }

    fn bump(&mut self) -> Token {
        let tok = self.peek().clone();
        if !self.at_eof() {
            self.pos += 1;
        }
        tok
    }
}
