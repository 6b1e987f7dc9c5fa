use crate::diag::Diagnostics;
use crate::span::Span;
use crate::token::{Keyword, Punct, Token, TokenKind};

pub fn lex(src: &str, diags: &mut Diagnostics) -> Vec<Token> {
    Lexer {
        src,
        bytes: src.as_bytes(),
        pos: 0,
        diags,
    }
    .run()
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    diags: &'a mut Diagnostics,
}

impl<'a> Lexer<'a> {
    fn run(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        while let Some(ch) = self.peek_char() {
            let start = self.pos;

            if ch.is_whitespace() {
                self.pos += ch.len_utf8();
                continue;
            }

            if self.src[self.pos..].starts_with("/*") {
                self.skip_block_comment(start);
                continue;
            }
            if self.src[self.pos..].starts_with("//") {
                self.skip_line_comment();
                continue;
            }

            if ch == '@' {
                self.pos += 1;
                let name = self.take_ident();
                if name.is_empty() {
                    self.diags
                        .error(Span::new(start, self.pos), "expected name after '@'");
                    continue;
                }
                let raw_block = name == "database";
                tokens.push(Token {
                    kind: TokenKind::At(name),
                    span: Span::new(start, self.pos),
                });
                if raw_block {
                    if let Some(token) = self.lex_raw_block() {
                        tokens.push(token);
                    }
                }
                continue;
            }

            if ch == '-' {
                if self.src[self.pos..].starts_with("--") {
                    self.pos += 2;
                    let name = self.take_ident();
                    if name.is_empty() {
                        self.diags
                            .error(Span::new(start, self.pos), "expected name after '--'");
                        continue;
                    }
                    tokens.push(Token {
                        kind: TokenKind::Var(name),
                        span: Span::new(start, self.pos),
                    });
                    continue;
                }
                if self
                    .bytes
                    .get(self.pos + 1)
                    .is_some_and(|b| b.is_ascii_digit())
                {
                    tokens.push(self.lex_number(start));
                    continue;
                }
                self.diags
                    .error(Span::new(start, start + 1), "unexpected character");
                self.pos += 1;
                continue;
            }

            if is_ident_start(ch) {
                let text = self.take_ident();
                let kind = if let Some(kw) = Keyword::from_str(&text) {
                    TokenKind::Keyword(kw)
                } else if text == "true" {
                    TokenKind::Bool(true)
                } else if text == "false" {
                    TokenKind::Bool(false)
                } else if text == "null" {
                    TokenKind::Null
                } else {
                    TokenKind::Ident(text)
                };
                tokens.push(Token {
                    kind,
                    span: Span::new(start, self.pos),
                });
                continue;
            }

            if ch.is_ascii_digit() {
                tokens.push(self.lex_number(start));
                continue;
            }

            if ch == '"' || ch == '\'' {
                tokens.push(self.lex_string(start, ch));
                continue;
            }

            if let Some((punct, width)) = match_punct(&self.src[self.pos..]) {
                self.pos += width;
                tokens.push(Token {
                    kind: TokenKind::Punct(punct),
                    span: Span::new(start, self.pos),
                });
                continue;
            }

            self.diags
                .error(Span::new(start, start + ch.len_utf8()), "unexpected character");
            self.pos += ch.len_utf8();
        }

        tokens.push(Token {
            kind: TokenKind::Eof,
            span: Span::new(self.pos, self.pos),
        });
        tokens
    }

    fn peek_char(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn take_ident(&mut self) -> String {
        let start = self.pos;
        if let Some(ch) = self.peek_char() {
            if !is_ident_start(ch) {
                return String::new();
            }
            self.pos += ch.len_utf8();
        }
        while let Some(ch) = self.peek_char() {
            if is_ident_continue(ch) {
                self.pos += ch.len_utf8();
            } else {
                break;
            }
        }
        self.src[start..self.pos].to_string()
    }

    fn lex_number(&mut self, start: usize) -> Token {
        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        let mut is_float = false;
        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.peek_char() == Some('.')
            && self
                .bytes
                .get(self.pos + 1)
                .is_some_and(|b| b.is_ascii_digit())
        {
            is_float = true;
            self.pos += 1;
            while let Some(ch) = self.peek_char() {
                if ch.is_ascii_digit() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        let text = &self.src[start..self.pos];
        let kind = if is_float {
            TokenKind::Float(text.parse::<f64>().unwrap_or(0.0))
        } else {
            TokenKind::Int(text.parse::<i64>().unwrap_or(0))
        };
        Token {
            kind,
            span: Span::new(start, self.pos),
        }
    }

    fn lex_string(&mut self, start: usize, quote: char) -> Token {
        self.pos += 1;
        let mut out = String::new();
        let mut terminated = false;
        while let Some(ch) = self.peek_char() {
            self.pos += ch.len_utf8();
            if ch == quote {
                terminated = true;
                break;
            }
            if ch == '\\' {
                match self.peek_char() {
                    Some(esc) => {
                        self.pos += esc.len_utf8();
                        match esc {
                            'n' => out.push('\n'),
                            't' => out.push('\t'),
                            'r' => out.push('\r'),
                            other => out.push(other),
                        }
                    }
                    None => break,
                }
                continue;
            }
            out.push(ch);
        }
        if !terminated {
            self.diags
                .error(Span::new(start, self.pos), "unterminated string literal");
        }
        Token {
            kind: TokenKind::Str(out),
            span: Span::new(start, self.pos),
        }
    }

    /// Captures a `@database` body verbatim, balancing braces and skipping
    /// over quoted SQL text so string contents never affect nesting.
    fn lex_raw_block(&mut self) -> Option<Token> {
        loop {
            match self.peek_char() {
                Some(ch) if ch.is_whitespace() => self.pos += ch.len_utf8(),
                Some(_) if self.src[self.pos..].starts_with("/*") => {
                    self.skip_block_comment(self.pos)
                }
                Some(_) if self.src[self.pos..].starts_with("//") => self.skip_line_comment(),
                _ => break,
            }
        }
        let start = self.pos;
        if self.peek_char() != Some('{') {
            self.diags
                .error(Span::new(start, start + 1), "expected '{' after @database");
            return None;
        }
        self.pos += 1;
        let body_start = self.pos;
        let mut depth = 1usize;
        let mut quote: Option<char> = None;
        while let Some(ch) = self.peek_char() {
            self.pos += ch.len_utf8();
            match quote {
                Some(q) => {
                    if ch == q {
                        quote = None;
                    }
                }
                None => match ch {
                    '\'' | '"' => quote = Some(ch),
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            let body = self.src[body_start..self.pos - 1].to_string();
                            return Some(Token {
                                kind: TokenKind::RawBlock(body),
                                span: Span::new(start, self.pos),
                            });
                        }
                    }
                    _ => {}
                },
            }
        }
        self.diags
            .error(Span::new(start, self.pos), "unterminated @database block");
        None
    }

    fn skip_block_comment(&mut self, start: usize) {
        self.pos += 2;
        match self.src[self.pos..].find("*/") {
            Some(end) => self.pos += end + 2,
            None => {
                self.pos = self.src.len();
                self.diags
                    .error(Span::new(start, self.pos), "unterminated comment");
            }
        }
    }

    fn skip_line_comment(&mut self) {
        match self.src[self.pos..].find('\n') {
            Some(end) => self.pos += end + 1,
            None => self.pos = self.src.len(),
        }
    }
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_continue(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'
}

fn match_punct(s: &str) -> Option<(Punct, usize)> {
    if s.starts_with("!=") {
        return Some((Punct::NotEq, 2));
    }
    if s.starts_with("<=") {
        return Some((Punct::LtEq, 2));
    }
    if s.starts_with(">=") {
        return Some((Punct::GtEq, 2));
    }
    let ch = s.chars().next()?;
    let punct = match ch {
        '{' => Punct::LBrace,
        '}' => Punct::RBrace,
        '[' => Punct::LBracket,
        ']' => Punct::RBracket,
        '(' => Punct::LParen,
        ')' => Punct::RParen,
        ':' => Punct::Colon,
        ';' => Punct::Semi,
        ',' => Punct::Comma,
        '=' => Punct::Eq,
        '<' => Punct::Lt,
        '>' => Punct::Gt,
        _ => return None,
    };
    Some((punct, ch.len_utf8()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut diags = Diagnostics::default();
        let tokens = lex(src, &mut diags);
        assert!(!diags.has_errors(), "unexpected lex errors: {diags:?}");
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_route_selector() {
        let got = kinds(r#"[path="/u/:id"]:GET"#);
        assert_eq!(
            got,
            vec![
                TokenKind::Punct(Punct::LBracket),
                TokenKind::Ident("path".into()),
                TokenKind::Punct(Punct::Eq),
                TokenKind::Str("/u/:id".into()),
                TokenKind::Punct(Punct::RBracket),
                TokenKind::Punct(Punct::Colon),
                TokenKind::Ident("GET".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_vars_and_idents_with_dashes() {
        let got = kinds("--session-id: header(x-role);");
        assert_eq!(
            got,
            vec![
                TokenKind::Var("session-id".into()),
                TokenKind::Punct(Punct::Colon),
                TokenKind::Ident("header".into()),
                TokenKind::Punct(Punct::LParen),
                TokenKind::Ident("x-role".into()),
                TokenKind::Punct(Punct::RParen),
                TokenKind::Punct(Punct::Semi),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn database_body_is_verbatim() {
        let src = "@database {\n  CREATE TABLE t(id INTEGER); -- {braces} in 'a } string'\n}";
        let got = kinds(src);
        match &got[1] {
            TokenKind::RawBlock(body) => {
                assert!(body.contains("CREATE TABLE t(id INTEGER);"));
                assert!(body.contains("'a } string'"));
            }
            other => panic!("expected raw block, got {other:?}"),
        }
    }

    #[test]
    fn negative_numbers_and_floats() {
        let got = kinds("-3 4.5");
        assert_eq!(
            got,
            vec![TokenKind::Int(-3), TokenKind::Float(4.5), TokenKind::Eof]
        );
    }

    #[test]
    fn comments_are_skipped() {
        let got = kinds("/* block */ 1 // line\n2");
        assert_eq!(
            got,
            vec![TokenKind::Int(1), TokenKind::Int(2), TokenKind::Eof]
        );
    }

    #[test]
    fn unterminated_string_reports_error() {
        let mut diags = Diagnostics::default();
        lex("\"abc", &mut diags);
        assert!(diags.has_errors());
    }
}
