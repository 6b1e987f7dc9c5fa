use crate::span::{line_col, Span};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Level {
    Error,
    Warning,
}

#[derive(Clone, Debug)]
pub struct Diag {
    pub level: Level,
    pub message: String,
    pub span: Span,
}

impl Diag {
    pub fn render(&self, src: &str) -> String {
        let (line, col) = line_col(src, self.span.start);
        let level = match self.level {
            Level::Error => "error",
            Level::Warning => "warning",
        };
        format!("{level}: {} ({line}:{col})", self.message)
    }
}

#[derive(Default, Debug)]
pub struct Diagnostics {
    diags: Vec<Diag>,
}

impl Diagnostics {
    pub fn error<S: Into<String>>(&mut self, span: Span, message: S) {
        self.diags.push(Diag {
            level: Level::Error,
            message: message.into(),
            span,
        });
    }

    pub fn warning<S: Into<String>>(&mut self, span: Span, message: S) {
        self.diags.push(Diag {
            level: Level::Warning,
            message: message.into(),
            span,
        });
    }

    pub fn has_errors(&self) -> bool {
        self.diags.iter().any(|d| matches!(d.level, Level::Error))
    }

    pub fn into_vec(self) -> Vec<Diag> {
        self.diags
    }

    pub fn extend(&mut self, other: Vec<Diag>) {
        self.diags.extend(other);
    }
}
