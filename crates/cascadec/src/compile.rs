use std::collections::HashMap;

use cascade_rt::form::percent_decode;

use crate::ast::{
    Cond, CondKind, Expr, ExprKind, Literal, Method, Program, Route, ServerDecl,
};
use crate::diag::Diagnostics;

#[derive(Clone, Debug, PartialEq)]
pub enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum PathPattern {
    CatchAll,
    Segments(Vec<Segment>),
}

pub fn compile_pattern(pattern: &str, span: crate::span::Span, diags: &mut Diagnostics) -> PathPattern {
    if pattern == "*" {
        return PathPattern::CatchAll;
    }
    let mut segments = Vec::new();
    for raw in pattern.split('/') {
        if raw == "*" {
            diags.error(span, "catch-all '*' must be the entire path pattern");
            segments.push(Segment::Literal(raw.to_string()));
            continue;
        }
        if let Some(name) = raw.strip_prefix(':') {
            if name.is_empty() {
                diags.error(span, "path parameter is missing a name");
            }
            segments.push(Segment::Param(name.to_string()));
        } else {
            segments.push(Segment::Literal(raw.to_string()));
        }
    }
    PathPattern::Segments(segments)
}

/// Routes grouped by method, in declared order. Catch-all routes sit in a
/// separate list and are only consulted after every explicit route missed.
pub struct RouteTable {
    by_method: HashMap<Method, Vec<(usize, Vec<Segment>)>>,
    catch_alls: Vec<usize>,
}

pub struct RouteMatch {
    pub route_index: usize,
    pub params: HashMap<String, String>,
    /// True when a HEAD request was served by a GET route.
    pub head_fallback: bool,
}

impl RouteTable {
    pub fn build(program: &Program, diags: &mut Diagnostics) -> Self {
        let mut by_method: HashMap<Method, Vec<(usize, Vec<Segment>)>> = HashMap::new();
        let mut catch_alls = Vec::new();
        for (index, route) in program.routes.iter().enumerate() {
            match compile_pattern(&route.path.value, route.path.span, diags) {
                PathPattern::CatchAll => catch_alls.push(index),
                PathPattern::Segments(segments) => {
                    by_method
                        .entry(route.method)
                        .or_default()
                        .push((index, segments));
                }
            }
        }
        Self {
            by_method,
            catch_alls,
        }
    }

    pub fn lookup(&self, method: Method, path: &str) -> Option<RouteMatch> {
        if let Some(found) = self.lookup_explicit(method, path) {
            return Some(found);
        }
        if method == Method::Head {
            if let Some(mut found) = self.lookup_explicit(Method::Get, path) {
                found.head_fallback = true;
                return Some(found);
            }
        }
        self.catch_alls.first().map(|&route_index| RouteMatch {
            route_index,
            params: HashMap::new(),
            head_fallback: false,
        })
    }

    fn lookup_explicit(&self, method: Method, path: &str) -> Option<RouteMatch> {
        let routes = self.by_method.get(&method)?;
        let request: Vec<String> = path.split('/').map(percent_decode).collect();
        for (route_index, segments) in routes {
            if segments.len() != request.len() {
                continue;
            }
            let mut params = HashMap::new();
            let mut matched = true;
            for (segment, got) in segments.iter().zip(request.iter()) {
                match segment {
                    Segment::Literal(want) => {
                        if want != got {
                            matched = false;
                            break;
                        }
                    }
                    Segment::Param(name) => {
                        if got.is_empty() {
                            matched = false;
                            break;
                        }
                        params.insert(name.clone(), got.clone());
                    }
                }
            }
            if matched {
                return Some(RouteMatch {
                    route_index: *route_index,
                    params,
                    head_fallback: false,
                });
            }
        }
        None
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub database: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "localhost".to_string(),
            database: None,
        }
    }
}

/// Resolves `@server` entries to concrete values, reading `env(NAME, default)`
/// from the process environment once at load.
pub fn resolve_config(program: &Program, diags: &mut Diagnostics) -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Some(server) = &program.server {
        resolve_server_entries(server, &mut config, diags);
    }
    if program.schema.is_some() && config.database.is_none() {
        if let Some(schema) = &program.schema {
            diags.warning(
                schema.span,
                "@database block present but no database is configured",
            );
        }
    }
    config
}

fn resolve_server_entries(server: &ServerDecl, config: &mut ServerConfig, diags: &mut Diagnostics) {
    for entry in &server.entries {
        let Some(value) = resolve_config_value(&entry.value, diags) else {
            continue;
        };
        match entry.key.name.as_str() {
            "port" => match value.parse::<u16>() {
                Ok(port) => config.port = port,
                Err(_) => diags.error(entry.value.span, "port must be a number"),
            },
            "host" => config.host = value,
            "database" => config.database = Some(value),
            _ => {}
        }
    }
}

fn resolve_config_value(expr: &Expr, diags: &mut Diagnostics) -> Option<String> {
    match &expr.kind {
        ExprKind::Literal(lit) => literal_text(lit).or_else(|| {
            diags.error(expr.span, "config value must be a literal or env(...)");
            None
        }),
        ExprKind::Env { name, default } => match std::env::var(name) {
            Ok(value) => Some(value),
            Err(_) => match default {
                Some(default) => resolve_config_value(default, diags),
                None => None,
            },
        },
        _ => {
            diags.error(expr.span, "config value must be a literal or env(...)");
            None
        }
    }
}

fn literal_text(lit: &Literal) -> Option<String> {
    match lit {
        Literal::Int(v) => Some(v.to_string()),
        Literal::Float(v) => Some(v.to_string()),
        Literal::String(v) => Some(v.clone()),
        Literal::Bool(_) | Literal::Null => None,
    }
}

/// Distinct `sql(...)` templates across the whole program; used to size the
/// prepared-statement cache.
pub fn sql_template_count(program: &Program) -> usize {
    let mut templates = std::collections::HashSet::new();
    for route in &program.routes {
        for binding in &route.bindings {
            collect_templates(&binding.expr, &mut templates);
        }
        if let Some(status) = &route.status {
            collect_templates(status, &mut templates);
        }
        collect_templates(&route.ret.expr, &mut templates);
    }
    templates.len()
}

fn collect_templates<'a>(expr: &'a Expr, out: &mut std::collections::HashSet<&'a str>) {
    match &expr.kind {
        ExprKind::Sql { template, args } => {
            out.insert(template.as_str());
            for arg in args {
                collect_templates(arg, out);
            }
        }
        ExprKind::Object(fields) => {
            for (_, value) in fields {
                collect_templates(value, out);
            }
        }
        ExprKind::Array(items) => {
            for item in items {
                collect_templates(item, out);
            }
        }
        ExprKind::If { arms, else_arm } => {
            for (cond, arm) in arms {
                collect_cond_templates(cond, out);
                collect_templates(arm, out);
            }
            if let Some(else_arm) = else_arm {
                collect_templates(else_arm, out);
            }
        }
        ExprKind::Json(inner) | ExprKind::Html(inner) => collect_templates(inner, out),
        ExprKind::Env { default: Some(default), .. } => collect_templates(default, out),
        _ => {}
    }
}

fn collect_cond_templates<'a>(cond: &'a Cond, out: &mut std::collections::HashSet<&'a str>) {
    match &cond.kind {
        CondKind::Cmp { left, right, .. } => {
            collect_templates(left, out);
            collect_templates(right, out);
        }
        CondKind::And(a, b) | CondKind::Or(a, b) => {
            collect_cond_templates(a, out);
            collect_cond_templates(b, out);
        }
        CondKind::Not(inner) => collect_cond_templates(inner, out),
        CondKind::Truthy(_) => {}
    }
}

/// Load-time checks that the parser cannot do locally: variable references
/// must point at earlier bindings, `env(...)` stays inside `@server`, and
/// `json(...)`/`html(...)` stay inside `@return`.
pub fn validate(program: &Program, diags: &mut Diagnostics) {
    for route in &program.routes {
        validate_route(route, diags);
    }
}

fn validate_route(route: &Route, diags: &mut Diagnostics) {
    let mut declared: Vec<&str> = Vec::new();
    for binding in &route.bindings {
        check_expr(&binding.expr, &declared, false, diags);
        declared.push(&binding.name.name);
    }
    if let Some(status) = &route.status {
        check_expr(status, &declared, false, diags);
    }
    check_expr(&route.ret.expr, &declared, true, diags);
}

fn check_expr(expr: &Expr, declared: &[&str], in_return: bool, diags: &mut Diagnostics) {
    match &expr.kind {
        ExprKind::VarRef(name) => {
            if !declared.contains(&name.as_str()) {
                diags.error(expr.span, format!("variable '--{name}' is not declared"));
            }
        }
        ExprKind::Env { .. } => {
            diags.error(expr.span, "env() is only allowed in @server");
        }
        ExprKind::Json(inner) | ExprKind::Html(inner) => {
            if !in_return {
                diags.error(expr.span, "json() and html() are only valid in @return");
            }
            check_expr(inner, declared, in_return, diags);
        }
        ExprKind::Object(fields) => {
            for (_, value) in fields {
                check_expr(value, declared, in_return, diags);
            }
        }
        ExprKind::Array(items) => {
            for item in items {
                check_expr(item, declared, in_return, diags);
            }
        }
        ExprKind::Sql { args, .. } => {
            for arg in args {
                check_expr(arg, declared, in_return, diags);
            }
        }
        ExprKind::If { arms, else_arm } => {
            for (cond, arm) in arms {
                check_cond(cond, declared, in_return, diags);
                check_expr(arm, declared, in_return, diags);
            }
            if let Some(else_arm) = else_arm {
                check_expr(else_arm, declared, in_return, diags);
            }
        }
        ExprKind::Literal(_)
        | ExprKind::Param(_)
        | ExprKind::Query(_)
        | ExprKind::Body(_)
        | ExprKind::Header(_) => {}
    }
}

fn check_cond(cond: &Cond, declared: &[&str], in_return: bool, diags: &mut Diagnostics) {
    match &cond.kind {
        CondKind::Truthy(name) => {
            if !declared.contains(&name.as_str()) {
                diags.error(cond.span, format!("variable '--{name}' is not declared"));
            }
        }
        CondKind::Cmp { left, right, .. } => {
            check_expr(left, declared, in_return, diags);
            check_expr(right, declared, in_return, diags);
        }
        CondKind::And(a, b) | CondKind::Or(a, b) => {
            check_cond(a, declared, in_return, diags);
            check_cond(b, declared, in_return, diags);
        }
        CondKind::Not(inner) => check_cond(inner, declared, in_return, diags),
    }
}
