use std::collections::{BTreeMap, HashMap};

use crate::ast::{Binding, CmpOp, Cond, CondKind, Expr, ExprKind, Literal, ReturnFormat, Route};
use crate::db::Db;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(v) => *v,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::String(v) => !v.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Object(fields) => !fields.is_empty(),
        }
    }

    /// Numeric view used by comparisons; strings parse on demand.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::String(v) => v.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Textual form used by `html(...)` and string comparison: scalars render
    /// plainly, aggregates fall back to JSON.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::String(v) => v.clone(),
            Value::List(_) | Value::Object(_) => self.to_json().to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(v) => serde_json::Value::Bool(*v),
            Value::Int(v) => serde_json::Value::from(*v),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(v) => serde_json::Value::String(v.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(v) => Value::Bool(v),
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Value::Int(v)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(v) => Value::String(v),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(key, value)| (key, Value::from_json(value)))
                    .collect(),
            ),
        }
    }
}

/// Per-request state. Header names are lowercased once at construction.
pub struct RequestContext {
    pub params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Value,
    pub headers: HashMap<String, String>,
    pub variables: HashMap<String, Value>,
}

impl RequestContext {
    pub fn new(
        params: HashMap<String, String>,
        query: HashMap<String, String>,
        body: Value,
        headers: HashMap<String, String>,
    ) -> Self {
        let headers = headers
            .into_iter()
            .map(|(key, value)| (key.to_ascii_lowercase(), value))
            .collect();
        Self {
            params,
            query,
            body,
            headers,
            variables: HashMap::new(),
        }
    }
}

/// Shared evaluation resources: the database handle (and with it the
/// prepared-statement cache). Constructed once at startup, shared by
/// reference across handlers.
pub struct Runtime {
    pub db: Option<Db>,
}

impl Runtime {
    pub fn new(db: Option<Db>) -> Self {
        Self { db }
    }
}

pub struct RouteOutcome {
    pub status: u16,
    pub format: ReturnFormat,
    pub value: Value,
}

/// Runs a matched route: bindings in source order, then the status
/// expression, then the return expression.
pub fn run_route(route: &Route, ctx: &mut RequestContext, rt: &Runtime) -> Result<RouteOutcome, String> {
    for Binding { name, expr, .. } in &route.bindings {
        let value = eval_expr(expr, ctx, rt)?;
        ctx.variables.insert(name.name.clone(), value);
    }
    let status = match &route.status {
        Some(expr) => status_code(&eval_expr(expr, ctx, rt)?),
        None => 200,
    };
    let value = eval_expr(&route.ret.expr, ctx, rt)?;
    Ok(RouteOutcome {
        status,
        format: route.ret.format,
        value,
    })
}

fn status_code(value: &Value) -> u16 {
    match value.as_number() {
        Some(n) if (100.0..=599.0).contains(&n) => n as u16,
        _ => 200,
    }
}

pub fn eval_expr(expr: &Expr, ctx: &RequestContext, rt: &Runtime) -> Result<Value, String> {
    match &expr.kind {
        ExprKind::Literal(lit) => Ok(literal_value(lit)),
        ExprKind::Object(fields) => {
            let mut out = BTreeMap::new();
            for (key, value) in fields {
                out.insert(key.clone(), eval_expr(value, ctx, rt)?);
            }
            Ok(Value::Object(out))
        }
        ExprKind::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_expr(item, ctx, rt)?);
            }
            Ok(Value::List(out))
        }
        ExprKind::Param(name) => Ok(lookup_string(&ctx.params, name)),
        ExprKind::Query(name) => Ok(lookup_string(&ctx.query, name)),
        ExprKind::Body(name) => match &ctx.body {
            Value::Object(fields) => Ok(fields.get(name).cloned().unwrap_or(Value::Null)),
            _ => Ok(Value::Null),
        },
        ExprKind::Header(name) => {
            Ok(lookup_string(&ctx.headers, &name.to_ascii_lowercase()))
        }
        ExprKind::VarRef(name) => ctx
            .variables
            .get(name)
            .cloned()
            .ok_or_else(|| format!("undefined variable --{name}")),
        ExprKind::Env { name, .. } => Err(format!("env({name}) reached the evaluator")),
        ExprKind::Sql { template, args } => {
            let mut bound = Vec::with_capacity(args.len());
            for arg in args {
                bound.push(eval_expr(arg, ctx, rt)?);
            }
            let Some(db) = &rt.db else {
                return Ok(in_band_error("no database configured"));
            };
            match db.run(template, &bound) {
                Ok(value) => Ok(value),
                Err(message) => Ok(in_band_error(&message)),
            }
        }
        ExprKind::If { arms, else_arm } => {
            for (cond, arm) in arms {
                if eval_cond(cond, ctx, rt)? {
                    return eval_expr(arm, ctx, rt);
                }
            }
            match else_arm {
                Some(arm) => eval_expr(arm, ctx, rt),
                None => Ok(Value::Null),
            }
        }
        ExprKind::Json(inner) => eval_expr(inner, ctx, rt),
        ExprKind::Html(inner) => {
            let value = eval_expr(inner, ctx, rt)?;
            Ok(Value::String(value.to_display_string()))
        }
    }
}

pub fn eval_cond(cond: &Cond, ctx: &RequestContext, rt: &Runtime) -> Result<bool, String> {
    match &cond.kind {
        CondKind::Truthy(name) => {
            let value = ctx
                .variables
                .get(name)
                .cloned()
                .ok_or_else(|| format!("undefined variable --{name}"))?;
            Ok(value.is_truthy())
        }
        CondKind::Cmp { op, left, right } => {
            let left = eval_expr(left, ctx, rt)?;
            let right = eval_expr(right, ctx, rt)?;
            Ok(compare(*op, &left, &right))
        }
        CondKind::And(a, b) => Ok(eval_cond(a, ctx, rt)? && eval_cond(b, ctx, rt)?),
        CondKind::Or(a, b) => Ok(eval_cond(a, ctx, rt)? || eval_cond(b, ctx, rt)?),
        CondKind::Not(inner) => Ok(!eval_cond(inner, ctx, rt)?),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    match op {
        CmpOp::Eq => loose_eq(left, right),
        CmpOp::NotEq => !loose_eq(left, right),
        CmpOp::Lt | CmpOp::LtEq | CmpOp::Gt | CmpOp::GtEq => {
            match (left.as_number(), right.as_number()) {
                (Some(a), Some(b)) => match op {
                    CmpOp::Lt => a < b,
                    CmpOp::LtEq => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::GtEq => a >= b,
                    _ => unreachable!(),
                },
                _ => false,
            }
        }
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => a == b,
        _ => left.to_display_string() == right.to_display_string(),
    }
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Int(v) => Value::Int(*v),
        Literal::Float(v) => Value::Float(*v),
        Literal::Bool(v) => Value::Bool(*v),
        Literal::String(v) => Value::String(v.clone()),
        Literal::Null => Value::Null,
    }
}

fn lookup_string(map: &HashMap<String, String>, name: &str) -> Value {
    match map.get(name) {
        Some(value) => Value::String(value.clone()),
        None => Value::Null,
    }
}

fn in_band_error(message: &str) -> Value {
    let mut fields = BTreeMap::new();
    fields.insert("error".to_string(), Value::String(message.to_string()));
    Value::Object(fields)
}
