use std::collections::BTreeMap;
use std::sync::Mutex;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};

use crate::eval::Value;

/// The one database handle per process. The connection is serialized behind a
/// mutex; prepared statements are cached per template through the
/// connection's statement cache, so each template is prepared once.
pub struct Db {
    conn: Mutex<Connection>,
}

enum StatementKind {
    Select,
    Insert,
    Other,
}

impl Db {
    pub fn open(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|err| format!("db open failed: {err}"))?;
        Ok(Self::wrap(conn))
    }

    pub fn open_in_memory() -> Result<Self, String> {
        let conn =
            Connection::open_in_memory().map_err(|err| format!("db open failed: {err}"))?;
        Ok(Self::wrap(conn))
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Sizes the statement cache so every template the program can run stays
    /// prepared; templates are static in the source, so this never evicts.
    pub fn reserve_statements(&self, templates: usize) {
        if let Ok(conn) = self.conn.lock() {
            conn.set_prepared_statement_cache_capacity(templates.max(32));
        }
    }

    /// Executes a schema bootstrap script verbatim.
    pub fn bootstrap(&self, sql: &str) -> Result<(), String> {
        if sql.trim().is_empty() {
            return Ok(());
        }
        let conn = self.lock()?;
        conn.execute_batch(sql)
            .map_err(|err| format!("schema bootstrap failed: {err}"))
    }

    /// Runs one parameterized statement and shapes the result by its leading
    /// keyword: SELECT without arguments yields all rows, SELECT with
    /// arguments the first row or null, INSERT `{id, changes}`, everything
    /// else `{changes}`.
    pub fn run(&self, template: &str, args: &[Value]) -> Result<Value, String> {
        let params = args
            .iter()
            .map(param_to_sql)
            .collect::<Result<Vec<_>, String>>()?;
        let conn = self.lock()?;
        match statement_kind(template) {
            StatementKind::Select => {
                let mut stmt = conn
                    .prepare_cached(template)
                    .map_err(|err| format!("db prepare failed: {err}"))?;
                let columns: Vec<String> = stmt
                    .column_names()
                    .iter()
                    .map(|name| name.to_string())
                    .collect();
                let mut rows = stmt
                    .query(params_from_iter(params.iter()))
                    .map_err(|err| format!("db query failed: {err}"))?;
                let mut out = Vec::new();
                while let Some(row) = rows
                    .next()
                    .map_err(|err| format!("db query failed: {err}"))?
                {
                    let mut fields = BTreeMap::new();
                    for (idx, name) in columns.iter().enumerate() {
                        let value = row
                            .get_ref(idx)
                            .map_err(|err| format!("db query failed: {err}"))?;
                        fields.insert(name.clone(), value_from_ref(value));
                    }
                    out.push(Value::Object(fields));
                    if !params.is_empty() {
                        break;
                    }
                }
                if params.is_empty() {
                    Ok(Value::List(out))
                } else {
                    Ok(out.into_iter().next().unwrap_or(Value::Null))
                }
            }
            StatementKind::Insert => {
                let changes = {
                    let mut stmt = conn
                        .prepare_cached(template)
                        .map_err(|err| format!("db exec failed: {err}"))?;
                    stmt.execute(params_from_iter(params.iter()))
                        .map_err(|err| format!("db exec failed: {err}"))?
                };
                let mut fields = BTreeMap::new();
                fields.insert("id".to_string(), Value::Int(conn.last_insert_rowid()));
                fields.insert("changes".to_string(), Value::Int(changes as i64));
                Ok(Value::Object(fields))
            }
            StatementKind::Other => {
                let changes = {
                    let mut stmt = conn
                        .prepare_cached(template)
                        .map_err(|err| format!("db exec failed: {err}"))?;
                    stmt.execute(params_from_iter(params.iter()))
                        .map_err(|err| format!("db exec failed: {err}"))?
                };
                let mut fields = BTreeMap::new();
                fields.insert("changes".to_string(), Value::Int(changes as i64));
                Ok(Value::Object(fields))
            }
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, String> {
        self.conn
            .lock()
            .map_err(|_| "db lock poisoned".to_string())
    }
}

fn statement_kind(template: &str) -> StatementKind {
    let head = template
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match head.as_str() {
        "select" => StatementKind::Select,
        "insert" => StatementKind::Insert,
        _ => StatementKind::Other,
    }
}

fn param_to_sql(param: &Value) -> Result<SqlValue, String> {
    match param {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(v) => Ok(SqlValue::Integer(if *v { 1 } else { 0 })),
        Value::Int(v) => Ok(SqlValue::Integer(*v)),
        Value::Float(v) => Ok(SqlValue::Real(*v)),
        Value::String(v) => Ok(SqlValue::Text(v.clone())),
        Value::List(_) | Value::Object(_) => {
            Err("unsupported sql argument type".to_string())
        }
    }
}

fn value_from_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Float(v),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).to_string()),
        ValueRef::Blob(bytes) => Value::String(String::from_utf8_lossy(bytes).to_string()),
    }
}
