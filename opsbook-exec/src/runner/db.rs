use opsbook_core::book::DbConfig;
use serde_json::{Map, Value};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Row};

use crate::capture::CaptureEvent;

use super::{RunnerError, StepHandle};

pub struct DbRunner {
    name: String,
    dsn: String,
    pool: Option<AnyPool>,
}

#[derive(Debug, Clone)]
pub struct DbQuery {
    pub stmt: String,
}

pub fn parse_db_query(m: &Map<String, Value>) -> Result<DbQuery, RunnerError> {
    let stmt = m
        .get("stmt")
        .and_then(Value::as_str)
        .ok_or_else(|| RunnerError::invalid("db", "missing stmt"))?;
    Ok(DbQuery {
        stmt: stmt.to_string(),
    })
}

impl DbRunner {
    pub fn new(name: &str, cfg: &DbConfig) -> Self {
        Self {
            name: name.to_string(),
            dsn: cfg.dsn.clone(),
            pool: None,
        }
    }

    async fn pool(&mut self) -> Result<&AnyPool, RunnerError> {
        if self.pool.is_none() {
            sqlx::any::install_default_drivers();
            // One connection: statements in a batch must observe each
            // other (and `sqlite::memory:` is per-connection).
            let pool = AnyPoolOptions::new()
                .max_connections(1)
                .connect(&self.dsn)
                .await
                .map_err(|e| RunnerError::Connect(e.to_string()))?;
            self.pool = Some(pool);
        }
        match &self.pool {
            Some(pool) => Ok(pool),
            None => Err(RunnerError::Connect("connection is not established".to_string())),
        }
    }

    pub async fn run(&mut self, h: &mut StepHandle<'_>, q: DbQuery) -> Result<(), RunnerError> {
        h.capturers
            .capture(CaptureEvent::DbQuery {
                runner: self.name.clone(),
                stmt: q.stmt.clone(),
            })
            .await;

        let pool = self.pool().await?;
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| RunnerError::Transport(e.to_string()))?;

        let stmts = separate_stmt(&q.stmt);
        let mut result = Map::new();
        for stmt in &stmts {
            if is_query(stmt) {
                let rows: Vec<AnyRow> = sqlx::query(stmt)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(|e| RunnerError::Transport(e.to_string()))?;
                let rows: Vec<Value> = rows
                    .iter()
                    .map(|r| Value::Object(row_to_json(r)))
                    .collect();
                result = Map::new();
                result.insert("rows".to_string(), Value::Array(rows));
            } else {
                let done = sqlx::query(stmt)
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| RunnerError::Transport(e.to_string()))?;
                result = Map::new();
                result.insert(
                    "last_insert_id".to_string(),
                    Value::from(done.last_insert_id().unwrap_or_default()),
                );
                result.insert("rows_affected".to_string(), Value::from(done.rows_affected()));
            }
        }

        h.capturers
            .capture(CaptureEvent::DbResult {
                runner: self.name.clone(),
                result: Value::Object(result.clone()),
            })
            .await;
        h.store.record(result);
        Ok(())
    }
}

/// Split a statement batch on top-level semicolons, keeping quoted
/// semicolons intact. The trailing `;` stays with each statement.
pub fn separate_stmt(stmt: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();
    let mut quote: Option<char> = None;
    for c in stmt.chars() {
        buf.push(c);
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                ';' => {
                    let trimmed = buf.trim();
                    if !trimmed.is_empty() {
                        out.push(trimmed.to_string());
                    }
                    buf.clear();
                }
                _ => {}
            },
        }
    }
    let trimmed = buf.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    out
}

fn is_query(stmt: &str) -> bool {
    let head = stmt
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    matches!(
        head.as_str(),
        "select" | "show" | "with" | "pragma" | "explain" | "describe" | "values"
    )
}

fn row_to_json(row: &AnyRow) -> Map<String, Value> {
    let mut m = Map::new();
    for (i, col) in row.columns().iter().enumerate() {
        m.insert(col.name().to_string(), decode_column(row, i));
    }
    m
}

fn decode_column(row: &AnyRow, i: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(i) {
        return match v {
            Some(s) => text_to_value(s),
            None => Value::Null,
        };
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(i) {
        return v
            .map(|b| Value::String(String::from_utf8_lossy(&b).into_owned()))
            .unwrap_or(Value::Null);
    }
    Value::Null
}

/// Columns holding serialized JSON come back as their parsed structure.
fn text_to_value(s: String) -> Value {
    let trimmed = s.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str::<Value>(&s) {
            if v.is_object() || v.is_array() {
                return v;
            }
        }
    }
    Value::String(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separates_statements_after_semicolons() {
        assert_eq!(separate_stmt("SELECT 1"), vec!["SELECT 1"]);
        assert_eq!(
            separate_stmt("SELECT 1;SELECT 2;"),
            vec!["SELECT 1;", "SELECT 2;"]
        );
    }

    #[test]
    fn quoted_semicolons_do_not_split() {
        let stmt = "INSERT INTO t (v) VALUES ('a;b');SELECT * FROM t;";
        assert_eq!(
            separate_stmt(stmt),
            vec!["INSERT INTO t (v) VALUES ('a;b');", "SELECT * FROM t;"]
        );
    }

    #[test]
    fn classifies_queries() {
        assert!(is_query("SELECT 1"));
        assert!(is_query("  with x as (select 1) select * from x"));
        assert!(!is_query("INSERT INTO t VALUES (1)"));
        assert!(!is_query("CREATE TABLE t (id int)"));
    }
}
