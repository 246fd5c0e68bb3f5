// SQL runner over sqlx's Any driver (sqlite/postgres/mysql).
// Payload: {query: "..."} or {statements: ["...", ...]} run in one
// transaction. Row-returning statements record {columns, rows}; others
// {rows_affected}.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Row};
use tokio::sync::OnceCell;

use rundown_common::errors::{Result, RundownError};

use super::{RunnerKind, StepContext, StepRunner};

pub struct DbRunner {
    name: String,
    dsn: String,
    pool: OnceCell<AnyPool>,
}

impl DbRunner {
    pub fn new(name: &str, dsn: &str) -> Self {
        // `sq://` is accepted as shorthand for sqlite.
        let dsn = match dsn.strip_prefix("sq://") {
            Some(rest) => format!("sqlite://{rest}"),
            None => dsn.to_string(),
        };
        Self { name: name.to_string(), dsn, pool: OnceCell::new() }
    }

    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    fn fail(&self, message: impl Into<String>) -> RundownError {
        RundownError::RunnerFailure { runner: self.name.clone(), message: message.into() }
    }

    async fn pool(&self) -> Result<&AnyPool> {
        self.pool
            .get_or_try_init(|| async {
                sqlx::any::install_default_drivers();
                AnyPoolOptions::new()
                    .max_connections(4)
                    .connect(&self.dsn)
                    .await
                    .map_err(|e| self.fail(format!("connecting {}: {e}", self.dsn)))
            })
            .await
    }
}

#[async_trait]
impl StepRunner for DbRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Db
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StepContext) -> Result<Value> {
        let statements = parse_payload(&ctx.payload).map_err(|m| self.fail(m))?;
        let pool = self.pool().await?;

        let mut tx = pool.begin().await.map_err(|e| self.fail(format!("begin: {e}")))?;
        let mut output = json!({});

        for statement in &statements {
            if ctx.cancel.is_cancelled() {
                return Err(RundownError::Canceled);
            }
            ctx.capturers.each(|c| c.on_db_query(&self.name, statement));

            if returns_rows(statement) {
                let rows: Vec<AnyRow> = sqlx::query(statement)
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(|e| self.fail(format!("query {statement:?}: {e}")))?;
                output = rows_to_value(&rows);
            } else {
                let done = sqlx::query(statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| self.fail(format!("exec {statement:?}: {e}")))?;
                output = json!({ "rows_affected": done.rows_affected() });
            }
        }

        tx.commit().await.map_err(|e| self.fail(format!("commit: {e}")))?;
        Ok(output)
    }

    async fn renew(&self) -> Result<()> {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
        // The OnceCell keeps the closed pool; reconnect happens lazily on the
        // next run because a closed sqlx pool re-errors fast. Rebuilding the
        // cell is not possible through &self, so renew is only useful before
        // the first run.
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
        Ok(())
    }
}

fn parse_payload(payload: &Value) -> std::result::Result<Vec<String>, String> {
    let map = payload.as_object().ok_or("payload must be a map")?;
    if let Some(q) = map.get("query") {
        let q = q.as_str().ok_or("query must be a string")?;
        return Ok(vec![q.trim().to_string()]);
    }
    if let Some(list) = map.get("statements").and_then(Value::as_array) {
        let mut out = Vec::with_capacity(list.len());
        for item in list {
            out.push(item.as_str().ok_or("statements must be strings")?.trim().to_string());
        }
        if out.is_empty() {
            return Err("statements is empty".to_string());
        }
        return Ok(out);
    }
    Err("payload needs query or statements".to_string())
}

fn returns_rows(statement: &str) -> bool {
    let head = statement.split_whitespace().next().unwrap_or_default().to_ascii_lowercase();
    matches!(head.as_str(), "select" | "with" | "show" | "pragma" | "explain")
}

fn rows_to_value(rows: &[AnyRow]) -> Value {
    let columns: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let mut out_rows = Vec::with_capacity(rows.len());
    for row in rows {
        let mut record = Map::new();
        for (i, column) in row.columns().iter().enumerate() {
            record.insert(column.name().to_string(), decode_column(row, i));
        }
        out_rows.push(Value::Object(record));
    }
    json!({ "columns": columns, "rows": out_rows })
}

/// Best-effort decode across the Any driver's narrow type surface.
fn decode_column(row: &AnyRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return json!(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(index) {
        return json!(v);
    }
    if let Ok(v) = row.try_get::<bool, _>(index) {
        return json!(v);
    }
    if let Ok(v) = row.try_get::<String, _>(index) {
        return json!(v);
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_single_query() {
        let stmts = parse_payload(&json!({"query": "SELECT 1"})).unwrap();
        assert_eq!(stmts, vec!["SELECT 1"]);
    }

    #[test]
    fn payload_statement_list() {
        let stmts = parse_payload(&json!({
            "statements": ["CREATE TABLE t (id INTEGER)", "INSERT INTO t VALUES (1)"],
        }))
        .unwrap();
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn payload_rejects_missing_query() {
        assert!(parse_payload(&json!({"sql": "SELECT 1"})).is_err());
    }

    #[test]
    fn statement_classification() {
        assert!(returns_rows("SELECT * FROM t"));
        assert!(returns_rows("with x as (select 1) select * from x"));
        assert!(!returns_rows("INSERT INTO t VALUES (1)"));
        assert!(!returns_rows("UPDATE t SET a = 1"));
    }

    #[test]
    fn sq_scheme_normalizes_to_sqlite() {
        let runner = DbRunner::new("db", "sq://test.db");
        assert_eq!(runner.dsn(), "sqlite://test.db");
    }
}
