use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Column, PgConnection, Postgres, Row, TypeInfo};
use tokio::sync::mpsc;

use crate::db::pool::DbPool;
use crate::error::{DbaError, Result};

/// An ordered column-name-to-JSON mapping, one per result row.
///
/// The driver coerces PostgreSQL types on the way out: booleans stay
/// booleans, `numeric` becomes a string to preserve precision, timestamps
/// become ISO 8601 strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqlRow {
    #[serde(flatten)]
    pub cells: Map<String, Value>,
}

impl SqlRow {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.cells.get(column)
    }

    pub fn as_i64(&self, column: &str) -> Option<i64> {
        match self.cells.get(column)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self, column: &str) -> Option<f64> {
        match self.cells.get(column)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self, column: &str) -> Option<&str> {
        self.cells.get(column)?.as_str()
    }

    pub fn as_bool(&self, column: &str) -> Option<bool> {
        self.cells.get(column)?.as_bool()
    }
}

/// Base SQL driver: parameterized execution over the pool, rows out as
/// [`SqlRow`]. Parameters are always bound through placeholders, never
/// interpolated.
#[derive(Clone)]
pub struct PgDriver {
    pool: DbPool,
}

impl PgDriver {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Run one statement and collect every row. Non-SELECT statements
    /// yield an empty list. Transient connection loss is retried once
    /// with a fresh connection; server-side timeouts are not.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>> {
        let rows = match bind_params(sqlx::query(sql), params)
            .fetch_all(self.pool.inner())
            .await
        {
            Ok(rows) => rows,
            Err(first) if is_transient(&first) => {
                tracing::warn!("Statement failed on a dropped connection ({first}), retrying once");
                bind_params(sqlx::query(sql), params)
                    .fetch_all(self.pool.inner())
                    .await
                    .map_err(|e| DbaError::from_sqlx(e, 0))?
            }
            Err(other) => return Err(DbaError::from_sqlx(other, 0)),
        };
        Ok(rows.iter().map(row_to_json).collect())
    }

    /// Stream a large result set as row batches. The stream is finite and
    /// not restartable; dropping the receiver cancels the fetch.
    pub fn execute_stream(
        &self,
        sql: String,
        params: Vec<Value>,
        batch_size: usize,
    ) -> mpsc::Receiver<Result<Vec<SqlRow>>> {
        let (tx, rx) = mpsc::channel(4);
        let pool = self.pool.clone();
        let batch_size = batch_size.max(1);
        tokio::spawn(async move {
            let mut stream = bind_params(sqlx::query(&sql), &params).fetch(pool.inner());
            let mut batch = Vec::with_capacity(batch_size);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(row) => {
                        batch.push(row_to_json(&row));
                        if batch.len() >= batch_size
                            && tx.send(Ok(std::mem::take(&mut batch))).await.is_err()
                        {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(DbaError::from_sqlx(err, 0))).await;
                        return;
                    }
                }
            }
            if !batch.is_empty() {
                let _ = tx.send(Ok(batch)).await;
            }
        });
        rx
    }
}

/// Run a statement on an already-borrowed connection. Session-scoped work
/// (hypothetical indexes, SET LOCAL) must stay on one connection.
pub async fn execute_on(
    conn: &mut PgConnection,
    sql: &str,
    params: &[Value],
) -> Result<Vec<SqlRow>> {
    let rows = bind_params(sqlx::query(sql), params)
        .fetch_all(conn)
        .await
        .map_err(|e| DbaError::from_sqlx(e, 0))?;
    Ok(rows.iter().map(row_to_json).collect())
}

pub(crate) fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    for value in params {
        query = match value {
            Value::Null => query.bind(Option::<&str>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap_or_default()),
            Value::Number(n) => query.bind(n.as_f64().unwrap_or_default()),
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(other.clone()),
        };
    }
    query
}

pub(crate) fn row_to_json(row: &PgRow) -> SqlRow {
    let mut cells = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        cells.insert(column.name().to_string(), cell_value(row, idx));
    }
    SqlRow { cells }
}

fn cell_value(row: &PgRow, idx: usize) -> Value {
    let type_name = row.columns()[idx].type_info().name().to_uppercase();
    match type_name.as_str() {
        "BOOL" => opt(row.try_get::<Option<bool>, _>(idx), Value::Bool),
        "INT2" => opt(row.try_get::<Option<i16>, _>(idx), |v| {
            Value::from(i64::from(v))
        }),
        "INT4" => opt(row.try_get::<Option<i32>, _>(idx), |v| {
            Value::from(i64::from(v))
        }),
        "INT8" => opt(row.try_get::<Option<i64>, _>(idx), Value::from),
        "FLOAT4" => opt(row.try_get::<Option<f32>, _>(idx), |v| {
            Value::from(f64::from(v))
        }),
        "FLOAT8" => opt(row.try_get::<Option<f64>, _>(idx), Value::from),
        // Stringified to preserve precision.
        "NUMERIC" => opt(row.try_get::<Option<BigDecimal>, _>(idx), |v| {
            Value::String(v.to_string())
        }),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        "UUID" => opt(row.try_get::<Option<sqlx::types::Uuid>, _>(idx), |v| {
            Value::String(v.to_string())
        }),
        "TIMESTAMPTZ" => opt(row.try_get::<Option<DateTime<Utc>>, _>(idx), |v| {
            Value::String(v.to_rfc3339())
        }),
        "TIMESTAMP" => opt(row.try_get::<Option<NaiveDateTime>, _>(idx), |v| {
            Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        }),
        "DATE" => opt(row.try_get::<Option<NaiveDate>, _>(idx), |v| {
            Value::String(v.format("%Y-%m-%d").to_string())
        }),
        "TIME" => opt(row.try_get::<Option<NaiveTime>, _>(idx), |v| {
            Value::String(v.format("%H:%M:%S%.f").to_string())
        }),
        "TEXT[]" | "VARCHAR[]" | "NAME[]" => {
            opt(row.try_get::<Option<Vec<String>>, _>(idx), |v| {
                Value::Array(v.into_iter().map(Value::String).collect())
            })
        }
        // TEXT, VARCHAR, NAME, BPCHAR, and anything else with a text form.
        _ => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
}

fn opt<T>(value: sqlx::Result<Option<T>>, to_json: impl FnOnce(T) -> Value) -> Value {
    value
        .ok()
        .flatten()
        .map(to_json)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> SqlRow {
        let mut cells = Map::new();
        for (k, v) in pairs {
            cells.insert((*k).to_string(), v.clone());
        }
        SqlRow { cells }
    }

    #[test]
    fn accessors_read_numbers_and_numeric_strings() {
        let r = row(&[
            ("calls", json!(42)),
            ("total", json!("1234.5")),
            ("live", json!(7.25)),
        ]);
        assert_eq!(r.as_i64("calls"), Some(42));
        assert_eq!(r.as_f64("total"), Some(1234.5));
        assert_eq!(r.as_f64("live"), Some(7.25));
        assert_eq!(r.as_i64("missing"), None);
    }

    #[test]
    fn rows_serialize_as_flat_objects() {
        let r = row(&[("name", json!("orders")), ("rows", json!(10))]);
        let encoded = serde_json::to_value(&r).expect("serialize");
        assert_eq!(encoded, json!({"name": "orders", "rows": 10}));
    }
}
