use std::time::Instant;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::channel::mpsc;
use futures::{stream, SinkExt, StreamExt};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlQueryResult, MySqlRow};
use sqlx::{Column, ConnectOptions, Connection, Either, Row, TypeInfo};

use async_trait::async_trait;

use crate::db::{DatabaseDriver, DbError, ExportSource};
use crate::models::{ConnectParams, StatementOutcome, TablePage};

pub struct MySqlDriver;

impl MySqlDriver {
    pub fn new() -> Self {
        Self
    }
}

async fn connect(params: &ConnectParams) -> Result<MySqlConnection, DbError> {
    let mut options = MySqlConnectOptions::new()
        .host(&params.host)
        .port(params.port)
        .username(&params.user)
        .password(&params.password);
    if let Some(database) = params.database.as_deref() {
        options = options.database(database);
    }

    options
        .connect()
        .await
        .map_err(|e| DbError::Connect(e.to_string()))
}

// Table names pass an allow-list check upstream before they reach this
// quoting.
fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[async_trait]
impl DatabaseDriver for MySqlDriver {
    async fn run_script(
        &self,
        params: &ConnectParams,
        sql: &str,
    ) -> Result<Vec<StatementOutcome>, DbError> {
        let mut conn = connect(params).await?;
        let outcomes = collect_outcomes(&mut conn, sql).await;
        let _ = conn.close().await;

        match &outcomes {
            Ok(list) => tracing::debug!(statements = list.len(), "script executed"),
            Err(e) => tracing::debug!(error = %e, "script failed"),
        }
        outcomes
    }

    async fn stream_first_result(
        &self,
        params: &ConnectParams,
        sql: &str,
    ) -> Result<ExportSource, DbError> {
        let mut conn = connect(params).await?;
        let sql = sql.to_string();

        // A task owns the connection and feeds events through a bounded
        // channel, so rows reach the CSV writer as they come off the wire
        // instead of being materialized first. The task stops after the first
        // statement's terminating packet; only that result is exported.
        let (mut tx, mut rx) =
            mpsc::channel::<Result<Either<MySqlQueryResult, MySqlRow>, sqlx::Error>>(64);
        tokio::spawn(async move {
            {
                let mut events = sqlx::raw_sql(&sql).fetch_many(&mut conn);
                while let Some(event) = events.next().await {
                    let last = matches!(&event, Ok(Either::Left(_)) | Err(_));
                    if tx.send(event).await.is_err() {
                        break;
                    }
                    if last {
                        break;
                    }
                }
            }
            let _ = conn.close().await;
        });

        match rx.next().await {
            None => Ok(ExportSource::Affected(0)),
            Some(Err(e)) => Err(DbError::Query(e.to_string())),
            Some(Ok(Either::Left(done))) => Ok(ExportSource::Affected(done.rows_affected())),
            Some(Ok(Either::Right(first))) => {
                let columns = first
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect();
                let head = stream::iter(vec![Ok(row_values(&first))]);
                let tail = rx.filter_map(|event| async move {
                    match event {
                        Ok(Either::Right(row)) => Some(Ok(row_values(&row))),
                        Ok(Either::Left(_)) => None,
                        Err(e) => Some(Err(DbError::Query(e.to_string()))),
                    }
                });
                Ok(ExportSource::Rows {
                    columns,
                    rows: head.chain(tail).boxed(),
                })
            }
        }
    }

    async fn fetch_table_page(
        &self,
        params: &ConnectParams,
        table: &str,
        limit: u64,
        offset: u64,
    ) -> Result<TablePage, DbError> {
        let mut conn = connect(params).await?;
        let page = fetch_page(&mut conn, table, limit, offset).await;
        let _ = conn.close().await;
        page
    }

    async fn list_databases(&self, params: &ConnectParams) -> Result<Vec<String>, DbError> {
        // Connect without selecting a database so a stale default cannot make
        // the listing itself fail.
        let mut bare = params.clone();
        bare.database = None;

        let mut conn = connect(&bare).await?;
        let names = fetch_names(&mut conn, "SHOW DATABASES").await;
        let _ = conn.close().await;
        names
    }

    async fn list_tables(&self, params: &ConnectParams) -> Result<Vec<String>, DbError> {
        let mut conn = connect(params).await?;
        let names = fetch_names(&mut conn, "SHOW TABLES").await;
        let _ = conn.close().await;
        names
    }
}

/// Folds the driver's event stream into per-statement outcomes. Every
/// statement terminates with an `Either::Left` carrying its affected-row
/// count; row events before it belong to that statement.
async fn collect_outcomes(
    conn: &mut MySqlConnection,
    sql: &str,
) -> Result<Vec<StatementOutcome>, DbError> {
    let mut outcomes = Vec::new();
    let mut columns: Vec<String> = Vec::new();
    let mut rows: Vec<Vec<serde_json::Value>> = Vec::new();
    let mut timer = Instant::now();

    let mut events = sqlx::raw_sql(sql).fetch_many(conn);
    while let Some(event) = events.next().await {
        match event.map_err(|e| DbError::Query(e.to_string()))? {
            Either::Right(row) => {
                if columns.is_empty() {
                    columns = row
                        .columns()
                        .iter()
                        .map(|c| c.name().to_string())
                        .collect();
                }
                rows.push(row_values(&row));
            }
            Either::Left(done) => {
                let elapsed_ms = timer.elapsed().as_millis() as u64;
                if columns.is_empty() && rows.is_empty() {
                    outcomes.push(StatementOutcome::Affected {
                        affected_rows: done.rows_affected(),
                        elapsed_ms,
                    });
                } else {
                    let row_count = rows.len() as u64;
                    outcomes.push(StatementOutcome::Rows {
                        columns: std::mem::take(&mut columns),
                        rows: std::mem::take(&mut rows),
                        row_count,
                        elapsed_ms,
                    });
                }
                timer = Instant::now();
            }
        }
    }

    Ok(outcomes)
}

async fn fetch_page(
    conn: &mut MySqlConnection,
    table: &str,
    limit: u64,
    offset: u64,
) -> Result<TablePage, DbError> {
    let table = quote_identifier(table);

    let count_sql = format!("SELECT COUNT(*) FROM {table}");
    let total: i64 = sqlx::query_scalar(&count_sql)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;

    let page_sql = format!("SELECT * FROM {table} LIMIT {limit} OFFSET {offset}");
    let fetched = sqlx::query(&page_sql)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;

    let columns = fetched
        .first()
        .map(|row| {
            row.columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect()
        })
        .unwrap_or_default();
    let rows = fetched.iter().map(row_values).collect();

    Ok(TablePage {
        total_rows: total.max(0) as u64,
        columns,
        rows,
    })
}

async fn fetch_names(conn: &mut MySqlConnection, sql: &str) -> Result<Vec<String>, DbError> {
    let rows = sqlx::query(sql)
        .fetch_all(conn)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;

    rows.iter()
        .map(|row| {
            row.try_get::<String, _>(0)
                .map_err(|e| DbError::Query(e.to_string()))
        })
        .collect()
}

fn row_values(row: &MySqlRow) -> Vec<serde_json::Value> {
    (0..row.columns().len())
        .map(|i| map_mysql_value(row, i))
        .collect()
}

fn map_mysql_value(row: &MySqlRow, index: usize) -> serde_json::Value {
    use sqlx::ValueRef;
    let value_ref = match row.try_get_raw(index) {
        Ok(v) => v,
        Err(_) => return serde_json::Value::Null,
    };

    if value_ref.is_null() {
        return serde_json::Value::Null;
    }

    let type_info = value_ref.type_info();
    let type_name = type_info.name();

    match type_name {
        "BOOLEAN" => {
            let v: Option<bool> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            let v: Option<i64> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => {
            let v: Option<u64> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "YEAR" => {
            let v: Option<u16> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "FLOAT" => {
            let v: Option<f32> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "DOUBLE" => {
            let v: Option<f64> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "DECIMAL" => {
            let v: Option<sqlx::types::BigDecimal> = row.try_get(index).ok();
            if let Some(d) = v {
                serde_json::json!(d.to_string())
            } else {
                serde_json::Value::Null
            }
        }
        "CHAR" | "VARCHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM" | "SET" => {
            let v: Option<String> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "DATE" => {
            let v: Option<NaiveDate> = row.try_get(index).ok();
            serde_json::json!(v.map(|d| d.to_string()))
        }
        "TIME" => {
            let v: Option<NaiveTime> = row.try_get(index).ok();
            serde_json::json!(v.map(|t| t.to_string()))
        }
        "DATETIME" => {
            let v: Option<NaiveDateTime> = row.try_get(index).ok();
            serde_json::json!(v.map(|t| t.to_string()))
        }
        "TIMESTAMP" => {
            // Try as DateTime<Utc>, fall back to a naive timestamp.
            let v: Option<DateTime<Utc>> = row.try_get(index).ok();
            if let Some(t) = v {
                return serde_json::json!(t.to_string());
            }
            let v: Option<NaiveDateTime> = row.try_get(index).ok();
            serde_json::json!(v.map(|t| t.to_string()))
        }
        "JSON" => {
            let v: Option<serde_json::Value> = row.try_get(index).ok();
            v.unwrap_or(serde_json::Value::Null)
        }
        "BIT" => {
            let v: Option<u64> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
            let v: Option<Vec<u8>> = row.try_get(index).ok();
            match v.map(String::from_utf8) {
                Some(Ok(s)) => serde_json::Value::String(s),
                _ => serde_json::Value::String(format!("<{}>", type_name)),
            }
        }
        _ => {
            let v: Option<String> = row.try_get(index).ok();
            match v {
                Some(s) => serde_json::Value::String(s),
                None => serde_json::Value::String(format!("<{}>", type_name)),
            }
        }
    }
}
