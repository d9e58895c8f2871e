use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::models::{ConnectParams, StatementOutcome, TablePage};

pub mod mysql;

#[derive(Debug, Error)]
pub enum DbError {
    /// The server refused the connection; no statements ran.
    #[error("{0}")]
    Connect(String),
    /// The server rejected or failed a statement.
    #[error("{0}")]
    Query(String),
}

/// First statement's result of an exported script: rows streamed as they are
/// fetched, or the affected-row count when the statement returned no row set.
pub enum ExportSource {
    Rows {
        columns: Vec<String>,
        rows: BoxStream<'static, Result<Vec<serde_json::Value>, DbError>>,
    },
    Affected(u64),
}

/// One driver invocation opens one connection and closes it before returning,
/// success or failure. No pooling, no reuse across requests.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Runs a possibly multi-statement script and returns one outcome per
    /// statement in server order. All-or-nothing: a mid-script error discards
    /// the outcomes collected so far.
    async fn run_script(
        &self,
        params: &ConnectParams,
        sql: &str,
    ) -> Result<Vec<StatementOutcome>, DbError>;

    /// Re-runs a script fresh and hands back the first statement's result for
    /// streaming export.
    async fn stream_first_result(
        &self,
        params: &ConnectParams,
        sql: &str,
    ) -> Result<ExportSource, DbError>;

    /// `COUNT(*)` plus one `LIMIT/OFFSET` window, both over the same
    /// connection.
    async fn fetch_table_page(
        &self,
        params: &ConnectParams,
        table: &str,
        limit: u64,
        offset: u64,
    ) -> Result<TablePage, DbError>;

    async fn list_databases(&self, params: &ConnectParams) -> Result<Vec<String>, DbError>;

    async fn list_tables(&self, params: &ConnectParams) -> Result<Vec<String>, DbError>;
}
