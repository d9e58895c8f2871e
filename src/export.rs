use chrono::{DateTime, Local};
use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::db::{DbError, ExportSource};
use crate::models::SavedQuery;

/// Content type of the streamed download.
pub const CSV_CONTENT_TYPE: &str = "text/csv; charset=utf-8";

const DEFAULT_BASENAME: &str = "query";

#[cfg(windows)]
const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
const LINE_ENDING: &str = "\n";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("{0}")]
    Db(#[from] DbError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Field separator for exports. Anything but a semicolon falls back to a
/// comma.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    Comma,
    Semicolon,
}

impl Separator {
    pub fn from_param(param: &str) -> Self {
        if param == ";" {
            Separator::Semicolon
        } else {
            Separator::Comma
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Separator::Comma => ",",
            Separator::Semicolon => ";",
        }
    }
}

/// `{base}_{timestamp}.csv`, where `base` is the name of the first saved
/// query whose trimmed SQL matches the script (`query` otherwise) and every
/// character outside `[A-Za-z0-9._-]` becomes `_`.
pub fn derive_filename<'a>(
    saved: impl IntoIterator<Item = &'a SavedQuery>,
    sql: &str,
    now: DateTime<Local>,
) -> String {
    let base = saved
        .into_iter()
        .find(|q| q.sql.trim() == sql.trim())
        .map(|q| q.name.as_str())
        .unwrap_or(DEFAULT_BASENAME);

    let raw = format!("{}_{}.csv", base, now.format("%Y-%m-%d_%H:%M:%S"));
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn csv_field(raw: &str) -> String {
    format!("\"{}\"", raw.replace('"', "\"\""))
}

fn csv_record(fields: impl IntoIterator<Item = String>, separator: Separator) -> String {
    let mut record = fields
        .into_iter()
        .map(|field| csv_field(&field))
        .collect::<Vec<_>>()
        .join(separator.as_str());
    record.push_str(LINE_ENDING);
    record
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A prepared export. The filename is derived up front (the transport needs
/// it for the attachment header); `write_to` then streams the body without
/// buffering the result set.
pub struct CsvExport {
    pub filename: String,
    separator: Separator,
    source: ExportSource,
}

impl CsvExport {
    pub fn new(filename: String, separator: Separator, source: ExportSource) -> Self {
        Self {
            filename,
            separator,
            source,
        }
    }

    /// Writes the header row and then each record as it is fetched. A script
    /// whose first statement returned no row set produces the two-record
    /// `info` / affected-count form instead.
    pub async fn write_to<W>(self, out: &mut W) -> Result<(), ExportError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let CsvExport {
            separator, source, ..
        } = self;

        match source {
            ExportSource::Rows { columns, mut rows } => {
                out.write_all(csv_record(columns, separator).as_bytes())
                    .await?;
                while let Some(row) = rows.next().await {
                    let row = row?;
                    let record = csv_record(row.iter().map(display_value), separator);
                    out.write_all(record.as_bytes()).await?;
                }
            }
            ExportSource::Affected(count) => {
                out.write_all(csv_record(["info".to_string()], separator).as_bytes())
                    .await?;
                out.write_all(csv_record([count.to_string()], separator).as_bytes())
                    .await?;
            }
        }

        out.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::stream;
    use serde_json::json;

    fn saved(name: &str, sql: &str) -> SavedQuery {
        SavedQuery {
            id: "id".to_string(),
            name: name.to_string(),
            sql: sql.to_string(),
            created_at: chrono::Utc::now(),
            updated_at: None,
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn separator_falls_back_to_comma() {
        assert_eq!(Separator::from_param(";"), Separator::Semicolon);
        assert_eq!(Separator::from_param(","), Separator::Comma);
        assert_eq!(Separator::from_param("|"), Separator::Comma);
        assert_eq!(Separator::from_param(""), Separator::Comma);
    }

    #[test]
    fn filename_uses_matching_saved_query_name() {
        let queries = [saved("daily_report", "SELECT * FROM t")];
        let name = derive_filename(&queries, "  SELECT * FROM t  ", at(2024, 3, 9, 14, 30, 5));
        assert_eq!(name, "daily_report_2024-03-09_14_30_05.csv");
    }

    #[test]
    fn filename_defaults_to_query() {
        let name = derive_filename(std::iter::empty(), "SELECT 1", at(2024, 3, 9, 14, 30, 5));
        assert_eq!(name, "query_2024-03-09_14_30_05.csv");
    }

    #[test]
    fn filename_is_sanitized() {
        let queries = [saved("My Report!!", "SELECT 1")];
        let name = derive_filename(&queries, "SELECT 1", at(2024, 3, 9, 14, 30, 5));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
        assert!(name.starts_with("My_Report___"));
    }

    #[test]
    fn fields_are_quoted_with_doubled_quotes() {
        assert_eq!(csv_field("plain"), "\"plain\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    fn rows_source(
        columns: &[&str],
        rows: Vec<Result<Vec<serde_json::Value>, DbError>>,
    ) -> ExportSource {
        ExportSource::Rows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: stream::iter(rows).boxed(),
        }
    }

    #[tokio::test]
    async fn rows_are_streamed_with_the_chosen_separator() {
        let source = rows_source(
            &["id", "name"],
            vec![
                Ok(vec![json!(1), json!("ada")]),
                Ok(vec![json!(2), serde_json::Value::Null]),
            ],
        );
        let export = CsvExport::new("x.csv".to_string(), Separator::Semicolon, source);

        let mut out = Vec::new();
        export.write_to(&mut out).await.unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "\"id\";\"name\"\n\"1\";\"ada\"\n\"2\";\"\"\n"
        );
    }

    #[tokio::test]
    async fn statement_without_rows_exports_the_info_form() {
        let export = CsvExport::new(
            "x.csv".to_string(),
            Separator::Comma,
            ExportSource::Affected(7),
        );

        let mut out = Vec::new();
        export.write_to(&mut out).await.unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "\"info\"\n\"7\"\n");
    }

    #[tokio::test]
    async fn mid_stream_error_aborts_after_partial_output() {
        let source = rows_source(
            &["id"],
            vec![
                Ok(vec![json!(1)]),
                Err(DbError::Query("server gone".to_string())),
            ],
        );
        let export = CsvExport::new("x.csv".to_string(), Separator::Comma, source);

        let mut out = Vec::new();
        let err = export.write_to(&mut out).await.unwrap_err();
        assert!(matches!(err, ExportError::Db(_)));
        assert_eq!(String::from_utf8(out).unwrap(), "\"id\"\n\"1\"\n");
    }
}
