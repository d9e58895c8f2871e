use thiserror::Error;

use crate::db::DbError;
use crate::export::ExportError;
use crate::storage::StorageError;

/// Action-boundary errors. Every variant renders as a user-visible message;
/// none of them are fatal to the process.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Database credentials are missing or expired. Please log in.")]
    CredentialsMissing,

    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Unknown table '{0}'")]
    UnknownTable(String),

    #[error("Unknown saved query.")]
    QueryNotFound,

    #[error("{0}")]
    Validation(&'static str),

    #[error("Saved query storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Export failed: {0}")]
    Export(#[from] ExportError),

    #[error("Session store is unavailable.")]
    SessionStore,
}

impl From<DbError> for Error {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Connect(msg) => Error::Connect(msg),
            DbError::Query(msg) => Error::Query(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_keep_their_prefixes() {
        let err = Error::from(DbError::Connect("refused".to_string()));
        assert_eq!(err.to_string(), "Connect error: refused");

        let err = Error::from(DbError::Query("syntax".to_string()));
        assert_eq!(err.to_string(), "Query error: syntax");

        assert_eq!(
            Error::CredentialsMissing.to_string(),
            "Database credentials are missing or expired. Please log in."
        );

        let err = Error::from(ExportError::Db(DbError::Query("gone".to_string())));
        assert_eq!(err.to_string(), "Export failed: gone");
    }
}
