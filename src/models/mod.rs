use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Seconds a stored credential stays usable after login.
pub const CREDENTIAL_EXPIRY_SECS: i64 = 60 * 60 * 8;

/// Fixed page size for table browsing.
pub const PAGE_SIZE: u64 = 100;

pub const DEFAULT_MYSQL_PORT: u16 = 3306;

/// Operator identity stored in the session after a successful login.
/// `database` starts as the login form's default and is overwritten when the
/// operator picks a working database.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Credential {
    pub host: String,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(
        host: String,
        user: String,
        password: String,
        database: Option<String>,
        label: String,
    ) -> Self {
        Self {
            host,
            user,
            password,
            database,
            label,
            created_at: Utc::now(),
        }
    }

    /// Recomputed on every access; there is no background sweep. A credential
    /// can still sit in the session store and be reported invalid the moment
    /// the expiry window elapses.
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty()
            && !self.user.is_empty()
            && (Utc::now() - self.created_at).num_seconds() <= CREDENTIAL_EXPIRY_SECS
    }

    /// Connection parameters for one driver invocation. `database` takes the
    /// request-level override when given, else the credential's working
    /// database.
    pub fn connect_params(&self, database: Option<String>) -> ConnectParams {
        let (host, port) = split_host_port(&self.host);
        ConnectParams {
            host,
            port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: database.or_else(|| self.database.clone()),
        }
    }
}

// Operators often type "host:3307" into the host field; anything that does
// not parse as a port stays part of the host name.
fn split_host_port(host: &str) -> (String, u16) {
    match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() => match port.parse() {
            Ok(port) => (name.to_string(), port),
            Err(_) => (host.to_string(), DEFAULT_MYSQL_PORT),
        },
        _ => (host.to_string(), DEFAULT_MYSQL_PORT),
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
}

/// Result of one statement of a script, in server execution order.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatementOutcome {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
        row_count: u64,
        elapsed_ms: u64,
    },
    Affected {
        affected_rows: u64,
        elapsed_ms: u64,
    },
}

impl StatementOutcome {
    /// Contribution of this statement to the script's row impact.
    pub fn row_impact(&self) -> u64 {
        match self {
            StatementOutcome::Rows { row_count, .. } => *row_count,
            StatementOutcome::Affected { affected_rows, .. } => *affected_rows,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SavedQuery {
    pub id: String,
    pub name: String,
    pub sql: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Advisory back-reference to the catalog entry currently in the editor.
/// Never owns the entry; cleared when the entry is deleted or the session
/// ends.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EditPointer {
    pub id: String,
    pub name: String,
}

/// One page of a browsed table, recomputed fresh on every request.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TableView {
    pub table: String,
    pub page: u64,
    pub page_size: u64,
    pub total_rows: u64,
    pub total_pages: u64,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// Raw window fetched by the driver for one browse invocation.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TablePage {
    pub total_rows: u64,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn credential(host: &str, user: &str) -> Credential {
        Credential::new(
            host.to_string(),
            user.to_string(),
            String::new(),
            None,
            "dev".to_string(),
        )
    }

    #[test]
    fn fresh_credential_is_valid_even_without_password() {
        assert!(credential("127.0.0.1", "root").is_valid());
    }

    #[test]
    fn empty_host_or_user_is_invalid() {
        assert!(!credential("", "root").is_valid());
        assert!(!credential("127.0.0.1", "").is_valid());
    }

    #[test]
    fn credential_expires_after_the_window() {
        let mut cred = credential("127.0.0.1", "root");
        cred.created_at = Utc::now() - Duration::seconds(CREDENTIAL_EXPIRY_SECS + 1);
        assert!(!cred.is_valid());

        // One second inside the window is still fine.
        cred.created_at = Utc::now() - Duration::seconds(CREDENTIAL_EXPIRY_SECS - 1);
        assert!(cred.is_valid());
    }

    #[test]
    fn host_port_suffix_is_split_off() {
        assert_eq!(
            split_host_port("db.internal:3307"),
            ("db.internal".to_string(), 3307)
        );
        assert_eq!(
            split_host_port("127.0.0.1"),
            ("127.0.0.1".to_string(), DEFAULT_MYSQL_PORT)
        );
        assert_eq!(
            split_host_port("db:notaport"),
            ("db:notaport".to_string(), DEFAULT_MYSQL_PORT)
        );
    }

    #[test]
    fn request_override_beats_credential_database() {
        let mut cred = credential("127.0.0.1", "root");
        cred.database = Some("main".to_string());

        assert_eq!(
            cred.connect_params(Some("other".to_string())).database,
            Some("other".to_string())
        );
        assert_eq!(cred.connect_params(None).database, Some("main".to_string()));
    }

    #[test]
    fn row_impact_counts_rows_and_affected() {
        let rows = StatementOutcome::Rows {
            columns: vec!["id".to_string()],
            rows: vec![vec![json!(1)], vec![json!(2)]],
            row_count: 2,
            elapsed_ms: 0,
        };
        let affected = StatementOutcome::Affected {
            affected_rows: 3,
            elapsed_ms: 0,
        };
        assert_eq!(rows.row_impact(), 2);
        assert_eq!(affected.row_impact(), 3);
    }
}
