use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::models::{Credential, EditPointer};

/// Tables most recently listed for a database; doubles as the allow-list for
/// table browsing.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ListedTables {
    pub database: Option<String>,
    pub tables: Vec<String>,
}

/// Per-operator session bag, owned by the store and addressed by the session
/// id the transport layer supplies.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SessionState {
    pub credential: Option<Credential>,
    pub last_row_impact: u64,
    pub current_edit: Option<EditPointer>,
    pub listed_tables: Option<ListedTables>,
}

pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `f` against the bag for `session_id`, creating an empty bag on
    /// first touch.
    pub fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionState) -> T,
    ) -> Result<T, Error> {
        let mut sessions = self.sessions.lock().map_err(|_| Error::SessionStore)?;
        Ok(f(sessions.entry(session_id.to_string()).or_default()))
    }

    /// Replaces any existing credential; derived state is left alone.
    pub fn login(&self, session_id: &str, credential: Credential) -> Result<(), Error> {
        self.with_session(session_id, |s| s.credential = Some(credential))
    }

    /// Clears the credential and all derived state. Idempotent.
    pub fn logout(&self, session_id: &str) -> Result<(), Error> {
        self.with_session(session_id, |s| *s = SessionState::default())
    }

    pub fn credential(&self, session_id: &str) -> Result<Option<Credential>, Error> {
        self.with_session(session_id, |s| s.credential.clone())
    }

    pub fn credentials_valid(&self, session_id: &str) -> Result<bool, Error> {
        self.with_session(session_id, |s| {
            s.credential.as_ref().map_or(false, Credential::is_valid)
        })
    }

    /// Persists a working-database override onto the live credential, so later
    /// requests in this session default to it. An empty name clears the
    /// override.
    pub fn set_selected_database(&self, session_id: &str, database: &str) -> Result<(), Error> {
        self.with_session(session_id, |s| {
            if let Some(credential) = s.credential.as_mut() {
                credential.database = if database.is_empty() {
                    None
                } else {
                    Some(database.to_string())
                };
            }
        })
    }

    pub fn set_row_impact(&self, session_id: &str, impact: u64) -> Result<(), Error> {
        self.with_session(session_id, |s| s.last_row_impact = impact)
    }

    /// Rows returned/affected by the most recent script or table view.
    pub fn row_impact(&self, session_id: &str) -> Result<u64, Error> {
        self.with_session(session_id, |s| s.last_row_impact)
    }

    pub fn set_current_edit(
        &self,
        session_id: &str,
        edit: Option<EditPointer>,
    ) -> Result<(), Error> {
        self.with_session(session_id, |s| s.current_edit = edit)
    }

    pub fn current_edit(&self, session_id: &str) -> Result<Option<EditPointer>, Error> {
        self.with_session(session_id, |s| s.current_edit.clone())
    }

    pub fn set_listed_tables(
        &self,
        session_id: &str,
        database: Option<String>,
        tables: Vec<String>,
    ) -> Result<(), Error> {
        self.with_session(session_id, |s| {
            s.listed_tables = Some(ListedTables { database, tables })
        })
    }

    /// Membership check against the most recent listing; a listing for a
    /// different database does not count.
    pub fn is_listed_table(
        &self,
        session_id: &str,
        database: &Option<String>,
        table: &str,
    ) -> Result<bool, Error> {
        self.with_session(session_id, |s| {
            s.listed_tables.as_ref().map_or(false, |listed| {
                listed.database == *database && listed.tables.iter().any(|t| t == table)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_login(session_id: &str) -> SessionStore {
        let store = SessionStore::new();
        store
            .login(
                session_id,
                Credential::new(
                    "127.0.0.1".to_string(),
                    "root".to_string(),
                    String::new(),
                    None,
                    "dev".to_string(),
                ),
            )
            .unwrap();
        store
    }

    #[test]
    fn login_makes_the_session_valid() {
        let store = store_with_login("s1");
        assert!(store.credentials_valid("s1").unwrap());
        // Other sessions are unaffected.
        assert!(!store.credentials_valid("s2").unwrap());
    }

    #[test]
    fn logout_clears_credential_and_derived_state() {
        let store = store_with_login("s1");
        store.set_row_impact("s1", 42).unwrap();
        store
            .set_current_edit(
                "s1",
                Some(EditPointer {
                    id: "q1".to_string(),
                    name: "report".to_string(),
                }),
            )
            .unwrap();

        store.logout("s1").unwrap();
        assert!(!store.credentials_valid("s1").unwrap());
        assert_eq!(store.row_impact("s1").unwrap(), 0);
        assert!(store.current_edit("s1").unwrap().is_none());

        // Logging out twice is fine.
        store.logout("s1").unwrap();
    }

    #[test]
    fn selected_database_sticks_to_the_credential() {
        let store = store_with_login("s1");
        store.set_selected_database("s1", "shop").unwrap();
        let credential = store.credential("s1").unwrap().unwrap();
        assert_eq!(credential.database, Some("shop".to_string()));

        store.set_selected_database("s1", "").unwrap();
        let credential = store.credential("s1").unwrap().unwrap();
        assert_eq!(credential.database, None);
    }

    #[test]
    fn table_listing_is_scoped_to_its_database() {
        let store = store_with_login("s1");
        store
            .set_listed_tables(
                "s1",
                Some("shop".to_string()),
                vec!["users".to_string(), "orders".to_string()],
            )
            .unwrap();

        let shop = Some("shop".to_string());
        let other = Some("other".to_string());
        assert!(store.is_listed_table("s1", &shop, "users").unwrap());
        assert!(!store.is_listed_table("s1", &shop, "missing").unwrap());
        assert!(!store.is_listed_table("s1", &other, "users").unwrap());
        assert!(!store.is_listed_table("s2", &shop, "users").unwrap());
    }
}
