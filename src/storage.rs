use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use indexmap::IndexMap;
use thiserror::Error;
use uuid::Uuid;

use crate::models::SavedQuery;

const FILE_NAME: &str = "saved_queries.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

/// Durable catalog of named queries, kept as one JSON mapping of id to entry.
/// The whole mapping is rewritten on every mutation; concurrent writers race
/// with last-write-wins semantics.
pub struct QueryCatalog {
    path: PathBuf,
}

impl QueryCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Catalog stored as `saved_queries.json` inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(FILE_NAME),
        }
    }

    /// A missing or unparseable file reads as an empty catalog. Entries keep
    /// insertion order for display.
    pub fn load_all(&self) -> Result<IndexMap<String, SavedQuery>, StorageError> {
        if !self.path.exists() {
            return Ok(IndexMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content).unwrap_or_default())
    }

    fn save_all(&self, queries: &IndexMap<String, SavedQuery>) -> Result<(), StorageError> {
        let content = serde_json::to_string_pretty(queries)?;
        fs::write(&self.path, content)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<SavedQuery>, StorageError> {
        Ok(self.load_all()?.get(id).cloned())
    }

    /// Creates a new entry when `id` is absent or unknown, otherwise
    /// overwrites name and sql and stamps `updated_at`.
    pub fn upsert(
        &self,
        id: Option<&str>,
        name: &str,
        sql: &str,
    ) -> Result<SavedQuery, StorageError> {
        let mut queries = self.load_all()?;
        let query = match id.and_then(|id| queries.get_mut(id)) {
            Some(existing) => {
                existing.name = name.to_string();
                existing.sql = sql.to_string();
                existing.updated_at = Some(Utc::now());
                existing.clone()
            }
            None => {
                let query = SavedQuery {
                    id: Uuid::new_v4().to_string(),
                    name: name.to_string(),
                    sql: sql.to_string(),
                    created_at: Utc::now(),
                    updated_at: None,
                };
                queries.insert(query.id.clone(), query.clone());
                query
            }
        };
        self.save_all(&queries)?;
        Ok(query)
    }

    /// Returns whether an entry was removed.
    pub fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let mut queries = self.load_all()?;
        let removed = queries.shift_remove(id).is_some();
        if removed {
            self.save_all(&queries)?;
        }
        Ok(removed)
    }
}
