use std::sync::Arc;

use chrono::Local;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::db::DatabaseDriver;
use crate::error::Error;
use crate::export::{self, CsvExport, Separator};
use crate::models::{
    Credential, EditPointer, SavedQuery, StatementOutcome, TableView, PAGE_SIZE,
};
use crate::state::SessionStore;
use crate::storage::QueryCatalog;

const LOGIN_FIELDS_REQUIRED: &str = "Please provide host, user and a label for these credentials.";
const SAVE_NAME_REQUIRED: &str = "Please provide a name to save the query.";

/// Everything a request handler needs, passed explicitly together with the
/// transport-supplied session id; no component reads ambient global state.
pub struct AppContext {
    pub sessions: SessionStore,
    pub catalog: QueryCatalog,
    pub driver: Arc<dyn DatabaseDriver>,
}

impl AppContext {
    pub fn new(catalog: QueryCatalog, driver: Arc<dyn DatabaseDriver>) -> Self {
        Self {
            sessions: SessionStore::new(),
            catalog,
            driver,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoginRequest {
    pub host: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: String,
    pub label: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunRequest {
    pub sql: String,
    #[serde(default)]
    pub selected_db: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExportRequest {
    pub sql: String,
    #[serde(default)]
    pub sep: String,
    #[serde(default)]
    pub selected_db: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SaveRequest {
    pub name: String,
    pub sql: String,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowseRequest {
    pub table: String,
    #[serde(default)]
    pub page: u64,
    #[serde(default)]
    pub selected_db: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseSelection {
    pub selected_database: String,
    pub tables: Vec<String>,
}

/// Sidebar metadata, refreshed opportunistically while credentials are valid.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SchemaOverview {
    pub databases: Vec<String>,
    pub selected_database: Option<String>,
    pub tables: Vec<String>,
}

// Every credential-gated action goes through here; validity is recomputed on
// each call, so an expired login fails the next action without any sweep.
fn valid_credential(ctx: &AppContext, session_id: &str) -> Result<Credential, Error> {
    match ctx.sessions.credential(session_id)? {
        Some(credential) if credential.is_valid() => Ok(credential),
        _ => Err(Error::CredentialsMissing),
    }
}

pub async fn login(ctx: &AppContext, session_id: &str, request: LoginRequest) -> Result<(), Error> {
    let host = request.host.trim().to_string();
    let user = request.user.trim().to_string();
    let label = request.label.trim().to_string();
    let database = request.database.trim().to_string();

    if host.is_empty() || user.is_empty() || label.is_empty() {
        return Err(Error::Validation(LOGIN_FIELDS_REQUIRED));
    }

    let database = (!database.is_empty()).then_some(database);
    ctx.sessions.login(
        session_id,
        Credential::new(host, user, request.password, database, label),
    )
}

pub async fn logout(ctx: &AppContext, session_id: &str) -> Result<(), Error> {
    ctx.sessions.logout(session_id)
}

/// Runs a script and reports one outcome per statement in server order.
/// All-or-nothing: a mid-script failure surfaces as `Query` with no partial
/// outcomes. The session's row impact becomes the sum over all outcomes.
pub async fn run_query(
    ctx: &AppContext,
    session_id: &str,
    request: RunRequest,
) -> Result<Vec<StatementOutcome>, Error> {
    let credential = valid_credential(ctx, session_id)?;
    let params = credential.connect_params(request.selected_db);

    let outcomes = ctx.driver.run_script(&params, &request.sql).await?;

    let impact: u64 = outcomes.iter().map(StatementOutcome::row_impact).sum();
    ctx.sessions.set_row_impact(session_id, impact)?;
    Ok(outcomes)
}

/// Re-runs the script fresh and prepares a streaming CSV download of its
/// first statement's result.
pub async fn export_csv(
    ctx: &AppContext,
    session_id: &str,
    request: ExportRequest,
) -> Result<CsvExport, Error> {
    let credential = valid_credential(ctx, session_id)?;
    let params = credential.connect_params(request.selected_db);
    let separator = Separator::from_param(&request.sep);

    let saved = ctx.catalog.load_all()?;
    let filename = export::derive_filename(saved.values(), &request.sql, Local::now());

    let source = ctx.driver.stream_first_result(&params, &request.sql).await?;
    Ok(CsvExport::new(filename, separator, source))
}

pub async fn save_query(
    ctx: &AppContext,
    session_id: &str,
    request: SaveRequest,
) -> Result<SavedQuery, Error> {
    valid_credential(ctx, session_id)?;

    let name = request.name.trim();
    if name.is_empty() {
        return Err(Error::Validation(SAVE_NAME_REQUIRED));
    }

    let saved = ctx.catalog.upsert(request.id.as_deref(), name, &request.sql)?;
    ctx.sessions.set_current_edit(
        session_id,
        Some(EditPointer {
            id: saved.id.clone(),
            name: saved.name.clone(),
        }),
    )?;
    Ok(saved)
}

pub async fn delete_query(ctx: &AppContext, session_id: &str, id: &str) -> Result<bool, Error> {
    valid_credential(ctx, session_id)?;

    let removed = ctx.catalog.delete(id)?;
    ctx.sessions.with_session(session_id, |s| {
        if s.current_edit.as_ref().map_or(false, |edit| edit.id == id) {
            s.current_edit = None;
        }
    })?;
    Ok(removed)
}

/// Puts a saved query back into the editor and remembers it as the entry
/// being edited.
pub async fn load_query(ctx: &AppContext, session_id: &str, id: &str) -> Result<SavedQuery, Error> {
    valid_credential(ctx, session_id)?;

    let query = ctx.catalog.get(id)?.ok_or(Error::QueryNotFound)?;
    ctx.sessions.set_current_edit(
        session_id,
        Some(EditPointer {
            id: query.id.clone(),
            name: query.name.clone(),
        }),
    )?;
    Ok(query)
}

/// Persists the working-database override and refreshes the table listing for
/// it. A failed listing degrades to an empty list; the selection itself
/// sticks.
pub async fn set_database(
    ctx: &AppContext,
    session_id: &str,
    database: &str,
) -> Result<DatabaseSelection, Error> {
    let credential = valid_credential(ctx, session_id)?;
    ctx.sessions.set_selected_database(session_id, database)?;

    let selected = (!database.is_empty()).then(|| database.to_string());
    let tables = match &selected {
        Some(_) => {
            let params = credential.connect_params(selected.clone());
            match ctx.driver.list_tables(&params).await {
                Ok(tables) => tables,
                Err(e) => {
                    tracing::warn!(error = %e, database, "could not list tables");
                    Vec::new()
                }
            }
        }
        None => Vec::new(),
    };
    ctx.sessions
        .set_listed_tables(session_id, selected, tables.clone())?;

    Ok(DatabaseSelection {
        selected_database: database.to_string(),
        tables,
    })
}

/// Fetches the database list (and the table list of the selected database)
/// for the sidebar. Callers degrade a failure here to an informational
/// message; it never blocks the rest of the page.
pub async fn list_schemas(ctx: &AppContext, session_id: &str) -> Result<SchemaOverview, Error> {
    let credential = valid_credential(ctx, session_id)?;
    let params = credential.connect_params(None);

    let databases = ctx.driver.list_databases(&params).await?;

    let selected_database = params.database.clone();
    let tables = match &selected_database {
        Some(_) => match ctx.driver.list_tables(&params).await {
            Ok(tables) => tables,
            Err(e) => {
                tracing::warn!(error = %e, "could not list tables");
                Vec::new()
            }
        },
        None => Vec::new(),
    };
    ctx.sessions
        .set_listed_tables(session_id, selected_database.clone(), tables.clone())?;

    Ok(SchemaOverview {
        databases,
        selected_database,
        tables,
    })
}

/// One page of a table, 100 rows wide. The table must appear in the session's
/// most recent listing for the resolved database; browsing counts as a query
/// for row-impact purposes.
pub async fn browse_table(
    ctx: &AppContext,
    session_id: &str,
    request: BrowseRequest,
) -> Result<TableView, Error> {
    let credential = valid_credential(ctx, session_id)?;
    let params = credential.connect_params(request.selected_db);

    if !ctx
        .sessions
        .is_listed_table(session_id, &params.database, &request.table)?
    {
        return Err(Error::UnknownTable(request.table));
    }

    let page = request.page.max(1);
    let offset = (page - 1) * PAGE_SIZE;
    let fetched = ctx
        .driver
        .fetch_table_page(&params, &request.table, PAGE_SIZE, offset)
        .await?;

    let total_pages = fetched.total_rows.div_ceil(PAGE_SIZE).max(1);
    ctx.sessions
        .set_row_impact(session_id, fetched.rows.len() as u64)?;

    Ok(TableView {
        table: request.table,
        page,
        page_size: PAGE_SIZE,
        total_rows: fetched.total_rows,
        total_pages,
        columns: fetched.columns,
        rows: fetched.rows,
    })
}

/// Catalog listing for the sidebar; available before login like the catalog
/// itself.
pub async fn list_saved(ctx: &AppContext) -> Result<IndexMap<String, SavedQuery>, Error> {
    Ok(ctx.catalog.load_all()?)
}
