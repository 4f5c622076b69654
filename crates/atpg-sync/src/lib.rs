//! Configuration and upsert orchestration for webhook deliveries.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use atpg_core::{FieldMapping, SyncAction, TableName, WebhookPayload, DEFAULT_IDENTIFIER_COLUMN};
use atpg_storage::{
    PgRecordStore, RecordStore, RecordStoreBackend, StoreError, StoreSession, UnconfiguredStore,
};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "atpg-sync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    pub database_url: Option<String>,
    pub table_name: Option<String>,
    pub identifier_column: String,
    pub field_map_path: Option<PathBuf>,
    pub web_port: u16,
    pub max_connections: u32,
}

impl MirrorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            database_url: get("DATABASE_URL"),
            table_name: get("PG_TABLE_NAME"),
            identifier_column: get("PG_ID_COLUMN")
                .unwrap_or_else(|| DEFAULT_IDENTIFIER_COLUMN.to_string()),
            field_map_path: get("ATPG_FIELD_MAP").map(PathBuf::from),
            web_port: get("ATPG_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            max_connections: get("ATPG_DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        }
    }

    pub fn field_mapping(&self) -> Result<FieldMapping> {
        match &self.field_map_path {
            Some(path) => FieldMapping::from_yaml_file(path, &self.identifier_column)
                .with_context(|| format!("loading field mapping from {}", path.display())),
            None => FieldMapping::default()
                .with_identifier_column(&self.identifier_column)
                .context("invalid PG_ID_COLUMN"),
        }
    }

    pub fn table(&self) -> Result<Option<TableName>> {
        self.table_name
            .as_deref()
            .map(|raw| TableName::parse(raw).context("invalid PG_TABLE_NAME"))
            .transpose()
    }
}

/// Pick the store for `config`. Names are validated now; missing connection
/// settings only fail once a delivery needs the database.
pub fn backend_from_config(
    config: &MirrorConfig,
    mapping: Arc<FieldMapping>,
) -> Result<Arc<dyn RecordStoreBackend>> {
    let table = config.table()?;
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL is not set; webhook deliveries will fail until it is");
        return Ok(Arc::new(UnconfiguredStore::new("DATABASE_URL")));
    };
    let Some(table) = table else {
        warn!("PG_TABLE_NAME is not set; webhook deliveries will fail until it is");
        return Ok(Arc::new(UnconfiguredStore::new("PG_TABLE_NAME")));
    };
    let store = PgRecordStore::connect_lazy(database_url, config.max_connections, &table, mapping)
        .context("creating postgres pool")?;
    info!(table = %table, "postgres record store ready");
    Ok(Arc::new(store))
}

/// Insert the record when its identifier is unknown, otherwise overwrite the
/// mapped columns of the existing row.
pub async fn sync_record<S>(store: &mut S, payload: &WebhookPayload) -> Result<SyncAction, StoreError>
where
    S: RecordStore + ?Sized,
{
    match store.find_by_identifier(&payload.id).await? {
        None => {
            store.create(&payload.id, &payload.fields).await?;
            Ok(SyncAction::Created)
        }
        Some(_) => {
            let affected = store.update(&payload.id, &payload.fields).await?;
            if affected == 0 {
                warn!(record_id = %payload.id, "update matched no rows after lookup found one");
            }
            Ok(SyncAction::Updated)
        }
    }
}

/// Run [`sync_record`] in its own session: commit on success, roll back on
/// failure. The session is released on every path.
pub async fn sync_in_transaction(
    backend: &dyn RecordStoreBackend,
    payload: &WebhookPayload,
) -> Result<SyncAction, StoreError> {
    let mut session = backend.begin().await?;
    match sync_record(&mut *session, payload).await {
        Ok(action) => {
            session.commit().await?;
            info!(record_id = %payload.id, action = %action, "record synced");
            Ok(action)
        }
        Err(err) => {
            if let Err(rollback_err) = session.rollback().await {
                error!(record_id = %payload.id, error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}
