//! Statement building and record store backends for the mirror table.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use atpg_core::{FieldMapping, FieldSet, MappingError, SqlType, TableName};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

pub const CRATE_NAME: &str = "atpg-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} is not set")]
    NotConfigured(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("duplicate key value violates unique constraint on {column}: {identifier}")]
    DuplicateIdentifier { column: String, identifier: String },
    #[error("table {0} does not exist")]
    UnknownTable(String),
    #[error("column {column} not found in {table}")]
    UnknownColumn { table: String, column: String },
    #[error("column {column} has unsupported type: {source}")]
    ColumnType {
        column: String,
        #[source]
        source: MappingError,
    },
    #[error("{0}")]
    Backend(String),
}

/// Reads `column name -> declared type` for `table` from the system catalog.
/// Types come back as `format_type` renders them, modifiers included.
pub async fn catalog_column_types(
    conn: &mut PgConnection,
    table: &TableName,
) -> Result<HashMap<String, String>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
        FROM pg_attribute a
        WHERE a.attrelid = to_regclass($1)
          AND a.attnum > 0
          AND NOT a.attisdropped
        "#,
    )
    .bind(table.quoted())
    .fetch_all(conn)
    .await?;

    let mut types = HashMap::with_capacity(rows.len());
    for row in rows {
        types.insert(row.try_get::<String, _>(0)?, row.try_get::<String, _>(1)?);
    }
    Ok(types)
}

/// Cast type for each mapped field, in mapping order. A configured `sql_type`
/// wins; otherwise the column's declared type from `catalog` is used.
pub fn resolve_column_types(
    table: &TableName,
    mapping: &FieldMapping,
    catalog: &HashMap<String, String>,
) -> Result<Vec<SqlType>, StoreError> {
    mapping
        .fields()
        .iter()
        .map(|field| {
            if let Some(sql_type) = &field.sql_type {
                return Ok(sql_type.clone());
            }
            let declared = catalog.get(field.column.as_str()).ok_or_else(|| {
                StoreError::UnknownColumn {
                    table: table.to_string(),
                    column: field.column.to_string(),
                }
            })?;
            SqlType::parse(declared).map_err(|source| StoreError::ColumnType {
                column: field.column.to_string(),
                source,
            })
        })
        .collect()
}

/// Parameterized statements for one table and mapping. Names are interpolated
/// quoted; every value goes through a positional placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySet {
    /// Binds `[identifier]`.
    pub select: String,
    /// Binds `[identifier] + mapped values`.
    pub insert: String,
    /// Binds `mapped values + [identifier]`.
    pub update: String,
}

impl QuerySet {
    /// `types` holds one cast type per mapped field, in mapping order.
    pub fn build(table: &TableName, mapping: &FieldMapping, types: &[SqlType]) -> Self {
        debug_assert_eq!(types.len(), mapping.fields().len());
        let table = table.quoted();
        let id_col = mapping.identifier_column().quoted();

        let select_cols = std::iter::once(format!("CAST({id_col} AS text) AS {id_col}"))
            .chain(mapping.columns().map(|c| {
                let col = c.quoted();
                format!("CAST({col} AS text) AS {col}")
            }))
            .collect::<Vec<_>>()
            .join(", ");
        let select = format!("SELECT {select_cols} FROM {table} WHERE {id_col} = $1 LIMIT 1");

        let insert_cols = std::iter::once(id_col.clone())
            .chain(mapping.columns().map(|c| c.quoted()))
            .collect::<Vec<_>>()
            .join(", ");
        let insert_values = std::iter::once("$1".to_string())
            .chain(
                types
                    .iter()
                    .enumerate()
                    .map(|(idx, ty)| format!("CAST(${} AS {})", idx + 2, ty.as_str())),
            )
            .collect::<Vec<_>>()
            .join(", ");
        let insert = format!("INSERT INTO {table} ({insert_cols}) VALUES ({insert_values})");

        let set_clause = mapping
            .columns()
            .zip(types)
            .enumerate()
            .map(|(idx, (col, ty))| {
                format!("{} = CAST(${} AS {})", col.quoted(), idx + 1, ty.as_str())
            })
            .collect::<Vec<_>>()
            .join(", ");
        let update = format!(
            "UPDATE {table} SET {set_clause} WHERE {id_col} = ${}",
            mapping.fields().len() + 1
        );

        Self {
            select,
            insert,
            update,
        }
    }

    /// Statements for a mapping whose every field names its `sql_type`, so no
    /// catalog lookup is needed. `None` when any type comes from the table.
    pub fn from_configured(table: &TableName, mapping: &FieldMapping) -> Option<Self> {
        let types = mapping
            .fields()
            .iter()
            .map(|f| f.sql_type.clone())
            .collect::<Option<Vec<_>>>()?;
        Some(Self::build(table, mapping, &types))
    }

    /// Statements with every inferred type read through `conn`.
    pub async fn load(
        conn: &mut PgConnection,
        table: &TableName,
        mapping: &FieldMapping,
    ) -> Result<Self, StoreError> {
        if let Some(queries) = Self::from_configured(table, mapping) {
            return Ok(queries);
        }
        let catalog = catalog_column_types(conn, table).await?;
        if catalog.is_empty() {
            return Err(StoreError::UnknownTable(table.to_string()));
        }
        let types = resolve_column_types(table, mapping, &catalog)?;
        info!(
            table = %table,
            types = ?types.iter().map(SqlType::as_str).collect::<Vec<_>>(),
            "column types resolved"
        );
        Ok(Self::build(table, mapping, &types))
    }
}

/// Persisted row as read back: the identifier plus each mapped column in text
/// form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRow {
    pub identifier: String,
    pub columns: Vec<(String, Option<String>)>,
}

impl TargetRow {
    fn from_values(identifier: &str, mapping: &FieldMapping, values: &[Option<String>]) -> Self {
        Self {
            identifier: identifier.to_string(),
            columns: mapping
                .columns()
                .map(ToString::to_string)
                .zip(values.iter().cloned())
                .collect(),
        }
    }

    /// Value of `column`, `None` when unmapped or null.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .and_then(|(_, value)| value.as_deref())
    }
}

/// The three operations the orchestrator needs against the mirror table.
#[async_trait]
pub trait RecordStore: Send {
    async fn find_by_identifier(&mut self, identifier: &str) -> Result<Option<TargetRow>, StoreError>;

    async fn create(&mut self, identifier: &str, fields: &FieldSet) -> Result<(), StoreError>;

    /// Overwrites every mapped column. Returns the affected row count, which
    /// is 0 when no row carries `identifier`.
    async fn update(&mut self, identifier: &str, fields: &FieldSet) -> Result<u64, StoreError>;
}

/// A record store bound to one transaction. Dropping it without `commit`
/// discards its writes.
#[async_trait]
pub trait StoreSession: RecordStore {
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RecordStoreBackend: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError>;
}

/// Postgres backend. Statements are built by the first session and shared
/// afterwards; a failed build is retried by the next one.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
    table: TableName,
    mapping: Arc<FieldMapping>,
    queries: Arc<OnceCell<Arc<QuerySet>>>,
}

impl PgRecordStore {
    pub fn new(pool: PgPool, table: &TableName, mapping: Arc<FieldMapping>) -> Self {
        Self {
            pool,
            table: table.clone(),
            mapping,
            queries: Arc::new(OnceCell::new()),
        }
    }

    /// Pool that opens connections on first use, so startup never waits on
    /// the database.
    pub fn connect_lazy(
        database_url: &str,
        max_connections: u32,
        table: &TableName,
        mapping: Arc<FieldMapping>,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_lazy(database_url)?;
        Ok(Self::new(pool, table, mapping))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The statements sessions run, resolving column types if not done yet.
    pub async fn queries(&self) -> Result<Arc<QuerySet>, StoreError> {
        if let Some(queries) = self.queries.get() {
            return Ok(queries.clone());
        }
        let mut conn = self.pool.acquire().await?;
        self.queries_via(&mut *conn).await
    }

    async fn queries_via(&self, conn: &mut PgConnection) -> Result<Arc<QuerySet>, StoreError> {
        let queries = self
            .queries
            .get_or_try_init(|| async move {
                QuerySet::load(conn, &self.table, &self.mapping)
                    .await
                    .map(Arc::new)
            })
            .await?;
        Ok(queries.clone())
    }
}

#[async_trait]
impl RecordStoreBackend for PgRecordStore {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let queries = self.queries_via(&mut *tx).await?;
        Ok(Box::new(PgSession {
            tx,
            mapping: self.mapping.clone(),
            queries,
        }))
    }
}

pub struct PgSession {
    tx: Transaction<'static, Postgres>,
    mapping: Arc<FieldMapping>,
    queries: Arc<QuerySet>,
}

#[async_trait]
impl RecordStore for PgSession {
    async fn find_by_identifier(&mut self, identifier: &str) -> Result<Option<TargetRow>, StoreError> {
        let row = sqlx::query(&self.queries.select)
            .bind(identifier)
            .fetch_optional(&mut *self.tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let found: String = row.try_get(0)?;
        let mut columns = Vec::with_capacity(self.mapping.fields().len());
        for (idx, column) in self.mapping.columns().enumerate() {
            let value: Option<String> = row.try_get(idx + 1)?;
            columns.push((column.to_string(), value));
        }
        Ok(Some(TargetRow {
            identifier: found,
            columns,
        }))
    }

    async fn create(&mut self, identifier: &str, fields: &FieldSet) -> Result<(), StoreError> {
        let mut query = sqlx::query(&self.queries.insert).bind(identifier);
        for value in self.mapping.values_for(fields) {
            query = query.bind(value);
        }
        query.execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn update(&mut self, identifier: &str, fields: &FieldSet) -> Result<u64, StoreError> {
        let mut query = sqlx::query(&self.queries.update);
        for value in self.mapping.values_for(fields) {
            query = query.bind(value);
        }
        let result = query.bind(identifier).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StoreSession for PgSession {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Backend standing in when the connection settings are absent; every
/// session request fails naming the missing setting.
#[derive(Debug, Clone)]
pub struct UnconfiguredStore {
    missing: String,
}

impl UnconfiguredStore {
    pub fn new(missing: impl Into<String>) -> Self {
        Self {
            missing: missing.into(),
        }
    }
}

#[async_trait]
impl RecordStoreBackend for UnconfiguredStore {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        Err(StoreError::NotConfigured(self.missing.clone()))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<String, Vec<Option<String>>>,
    fail_writes: bool,
}

/// In-process mirror table. Writes are staged per session and applied on
/// commit; the identifier behaves as if it carried a unique constraint.
#[derive(Debug, Clone)]
pub struct MemoryRecordStore {
    mapping: Arc<FieldMapping>,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRecordStore {
    pub fn new(mapping: Arc<FieldMapping>) -> Self {
        Self {
            mapping,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Make every subsequent create/update fail, as a lost connection would.
    pub async fn set_fail_writes(&self, fail: bool) {
        self.state.lock().await.fail_writes = fail;
    }

    pub async fn row_count(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn get(&self, identifier: &str) -> Option<TargetRow> {
        let state = self.state.lock().await;
        state
            .rows
            .get(identifier)
            .map(|values| TargetRow::from_values(identifier, &self.mapping, values))
    }

    fn duplicate(&self, identifier: &str) -> StoreError {
        StoreError::DuplicateIdentifier {
            column: self.mapping.identifier_column().to_string(),
            identifier: identifier.to_string(),
        }
    }
}

#[async_trait]
impl RecordStoreBackend for MemoryRecordStore {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        Ok(Box::new(MemorySession {
            store: self.clone(),
            staged: BTreeMap::new(),
            created: BTreeSet::new(),
        }))
    }
}

pub struct MemorySession {
    store: MemoryRecordStore,
    staged: BTreeMap<String, Vec<Option<String>>>,
    created: BTreeSet<String>,
}

impl MemorySession {
    async fn current(&self, identifier: &str) -> Option<Vec<Option<String>>> {
        if let Some(values) = self.staged.get(identifier) {
            return Some(values.clone());
        }
        self.store.state.lock().await.rows.get(identifier).cloned()
    }

    async fn check_writable(&self) -> Result<(), StoreError> {
        if self.store.state.lock().await.fail_writes {
            return Err(StoreError::Backend("simulated write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemorySession {
    async fn find_by_identifier(&mut self, identifier: &str) -> Result<Option<TargetRow>, StoreError> {
        Ok(self
            .current(identifier)
            .await
            .map(|values| TargetRow::from_values(identifier, &self.store.mapping, &values)))
    }

    async fn create(&mut self, identifier: &str, fields: &FieldSet) -> Result<(), StoreError> {
        self.check_writable().await?;
        if self.current(identifier).await.is_some() {
            return Err(self.store.duplicate(identifier));
        }
        let values = self.store.mapping.values_for(fields);
        self.staged.insert(identifier.to_string(), values);
        self.created.insert(identifier.to_string());
        Ok(())
    }

    async fn update(&mut self, identifier: &str, fields: &FieldSet) -> Result<u64, StoreError> {
        self.check_writable().await?;
        if self.current(identifier).await.is_none() {
            return Ok(0);
        }
        let values = self.store.mapping.values_for(fields);
        self.staged.insert(identifier.to_string(), values);
        Ok(1)
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemorySession {
            store,
            staged,
            created,
        } = *self;
        let mut state = store.state.lock().await;
        if let Some(taken) = created.iter().find(|id| state.rows.contains_key(*id)) {
            return Err(store.duplicate(taken));
        }
        let applied = staged.len();
        for (identifier, values) in staged {
            state.rows.insert(identifier, values);
        }
        debug!(applied, "memory session committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        debug!(discarded = self.staged.len(), "memory session rolled back");
        Ok(())
    }
}
