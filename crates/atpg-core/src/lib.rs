//! Core record model and field mapping for the Airtable -> Postgres mirror.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const CRATE_NAME: &str = "atpg-core";

/// Column holding the external record identifier when none is configured.
pub const DEFAULT_IDENTIFIER_COLUMN: &str = "airtable_id";

/// Field names mirrored by the shipped configuration, in column order.
pub const DEFAULT_FIELDS: [&str; 4] = [
    "record_id",
    "Startup name",
    "PH1_Constitution_Location",
    "date_sourced",
];

/// Postgres truncates identifiers longer than NAMEDATALEN - 1 bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Arbitrary field values as delivered by the source, keyed by field name.
pub type FieldSet = serde_json::Map<String, Value>;

/// Body of a webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub id: String,
    pub fields: FieldSet,
}

/// Outcome of one upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncAction {
    #[serde(rename = "created record")]
    Created,
    #[serde(rename = "updated record")]
    Updated,
}

impl SyncAction {
    pub fn label(self) -> &'static str {
        match self {
            SyncAction::Created => "created record",
            SyncAction::Updated => "updated record",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("identifier must not be empty")]
    EmptyIdentifier,
    #[error("identifier {0:?} exceeds 63 bytes")]
    IdentifierTooLong(String),
    #[error("identifier {0:?} contains a double quote or control character")]
    InvalidIdentifierChar(String),
    #[error("table name {0:?} must be `table` or `schema.table`")]
    InvalidTableName(String),
    #[error("sql type {0:?} is not an allowed type name")]
    InvalidSqlType(String),
    #[error("field mapping must contain at least one field")]
    NoFields,
    #[error("column {0:?} is mapped more than once")]
    DuplicateColumn(String),
    #[error("column {0:?} collides with the identifier column")]
    IdentifierColumnMapped(String),
    #[error("reading field mapping {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing field mapping: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A table or column name that passed the allow-list and can be interpolated
/// into statement text once quoted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SqlIdentifier(String);

impl SqlIdentifier {
    pub fn parse(raw: &str) -> Result<Self, MappingError> {
        if raw.is_empty() {
            return Err(MappingError::EmptyIdentifier);
        }
        if raw.len() > MAX_IDENTIFIER_LEN {
            return Err(MappingError::IdentifierTooLong(raw.to_string()));
        }
        if raw.chars().any(|c| c == '"' || c.is_control()) {
            return Err(MappingError::InvalidIdentifierChar(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for SqlIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Target table, optionally schema-qualified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub schema: Option<SqlIdentifier>,
    pub table: SqlIdentifier,
}

impl TableName {
    pub fn parse(raw: &str) -> Result<Self, MappingError> {
        let parts = raw.split('.').collect::<Vec<_>>();
        match parts.as_slice() {
            [table] => Ok(Self {
                schema: None,
                table: SqlIdentifier::parse(table)?,
            }),
            [schema, table] => Ok(Self {
                schema: Some(SqlIdentifier::parse(schema)?),
                table: SqlIdentifier::parse(table)?,
            }),
            _ => Err(MappingError::InvalidTableName(raw.to_string())),
        }
    }

    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema.quoted(), self.table.quoted()),
            None => self.table.quoted(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.table),
            None => write!(f, "{}", self.table),
        }
    }
}

/// Postgres type name used to cast a bound text value, e.g. `date`,
/// `numeric(10,2)`, `timestamp(3) with time zone` or `text[]`.
///
/// Accepted shape: space-separated words (`[a-z_][a-z0-9_]*`, optionally
/// schema-qualified), at most one `(n)` / `(n,m)` modifier attached to a word,
/// and trailing `[]` suffixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlType(String);

impl SqlType {
    pub fn parse(raw: &str) -> Result<Self, MappingError> {
        let invalid = || MappingError::InvalidSqlType(raw.to_string());
        let normalized = raw.trim().to_ascii_lowercase();

        let mut base = normalized.as_str();
        while let Some(stripped) = base.strip_suffix("[]") {
            base = stripped;
        }
        if base.is_empty() {
            return Err(invalid());
        }

        let mut modifiers = 0;
        for token in base.split(' ') {
            let name = match token.split_once('(') {
                Some((name, rest)) => {
                    let inner = rest.strip_suffix(')').ok_or_else(invalid)?;
                    if !is_type_modifier(inner) {
                        return Err(invalid());
                    }
                    modifiers += 1;
                    name
                }
                None => token,
            };
            if !is_type_name(name) {
                return Err(invalid());
            }
        }
        if modifiers > 1 {
            return Err(invalid());
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_type_name(name: &str) -> bool {
    let parts = name.split('.').collect::<Vec<_>>();
    parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
                && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        })
}

fn is_type_modifier(inner: &str) -> bool {
    let parts = inner.split(',').collect::<Vec<_>>();
    (1..=2).contains(&parts.len())
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

/// One mirrored field: the key in the incoming field set and the column it
/// lands in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub source: String,
    pub column: SqlIdentifier,
    /// Cast applied to the bound value. `None` uses the column's declared
    /// type, read from the table.
    pub sql_type: Option<SqlType>,
}

impl FieldSpec {
    pub fn new(source: &str, column: &str, sql_type: Option<&str>) -> Result<Self, MappingError> {
        Ok(Self {
            source: source.to_string(),
            column: SqlIdentifier::parse(column)?,
            sql_type: sql_type.map(SqlType::parse).transpose()?,
        })
    }

    pub fn identity(name: &str) -> Result<Self, MappingError> {
        Self::new(name, name, None)
    }
}

/// Ordered field list shared by every query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    identifier_column: SqlIdentifier,
    fields: Vec<FieldSpec>,
}

#[derive(Debug, Deserialize)]
struct MappingDocument {
    #[serde(default)]
    identifier_column: Option<String>,
    fields: Vec<MappingDocumentField>,
}

#[derive(Debug, Deserialize)]
struct MappingDocumentField {
    source: String,
    #[serde(default)]
    column: Option<String>,
    #[serde(default)]
    sql_type: Option<String>,
}

impl FieldMapping {
    pub fn new(identifier_column: SqlIdentifier, fields: Vec<FieldSpec>) -> Result<Self, MappingError> {
        if fields.is_empty() {
            return Err(MappingError::NoFields);
        }
        let mut seen = HashSet::with_capacity(fields.len());
        for field in &fields {
            if field.column == identifier_column {
                return Err(MappingError::IdentifierColumnMapped(field.column.to_string()));
            }
            if !seen.insert(field.column.as_str()) {
                return Err(MappingError::DuplicateColumn(field.column.to_string()));
            }
        }
        Ok(Self {
            identifier_column,
            fields,
        })
    }

    /// Identity mapping over `names`, typed from the table.
    pub fn identity(identifier_column: &str, names: &[&str]) -> Result<Self, MappingError> {
        let fields = names
            .iter()
            .map(|name| FieldSpec::identity(name))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(SqlIdentifier::parse(identifier_column)?, fields)
    }

    /// Parse a YAML mapping document. A missing `identifier_column` falls back
    /// to `default_identifier_column`; a missing `column` mirrors `source`.
    pub fn from_yaml_str(yaml: &str, default_identifier_column: &str) -> Result<Self, MappingError> {
        let doc: MappingDocument = serde_yaml::from_str(yaml)?;
        let identifier_column = doc
            .identifier_column
            .as_deref()
            .unwrap_or(default_identifier_column);
        let fields = doc
            .fields
            .iter()
            .map(|f| {
                FieldSpec::new(
                    &f.source,
                    f.column.as_deref().unwrap_or(&f.source),
                    f.sql_type.as_deref(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(SqlIdentifier::parse(identifier_column)?, fields)
    }

    pub fn from_yaml_file(path: &Path, default_identifier_column: &str) -> Result<Self, MappingError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| MappingError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&yaml, default_identifier_column)
    }

    /// Same field list, different identifier column.
    pub fn with_identifier_column(self, identifier_column: &str) -> Result<Self, MappingError> {
        Self::new(SqlIdentifier::parse(identifier_column)?, self.fields)
    }

    pub fn identifier_column(&self) -> &SqlIdentifier {
        &self.identifier_column
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn columns(&self) -> impl Iterator<Item = &SqlIdentifier> {
        self.fields.iter().map(|f| &f.column)
    }

    /// Values to bind, one per mapped field in mapping order. Missing keys and
    /// JSON nulls become `None`; keys outside the mapping are ignored.
    pub fn values_for(&self, fields: &FieldSet) -> Vec<Option<String>> {
        self.fields
            .iter()
            .map(|spec| fields.get(&spec.source).and_then(render_value))
            .collect()
    }
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            identifier_column: SqlIdentifier(DEFAULT_IDENTIFIER_COLUMN.to_string()),
            fields: DEFAULT_FIELDS
                .iter()
                .map(|name| FieldSpec {
                    source: name.to_string(),
                    column: SqlIdentifier(name.to_string()),
                    sql_type: None,
                })
                .collect(),
        }
    }
}

/// Text form of a field value as bound to the database.
pub fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}
