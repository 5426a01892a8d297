//! Core data model for the CRM delta loader: records, snapshots, load state and deltas.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "crmd-core";

pub const LOAD_TIMESTAMP_COLUMN: &str = "_load_timestamp";
pub const LOAD_TYPE_COLUMN: &str = "_load_type";
pub const IS_DELETED_COLUMN: &str = "_is_deleted";
pub const DELETE_REASON_COLUMN: &str = "_delete_reason";

/// Column names reserved for load tracking in every staging table.
pub const TRACKING_COLUMNS: [&str; 4] = [
    LOAD_TIMESTAMP_COLUMN,
    LOAD_TYPE_COLUMN,
    IS_DELETED_COLUMN,
    DELETE_REASON_COLUMN,
];

/// Scalar cell value. Every extracted column is one of these.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

static NULL: Value = Value::Null;

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    /// Text cell as read from an extract; empty cells are missing values.
    pub fn from_cell(cell: &str) -> Self {
        if cell.is_empty() {
            Value::Null
        } else {
            Value::Text(cell.to_string())
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
        }
    }

    /// Canonical text rendering, `None` for null.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Timestamp(ts) => Some(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::Text(_) => 3,
            Value::Timestamp(_) => 4,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            // total_cmp equality is bit equality
            Value::Number(n) => n.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
            Value::Timestamp(ts) => ts.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_text().as_deref().unwrap_or(""))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One extracted row: column name to value, iterated in column-name order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(column.into(), value.into())
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    /// Value of `column`, treating an absent column as null.
    pub fn value(&self, column: &str) -> &Value {
        self.fields.get(column).unwrap_or(&NULL)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.fields.contains_key(column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn key(&self, key_columns: &[String]) -> CompositeKey {
        CompositeKey(
            key_columns
                .iter()
                .map(|column| self.value(column).clone())
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Durable row identity: the primary-key values compared structurally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositeKey(pub Vec<Value>);

impl CompositeKey {
    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Joined with `_` for display only; equality never goes through this form.
impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("_")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

/// One full extract of an entity's rows at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

impl Snapshot {
    pub fn new(id: impl Into<String>, columns: Vec<String>, rows: Vec<Record>) -> Self {
        Self {
            id: id.into(),
            columns,
            rows,
        }
    }

    /// Builds a snapshot whose column list is the union of the rows' columns.
    pub fn from_records(id: impl Into<String>, rows: Vec<Record>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for column in row.columns() {
                if !columns.iter().any(|c| c == column) {
                    columns.push(column.to_string());
                }
            }
        }
        Self::new(id, columns, rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Required columns absent from this snapshot, in the order given.
    pub fn missing_columns<'a>(&self, required: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let mut missing = Vec::new();
        for column in required {
            if !self.has_column(column) && !missing.contains(column) {
                missing.push(column.clone());
            }
        }
        missing
    }
}

/// Outcome of the most recent successful load for one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadState {
    pub entity_type: String,
    pub last_load_timestamp: DateTime<Utc>,
    pub last_csv_path: String,
    pub last_row_count: usize,
    pub last_data_fingerprint: String,
    pub column_schema: Vec<String>,
    pub primary_keys: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LoadState {
    pub fn metadata_count(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(|v| v.as_u64())
    }
}

/// What the current snapshot was compared against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Baseline {
    FirstRun,
    PreviousSnapshotMissing { snapshot_id: String },
    Previous { snapshot_id: String },
}

impl Baseline {
    pub fn is_fallback(&self) -> bool {
        !matches!(self, Baseline::Previous { .. })
    }
}

/// A new or modified row, carried with its identity and content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangedRecord {
    pub key: CompositeKey,
    pub fingerprint: String,
    pub record: Record,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaResult {
    pub entity_type: String,
    pub snapshot_id: String,
    /// Column order of the current snapshot.
    pub columns: Vec<String>,
    pub primary_keys: Vec<String>,
    pub baseline: Baseline,
    pub new_records: Vec<ChangedRecord>,
    pub modified_records: Vec<ChangedRecord>,
    pub deleted_keys: Vec<CompositeKey>,
    pub unchanged_keys: Vec<CompositeKey>,
    pub detected_at: DateTime<Utc>,
}

impl DeltaResult {
    pub fn has_changes(&self) -> bool {
        !self.new_records.is_empty()
            || !self.modified_records.is_empty()
            || !self.deleted_keys.is_empty()
    }

    pub fn summary(&self) -> DeltaSummary {
        DeltaSummary {
            entity_type: self.entity_type.clone(),
            snapshot_id: self.snapshot_id.clone(),
            new_count: self.new_records.len(),
            modified_count: self.modified_records.len(),
            deleted_count: self.deleted_keys.len(),
            unchanged_count: self.unchanged_keys.len(),
            has_changes: self.has_changes(),
            fallback: self.baseline.is_fallback(),
            detected_at: self.detected_at,
        }
    }
}

/// Count-level view of a delta for logs, reports and alerting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSummary {
    pub entity_type: String,
    pub snapshot_id: String,
    pub new_count: usize,
    pub modified_count: usize,
    pub deleted_count: usize,
    pub unchanged_count: usize,
    pub has_changes: bool,
    pub fallback: bool,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadType {
    Insert,
    Update,
    Delete,
}

impl LoadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadType::Insert => "insert",
            LoadType::Update => "update",
            LoadType::Delete => "delete",
        }
    }
}

impl fmt::Display for LoadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Staging table address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StagingTarget {
    pub schema: String,
    pub table: String,
}

impl StagingTarget {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for StagingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Entity row as persisted in staging, with its load-tracking columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagingRow {
    pub record: Record,
    pub load_timestamp: DateTime<Utc>,
    pub load_type: LoadType,
    pub is_deleted: bool,
    pub delete_reason: Option<String>,
}

impl StagingRow {
    pub fn inserted(record: Record, at: DateTime<Utc>) -> Self {
        Self {
            record,
            load_timestamp: at,
            load_type: LoadType::Insert,
            is_deleted: false,
            delete_reason: None,
        }
    }

    pub fn updated(record: Record, at: DateTime<Utc>) -> Self {
        Self {
            record,
            load_timestamp: at,
            load_type: LoadType::Update,
            is_deleted: false,
            delete_reason: None,
        }
    }

    pub fn mark_deleted(&mut self, at: DateTime<Utc>, reason: Option<&str>) {
        self.load_timestamp = at;
        self.load_type = LoadType::Delete;
        self.is_deleted = true;
        self.delete_reason = reason.map(str::to_string);
    }
}
