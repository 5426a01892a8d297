//! Snapshot source contracts + CSV and in-memory implementations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use crmd_core::{Record, Snapshot, Value};
use crmd_storage::SnapshotArchive;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

pub const CRATE_NAME: &str = "crmd-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("snapshot {id} not found")]
    NotFound { id: String },
    #[error("reading snapshot {id}: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing snapshot {id}: {message}")]
    Parse { id: String, message: String },
    #[error("archiving snapshot {id}: {message}")]
    Archive { id: String, message: String },
}

/// Anything that can hand back a table of named columns for a snapshot identifier.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn read(&self, id: &str) -> Result<Snapshot, SourceError>;

    /// Whether a previously referenced snapshot can still be read.
    async fn exists(&self, id: &str) -> Result<bool, SourceError>;

    /// Keeps `snapshot` readable after its original location is overwritten and returns
    /// the id to read it back by. Sources without an archive hand back `snapshot.id`.
    async fn archive(&self, _entity_type: &str, snapshot: &Snapshot) -> Result<String, SourceError> {
        Ok(snapshot.id.clone())
    }
}

/// Reads delimited text extracts from disk. Every cell is text; empty cells are null.
#[derive(Debug, Clone)]
pub struct CsvSnapshotSource {
    root: Option<PathBuf>,
    delimiter: u8,
    archive: Option<SnapshotArchive>,
}

impl Default for CsvSnapshotSource {
    fn default() -> Self {
        Self {
            root: None,
            delimiter: b',',
            archive: None,
        }
    }
}

impl CsvSnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relative snapshot ids are resolved against `root`.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Diffed extracts are copied into `archive`, so a later extract written to the same
    /// path cannot replace the baseline.
    pub fn with_archive(mut self, archive: SnapshotArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn resolve(&self, id: &str) -> PathBuf {
        let path = Path::new(id);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub fn parse(&self, id: &str, bytes: &[u8]) -> Result<Snapshot, SourceError> {
        let parse_err = |message: String| SourceError::Parse {
            id: id.to_string(),
            message,
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .from_reader(bytes);

        let mut columns: Vec<String> = Vec::new();
        for (i, header) in reader
            .headers()
            .map_err(|e| parse_err(e.to_string()))?
            .iter()
            .enumerate()
        {
            let header = if i == 0 {
                header.trim_start_matches('\u{feff}')
            } else {
                header
            };
            if columns.iter().any(|c| c == header) {
                return Err(parse_err(format!("duplicate column {header:?}")));
            }
            columns.push(header.to_string());
        }

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result.map_err(|e| parse_err(e.to_string()))?;
            let row: Record = columns
                .iter()
                .zip(record.iter())
                .map(|(column, cell)| (column.clone(), Value::from_cell(cell)))
                .collect();
            rows.push(row);
        }

        Ok(Snapshot::new(id, columns, rows))
    }

    /// Writes `snapshot` back out as delimited text that `parse` reads to the same rows.
    pub fn encode(&self, snapshot: &Snapshot) -> Result<Vec<u8>, SourceError> {
        let encode_err = |message: String| SourceError::Archive {
            id: snapshot.id.clone(),
            message,
        };
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(Vec::new());
        writer
            .write_record(&snapshot.columns)
            .map_err(|e| encode_err(e.to_string()))?;
        for row in &snapshot.rows {
            writer
                .write_record(
                    snapshot
                        .columns
                        .iter()
                        .map(|column| row.value(column).to_text().unwrap_or_default()),
                )
                .map_err(|e| encode_err(e.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|e| encode_err(e.to_string()))
    }

    /// Snapshot id for a file: relative to the root when it lives under it.
    fn id_for(&self, path: &Path) -> String {
        self.root
            .as_ref()
            .and_then(|root| path.strip_prefix(root).ok())
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}

#[async_trait]
impl SnapshotSource for CsvSnapshotSource {
    async fn read(&self, id: &str) -> Result<Snapshot, SourceError> {
        let path = self.resolve(id);
        let bytes = fs::read(&path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                SourceError::NotFound { id: id.to_string() }
            } else {
                SourceError::Io {
                    id: id.to_string(),
                    source,
                }
            }
        })?;
        let snapshot = self.parse(id, &bytes)?;
        info!(
            snapshot = id,
            rows = snapshot.len(),
            columns = snapshot.columns.len(),
            "read csv snapshot"
        );
        Ok(snapshot)
    }

    async fn exists(&self, id: &str) -> Result<bool, SourceError> {
        fs::try_exists(self.resolve(id))
            .await
            .map_err(|source| SourceError::Io {
                id: id.to_string(),
                source,
            })
    }

    async fn archive(&self, entity_type: &str, snapshot: &Snapshot) -> Result<String, SourceError> {
        let Some(archive) = &self.archive else {
            return Ok(snapshot.id.clone());
        };
        let bytes = self.encode(snapshot)?;
        let stored = archive
            .store_bytes(entity_type, "csv", &bytes)
            .await
            .map_err(|err| SourceError::Archive {
                id: snapshot.id.clone(),
                message: format!("{err:#}"),
            })?;
        let archived_id = self.id_for(&stored.absolute_path);
        info!(
            snapshot = %snapshot.id,
            archived = %archived_id,
            deduplicated = stored.deduplicated,
            "archived csv snapshot"
        );
        Ok(archived_id)
    }
}

/// Snapshots held in memory, keyed by id. Removing one simulates a lost extract.
#[derive(Debug, Default)]
pub struct MemorySnapshotSource {
    snapshots: Mutex<HashMap<String, Snapshot>>,
}

impl MemorySnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, snapshot: Snapshot) {
        self.snapshots
            .lock()
            .await
            .insert(snapshot.id.clone(), snapshot);
    }

    pub async fn remove(&self, id: &str) -> Option<Snapshot> {
        self.snapshots.lock().await.remove(id)
    }
}

#[async_trait]
impl SnapshotSource for MemorySnapshotSource {
    async fn read(&self, id: &str) -> Result<Snapshot, SourceError> {
        self.snapshots
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound { id: id.to_string() })
    }

    async fn exists(&self, id: &str) -> Result<bool, SourceError> {
        Ok(self.snapshots.lock().await.contains_key(id))
    }
}
