//! Delta detection between the current snapshot and the one recorded in load state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use crmd_adapters::{SnapshotSource, SourceError};
use crmd_core::{
    Baseline, ChangedRecord, CompositeKey, DeltaResult, LoadState, Record, Snapshot,
};
use crmd_storage::{dataset_fingerprint, record_fingerprint, StateStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("invalid detection request for {entity_type}: {message}")]
    Config { entity_type: String, message: String },
    #[error("snapshot {snapshot_id} is missing required columns: {}", missing.join(", "))]
    SchemaValidation {
        snapshot_id: String,
        missing: Vec<String>,
    },
    #[error("snapshot source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),
    #[error("snapshot {snapshot_id} has {count} duplicate primary keys (first: {first})")]
    DuplicateKeys {
        snapshot_id: String,
        count: usize,
        first: String,
    },
    #[error("load state store: {0:#}")]
    State(anyhow::Error),
}

/// What to do when a primary key occurs more than once within one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicateKeyPolicy {
    /// The first row carrying a key is used; later rows with that key are ignored.
    #[default]
    FirstWins,
    Reject,
}

impl std::str::FromStr for DuplicateKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first-wins" | "first_wins" | "first" => Ok(Self::FirstWins),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown duplicate key policy {other:?}")),
        }
    }
}

/// Rows of one snapshot indexed by composite key, first occurrence wins.
struct KeyedRows<'a> {
    entries: Vec<(CompositeKey, &'a Record)>,
    positions: HashMap<CompositeKey, usize>,
}

impl<'a> KeyedRows<'a> {
    fn build(
        snapshot: &'a Snapshot,
        primary_keys: &[String],
        policy: DuplicateKeyPolicy,
    ) -> Result<Self, DeltaError> {
        let mut entries = Vec::with_capacity(snapshot.len());
        let mut positions = HashMap::with_capacity(snapshot.len());
        let mut duplicates = 0usize;
        let mut first_duplicate: Option<CompositeKey> = None;

        for row in &snapshot.rows {
            let key = row.key(primary_keys);
            if positions.contains_key(&key) {
                duplicates += 1;
                if first_duplicate.is_none() {
                    first_duplicate = Some(key);
                }
                continue;
            }
            positions.insert(key.clone(), entries.len());
            entries.push((key, row));
        }

        if let Some(first) = first_duplicate {
            match policy {
                DuplicateKeyPolicy::Reject => {
                    return Err(DeltaError::DuplicateKeys {
                        snapshot_id: snapshot.id.clone(),
                        count: duplicates,
                        first: first.to_string(),
                    })
                }
                DuplicateKeyPolicy::FirstWins => warn!(
                    snapshot = %snapshot.id,
                    duplicates,
                    first = %first,
                    "duplicate primary keys; using the first row for each key"
                ),
            }
        }

        Ok(Self { entries, positions })
    }

    fn get(&self, key: &CompositeKey) -> Option<&'a Record> {
        self.positions.get(key).map(|&i| self.entries[i].1)
    }

    fn contains(&self, key: &CompositeKey) -> bool {
        self.positions.contains_key(key)
    }
}

/// Classifies current rows as new, modified or unchanged and previous rows as deleted.
pub struct DeltaDetector {
    source: Arc<dyn SnapshotSource>,
    state: Arc<dyn StateStore>,
    duplicate_keys: DuplicateKeyPolicy,
    archive_snapshots: bool,
}

impl DeltaDetector {
    pub fn new(source: Arc<dyn SnapshotSource>, state: Arc<dyn StateStore>) -> Self {
        Self {
            source,
            state,
            duplicate_keys: DuplicateKeyPolicy::default(),
            archive_snapshots: true,
        }
    }

    /// Records the current snapshot id as-is instead of archiving a copy first.
    pub fn without_archive(mut self) -> Self {
        self.archive_snapshots = false;
        self
    }

    pub fn with_duplicate_key_policy(mut self, policy: DuplicateKeyPolicy) -> Self {
        self.duplicate_keys = policy;
        self
    }

    /// Diffs `snapshot_id` against the previous snapshot for `entity_type` and records
    /// the current snapshot as the new baseline. The recorded id is the source's archived
    /// copy, so the next run still diffs against these rows when the extract is replaced
    /// in place.
    ///
    /// State is written only once the whole delta has been computed, so every error
    /// path leaves the stored baseline untouched.
    pub async fn detect_changes(
        &self,
        entity_type: &str,
        snapshot_id: &str,
        expected_columns: &[String],
        primary_keys: &[String],
    ) -> Result<DeltaResult, DeltaError> {
        if primary_keys.is_empty() {
            return Err(DeltaError::Config {
                entity_type: entity_type.to_string(),
                message: "at least one primary key column is required".to_string(),
            });
        }

        info!(entity_type, snapshot = snapshot_id, "detecting changes");
        let current = self.source.read(snapshot_id).await?;
        validate_columns(&current, expected_columns, primary_keys)?;
        info!(entity_type, rows = current.len(), "loaded current snapshot");

        let previous_state = self
            .state
            .load(entity_type)
            .await
            .map_err(DeltaError::State)?;
        let (baseline, previous) = self
            .resolve_previous(entity_type, previous_state.as_ref(), expected_columns, primary_keys)
            .await?;

        let current_rows = KeyedRows::build(&current, primary_keys, self.duplicate_keys)?;
        let mut new_records = Vec::new();
        let mut modified_records = Vec::new();
        let mut unchanged_keys = Vec::new();
        let mut deleted_keys = Vec::new();

        match &previous {
            None => {
                for (key, row) in &current_rows.entries {
                    new_records.push(changed(key, row, record_fingerprint(row)));
                }
            }
            Some(previous) => {
                let previous_rows = KeyedRows::build(previous, primary_keys, self.duplicate_keys)?;
                for (key, row) in &current_rows.entries {
                    match previous_rows.get(key) {
                        None => new_records.push(changed(key, row, record_fingerprint(row))),
                        Some(previous_row) => {
                            let current_fp = record_fingerprint(row);
                            if current_fp != record_fingerprint(previous_row) {
                                modified_records.push(changed(key, row, current_fp));
                            } else {
                                unchanged_keys.push(key.clone());
                            }
                        }
                    }
                }
                deleted_keys.extend(
                    previous_rows
                        .entries
                        .iter()
                        .filter(|(key, _)| !current_rows.contains(key))
                        .map(|(key, _)| key.clone()),
                );
                info!(
                    entity_type,
                    previous_rows = previous.len(),
                    current_keys = current_rows.entries.len(),
                    previous_keys = previous_rows.entries.len(),
                    "key analysis complete"
                );
            }
        }

        let delta = DeltaResult {
            entity_type: entity_type.to_string(),
            snapshot_id: snapshot_id.to_string(),
            columns: current.columns.clone(),
            primary_keys: primary_keys.to_vec(),
            baseline,
            new_records,
            modified_records,
            deleted_keys,
            unchanged_keys,
            detected_at: Utc::now(),
        };

        let baseline_id = if self.archive_snapshots {
            self.source.archive(entity_type, &current).await?
        } else {
            current.id.clone()
        };
        let new_state = next_state(&delta, &current, &baseline_id, expected_columns);
        self.state.save(&new_state).await.map_err(DeltaError::State)?;

        let summary = delta.summary();
        info!(
            entity_type,
            new = summary.new_count,
            modified = summary.modified_count,
            deleted = summary.deleted_count,
            unchanged = summary.unchanged_count,
            "change detection complete"
        );
        Ok(delta)
    }

    async fn resolve_previous(
        &self,
        entity_type: &str,
        state: Option<&LoadState>,
        expected_columns: &[String],
        primary_keys: &[String],
    ) -> Result<(Baseline, Option<Snapshot>), DeltaError> {
        let Some(state) = state else {
            info!(entity_type, "no previous state; all records are new");
            return Ok((Baseline::FirstRun, None));
        };

        if state.primary_keys != primary_keys {
            warn!(
                entity_type,
                previous = ?state.primary_keys,
                current = ?primary_keys,
                "primary key definition changed since the last load"
            );
        }

        let previous_id = state.last_csv_path.clone();
        let missing = || {
            warn!(
                entity_type,
                previous_snapshot = %previous_id,
                "previous snapshot not found; treating all records as new"
            );
            Ok((
                Baseline::PreviousSnapshotMissing {
                    snapshot_id: previous_id.clone(),
                },
                None,
            ))
        };

        if !self.source.exists(&previous_id).await? {
            return missing();
        }
        let previous = match self.source.read(&previous_id).await {
            Ok(snapshot) => snapshot,
            Err(SourceError::NotFound { .. }) => return missing(),
            Err(err) => return Err(err.into()),
        };
        validate_columns(&previous, expected_columns, primary_keys)?;
        info!(entity_type, rows = previous.len(), "loaded previous snapshot");
        Ok((
            Baseline::Previous {
                snapshot_id: previous_id.clone(),
            },
            Some(previous),
        ))
    }
}

fn changed(key: &CompositeKey, row: &Record, fingerprint: String) -> ChangedRecord {
    ChangedRecord {
        key: key.clone(),
        fingerprint,
        record: row.clone(),
    }
}

/// Expected and primary-key columns must be present; extra columns are fine.
pub fn validate_columns(
    snapshot: &Snapshot,
    expected_columns: &[String],
    primary_keys: &[String],
) -> Result<(), DeltaError> {
    let missing = snapshot.missing_columns(expected_columns.iter().chain(primary_keys));
    if missing.is_empty() {
        Ok(())
    } else {
        Err(DeltaError::SchemaValidation {
            snapshot_id: snapshot.id.clone(),
            missing,
        })
    }
}

fn next_state(
    delta: &DeltaResult,
    current: &Snapshot,
    baseline_id: &str,
    expected_columns: &[String],
) -> LoadState {
    let summary = delta.summary();
    let mut metadata = serde_json::Map::new();
    metadata.insert("new_count".into(), summary.new_count.into());
    metadata.insert("modified_count".into(), summary.modified_count.into());
    metadata.insert("deleted_count".into(), summary.deleted_count.into());
    metadata.insert("unchanged_count".into(), summary.unchanged_count.into());
    metadata.insert("fallback".into(), summary.fallback.into());

    LoadState {
        entity_type: delta.entity_type.clone(),
        last_load_timestamp: delta.detected_at,
        last_csv_path: baseline_id.to_string(),
        last_row_count: current.len(),
        last_data_fingerprint: dataset_fingerprint(&current.rows),
        column_schema: expected_columns.to_vec(),
        primary_keys: delta.primary_keys.clone(),
        metadata,
    }
}
