//! Staging store contract and an in-process implementation.
//!
//! Every operation addresses *active* rows only (`is_deleted == false`). Soft-deleted
//! rows stay behind as history and never block a key from being staged again.

use std::collections::{BTreeMap, HashSet};

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crmd_core::{CompositeKey, StagingRow, StagingTarget, TRACKING_COLUMNS};
use tokio::sync::Mutex;

/// Rows removed and inserted by one `upsert_by_key` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub replaced: u64,
    pub inserted: u64,
}

#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Creates the table if needed and adds any entity columns it lacks.
    async fn ensure_table(
        &self,
        target: &StagingTarget,
        columns: &[String],
        key_columns: &[String],
    ) -> anyhow::Result<()>;

    /// Appends rows. Fails, inserting nothing, if an active row already holds one of the keys.
    async fn insert_rows(
        &self,
        target: &StagingTarget,
        key_columns: &[String],
        rows: &[StagingRow],
    ) -> anyhow::Result<u64>;

    /// Replaces the active rows for the given rows' keys as one atomic unit.
    async fn upsert_by_key(
        &self,
        target: &StagingTarget,
        key_columns: &[String],
        rows: &[StagingRow],
    ) -> anyhow::Result<UpsertOutcome>;

    /// Flags active rows with the given keys as deleted; nothing is physically removed.
    async fn soft_delete(
        &self,
        target: &StagingTarget,
        key_columns: &[String],
        keys: &[CompositeKey],
        at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> anyhow::Result<u64>;
}

/// A staged row plus the storage identity it was given on insert.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub row_id: u64,
    pub row: StagingRow,
}

#[derive(Debug, Default)]
struct MemoryTable {
    columns: Vec<String>,
    rows: Vec<StoredRow>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<StagingTarget, MemoryTable>,
    next_row_id: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStagingStore {
    state: Mutex<MemoryState>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self, target: &StagingTarget) -> Vec<StoredRow> {
        self.state
            .lock()
            .await
            .tables
            .get(target)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub async fn columns(&self, target: &StagingTarget) -> Vec<String> {
        self.state
            .lock()
            .await
            .tables
            .get(target)
            .map(|t| t.columns.clone())
            .unwrap_or_default()
    }

    pub async fn active_rows(&self, target: &StagingTarget) -> Vec<StoredRow> {
        self.rows(target)
            .await
            .into_iter()
            .filter(|r| !r.row.is_deleted)
            .collect()
    }
}

impl MemoryState {
    fn table_mut(&mut self, target: &StagingTarget) -> anyhow::Result<&mut MemoryTable> {
        match self.tables.get_mut(target) {
            Some(table) => Ok(table),
            None => bail!("staging table {target} does not exist"),
        }
    }

    fn append(&mut self, target: &StagingTarget, rows: &[StagingRow]) -> anyhow::Result<u64> {
        let mut next = self.next_row_id;
        let table = self.table_mut(target)?;
        for row in rows {
            next += 1;
            table.rows.push(StoredRow {
                row_id: next,
                row: row.clone(),
            });
        }
        self.next_row_id = next;
        Ok(rows.len() as u64)
    }
}

fn check_unique_batch(
    target: &StagingTarget,
    key_columns: &[String],
    rows: &[StagingRow],
) -> anyhow::Result<HashSet<CompositeKey>> {
    let mut keys = HashSet::with_capacity(rows.len());
    for row in rows {
        let key = row.record.key(key_columns);
        if !keys.insert(key.clone()) {
            bail!("duplicate key {key} within batch for {target}");
        }
    }
    Ok(keys)
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn ensure_table(
        &self,
        target: &StagingTarget,
        columns: &[String],
        _key_columns: &[String],
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let table = state.tables.entry(target.clone()).or_default();
        for column in columns {
            if TRACKING_COLUMNS.contains(&column.as_str()) {
                bail!("column {column} collides with a load-tracking column");
            }
            if !table.columns.contains(column) {
                table.columns.push(column.clone());
            }
        }
        Ok(())
    }

    async fn insert_rows(
        &self,
        target: &StagingTarget,
        key_columns: &[String],
        rows: &[StagingRow],
    ) -> anyhow::Result<u64> {
        let mut state = self.state.lock().await;
        let keys = check_unique_batch(target, key_columns, rows)?;
        let table = state.table_mut(target)?;
        if let Some(existing) = table
            .rows
            .iter()
            .filter(|r| !r.row.is_deleted)
            .map(|r| r.row.record.key(key_columns))
            .find(|k| keys.contains(k))
        {
            bail!("unique violation on {target}: active row with key {existing} already staged");
        }
        state.append(target, rows)
    }

    async fn upsert_by_key(
        &self,
        target: &StagingTarget,
        key_columns: &[String],
        rows: &[StagingRow],
    ) -> anyhow::Result<UpsertOutcome> {
        let mut state = self.state.lock().await;
        let keys = check_unique_batch(target, key_columns, rows)?;
        let table = state.table_mut(target)?;
        let before = table.rows.len();
        table
            .rows
            .retain(|r| r.row.is_deleted || !keys.contains(&r.row.record.key(key_columns)));
        let replaced = (before - table.rows.len()) as u64;
        let inserted = state.append(target, rows)?;
        Ok(UpsertOutcome { replaced, inserted })
    }

    async fn soft_delete(
        &self,
        target: &StagingTarget,
        key_columns: &[String],
        keys: &[CompositeKey],
        at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> anyhow::Result<u64> {
        let mut state = self.state.lock().await;
        let keys: HashSet<&CompositeKey> = keys.iter().collect();
        let table = state.table_mut(target)?;
        let mut flagged = 0u64;
        for stored in table.rows.iter_mut() {
            if !stored.row.is_deleted && keys.contains(&stored.row.record.key(key_columns)) {
                stored.row.mark_deleted(at, reason);
                flagged += 1;
            }
        }
        Ok(flagged)
    }
}
