//! Applies one delta to a staging table: insert, then replace, then soft-delete.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crmd_core::{DeltaResult, StagingRow, StagingTarget};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::staging::StagingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    Prepare,
    Insert,
    Update,
    SoftDelete,
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadPhase::Prepare => "prepare",
            LoadPhase::Insert => "insert",
            LoadPhase::Update => "update",
            LoadPhase::SoftDelete => "soft-delete",
        })
    }
}

#[derive(Debug, Error)]
pub enum StagingFailure {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0:#}")]
    Store(anyhow::Error),
}

/// A phase failed; phases listed in `completed` stay applied.
#[derive(Debug, Error)]
#[error("staging {phase} phase failed for {target} (completed: {completed:?}): {cause}")]
pub struct StagingWriteError {
    pub phase: LoadPhase,
    pub target: StagingTarget,
    pub completed: Vec<LoadPhase>,
    #[source]
    pub cause: StagingFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub target: StagingTarget,
    pub skipped: bool,
    pub inserted: u64,
    pub updated: u64,
    pub replaced: u64,
    pub soft_deleted: u64,
    pub completed: Vec<LoadPhase>,
}

impl LoadReport {
    fn empty(target: &StagingTarget, skipped: bool) -> Self {
        Self {
            target: target.clone(),
            skipped,
            inserted: 0,
            updated: 0,
            replaced: 0,
            soft_deleted: 0,
            completed: Vec::new(),
        }
    }
}

pub struct StagingLoader {
    store: Arc<dyn StagingStore>,
    phase_timeout: Duration,
}

impl StagingLoader {
    pub fn new(store: Arc<dyn StagingStore>) -> Self {
        Self {
            store,
            phase_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    async fn run_phase<T, F>(
        &self,
        phase: LoadPhase,
        target: &StagingTarget,
        report: &LoadReport,
        fut: F,
    ) -> Result<T, StagingWriteError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let cause = match tokio::time::timeout(self.phase_timeout, fut).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => StagingFailure::Store(err),
            Err(_) => StagingFailure::Timeout(self.phase_timeout),
        };
        error!(
            %target,
            %phase,
            completed = ?report.completed,
            error = %cause,
            "staging phase failed; earlier phases remain applied"
        );
        Err(StagingWriteError {
            phase,
            target: target.clone(),
            completed: report.completed.clone(),
            cause,
        })
    }

    /// Stages exactly the rows that changed. A delta without changes touches nothing.
    ///
    /// When the delta was computed without a readable previous snapshot, staged rows
    /// may already exist for "new" keys, so those rows replace by key instead of
    /// appending.
    pub async fn load_delta(
        &self,
        delta: &DeltaResult,
        target: &StagingTarget,
    ) -> Result<LoadReport, StagingWriteError> {
        if !delta.has_changes() {
            info!(entity_type = %delta.entity_type, %target, "no changes detected; skipping load");
            return Ok(LoadReport::empty(target, true));
        }

        let keys = &delta.primary_keys;
        let mut report = LoadReport::empty(target, false);

        self.run_phase(
            LoadPhase::Prepare,
            target,
            &report,
            self.store.ensure_table(target, &delta.columns, keys),
        )
        .await?;
        report.completed.push(LoadPhase::Prepare);

        if !delta.new_records.is_empty() {
            let now = Utc::now();
            let rows: Vec<StagingRow> = delta
                .new_records
                .iter()
                .map(|r| StagingRow::inserted(r.record.clone(), now))
                .collect();
            info!(%target, rows = rows.len(), "inserting new records");
            let inserted = if delta.baseline.is_fallback() {
                let outcome = self
                    .run_phase(
                        LoadPhase::Insert,
                        target,
                        &report,
                        self.store.upsert_by_key(target, keys, &rows),
                    )
                    .await?;
                report.replaced += outcome.replaced;
                outcome.inserted
            } else {
                self.run_phase(
                    LoadPhase::Insert,
                    target,
                    &report,
                    self.store.insert_rows(target, keys, &rows),
                )
                .await?
            };
            report.inserted = inserted;
            report.completed.push(LoadPhase::Insert);
        }

        if !delta.modified_records.is_empty() {
            let now = Utc::now();
            let rows: Vec<StagingRow> = delta
                .modified_records
                .iter()
                .map(|r| StagingRow::updated(r.record.clone(), now))
                .collect();
            info!(%target, rows = rows.len(), "replacing modified records");
            let outcome = self
                .run_phase(
                    LoadPhase::Update,
                    target,
                    &report,
                    self.store.upsert_by_key(target, keys, &rows),
                )
                .await?;
            report.replaced += outcome.replaced;
            report.updated = outcome.inserted;
            report.completed.push(LoadPhase::Update);
        }

        if !delta.deleted_keys.is_empty() {
            let reason = format!("absent from snapshot {}", delta.snapshot_id);
            info!(%target, keys = delta.deleted_keys.len(), "soft-deleting removed records");
            report.soft_deleted = self
                .run_phase(
                    LoadPhase::SoftDelete,
                    target,
                    &report,
                    self.store.soft_delete(
                        target,
                        keys,
                        &delta.deleted_keys,
                        Utc::now(),
                        Some(&reason),
                    ),
                )
                .await?;
            report.completed.push(LoadPhase::SoftDelete);
        }

        info!(
            entity_type = %delta.entity_type,
            %target,
            inserted = report.inserted,
            updated = report.updated,
            soft_deleted = report.soft_deleted,
            "delta load complete"
        );
        Ok(report)
    }
}
