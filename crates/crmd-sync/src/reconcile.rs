//! Legacy-to-HubSpot record matching by the shared legacy id property.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use crmd_core::{Snapshot, Value};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("snapshot {snapshot_id} is missing reconciliation columns: {}", missing.join(", "))]
    MissingColumns {
        snapshot_id: String,
        missing: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Legacy column holding the id HubSpot stores in `legacy_id_field`.
    pub legacy_key_column: String,
    pub legacy_id_field: String,
    pub hubspot_id_column: String,
    /// Legacy and HubSpot name columns; enables candidate suggestions for unmatched records.
    pub name_columns: Option<(String, String)>,
    pub review_threshold: f64,
}

impl ReconcileConfig {
    pub fn new(legacy_key_column: impl Into<String>, legacy_id_field: impl Into<String>) -> Self {
        Self {
            legacy_key_column: legacy_key_column.into(),
            legacy_id_field: legacy_id_field.into(),
            hubspot_id_column: "hs_object_id".to_string(),
            name_columns: None,
            review_threshold: 0.85,
        }
    }

    pub fn with_hubspot_id_column(mut self, column: impl Into<String>) -> Self {
        self.hubspot_id_column = column.into();
        self
    }

    pub fn with_name_columns(mut self, legacy: impl Into<String>, hubspot: impl Into<String>) -> Self {
        self.name_columns = Some((legacy.into(), hubspot.into()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Matched,
    Conflict,
    New,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewCandidate {
    pub hubspot_id: String,
    pub hubspot_name: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationOutcome {
    pub legacy_id: String,
    pub status: MatchStatus,
    pub hubspot_ids: Vec<String>,
    pub match_confidence: Option<f64>,
    pub review_candidate: Option<ReviewCandidate>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationStats {
    pub total: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub conflicts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub entity_type: String,
    pub legacy_snapshot: String,
    pub hubspot_snapshot: String,
    pub reconciled_at: DateTime<Utc>,
    pub stats: ReconciliationStats,
    pub outcomes: Vec<ReconciliationOutcome>,
}

pub struct ReconcileEngine {
    config: ReconcileConfig,
}

impl ReconcileEngine {
    pub fn new(config: ReconcileConfig) -> Self {
        Self { config }
    }

    /// Legacy ids arrive as `101`, ` 101 ` or `101.0` depending on the extract.
    pub fn normalize_legacy_id(value: &Value) -> Option<String> {
        let text = match value {
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => return Some(format!("{}", *n as i64)),
            other => other.to_text()?,
        };
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let text = match text.strip_suffix(".0") {
            Some(whole) if !whole.is_empty() && whole.chars().all(|c| c.is_ascii_digit()) => whole,
            _ => text,
        };
        Some(text.to_string())
    }

    pub fn normalize_name(input: &str) -> String {
        input
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn require(&self, snapshot: &Snapshot, columns: Vec<&String>) -> Result<(), ReconcileError> {
        let missing = snapshot.missing_columns(columns);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ReconcileError::MissingColumns {
                snapshot_id: snapshot.id.clone(),
                missing,
            })
        }
    }

    pub fn reconcile(
        &self,
        entity_type: &str,
        legacy: &Snapshot,
        hubspot: &Snapshot,
    ) -> Result<ReconciliationReport, ReconcileError> {
        let cfg = &self.config;
        let mut legacy_required = vec![&cfg.legacy_key_column];
        let mut hubspot_required = vec![&cfg.legacy_id_field, &cfg.hubspot_id_column];
        if let Some((legacy_name, hubspot_name)) = &cfg.name_columns {
            legacy_required.push(legacy_name);
            hubspot_required.push(hubspot_name);
        }
        self.require(legacy, legacy_required)?;
        self.require(hubspot, hubspot_required)?;

        let mut by_legacy_id: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, row) in hubspot.rows.iter().enumerate() {
            if let Some(id) = Self::normalize_legacy_id(row.value(&cfg.legacy_id_field)) {
                by_legacy_id.entry(id).or_default().push(i);
            }
        }

        let legacy_ids: Vec<Option<String>> = legacy
            .rows
            .iter()
            .map(|row| Self::normalize_legacy_id(row.value(&cfg.legacy_key_column)))
            .collect();
        let known: HashSet<&str> = legacy_ids.iter().flatten().map(String::as_str).collect();

        // HubSpot rows no legacy record points at
        let unclaimed: Vec<(String, String)> = match &cfg.name_columns {
            Some((_, hubspot_name)) => hubspot
                .rows
                .iter()
                .filter(|row| {
                    Self::normalize_legacy_id(row.value(&cfg.legacy_id_field))
                        .map_or(true, |id| !known.contains(id.as_str()))
                })
                .filter_map(|row| {
                    let id = row.value(&cfg.hubspot_id_column).to_text()?;
                    let name = row.value(hubspot_name).to_text()?;
                    Some((id, name))
                })
                .collect(),
            None => Vec::new(),
        };

        let mut stats = ReconciliationStats::default();
        let mut outcomes = Vec::with_capacity(legacy.len());
        for (row, legacy_id) in legacy.rows.iter().zip(legacy_ids) {
            let Some(legacy_id) = legacy_id else {
                continue;
            };
            stats.total += 1;
            let hubspot_ids: Vec<String> = by_legacy_id
                .get(&legacy_id)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|&i| hubspot.rows[i].value(&cfg.hubspot_id_column).to_text())
                        .collect()
                })
                .unwrap_or_default();

            let outcome = match hubspot_ids.len() {
                0 => {
                    stats.unmatched += 1;
                    let review_candidate = cfg.name_columns.as_ref().and_then(|(legacy_name, _)| {
                        let name = row.value(legacy_name).to_text()?;
                        self.best_candidate(&name, &unclaimed)
                    });
                    ReconciliationOutcome {
                        legacy_id,
                        status: MatchStatus::New,
                        hubspot_ids,
                        match_confidence: None,
                        review_candidate,
                    }
                }
                1 => {
                    stats.matched += 1;
                    ReconciliationOutcome {
                        legacy_id,
                        status: MatchStatus::Matched,
                        hubspot_ids,
                        match_confidence: Some(100.0),
                        review_candidate: None,
                    }
                }
                _ => {
                    stats.conflicts += 1;
                    ReconciliationOutcome {
                        legacy_id,
                        status: MatchStatus::Conflict,
                        hubspot_ids,
                        match_confidence: None,
                        review_candidate: None,
                    }
                }
            };
            outcomes.push(outcome);
        }

        info!(
            entity_type,
            total = stats.total,
            matched = stats.matched,
            unmatched = stats.unmatched,
            conflicts = stats.conflicts,
            "reconciliation complete"
        );

        Ok(ReconciliationReport {
            entity_type: entity_type.to_string(),
            legacy_snapshot: legacy.id.clone(),
            hubspot_snapshot: hubspot.id.clone(),
            reconciled_at: Utc::now(),
            stats,
            outcomes,
        })
    }

    fn best_candidate(&self, name: &str, unclaimed: &[(String, String)]) -> Option<ReviewCandidate> {
        let needle = Self::normalize_name(name);
        if needle.is_empty() {
            return None;
        }
        unclaimed
            .iter()
            .map(|(id, candidate)| (id, candidate, jaro_winkler(&needle, &Self::normalize_name(candidate))))
            .filter(|(_, _, score)| *score >= self.config.review_threshold)
            .max_by(|a, b| a.2.total_cmp(&b.2))
            .map(|(id, candidate, score)| ReviewCandidate {
                hubspot_id: id.clone(),
                hubspot_name: candidate.clone(),
                score,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crmd_core::Record;

    fn legacy() -> Snapshot {
        Snapshot::from_records(
            "legacy.csv",
            vec![
                Record::new().with("Comp_CompanyId", "101").with("Comp_Name", "Alpine Microsystems"),
                Record::new().with("Comp_CompanyId", "102").with("Comp_Name", "Bergsee Optics"),
                Record::new().with("Comp_CompanyId", "103").with("Comp_Name", "Cervin Labs SA"),
                Record::new().with("Comp_CompanyId", "104").with("Comp_Name", "Zzyzx"),
            ],
        )
    }

    fn hubspot() -> Snapshot {
        Snapshot::from_records(
            "hubspot.csv",
            vec![
                Record::new()
                    .with("hs_object_id", "9001")
                    .with("icalps_company_id", "101.0")
                    .with("name", "Alpine Microsystems"),
                Record::new()
                    .with("hs_object_id", "9002")
                    .with("icalps_company_id", " 102 ")
                    .with("name", "Bergsee"),
                Record::new()
                    .with("hs_object_id", "9003")
                    .with("icalps_company_id", "102")
                    .with("name", "Bergsee Optics AG"),
                Record::new()
                    .with("hs_object_id", "9004")
                    .with("icalps_company_id", Value::Null)
                    .with("name", "Cervin Labs"),
            ],
        )
    }

    fn engine() -> ReconcileEngine {
        ReconcileEngine::new(
            ReconcileConfig::new("Comp_CompanyId", "icalps_company_id")
                .with_name_columns("Comp_Name", "name"),
        )
    }

    #[test]
    fn normalizes_legacy_ids() {
        assert_eq!(ReconcileEngine::normalize_legacy_id(&Value::text(" 101.0 ")).as_deref(), Some("101"));
        assert_eq!(ReconcileEngine::normalize_legacy_id(&Value::from(42.0)).as_deref(), Some("42"));
        assert_eq!(ReconcileEngine::normalize_legacy_id(&Value::text("A-7.0")).as_deref(), Some("A-7.0"));
        assert_eq!(ReconcileEngine::normalize_legacy_id(&Value::text("  ")), None);
        assert_eq!(ReconcileEngine::normalize_legacy_id(&Value::Null), None);
    }

    #[test]
    fn classifies_matched_conflict_and_new() {
        let report = engine().reconcile("companies", &legacy(), &hubspot()).expect("reconcile");
        assert_eq!(
            report.stats,
            ReconciliationStats {
                total: 4,
                matched: 1,
                unmatched: 2,
                conflicts: 1
            }
        );
        let by_id = |id: &str| {
            report
                .outcomes
                .iter()
                .find(|o| o.legacy_id == id)
                .expect("outcome")
        };
        assert_eq!(by_id("101").status, MatchStatus::Matched);
        assert_eq!(by_id("101").match_confidence, Some(100.0));
        assert_eq!(by_id("102").status, MatchStatus::Conflict);
        assert_eq!(by_id("102").hubspot_ids, vec!["9002".to_string(), "9003".to_string()]);
        assert_eq!(by_id("103").status, MatchStatus::New);
    }

    #[test]
    fn suggests_close_names_from_unclaimed_records_only() {
        let report = engine().reconcile("companies", &legacy(), &hubspot()).expect("reconcile");
        let cervin = report
            .outcomes
            .iter()
            .find(|o| o.legacy_id == "103")
            .expect("outcome");
        let candidate = cervin.review_candidate.as_ref().expect("candidate");
        assert_eq!(candidate.hubspot_id, "9004");
        assert!(candidate.score >= 0.85);

        let zzyzx = report
            .outcomes
            .iter()
            .find(|o| o.legacy_id == "104")
            .expect("outcome");
        assert!(zzyzx.review_candidate.is_none());
    }

    #[test]
    fn missing_legacy_id_field_is_reported() {
        let hubspot = Snapshot::from_records(
            "hubspot.csv",
            vec![Record::new().with("hs_object_id", "1")],
        );
        let err = ReconcileEngine::new(ReconcileConfig::new("Comp_CompanyId", "icalps_company_id"))
            .reconcile("companies", &legacy(), &hubspot)
            .expect_err("missing column");
        assert!(err.to_string().contains("icalps_company_id"));
    }
}
