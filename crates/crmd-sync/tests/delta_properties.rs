use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crmd_adapters::{CsvSnapshotSource, MemorySnapshotSource};
use crmd_core::{Baseline, CompositeKey, DeltaResult, LoadType, Record, Snapshot, StagingTarget};
use crmd_storage::{record_fingerprint, JsonFileStateStore, MemoryStateStore, StateStore};
use crmd_sync::{DeltaDetector, MemoryStagingStore, StagingLoader};
use tempfile::TempDir;

const FIRST: &str = "companies/companies_2026_03_01.csv";
const SECOND: &str = "companies/companies_2026_03_08.csv";

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/companies")
}

fn cols(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn company_columns() -> Vec<String> {
    cols(&["Comp_CompanyId", "Comp_Name", "Comp_Website", "Comp_Type"])
}

fn company_key() -> Vec<String> {
    cols(&["Comp_CompanyId"])
}

fn target() -> StagingTarget {
    StagingTarget::new("staging", "companies_staging")
}

/// Temp workspace holding a private copy of the company extracts.
fn workspace() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    let companies = dir.path().join("companies");
    std::fs::create_dir_all(&companies).expect("mkdir");
    for entry in std::fs::read_dir(fixtures_dir()).expect("fixtures") {
        let entry = entry.expect("entry");
        std::fs::copy(entry.path(), companies.join(entry.file_name())).expect("copy fixture");
    }
    dir
}

struct Harness {
    dir: TempDir,
    detector: DeltaDetector,
    state: Arc<JsonFileStateStore>,
    staging: Arc<MemoryStagingStore>,
    loader: StagingLoader,
}

fn harness() -> Harness {
    let dir = workspace();
    let source = Arc::new(CsvSnapshotSource::new().with_root(dir.path()));
    let state = Arc::new(JsonFileStateStore::new(dir.path().join("state")));
    let staging = Arc::new(MemoryStagingStore::new());
    Harness {
        detector: DeltaDetector::new(source, state.clone()),
        loader: StagingLoader::new(staging.clone()),
        dir,
        state,
        staging,
    }
}

impl Harness {
    async fn detect(&self, snapshot: &str) -> DeltaResult {
        self.detector
            .detect_changes("companies", snapshot, &company_columns(), &company_key())
            .await
            .expect("detect")
    }

    async fn detect_and_load(&self, snapshot: &str) -> DeltaResult {
        let delta = self.detect(snapshot).await;
        self.loader.load_delta(&delta, &target()).await.expect("load");
        delta
    }
}

fn key(id: &str) -> CompositeKey {
    CompositeKey::single(id)
}

fn keys_of(delta: &DeltaResult) -> [HashSet<CompositeKey>; 4] {
    [
        delta.new_records.iter().map(|r| r.key.clone()).collect(),
        delta.modified_records.iter().map(|r| r.key.clone()).collect(),
        delta.deleted_keys.iter().cloned().collect(),
        delta.unchanged_keys.iter().cloned().collect(),
    ]
}

#[test]
fn fingerprints_are_stable_and_value_sensitive() {
    let a = Record::new().with("id", "1").with("name", "A");
    let same = Record::new().with("name", "A").with("id", "1");
    let changed = Record::new().with("id", "1").with("name", "B");
    assert_eq!(record_fingerprint(&a), record_fingerprint(&a));
    assert_eq!(record_fingerprint(&a), record_fingerprint(&same));
    assert_ne!(record_fingerprint(&a), record_fingerprint(&changed));
}

#[tokio::test]
async fn week_over_week_extracts_partition_every_key() {
    let h = harness();
    let first = h.detect_and_load(FIRST).await;
    assert_eq!(first.baseline, Baseline::FirstRun);
    assert_eq!(first.new_records.len(), 3);

    let second = h.detect(SECOND).await;
    let [new, modified, deleted, unchanged] = keys_of(&second);
    assert_eq!(new, HashSet::from([key("104")]));
    assert_eq!(modified, HashSet::from([key("102")]));
    assert_eq!(deleted, HashSet::from([key("103")]));
    assert_eq!(unchanged, HashSet::from([key("101")]));

    let all = [&new, &modified, &deleted, &unchanged];
    for (i, a) in all.iter().enumerate() {
        for b in &all[i + 1..] {
            assert!(a.is_disjoint(b));
        }
    }
    let union: HashSet<_> = all.iter().flat_map(|s| s.iter().cloned()).collect();
    let expected: HashSet<_> = ["101", "102", "103", "104"].into_iter().map(key).collect();
    assert_eq!(union, expected);
}

#[tokio::test]
async fn first_run_persists_state_with_row_count() {
    let h = harness();
    let delta = h.detect(FIRST).await;
    assert_eq!(delta.new_records.len(), 3);
    assert!(delta.modified_records.is_empty());
    assert!(delta.deleted_keys.is_empty());
    assert!(delta.unchanged_keys.is_empty());

    let state = h.state.load("companies").await.expect("load").expect("state");
    assert_eq!(state.last_row_count, 3);
    assert_eq!(state.last_csv_path, FIRST);
    assert!(h.dir.path().join("state/companies_load_state.json").exists());
}

#[tokio::test]
async fn staging_mirrors_the_latest_extract() {
    let h = harness();
    h.detect_and_load(FIRST).await;
    h.detect_and_load(SECOND).await;

    let rows = h.staging.rows(&target()).await;
    assert_eq!(rows.len(), 4);
    let row = |id: &str| {
        rows.iter()
            .find(|r| r.row.record.key(&company_key()) == key(id))
            .map(|r| &r.row)
            .expect("row")
    };
    assert_eq!(row("101").load_type, LoadType::Insert);
    assert_eq!(row("102").load_type, LoadType::Update);
    assert_eq!(
        row("102").record.value("Comp_Website").to_text().as_deref(),
        Some("bergsee.example")
    );
    assert_eq!(row("104").load_type, LoadType::Insert);
    assert_eq!(h.staging.active_rows(&target()).await.len(), 3);
}

#[tokio::test]
async fn deleted_keys_are_soft_deleted_not_removed() {
    let h = harness();
    h.detect_and_load(FIRST).await;
    h.detect_and_load(SECOND).await;

    let rows = h.staging.rows(&target()).await;
    let gone = rows
        .iter()
        .find(|r| r.row.record.key(&company_key()) == key("103"))
        .expect("row for deleted key still present");
    assert!(gone.row.is_deleted);
    assert_eq!(gone.row.load_type, LoadType::Delete);
    assert_eq!(
        gone.row.delete_reason.as_deref(),
        Some(format!("absent from snapshot {SECOND}").as_str())
    );
}

#[tokio::test]
async fn unchanged_extract_leaves_staging_untouched() {
    let h = harness();
    h.detect_and_load(FIRST).await;
    let before = h.staging.rows(&target()).await;

    let again = h.detect(FIRST).await;
    assert!(!again.has_changes());
    assert_eq!(again.unchanged_keys.len(), 3);
    let report = h.loader.load_delta(&again, &target()).await.expect("no-op");
    assert!(report.skipped);
    assert_eq!(h.staging.rows(&target()).await, before);
}

#[tokio::test]
async fn lost_previous_extract_reloads_everything_as_new() {
    let h = harness();
    h.detect_and_load(FIRST).await;
    std::fs::remove_file(h.dir.path().join(FIRST)).expect("remove previous extract");

    let delta = h.detect(SECOND).await;
    assert_eq!(
        delta.baseline,
        Baseline::PreviousSnapshotMissing {
            snapshot_id: FIRST.to_string()
        }
    );
    assert_eq!(delta.new_records.len(), 3);
    assert!(delta.deleted_keys.is_empty());

    // keys 101 and 102 are already staged from the first run
    let report = h.loader.load_delta(&delta, &target()).await.expect("load");
    assert_eq!(report.inserted, 3);
    assert_eq!(report.replaced, 2);
    assert_eq!(h.staging.active_rows(&target()).await.len(), 4);

    let state = h.state.load("companies").await.expect("load").expect("state");
    assert_eq!(state.last_csv_path, SECOND);
    assert_eq!(state.metadata.get("fallback"), Some(&serde_json::Value::Bool(true)));
}

fn snapshot(id: &str, rows: &[(&str, &str)]) -> Snapshot {
    Snapshot::new(
        id,
        cols(&["id", "name"]),
        rows.iter()
            .map(|(id, name)| Record::new().with("id", *id).with("name", *name))
            .collect(),
    )
}

async fn diff(previous: Snapshot, current: Snapshot) -> DeltaResult {
    let source = Arc::new(MemorySnapshotSource::new());
    let (previous_id, current_id) = (previous.id.clone(), current.id.clone());
    source.insert(previous).await;
    source.insert(current).await;
    let detector = DeltaDetector::new(source, Arc::new(MemoryStateStore::new()));
    let columns = cols(&["id", "name"]);
    let pk = cols(&["id"]);
    detector
        .detect_changes("items", &previous_id, &columns, &pk)
        .await
        .expect("baseline");
    detector
        .detect_changes("items", &current_id, &columns, &pk)
        .await
        .expect("detect")
}

#[tokio::test]
async fn pure_addition() {
    let delta = diff(
        snapshot("prev", &[("1", "A")]),
        snapshot("curr", &[("1", "A"), ("2", "B")]),
    )
    .await;
    assert_eq!(delta.new_records.len(), 1);
    assert_eq!(delta.new_records[0].record, Record::new().with("id", "2").with("name", "B"));
    assert!(delta.modified_records.is_empty());
    assert!(delta.deleted_keys.is_empty());
    assert_eq!(delta.unchanged_keys, vec![key("1")]);
}

#[tokio::test]
async fn pure_modification() {
    let delta = diff(snapshot("prev", &[("1", "A")]), snapshot("curr", &[("1", "B")])).await;
    assert!(delta.new_records.is_empty());
    assert_eq!(delta.modified_records.len(), 1);
    assert_eq!(
        delta.modified_records[0].record,
        Record::new().with("id", "1").with("name", "B")
    );
    assert!(delta.deleted_keys.is_empty());
    assert!(delta.unchanged_keys.is_empty());
}

#[tokio::test]
async fn pure_deletion() {
    let delta = diff(
        snapshot("prev", &[("1", "A"), ("2", "B")]),
        snapshot("curr", &[("1", "A")]),
    )
    .await;
    assert!(delta.new_records.is_empty());
    assert!(delta.modified_records.is_empty());
    assert_eq!(delta.deleted_keys, vec![key("2")]);
    assert_eq!(delta.unchanged_keys, vec![key("1")]);
}
