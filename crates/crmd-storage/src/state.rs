//! Load-state persistence: exactly one current checkpoint per entity type.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use crmd_core::LoadState;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use crate::write_atomic;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Most recent state for `entity_type`, or `None` before the first successful run.
    async fn load(&self, entity_type: &str) -> anyhow::Result<Option<LoadState>>;

    /// Overwrites the state for `state.entity_type`.
    async fn save(&self, state: &LoadState) -> anyhow::Result<()>;
}

/// One pretty-printed JSON file per entity under a state directory.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    dir: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, entity_type: &str) -> PathBuf {
        self.dir
            .join(format!("{}_load_state.json", file_stem(entity_type)))
    }
}

/// Entity names become file names; anything outside `[A-Za-z0-9_-]` is replaced.
pub fn file_stem(entity_type: &str) -> String {
    entity_type
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn load(&self, entity_type: &str) -> anyhow::Result<Option<LoadState>> {
        let path = self.path_for(entity_type);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking state file {}", path.display()))?
        {
            info!(entity_type, "no previous load state");
            return Ok(None);
        }

        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let state: LoadState =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        info!(entity_type, path = %path.display(), "loaded previous load state");
        Ok(Some(state))
    }

    async fn save(&self, state: &LoadState) -> anyhow::Result<()> {
        let path = self.path_for(&state.entity_type);
        let bytes = serde_json::to_vec_pretty(state).context("serializing load state")?;
        write_atomic(&path, &bytes).await?;
        info!(entity_type = %state.entity_type, path = %path.display(), "saved load state");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, LoadState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, state: LoadState) {
        self.states
            .lock()
            .await
            .insert(state.entity_type.clone(), state);
    }

    pub async fn get(&self, entity_type: &str) -> Option<LoadState> {
        self.states.lock().await.get(entity_type).cloned()
    }

    pub async fn len(&self) -> usize {
        self.states.lock().await.len()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, entity_type: &str) -> anyhow::Result<Option<LoadState>> {
        Ok(self.get(entity_type).await)
    }

    async fn save(&self, state: &LoadState) -> anyhow::Result<()> {
        self.insert(state.clone()).await;
        Ok(())
    }
}
