//! Immutable, content-addressed copies of the extracts a load state refers to.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::fs;

use crate::state::file_stem;
use crate::{sha256_hex, write_atomic};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Extracts are stored as `<root>/<entity>/<sha256>.<ext>` and never rewritten.
#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    root: PathBuf,
}

impl SnapshotArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative_path(entity_type: &str, content_hash: &str, extension: &str) -> PathBuf {
        PathBuf::from(file_stem(entity_type)).join(format!("{content_hash}.{extension}"))
    }

    pub async fn store_bytes(
        &self,
        entity_type: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedSnapshot> {
        let content_hash = sha256_hex(bytes);
        let relative_path = Self::relative_path(entity_type, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes).await?;
        }

        Ok(ArchivedSnapshot {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}
