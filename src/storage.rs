//! Content-addressed blob storage on the local filesystem.
//!
//! Raw uploads are stored under `{hash[0..2]}/{hash}.pdf`; the two-level
//! layout keeps directories small. Writes are idempotent: identical bytes
//! land at the identical path.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::models::Document;

/// Local filesystem blob store.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Blob-store-relative path for a content hash.
    pub fn relative_path(content_hash: &str) -> String {
        format!("{}/{}.pdf", &content_hash[..2], content_hash)
    }

    /// Absolute path for a content hash.
    pub fn path_for(&self, content_hash: &str) -> PathBuf {
        self.root.join(Self::relative_path(content_hash))
    }

    /// Store bytes, returning their content hash and relative path.
    pub fn put(&self, content: &[u8]) -> anyhow::Result<(String, String)> {
        let hash = Document::compute_hash(content);
        let path = self.path_for(&hash);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating blob directory {}", parent.display()))?;
        }
        if !path.exists() {
            std::fs::write(&path, content)
                .with_context(|| format!("writing blob {}", path.display()))?;
        }
        Ok((hash.clone(), Self::relative_path(&hash)))
    }

    /// Fetch the bytes for a content hash.
    pub fn get(&self, content_hash: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.path_for(content_hash);
        std::fs::read(&path).with_context(|| format!("reading blob {}", path.display()))
    }

    pub fn contains(&self, content_hash: &str) -> bool {
        self.path_for(content_hash).exists()
    }

    /// Remove the blob for a content hash, ignoring absence.
    pub fn remove(&self, content_hash: &str) -> anyhow::Result<()> {
        let path = self.path_for(content_hash);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing blob {}", path.display())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
