// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Artifact byte storage keyed by content digest.
//!
//! Published robot version artifacts are stored on the filesystem under
//! `{root}/sha256/{digest}`. The store is content-addressed: writing the
//! same bytes twice is a no-op, and readers verify the digest of whatever
//! they fetch before using it.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Filesystem blob store for robot version artifacts.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Create a blob store rooted at `{data_dir}/artifacts`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            root: data_dir.as_ref().join("artifacts"),
        }
    }

    /// Compute the sha256 hex digest of a byte slice.
    pub fn digest_of(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    /// Store bytes and return their digest. Idempotent per content.
    pub async fn put(&self, bytes: &[u8]) -> Result<String, CoreError> {
        let digest = Self::digest_of(bytes);
        let path = self.path_for(&digest);
        if tokio::fs::try_exists(&path).await? {
            return Ok(digest);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename keeps partially written blobs invisible.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(digest)
    }

    /// Fetch bytes by digest, verifying content integrity.
    pub async fn get(&self, digest: &str) -> Result<Vec<u8>, CoreError> {
        let path = self.path_for(digest);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| CoreError::ArtifactBytesMissing {
                digest: digest.to_string(),
            })?;
        let actual = Self::digest_of(&bytes);
        if actual != digest {
            return Err(CoreError::ArtifactBytesMissing {
                digest: digest.to_string(),
            });
        }
        Ok(bytes)
    }

    /// Whether a blob exists for the digest.
    pub async fn contains(&self, digest: &str) -> bool {
        tokio::fs::try_exists(self.path_for(digest))
            .await
            .unwrap_or(false)
    }

    /// Remove a blob. Missing blobs are not an error.
    pub async fn remove(&self, digest: &str) -> Result<(), CoreError> {
        match tokio::fs::remove_file(self.path_for(digest)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn path_for(&self, digest: &str) -> PathBuf {
        self.root.join("sha256").join(digest)
    }
}
