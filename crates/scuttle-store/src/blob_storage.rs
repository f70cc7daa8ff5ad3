//! Content-addressed blob files under `<data-dir>/blobs/<prefix>/<hash>`.

use std::path::{Path, PathBuf};

use scuttle_shared::constants::DEFAULT_MAX_BLOB_SIZE;
use scuttle_shared::BlobRef;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Result, StoreError};

#[derive(Debug, Clone)]
pub struct BlobStorage {
    base_path: PathBuf,
    max_size: u64,
}

impl BlobStorage {
    pub async fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path).await?;
        info!(path = %base_path.display(), "blob storage initialized");
        Ok(Self {
            base_path,
            max_size: DEFAULT_MAX_BLOB_SIZE,
        })
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// File path of `blob`. The name is the hex digest, so it cannot escape
    /// the base directory.
    pub fn path_for(&self, blob: &BlobRef) -> PathBuf {
        let hex = blob.to_hex();
        self.base_path.join(&hex[..2]).join(hex)
    }

    pub async fn has(&self, blob: &BlobRef) -> bool {
        fs::metadata(self.path_for(blob)).await.is_ok()
    }

    /// Size in bytes, `None` when the blob is not stored.
    pub async fn size(&self, blob: &BlobRef) -> Option<u64> {
        fs::metadata(self.path_for(blob)).await.ok().map(|m| m.len())
    }

    pub async fn get(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        match fs::read(self.path_for(blob)).await {
            Ok(data) => {
                debug!(blob = %blob, size = data.len(), "read blob");
                Ok(data)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Store `data` under its own hash.
    pub async fn store(&self, data: &[u8]) -> Result<BlobRef> {
        let blob = BlobRef::of_content(data);
        self.write(&blob, data).await?;
        Ok(blob)
    }

    /// Store `data` only if it hashes to `expected`.
    pub async fn store_verified(&self, expected: &BlobRef, data: &[u8]) -> Result<()> {
        if BlobRef::of_content(data) != *expected {
            return Err(StoreError::BlobHashMismatch(*expected));
        }
        self.write(expected, data).await
    }

    pub async fn delete(&self, blob: &BlobRef) -> Result<()> {
        match fs::remove_file(self.path_for(blob)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Every stored blob.
    pub async fn list(&self) -> Result<Vec<BlobRef>> {
        let mut blobs = Vec::new();
        let mut prefixes = fs::read_dir(&self.base_path).await?;
        while let Some(prefix) = prefixes.next_entry().await? {
            if !prefix.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(prefix.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Ok(bytes) = hex::decode(name) else { continue };
                if let Ok(array) = <[u8; 32]>::try_from(bytes) {
                    blobs.push(BlobRef::from_bytes(array));
                }
            }
        }
        blobs.sort();
        Ok(blobs)
    }

    async fn write(&self, blob: &BlobRef, data: &[u8]) -> Result<()> {
        let size = data.len() as u64;
        if size > self.max_size {
            return Err(StoreError::BlobTooLarge {
                size,
                max: self.max_size,
            });
        }

        let path = self.path_for(blob);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Readers never observe a partially written file.
        let tmp = path.with_extension(format!("tmp{:016x}", rand::random::<u64>()));
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;

        debug!(blob = %blob, size, "stored blob");
        Ok(())
    }
}
