//! In-memory blob store
//!
//! Path-backed files are read into memory on `put_object`, so the stored
//! object outlives the directory it was uploaded from.

use async_trait::async_trait;
use rototiller_core::domain::id::StorageId;
use rototiller_core::volume::{FileSource, Volume, VolumeFile};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::BlobStore;
use crate::error::BlobError;

#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<StorageId, Vec<(String, Vec<u8>)>>,
    fail_puts: bool,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores a single file under an object
    pub fn insert(&self, id: &StorageId, name: &str, bytes: impl Into<Vec<u8>>) {
        self.lock()
            .objects
            .entry(id.clone())
            .or_default()
            .push((name.to_string(), bytes.into()));
    }

    /// Files of an object as (name, bytes), sorted by name
    pub fn object(&self, id: &StorageId) -> Option<Vec<(String, Vec<u8>)>> {
        let mut files = self.lock().objects.get(id).cloned()?;
        files.sort();
        Some(files)
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Makes `put_object` fail until reset
    pub fn fail_puts(&self, fail: bool) {
        self.lock().fail_puts = fail;
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get_object(&self, id: &StorageId) -> Result<Volume, BlobError> {
        let files = self.object(id).unwrap_or_default();
        Ok(Volume::from_files(
            files
                .into_iter()
                .map(|(name, bytes)| VolumeFile::from_bytes(name, bytes))
                .collect(),
        ))
    }

    async fn put_object(&self, id: &StorageId, volume: Volume) -> Result<(), BlobError> {
        if self.lock().fail_puts {
            return Err(BlobError::Unavailable(format!("put '{id}' refused")));
        }

        let mut files = Vec::with_capacity(volume.len());
        for file in volume.into_files() {
            let bytes = match file.source {
                FileSource::Bytes(bytes) => bytes,
                FileSource::Path(path) => tokio::fs::read(&path)
                    .await
                    .map_err(|e| BlobError::io(id, e))?,
            };
            files.push((file.name, bytes));
        }

        self.lock()
            .objects
            .entry(id.clone())
            .or_default()
            .extend(files);
        Ok(())
    }

    async fn delete_object(&self, id: &StorageId) -> Result<(), BlobError> {
        self.lock().objects.remove(id);
        Ok(())
    }
}
