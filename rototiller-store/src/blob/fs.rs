//! Filesystem blob store
//!
//! Each object is a directory `<root>/<storage id>`; file names inside the
//! volume are paths relative to it.

use async_trait::async_trait;
use rototiller_core::domain::id::StorageId;
use rototiller_core::volume::{FileSource, Volume, safe_relative_path};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::BlobStore;
use crate::error::BlobError;

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_dir(&self, id: &StorageId) -> PathBuf {
        self.root.join(id.as_str())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get_object(&self, id: &StorageId) -> Result<Volume, BlobError> {
        let dir = self.object_dir(id);
        if !tokio::fs::try_exists(&dir)
            .await
            .map_err(|e| BlobError::io(id, e))?
        {
            debug!(object = %id, "Object has no files");
            return Ok(Volume::new());
        }

        tokio::task::spawn_blocking(move || Volume::from_dir(&dir))
            .await
            .map_err(|e| BlobError::io(id, std::io::Error::other(e)))?
            .map_err(|source| BlobError::Walk {
                id: id.to_string(),
                source,
            })
    }

    async fn put_object(&self, id: &StorageId, volume: Volume) -> Result<(), BlobError> {
        let dir = self.object_dir(id);

        for file in volume.into_files() {
            let relative =
                safe_relative_path(&file.name).ok_or_else(|| BlobError::UnsafePath(file.name.clone()))?;
            let target = dir.join(relative);

            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| BlobError::io(id, e))?;
            }

            let written = match file.source {
                FileSource::Bytes(bytes) => tokio::fs::write(&target, bytes).await,
                FileSource::Path(source) => tokio::fs::copy(&source, &target).await.map(|_| ()),
            };
            written.map_err(|e| BlobError::io(id, e))?;
        }

        debug!(object = %id, "Stored object");
        Ok(())
    }

    async fn delete_object(&self, id: &StorageId) -> Result<(), BlobError> {
        match tokio::fs::remove_dir_all(self.object_dir(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::io(id, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rototiller_core::volume::VolumeFile;

    fn id(raw: &str) -> StorageId {
        StorageId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get_preserves_names() {
        let root = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(root.path());

        let volume = Volume::from_files(vec![
            VolumeFile::from_bytes("output.geojson", b"{}".to_vec()),
            VolumeFile::from_bytes("tiles/0.zip", vec![0u8; 32]),
        ]);
        store.put_object(&id("out-1"), volume).await.unwrap();

        let stored = store.get_object(&id("out-1")).await.unwrap();
        let names: Vec<_> = stored.files().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["output.geojson", "tiles/0.zip"]);
        assert_eq!(stored.total_size(), 34);
    }

    #[tokio::test]
    async fn test_missing_object_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(root.path());

        let volume = store.get_object(&id("nothing")).await.unwrap();
        assert!(volume.is_empty());
    }

    #[tokio::test]
    async fn test_put_copies_path_sources() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let source = scratch.path().join("result.csv");
        std::fs::write(&source, "a,b\n").unwrap();

        let store = FsBlobStore::new(root.path());
        let volume = Volume::from_files(vec![VolumeFile::from_path("result.csv", &source, 4)]);
        store.put_object(&id("out-2"), volume).await.unwrap();

        let written = std::fs::read(root.path().join("out-2/result.csv")).unwrap();
        assert_eq!(written, b"a,b\n");
    }

    #[tokio::test]
    async fn test_put_rejects_escaping_names() {
        let root = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(root.path());

        let volume = Volume::from_files(vec![VolumeFile::from_bytes("../evil", b"x".to_vec())]);
        let err = store.put_object(&id("out-3"), volume).await.unwrap_err();
        assert!(matches!(err, BlobError::UnsafePath(_)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(root.path());

        let volume = Volume::from_files(vec![VolumeFile::from_bytes("a", b"1".to_vec())]);
        store.put_object(&id("gone"), volume).await.unwrap();
        store.delete_object(&id("gone")).await.unwrap();
        store.delete_object(&id("gone")).await.unwrap();

        assert!(!root.path().join("gone").exists());
    }
}
