//! Blob Gateway
//!
//! Storage contents as volumes: a tree of named files per storage id.

mod fs;
mod memory;

pub use fs::FsBlobStore;
pub use memory::InMemoryBlobStore;

use async_trait::async_trait;
use rototiller_core::domain::id::StorageId;
use rototiller_core::volume::Volume;

use crate::error::BlobError;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Contents of an object; an object never written is an empty volume
    async fn get_object(&self, id: &StorageId) -> Result<Volume, BlobError>;

    /// Writes every file of the volume under the object
    async fn put_object(&self, id: &StorageId, volume: Volume) -> Result<(), BlobError>;

    /// Removes an object; removing a missing object succeeds
    async fn delete_object(&self, id: &StorageId) -> Result<(), BlobError>;
}
