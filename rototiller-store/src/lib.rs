//! Rototiller Store
//!
//! Gateways to the two stores the worker reads and writes:
//! - the catalog of jobs, storage entries and task definitions
//! - the blob store holding storage contents as volumes
//!
//! Each gateway is a trait with a production implementation (Postgres,
//! filesystem) and an in-memory one for tests.

pub mod blob;
pub mod catalog;
pub mod db;
pub mod error;
mod repository;

pub use blob::{BlobStore, FsBlobStore, InMemoryBlobStore};
pub use catalog::{Catalog, InMemoryCatalog, PgCatalog};
pub use error::{BlobError, CatalogError};
