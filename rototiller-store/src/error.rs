//! Error types for the catalog and blob gateways

use rototiller_core::ParseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value does not decode into a domain type
    #[error("corrupt catalog row: {0}")]
    Decode(#[from] ParseError),
}

impl CatalogError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("i/o error on object '{id}': {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to list object '{id}': {source}")]
    Walk {
        id: String,
        #[source]
        source: walkdir::Error,
    },

    /// A file name would escape the object's root
    #[error("unsafe file name '{0}'")]
    UnsafePath(String),

    #[error("blob store unavailable: {0}")]
    Unavailable(String),
}

impl BlobError {
    pub(crate) fn io(id: impl ToString, source: std::io::Error) -> Self {
        Self::Io {
            id: id.to_string(),
            source,
        }
    }
}
