//! Core domain types
//!
//! These types represent the entities the pipeline moves through its state
//! machines. They are shared between the catalog (persists), the bus
//! (transports) and the worker (mutates).

pub mod event;
pub mod id;
pub mod job;
pub mod storage;
pub mod task;

use thiserror::Error;

/// Error returned when a textual value does not name a known variant
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown job status '{0}'")]
    JobStatus(String),

    #[error("unknown storage status '{0}'")]
    StorageStatus(String),

    #[error("unknown task kind '{0}'")]
    TaskKind(String),

    #[error("invalid identifier '{0}'")]
    Identifier(String),
}
