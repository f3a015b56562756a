//! Error types for the worker

use rototiller_core::domain::storage::StorageStatus;
use rototiller_store::{BlobError, CatalogError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Constraint(String),
}

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("no input found")]
    NoInput,

    #[error("unsafe file name '{0}'")]
    UnsafePath(String),

    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to walk {}: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

impl VolumeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    /// The task program could not be started
    #[error("failed to start task program '{}': {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on a started program failed
    #[error("failed to wait for task program '{}': {source}", program.display())]
    Wait {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RunnerError {
    /// Whether retrying on this host cannot help
    pub fn is_permanent(&self) -> bool {
        match self {
            RunnerError::Spawn { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            RunnerError::Wait { .. } => false,
        }
    }
}

/// Why a job did not complete
///
/// `Display` is the text recorded as the job's error.
#[derive(Debug, Error)]
pub enum JobFailure {
    #[error("input storage status '{0}'")]
    InputNotUsable(StorageStatus),

    /// The task program ran and reported failure
    #[error("{0}")]
    Task(String),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Blob(#[from] BlobError),
}

impl JobFailure {
    /// Whether redelivering the event may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            JobFailure::InputNotUsable(_) | JobFailure::Task(_) => false,
            JobFailure::Volume(VolumeError::NoInput | VolumeError::UnsafePath(_)) => false,
            JobFailure::Volume(_) => true,
            JobFailure::Runner(e) => !e.is_permanent(),
            JobFailure::Catalog(e) => !e.is_not_found(),
            JobFailure::Blob(BlobError::UnsafePath(_)) => false,
            JobFailure::Blob(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    fn spawn_error(kind: ErrorKind) -> RunnerError {
        RunnerError::Spawn {
            program: PathBuf::from("buffer"),
            source: IoError::from(kind),
        }
    }

    #[test]
    fn test_failure_messages() {
        assert_eq!(
            JobFailure::InputNotUsable(StorageStatus::Final).to_string(),
            "input storage status 'final'"
        );
        assert_eq!(JobFailure::from(VolumeError::NoInput).to_string(), "no input found");
        assert_eq!(JobFailure::Task("disk full".into()).to_string(), "disk full");
    }

    #[test]
    fn test_transient_classification() {
        assert!(!JobFailure::Task("unusable input".into()).is_transient());
        assert!(!JobFailure::from(VolumeError::NoInput).is_transient());
        assert!(!JobFailure::from(spawn_error(ErrorKind::NotFound)).is_transient());
        assert!(!JobFailure::from(spawn_error(ErrorKind::PermissionDenied)).is_transient());
        assert!(JobFailure::from(spawn_error(ErrorKind::WouldBlock)).is_transient());

        let io = VolumeError::io("/tmp/x", IoError::from(ErrorKind::Other));
        assert!(JobFailure::from(io).is_transient());

        assert!(!JobFailure::from(CatalogError::not_found("job", "x")).is_transient());
        assert!(JobFailure::from(BlobError::Unavailable("down".into())).is_transient());
        assert!(!JobFailure::from(BlobError::UnsafePath("../x".into())).is_transient());
    }
}
