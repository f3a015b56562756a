//! Task domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ParseError;
use super::storage::StorageStatus;

/// A declared transformation type, backed by an external program of the same name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Program name, e.g. "buffer"
    pub task_type: String,
    /// Ordered parameter names; a job's args bind to these positionally
    pub params: Vec<String>,
    pub kind: TaskKind,
    pub routing_key: String,
}

impl Task {
    /// Status given to the output storage of a successful run
    pub fn output_status(&self) -> StorageStatus {
        match self.kind {
            TaskKind::Lookup => StorageStatus::Final,
            TaskKind::Transformation => StorageStatus::Transformable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Produces a terminal result
    Lookup,
    /// Produces further-transformable output
    Transformation,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Lookup => "lookup",
            TaskKind::Transformation => "transformation",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [TaskKind::Lookup, TaskKind::Transformation]
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseError::TaskKind(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(kind: TaskKind) -> Task {
        Task {
            task_type: "buffer".to_string(),
            params: vec!["buffer-distance".to_string()],
            kind,
            routing_key: "job.created".to_string(),
        }
    }

    #[test]
    fn test_output_status_by_kind() {
        assert_eq!(task(TaskKind::Lookup).output_status(), StorageStatus::Final);
        assert_eq!(
            task(TaskKind::Transformation).output_status(),
            StorageStatus::Transformable
        );
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("Lookup".parse::<TaskKind>(), Ok(TaskKind::Lookup));
        assert!("reduce".parse::<TaskKind>().is_err());
    }
}
