//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ParseError;
use super::id::{JobId, StorageId};

/// One requested transformation
///
/// Created by the API layer in `Waiting`, mutated only by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub customer_id: String,
    pub task_type: String,
    /// Positional arguments, matched against the task's parameter names
    pub args: Vec<String>,
    pub input_id: StorageId,
    pub output_id: Option<StorageId>,
    pub status: JobStatus,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    InProgress,
    Complete,
    Error,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Waiting,
        JobStatus::InProgress,
        JobStatus::Complete,
        JobStatus::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::InProgress => "inprogress",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }

    /// Whether a duplicate `job.created` delivery must leave this job alone
    pub fn is_claimed(self) -> bool {
        matches!(self, JobStatus::InProgress | JobStatus::Complete)
    }

    /// Allowed moves of the job state machine
    ///
    /// `Error -> InProgress` is the retry after a requeued transient failure;
    /// `InProgress -> Waiting` is reserved for the stale-job reaper.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        self == next
            || matches!(
                (self, next),
                (Waiting, InProgress)
                    | (Waiting, Error)
                    | (InProgress, Complete)
                    | (InProgress, Error)
                    | (InProgress, Waiting)
                    | (Error, InProgress)
            )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseError::JobStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("InProgress".parse::<JobStatus>(), Ok(JobStatus::InProgress));
        assert_eq!("COMPLETE".parse::<JobStatus>(), Ok(JobStatus::Complete));
        assert_eq!(
            "running".parse::<JobStatus>(),
            Err(ParseError::JobStatus("running".to_string()))
        );
    }

    #[test]
    fn test_display_round_trips() {
        for status in JobStatus::ALL {
            assert_eq!(status.to_string().parse::<JobStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_claimed_statuses() {
        assert!(JobStatus::InProgress.is_claimed());
        assert!(JobStatus::Complete.is_claimed());
        assert!(!JobStatus::Waiting.is_claimed());
        assert!(!JobStatus::Error.is_claimed());
    }

    #[test]
    fn test_transitions() {
        use JobStatus::*;

        assert!(Waiting.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Complete));
        assert!(InProgress.can_transition_to(Error));
        assert!(Error.can_transition_to(InProgress));
        assert!(Complete.can_transition_to(Complete));

        assert!(!Complete.can_transition_to(InProgress));
        assert!(!Complete.can_transition_to(Error));
        assert!(!Waiting.can_transition_to(Complete));
        assert!(!Error.can_transition_to(Complete));
    }

    #[test]
    fn test_serde_uses_lowercase() {
        let json = serde_json::to_string(&JobStatus::InProgress).unwrap();
        assert_eq!(json, "\"inprogress\"");
    }
}
