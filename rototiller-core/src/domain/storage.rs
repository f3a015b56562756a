//! Storage domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ParseError;
use super::id::StorageId;

/// Catalog entry for one stored blob, used for job inputs and outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Storage {
    pub id: StorageId,
    pub customer_id: String,
    pub name: String,
    pub status: StorageStatus,
    pub last_used: Option<DateTime<Utc>>,
    pub create_time: DateTime<Utc>,
}

impl Storage {
    /// Builds a fresh storage entry with a generated id
    pub fn new(customer_id: impl Into<String>, status: StorageStatus) -> Self {
        let now = Utc::now();
        Self {
            id: StorageId::generate(),
            customer_id: customer_id.into(),
            name: String::new(),
            status,
            last_used: Some(now),
            create_time: now,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Usability of a stored blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageStatus {
    /// Freshly created, not yet classified
    Unknown,
    /// Safe to use as input to another job
    Transformable,
    /// Rejected by a task; must not be reused
    Unusable,
    /// Terminal lookup result; never an input, never mutated
    Final,
}

impl StorageStatus {
    pub const ALL: [StorageStatus; 4] = [
        StorageStatus::Unknown,
        StorageStatus::Transformable,
        StorageStatus::Unusable,
        StorageStatus::Final,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StorageStatus::Unknown => "unknown",
            StorageStatus::Transformable => "transformable",
            StorageStatus::Unusable => "unusable",
            StorageStatus::Final => "final",
        }
    }

    /// Whether a job may take this storage as its input
    pub fn accepts_input(self) -> bool {
        !matches!(self, StorageStatus::Final | StorageStatus::Unusable)
    }
}

impl fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorageStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseError::StorageStatus(s.to_string()))
    }
}
