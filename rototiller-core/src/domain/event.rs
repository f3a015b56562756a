//! Event domain types
//!
//! Events are job lifecycle notifications routed by their type. The delivery
//! tag is assigned by the bus on receive and never leaves the process.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use super::ParseError;
use super::id::JobId;

/// Well-known event types and binding patterns
pub mod event_type {
    pub const JOB_CREATED: &str = "job.created";
    pub const JOB_COMPLETED: &str = "job.completed";
    pub const JOB_ANY: &str = "job.#";
    pub const STORAGE_CREATED: &str = "storage.created";
}

/// Metadata key carrying the job id
pub const METADATA_ID: &str = "id";

/// Bus-assigned handle of one delivery
pub type DeliveryTag = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub metadata: HashMap<String, String>,

    #[serde(skip)]
    pub delivery_tag: Option<DeliveryTag>,
}

/// Why an event's metadata does not name a job
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("event metadata has no '{METADATA_ID}'")]
    MissingId,

    #[error(transparent)]
    InvalidId(#[from] ParseError),
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            metadata: HashMap::new(),
            delivery_tag: None,
        }
    }

    /// Builds a job event carrying `{"id": <job id>}`
    pub fn for_job(event_type: impl Into<String>, job_id: &JobId) -> Self {
        Self::new(event_type).with_metadata(METADATA_ID, job_id.as_str())
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Extracts the job id from the metadata
    pub fn job_id(&self) -> Result<JobId, MetadataError> {
        let raw = self
            .metadata
            .get(METADATA_ID)
            .ok_or(MetadataError::MissingId)?;
        Ok(JobId::parse(raw.as_str())?)
    }

    /// Copy of this event under another type, keeping the metadata
    pub fn relabel(&self, event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            metadata: self.metadata.clone(),
            delivery_tag: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_extraction() {
        let id = JobId::parse("job-1").unwrap();
        let event = Event::for_job(event_type::JOB_CREATED, &id);
        assert_eq!(event.job_id(), Ok(id));
    }

    #[test]
    fn test_missing_and_malformed_ids() {
        let event = Event::new(event_type::JOB_CREATED);
        assert_eq!(event.job_id(), Err(MetadataError::MissingId));

        let event = event.with_metadata(METADATA_ID, "../../etc");
        assert!(matches!(event.job_id(), Err(MetadataError::InvalidId(_))));
    }

    #[test]
    fn test_delivery_tag_is_not_serialized() {
        let mut event = Event::new(event_type::JOB_COMPLETED).with_metadata("id", "job-1");
        event.delivery_tag = Some(42);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "job.completed", "metadata": {"id": "job-1"}})
        );

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back.delivery_tag, None);
    }

    #[test]
    fn test_relabel_keeps_metadata() {
        let mut created = Event::new(event_type::JOB_CREATED).with_metadata("id", "job-1");
        created.delivery_tag = Some(7);

        let completed = created.relabel(event_type::JOB_COMPLETED);
        assert_eq!(completed.event_type, "job.completed");
        assert_eq!(completed.metadata, created.metadata);
        assert_eq!(completed.delivery_tag, None);
    }
}
