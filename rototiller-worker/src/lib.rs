//! Rototiller Worker
//!
//! Turns `job.created` events into runs of external task programs:
//! - Configuration: settings from `ROTOTILLER_*` environment variables
//! - Volume manager: per-job input/output directories
//! - Task runner: program invocation and exit-code classification
//! - Worker pool: bound on concurrently running jobs
//! - Orchestrator: event loop and the per-job state machine
//! - Reaper: requeues jobs left `InProgress` by a crashed worker
//! - API: health and status endpoints

pub mod api;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod reaper;
pub mod runner;
pub mod volume;

pub use config::Config;
pub use orchestrator::{Disposition, Orchestrator};
pub use pool::WorkerPool;
pub use reaper::Reaper;
pub use runner::TaskRunner;
pub use volume::WorkDir;
