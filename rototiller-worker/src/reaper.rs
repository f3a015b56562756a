//! Stale-job reaper
//!
//! A worker that dies after its task program exits but before the job row
//! is written leaves the job `InProgress`, and redeliveries skip claimed
//! jobs. The reaper puts such jobs back to `Waiting` and announces them
//! again. The threshold must exceed the longest task runtime: a slow job
//! and an orphaned one look the same.

use chrono::Utc;
use rototiller_bus::EventBus;
use rototiller_core::domain::event::{Event, event_type};
use rototiller_store::{Catalog, CatalogError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct Reaper {
    catalog: Arc<dyn Catalog>,
    bus: Arc<dyn EventBus>,
    stale_after: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        bus: Arc<dyn EventBus>,
        stale_after: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            catalog,
            bus,
            stale_after,
            interval,
        }
    }

    /// Requeues every job `InProgress` for longer than the threshold
    ///
    /// Returns the number of jobs requeued.
    pub async fn sweep(&self) -> Result<usize, CatalogError> {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(stale_after)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let stale = self.catalog.get_jobs_in_progress_before(cutoff).await?;
        let mut requeued = 0;

        for job in stale {
            let Some(started) = job.start_time else {
                continue;
            };

            // Only the run that was read; a job finishing meanwhile is left alone
            if !self.catalog.requeue_job(&job.id, started).await? {
                debug!(job_id = %job.id, "Job moved on before it could be requeued");
                continue;
            }
            warn!(job_id = %job.id, started = %started, "Requeued stale job");
            requeued += 1;

            if let Err(e) = self
                .bus
                .emit(&Event::for_job(event_type::JOB_CREATED, &job.id))
                .await
            {
                error!(job_id = %job.id, "Failed to announce requeued job: {}", e);
            }
        }

        Ok(requeued)
    }

    /// Sweeps every interval until `shutdown` resolves
    pub async fn run<S>(self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        info!(
            "Starting stale-job reaper (threshold: {:?}, interval: {:?})",
            self.stale_after, self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            match self.sweep().await {
                Ok(0) => debug!("No stale jobs"),
                Ok(n) => info!("Requeued {} stale job(s)", n),
                Err(e) => error!("Stale-job sweep failed: {}", e),
            }
        }

        debug!("Reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rototiller_bus::InMemoryEventBus;
    use rototiller_core::domain::id::{JobId, StorageId};
    use rototiller_core::domain::job::{Job, JobStatus};
    use rototiller_store::InMemoryCatalog;

    fn job(id: &str, status: JobStatus, age: chrono::Duration) -> Job {
        Job {
            id: JobId::parse(id).unwrap(),
            customer_id: "customer".to_string(),
            task_type: "buffer".to_string(),
            args: vec![],
            input_id: StorageId::parse("in-1").unwrap(),
            output_id: None,
            status,
            error: Some("stale".to_string()),
            start_time: Some(Utc::now() - age),
            end_time: None,
        }
    }

    #[tokio::test]
    async fn test_sweep_requeues_stale_jobs() {
        let catalog = InMemoryCatalog::new();
        let bus = InMemoryEventBus::default();
        catalog.insert_job(job("stuck", JobStatus::InProgress, chrono::Duration::hours(30)));
        catalog.insert_job(job("running", JobStatus::InProgress, chrono::Duration::minutes(5)));
        catalog.insert_job(job("done", JobStatus::Complete, chrono::Duration::hours(30)));

        let reaper = Reaper::new(
            Arc::new(catalog.clone()),
            Arc::new(bus.clone()),
            Duration::from_secs(24 * 60 * 60),
            Duration::from_secs(300),
        );

        assert_eq!(reaper.sweep().await.unwrap(), 1);

        let stuck = catalog.job(&JobId::parse("stuck").unwrap()).unwrap();
        assert_eq!(stuck.status, JobStatus::Waiting);
        assert!(stuck.error.is_none());
        assert!(stuck.start_time.is_some());

        let running = catalog.job(&JobId::parse("running").unwrap()).unwrap();
        assert_eq!(running.status, JobStatus::InProgress);

        let announced = bus.emitted_of(event_type::JOB_CREATED);
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].job_id().unwrap().as_str(), "stuck");
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let reaper = Reaper::new(
            Arc::new(InMemoryCatalog::new()),
            Arc::new(InMemoryEventBus::default()),
            Duration::from_secs(60),
            Duration::from_millis(10),
        );

        tokio::time::timeout(
            Duration::from_secs(1),
            reaper.run(tokio::time::sleep(Duration::from_millis(50))),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_job_finishing_during_sweep_is_kept() {
        let catalog = InMemoryCatalog::new();
        let bus = InMemoryEventBus::default();
        let stuck = job("slow", JobStatus::InProgress, chrono::Duration::hours(30));
        catalog.insert_job(stuck.clone());
        catalog.set_latency(Duration::from_millis(100));

        let reaper = Reaper::new(
            Arc::new(catalog.clone()),
            Arc::new(bus.clone()),
            Duration::from_secs(24 * 60 * 60),
            Duration::from_secs(300),
        );

        // The sweep reads at ~100ms and writes at ~200ms; the job completes at ~150ms
        let finish = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut done = stuck.clone();
            done.status = JobStatus::Complete;
            done.error = None;
            catalog.update_job(&done).await.unwrap();
        };
        let (swept, ()) = tokio::join!(reaper.sweep(), finish);

        assert_eq!(swept.unwrap(), 0);
        assert_eq!(catalog.job(&stuck.id).unwrap().status, JobStatus::Complete);
        assert!(bus.emitted_of(event_type::JOB_CREATED).is_empty());
    }
}
