//! Bounded worker pool
//!
//! At most `capacity` jobs run at once. The dispatch loop waits for a
//! permit before spawning, which is what applies back-pressure to the bus.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

/// A reserved slot, returned to the pool when the spawned job ends
pub struct Slot {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of slots held at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Waits for a free slot
    pub async fn acquire(&self) -> Slot {
        // The semaphore is never closed
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("worker pool semaphore closed"),
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        Slot {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Runs `job` on its own task, holding `slot` until it finishes
    pub fn spawn<F>(&self, slot: Slot, job: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(async move {
            let output = job.await;
            drop(slot);
            output
        })
    }

    /// Waits until every slot is free
    pub async fn wait_idle(&self) {
        let all = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        if let Ok(permits) = self.semaphore.acquire_many(all).await {
            drop(permits);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bound_is_respected() {
        let pool = WorkerPool::new(3);
        let mut handles = Vec::new();

        for _ in 0..10 {
            let slot = pool.acquire().await;
            assert!(pool.in_flight() <= 3);
            handles.push(pool.spawn(slot, async {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(pool.peak(), 3);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_slot_released_on_panic() {
        let pool = WorkerPool::new(1);
        let slot = pool.acquire().await;
        let handle = pool.spawn(slot, async { panic!("job blew up") });
        assert!(handle.await.is_err());

        assert_eq!(pool.in_flight(), 0);
        let _slot = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let pool = WorkerPool::new(2);
        let slot = pool.acquire().await;
        pool.spawn(slot, async {
            tokio::time::sleep(Duration::from_millis(30)).await;
        });

        pool.wait_idle().await;
        assert_eq!(pool.in_flight(), 0);
    }
}
