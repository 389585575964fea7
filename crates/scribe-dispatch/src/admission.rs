//! Joint admission under a worker-count ceiling and an optional aggregate
//! byte ceiling. Waiters park on a notify instead of polling; release always
//! happens through the permit's drop, so failure paths cannot leak a slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::inflight::{InFlightIndex, InsertOutcome};

pub const DEFAULT_COUNT_CEILING: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("record already in flight: {0}")]
    Duplicate(String),
}

pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    count_ceiling: AtomicUsize,
    byte_ceiling: Option<u64>,
    index: Arc<InFlightIndex>,
    released: Notify,
}

/// Scoped admission. Dropping the permit frees the count slot and the
/// in-flight entry and wakes byte-gate waiters.
pub struct Permit {
    controller: Arc<AdmissionController>,
    uri: String,
    _count: OwnedSemaphorePermit,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.controller.index.remove(&self.uri);
        self.controller.released.notify_waiters();
    }
}

impl AdmissionController {
    pub fn new(count_ceiling: usize, byte_ceiling: Option<u64>) -> Arc<Self> {
        let count_ceiling = count_ceiling.max(1);
        Arc::new(AdmissionController {
            semaphore: Arc::new(Semaphore::new(count_ceiling)),
            count_ceiling: AtomicUsize::new(count_ceiling),
            byte_ceiling,
            index: Arc::new(InFlightIndex::new()),
            released: Notify::new(),
        })
    }

    pub fn index(&self) -> &InFlightIndex {
        &self.index
    }

    pub fn count_ceiling(&self) -> usize {
        self.count_ceiling.load(Ordering::Relaxed)
    }

    /// Block until both ceilings admit the record, then enter it into the
    /// in-flight index atomically with admission.
    pub async fn acquire(
        self: &Arc<Self>,
        uri: &str,
        size: u64,
    ) -> Result<Permit, AdmissionError> {
        let count = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("admission semaphore closed");

        loop {
            match self.index.try_insert(uri, size, self.byte_ceiling) {
                InsertOutcome::Inserted => {
                    return Ok(Permit {
                        controller: self.clone(),
                        uri: uri.to_string(),
                        _count: count,
                    });
                }
                InsertOutcome::Duplicate => return Err(AdmissionError::Duplicate(uri.to_string())),
                InsertOutcome::OverCeiling => {
                    tracing::debug!(
                        uri,
                        size,
                        in_flight = self.index.total_bytes(),
                        "byte ceiling reached, waiting"
                    );
                    self.released.notified().await;
                }
            }
        }
    }

    /// Re-target the count ceiling, e.g. after a broker worker-count scrape.
    pub fn set_count_ceiling(self: &Arc<Self>, ceiling: usize) {
        let ceiling = ceiling.max(1);
        let previous = self.count_ceiling.swap(ceiling, Ordering::Relaxed);
        if ceiling > previous {
            self.semaphore.add_permits(ceiling - previous);
        } else if ceiling < previous {
            // Shrink by consuming permits as they free up.
            let semaphore = self.semaphore.clone();
            let shrink = previous - ceiling;
            tokio::spawn(async move {
                for _ in 0..shrink {
                    if let Ok(permit) = semaphore.clone().acquire_owned().await {
                        permit.forget();
                    }
                }
            });
        }
    }
}

/// Periodically re-read the broker's registered worker count for a queue and
/// retarget the admission ceiling. The first reading happens quickly; once a
/// value has been seen the cadence settles down.
pub fn spawn_worker_count_scraper(
    controller: Arc<AdmissionController>,
    host: String,
    port: u16,
    function: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut loaded = false;
        loop {
            tokio::time::sleep(Duration::from_secs(if loaded { 300 } else { 15 })).await;
            match scribe_broker::admin::worker_count(&host, port, &function).await {
                Ok(Some(workers)) if workers > 0 => {
                    loaded = true;
                    if workers as usize != controller.count_ceiling() {
                        tracing::info!(%function, workers, "retargeting admission ceiling");
                        controller.set_count_ceiling(workers as usize);
                    }
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(%err, "cannot read broker worker count"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn count_ceiling_bounds_concurrency() {
        let controller = AdmissionController::new(2, None);
        let first = controller.acquire("u1", 0).await.unwrap();
        let _second = controller.acquire("u2", 0).await.unwrap();
        assert_eq!(controller.index().len(), 2);

        let waiting = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.acquire("u3", 0).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(first);
        let third = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("third acquire should proceed after release")
            .unwrap();
        assert_eq!(controller.index().len(), 2);
        drop(third);
    }

    #[tokio::test]
    async fn byte_ceiling_serializes_large_records() {
        let controller = AdmissionController::new(8, Some(10 * 1024 * 1024));
        let first = controller.acquire("http://h/1.wav", 7 * 1024 * 1024).await.unwrap();

        let waiting = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .acquire("http://h/2.wav", 7 * 1024 * 1024)
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished(), "second record must wait for bytes");

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("second record admitted after release")
            .unwrap();
        assert_eq!(controller.index().total_bytes(), 7 * 1024 * 1024);
        drop(second);
        assert_eq!(controller.index().total_bytes(), 0);
    }

    #[tokio::test]
    async fn duplicate_uri_is_rejected() {
        let controller = AdmissionController::new(4, None);
        let _held = controller.acquire("file:///a.wav", 1).await.unwrap();
        assert!(matches!(
            controller.acquire("file:///a.wav", 1).await,
            Err(AdmissionError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn permits_release_on_drop_even_without_success() {
        let controller = AdmissionController::new(1, None);
        {
            let _permit = controller.acquire("a", 0).await.unwrap();
            // Simulated task failure: permit dropped without any completion.
        }
        assert!(controller.index().is_empty());
        let _again = controller.acquire("a", 0).await.unwrap();
    }
}
