//! Self-healing sweeper.
//!
//! A periodic task that (1) fails jobs stuck in `running` past their
//! timeout and (2) re-queues stalled jobs that still have attempts
//! remaining. The two passes are separate statements on disjoint status
//! predicates; they are intentionally not one transaction. A distributed
//! mutex keeps the sweep single-flight across control-plane replicas: when
//! the lock is busy the tick is skipped, not queued.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use jobrelay_events::{EngineEvent, EventSink};

use crate::mutex::DistributedMutex;
use crate::store::{JobStore, StoreError};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
pub const SWEEP_LOCK_NAME: &str = "jobrelay.sweeper";

/// What one sweep did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub stalled: usize,
    pub recovered: usize,
    /// Another replica held the lock; nothing was swept.
    pub skipped: bool,
}

/// Periodic stall-detection task. Owns its lifecycle: [`Sweeper::spawn`]
/// starts it, the returned handle stops it. No ambient global state.
pub struct Sweeper {
    store: Arc<dyn JobStore>,
    mutex: Arc<dyn DistributedMutex>,
    sink: EventSink,
    interval: Duration,
}

/// Handle to a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Request graceful shutdown and wait for the task to stop.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn JobStore>,
        mutex: Arc<dyn DistributedMutex>,
        sink: EventSink,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            mutex,
            sink,
            interval,
        }
    }

    /// Run one sweep immediately (also used by tests).
    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        let guard = match self.mutex.try_acquire(SWEEP_LOCK_NAME).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!("sweep lock busy; skipping tick");
                return Ok(SweepReport {
                    skipped: true,
                    ..SweepReport::default()
                });
            }
            Err(err) => {
                warn!(error = %err, "failed to acquire sweep lock");
                return Ok(SweepReport {
                    skipped: true,
                    ..SweepReport::default()
                });
            }
        };

        let stalled = self.store.fail_stalled(Utc::now()).await?;
        for job in &stalled {
            self.sink
                .emit(EngineEvent::JobStalled {
                    owner: job.owner.clone(),
                    job_id: job.id.clone(),
                    occurred_at: Utc::now(),
                })
                .await;
        }

        let recovered = self.store.recover_retryable().await?;
        for job in &recovered {
            self.sink
                .emit(EngineEvent::JobRecovered {
                    owner: job.owner.clone(),
                    job_id: job.id.clone(),
                    remaining_attempts: job.remaining_attempts,
                    occurred_at: Utc::now(),
                })
                .await;
        }

        drop(guard);

        if !stalled.is_empty() || !recovered.is_empty() {
            info!(
                stalled = stalled.len(),
                recovered = recovered.len(),
                "sweep completed"
            );
        }

        Ok(SweepReport {
            stalled: stalled.len(),
            recovered: recovered.len(),
            skipped: false,
        })
    }

    /// Start the periodic task.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "sweeper started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_once().await {
                            warn!(error = %err, "sweep failed");
                        }
                    }
                }
            }

            info!("sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use jobrelay_events::InMemoryEventBus;

    use super::*;
    use crate::mutex::{LocalMutex, MutexError, MutexGuard};
    use crate::store::{InMemoryJobStore, JobStore, NewJob};
    use jobrelay_core::{JobId, JobStatus, MachineId, OwnerHash};

    fn sink() -> EventSink {
        EventSink::new(Arc::new(InMemoryEventBus::new()))
    }

    async fn seed_running_job(
        store: &InMemoryJobStore,
        timeout_seconds: i64,
        remaining_attempts: i32,
    ) -> JobId {
        let owner = OwnerHash::new("o1");
        let job = store
            .insert(NewJob {
                id: JobId::generate(),
                owner: owner.clone(),
                service: "svc".to_string(),
                target_fn: "run".to_string(),
                target_args: serde_json::json!({}),
                idempotency_key: None,
                cache_key: None,
                remaining_attempts,
                timeout_seconds: Some(timeout_seconds),
            })
            .await
            .unwrap();
        store
            .claim(&owner, "svc", &MachineId::new("m1"), 1)
            .await
            .unwrap();
        job.id
    }

    #[tokio::test]
    async fn sweep_fails_and_recovers_in_one_tick() {
        let store = InMemoryJobStore::arc();
        let job_id = seed_running_job(&store, 0, 2).await;

        // timeout_seconds = 0 makes the job stalled on the next sweep.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sweeper = Sweeper::new(
            store.clone(),
            Arc::new(LocalMutex::new()),
            sink(),
            DEFAULT_SWEEP_INTERVAL,
        );
        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.stalled, 1);
        assert_eq!(report.recovered, 1);
        assert!(!report.skipped);

        let job = store
            .get(&OwnerHash::new("o1"), &job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.remaining_attempts, 1);
    }

    #[tokio::test]
    async fn busy_lock_skips_the_tick() {
        let store = InMemoryJobStore::arc();
        seed_running_job(&store, 0, 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mutex = LocalMutex::new();
        let _held = mutex.try_acquire(SWEEP_LOCK_NAME).await.unwrap();

        let sweeper = Sweeper::new(
            store.clone(),
            Arc::new(mutex.clone()),
            sink(),
            DEFAULT_SWEEP_INTERVAL,
        );
        let report = sweeper.run_once().await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.stalled, 0);
    }

    #[tokio::test]
    async fn lock_errors_degrade_to_a_skip() {
        struct BrokenMutex;

        #[async_trait]
        impl DistributedMutex for BrokenMutex {
            async fn try_acquire(&self, _name: &str) -> Result<Option<MutexGuard>, MutexError> {
                Err(MutexError("backend down".to_string()))
            }
        }

        let sweeper = Sweeper::new(
            InMemoryJobStore::arc(),
            Arc::new(BrokenMutex),
            sink(),
            DEFAULT_SWEEP_INTERVAL,
        );
        let report = sweeper.run_once().await.unwrap();
        assert!(report.skipped);
    }

    #[tokio::test]
    async fn spawn_and_shutdown() {
        let store = InMemoryJobStore::arc();
        let job_id = seed_running_job(&store, 0, 1).await;

        let sweeper = Sweeper::new(
            store.clone(),
            Arc::new(LocalMutex::new()),
            sink(),
            Duration::from_millis(10),
        );
        let handle = sweeper.spawn();

        // Give the task a few ticks, then stop it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        // The background ticks stalled and then recovered the job.
        let job = store
            .get(&OwnerHash::new("o1"), &job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.remaining_attempts, 0);
    }

    #[tokio::test]
    async fn exhausted_attempts_are_left_stalled() {
        let store = InMemoryJobStore::arc();
        let job_id = seed_running_job(&store, 0, 0).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sweeper = Sweeper::new(
            store.clone(),
            Arc::new(LocalMutex::new()),
            sink(),
            DEFAULT_SWEEP_INTERVAL,
        );
        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.stalled, 1);
        assert_eq!(report.recovered, 0);

        let job = store
            .get(&OwnerHash::new("o1"), &job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Stalled);
        assert_eq!(job.remaining_attempts, 0);

        // Subsequent sweeps never touch it again.
        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.stalled, 0);
        assert_eq!(report.recovered, 0);
    }
}
