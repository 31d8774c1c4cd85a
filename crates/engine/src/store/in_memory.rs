//! In-memory job store for tests/dev.
//!
//! Single-process stand-in for the Postgres store. Atomicity comes from one
//! `RwLock` around the whole table; the claim path selects and mutates under
//! the write lock, which gives the same mutual exclusion the row-level
//! locking gives in Postgres.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobrelay_core::{Job, JobId, JobStatus, MachineId, OwnerHash, ResultKind};

use super::{IdempotentInsert, JobStore, NewJob, ResultUpdate, StoreError};

#[derive(Debug, Clone)]
struct HeartbeatRow {
    ip: String,
    last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<(OwnerHash, JobId), Job>,
    heartbeats: HashMap<(OwnerHash, MachineId), HeartbeatRow>,
}

/// In-memory job store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn materialize(new: NewJob, now: DateTime<Utc>) -> Job {
        Job {
            id: new.id,
            owner: new.owner,
            service: new.service,
            target_fn: new.target_fn,
            target_args: new.target_args,
            idempotency_key: new.idempotency_key,
            cache_key: new.cache_key,
            status: JobStatus::Pending,
            result: None,
            result_kind: None,
            remaining_attempts: new.remaining_attempts,
            timeout_seconds: new.timeout_seconds,
            executing_machine: None,
            last_retrieved_at: None,
            created_at: now,
            updated_at: now,
            resulted_at: None,
            function_execution_ms: None,
            predicted_retryable: None,
            predicted_retryable_reason: None,
        }
    }

    fn lock_poisoned() -> StoreError {
        StoreError::Storage("job table lock poisoned".to_string())
    }

    /// Heartbeat row for a machine, if any (test helper).
    pub fn heartbeat(&self, owner: &OwnerHash, machine: &MachineId) -> Option<(String, DateTime<Utc>)> {
        let tables = self.tables.read().ok()?;
        tables
            .heartbeats
            .get(&(owner.clone(), machine.clone()))
            .map(|h| (h.ip.clone(), h.last_seen_at))
    }

    /// Number of rows for an owner (test helper).
    pub fn row_count(&self, owner: &OwnerHash) -> usize {
        self.tables
            .read()
            .map(|t| t.jobs.keys().filter(|(o, _)| o == owner).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, new: NewJob) -> Result<Job, StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::lock_poisoned())?;
        let key = (new.owner.clone(), new.id.clone());
        if tables.jobs.contains_key(&key) {
            return Err(StoreError::AlreadyExists(new.id));
        }
        let job = Self::materialize(new, Utc::now());
        tables.jobs.insert(key, job.clone());
        Ok(job)
    }

    async fn insert_idempotent(&self, new: NewJob) -> Result<IdempotentInsert, StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::lock_poisoned())?;
        let key = (new.owner.clone(), new.id.clone());
        if tables.jobs.contains_key(&key) {
            return Ok(IdempotentInsert::Existing(new.id));
        }
        let job = Self::materialize(new, Utc::now());
        tables.jobs.insert(key, job.clone());
        Ok(IdempotentInsert::Created(job))
    }

    async fn find_cached(
        &self,
        owner: &OwnerHash,
        service: &str,
        target_fn: &str,
        cache_key: &str,
        ttl: Duration,
    ) -> Result<Option<JobId>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::lock_poisoned())?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());

        let hit = tables
            .jobs
            .values()
            .filter(|j| {
                j.owner == *owner
                    && j.service == service
                    && j.target_fn == target_fn
                    && j.cache_key.as_deref() == Some(cache_key)
                    && j.status == JobStatus::Terminal
                    && j.result_kind == Some(ResultKind::Resolution)
                    && j.resulted_at.is_some_and(|t| t > cutoff)
            })
            .max_by_key(|j| j.resulted_at);

        Ok(hit.map(|j| j.id.clone()))
    }

    async fn claim(
        &self,
        owner: &OwnerHash,
        service: &str,
        machine: &MachineId,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::lock_poisoned())?;
        let now = Utc::now();

        let keys: Vec<(OwnerHash, JobId)> = tables
            .jobs
            .values()
            .filter(|j| j.owner == *owner && j.service == service && j.status == JobStatus::Pending)
            .take(limit.max(0) as usize)
            .map(|j| (j.owner.clone(), j.id.clone()))
            .collect();

        let mut claimed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(job) = tables.jobs.get_mut(&key) {
                job.status = JobStatus::Running;
                job.executing_machine = Some(machine.clone());
                job.last_retrieved_at = Some(now);
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn record_result(
        &self,
        owner: &OwnerHash,
        update: ResultUpdate,
    ) -> Result<Option<Job>, StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::lock_poisoned())?;
        let now = Utc::now();

        let key = (owner.clone(), update.job_id.clone());
        let Some(job) = tables.jobs.get_mut(&key) else {
            return Ok(None);
        };

        job.result = Some(update.result);
        job.result_kind = Some(update.result_kind);
        job.function_execution_ms = update.function_execution_ms;
        job.predicted_retryable = update.predicted_retryable;
        job.predicted_retryable_reason = update.predicted_retryable_reason;
        job.executing_machine = Some(update.machine);
        job.resulted_at = Some(now);
        job.updated_at = now;
        if update.requeue {
            job.status = JobStatus::Pending;
            job.remaining_attempts = (job.remaining_attempts - 1).max(0);
        } else {
            job.status = JobStatus::Terminal;
        }

        Ok(Some(job.clone()))
    }

    async fn get(&self, owner: &OwnerHash, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::lock_poisoned())?;
        Ok(tables.jobs.get(&(owner.clone(), job_id.clone())).cloned())
    }

    async fn fail_stalled(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::lock_poisoned())?;
        let mut affected = Vec::new();
        for job in tables.jobs.values_mut() {
            if job.is_stalled_at(now) {
                job.status = JobStatus::Stalled;
                job.updated_at = now;
                affected.push(job.clone());
            }
        }
        Ok(affected)
    }

    async fn recover_retryable(&self) -> Result<Vec<Job>, StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::lock_poisoned())?;
        let now = Utc::now();
        let mut affected = Vec::new();
        for job in tables.jobs.values_mut() {
            if job.is_recoverable() {
                job.status = JobStatus::Pending;
                job.remaining_attempts -= 1;
                job.executing_machine = None;
                job.last_retrieved_at = None;
                job.updated_at = now;
                affected.push(job.clone());
            }
        }
        Ok(affected)
    }

    async fn upsert_heartbeat(
        &self,
        owner: &OwnerHash,
        machine: &MachineId,
        ip: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::lock_poisoned())?;
        tables.heartbeats.insert(
            (owner.clone(), machine.clone()),
            HeartbeatRow {
                ip: ip.to_string(),
                last_seen_at: seen_at,
            },
        );
        Ok(())
    }

    async fn owner_is_hot(
        &self,
        owner: &OwnerHash,
        window: Duration,
    ) -> Result<bool, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::lock_poisoned())?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        Ok(tables
            .jobs
            .values()
            .any(|j| j.owner == *owner && j.updated_at > cutoff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(owner: &str, service: &str) -> NewJob {
        NewJob {
            id: JobId::generate(),
            owner: OwnerHash::new(owner),
            service: service.to_string(),
            target_fn: "run".to_string(),
            target_args: serde_json::json!({}),
            idempotency_key: None,
            cache_key: None,
            remaining_attempts: 1,
            timeout_seconds: None,
        }
    }

    #[tokio::test]
    async fn insert_and_claim() {
        let store = InMemoryJobStore::new();
        let owner = OwnerHash::new("o1");
        let inserted = store.insert(new_job("o1", "svc")).await.unwrap();

        let claimed = store
            .claim(&owner, "svc", &MachineId::new("m1"), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, inserted.id);
        assert_eq!(claimed[0].status, JobStatus::Running);
        assert_eq!(claimed[0].executing_machine, Some(MachineId::new("m1")));
        assert!(claimed[0].last_retrieved_at.is_some());

        // Already running; nothing left to claim.
        let again = store
            .claim(&owner, "svc", &MachineId::new("m2"), 10)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn claim_respects_limit_and_service() {
        let store = InMemoryJobStore::new();
        let owner = OwnerHash::new("o1");
        for _ in 0..3 {
            store.insert(new_job("o1", "svc-a")).await.unwrap();
        }
        store.insert(new_job("o1", "svc-b")).await.unwrap();

        let claimed = store
            .claim(&owner, "svc-a", &MachineId::new("m1"), 2)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|j| j.service == "svc-a"));
    }

    #[tokio::test]
    async fn result_update_is_owner_scoped() {
        let store = InMemoryJobStore::new();
        let job = store.insert(new_job("o1", "svc")).await.unwrap();

        let update = ResultUpdate {
            job_id: job.id.clone(),
            machine: MachineId::new("m1"),
            result: serde_json::json!({"ok": true}),
            result_kind: ResultKind::Resolution,
            function_execution_ms: Some(12),
            predicted_retryable: None,
            predicted_retryable_reason: None,
            requeue: false,
        };

        let miss = store
            .record_result(&OwnerHash::new("other"), update.clone())
            .await
            .unwrap();
        assert!(miss.is_none());

        let hit = store
            .record_result(&OwnerHash::new("o1"), update)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.status, JobStatus::Terminal);
        assert!(hit.resulted_at.is_some());
    }

    #[tokio::test]
    async fn heartbeat_upsert_overwrites() {
        let store = InMemoryJobStore::new();
        let owner = OwnerHash::new("o1");
        let machine = MachineId::new("m1");

        let t1 = Utc::now();
        store
            .upsert_heartbeat(&owner, &machine, "10.0.0.1", t1)
            .await
            .unwrap();
        let t2 = Utc::now();
        store
            .upsert_heartbeat(&owner, &machine, "10.0.0.2", t2)
            .await
            .unwrap();

        let (ip, seen) = store.heartbeat(&owner, &machine).unwrap();
        assert_eq!(ip, "10.0.0.2");
        assert_eq!(seen, t2);
    }

    #[tokio::test]
    async fn owner_heat_tracks_recent_activity() {
        let store = InMemoryJobStore::new();
        let owner = OwnerHash::new("o1");
        assert!(
            !store
                .owner_is_hot(&owner, Duration::from_secs(60))
                .await
                .unwrap()
        );

        store.insert(new_job("o1", "svc")).await.unwrap();
        assert!(
            store
                .owner_is_hot(&owner, Duration::from_secs(60))
                .await
                .unwrap()
        );
    }
}
