//! Cross-process named mutex.
//!
//! Non-blocking try-acquire semantics: a call either yields a guard whose
//! drop releases the lock, or reports that someone else holds it. Used
//! exclusively to keep the sweeper single-flight across control-plane
//! replicas; the request-serving path relies on row-level atomicity instead.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::warn;

/// Error acquiring or releasing a named lock.
#[derive(Debug, Clone, thiserror::Error)]
#[error("mutex error: {0}")]
pub struct MutexError(pub String);

/// Held lock; releases on drop.
pub struct MutexGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl MutexGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl core::fmt::Debug for MutexGuard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MutexGuard").finish_non_exhaustive()
    }
}

/// Named, non-blocking cross-process lock.
#[async_trait]
pub trait DistributedMutex: Send + Sync {
    /// `Ok(Some(guard))` when acquired, `Ok(None)` when another holder has
    /// the name.
    async fn try_acquire(&self, name: &str) -> Result<Option<MutexGuard>, MutexError>;
}

/// Postgres advisory-lock mutex.
///
/// Advisory locks are session-scoped, so the guard pins a pooled connection
/// for the lock's lifetime and unlocks on that same connection before
/// returning it to the pool.
#[derive(Debug, Clone)]
pub struct PgAdvisoryMutex {
    pool: Arc<PgPool>,
}

impl PgAdvisoryMutex {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributedMutex for PgAdvisoryMutex {
    async fn try_acquire(&self, name: &str) -> Result<Option<MutexGuard>, MutexError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| MutexError(format!("acquire connection: {e}")))?;

        let row = sqlx::query("SELECT pg_try_advisory_lock(hashtextextended($1, 0)) AS locked")
            .bind(name)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| MutexError(format!("pg_try_advisory_lock: {e}")))?;

        let locked: bool = row
            .try_get("locked")
            .map_err(|e| MutexError(format!("pg_try_advisory_lock: {e}")))?;

        if !locked {
            return Ok(None);
        }

        let name = name.to_string();
        Ok(Some(MutexGuard::new(move || {
            tokio::spawn(async move {
                let mut conn = conn;
                let released = sqlx::query("SELECT pg_advisory_unlock(hashtextextended($1, 0))")
                    .bind(&name)
                    .execute(&mut *conn)
                    .await;
                if let Err(e) = released {
                    warn!(lock = %name, error = %e, "failed to release advisory lock");
                }
            });
        })))
    }
}

/// Process-local mutex for tests/dev.
#[derive(Debug, Default, Clone)]
pub struct LocalMutex {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LocalMutex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedMutex for LocalMutex {
    async fn try_acquire(&self, name: &str) -> Result<Option<MutexGuard>, MutexError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| MutexError("lock table poisoned".to_string()))?;

        if !held.insert(name.to_string()) {
            return Ok(None);
        }
        drop(held);

        let table = self.held.clone();
        let name = name.to_string();
        Ok(Some(MutexGuard::new(move || {
            if let Ok(mut held) = table.lock() {
                held.remove(&name);
            }
        })))
    }
}
