//! Long-poll dequeue.
//!
//! The claim itself is one atomic statement in the store; this module owns
//! the bounded retry loop around it. An empty claim sleeps and retries until
//! the request's `ttl` elapses, converting "no work available" into a
//! bounded wait instead of an immediate empty response — that is the
//! system's backpressure mechanism. The per-iteration nap is 100ms while the
//! owner is hot (job activity within the last minute) and 1s otherwise.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use jobrelay_core::{Job, MachineId, OwnerHash};
use jobrelay_events::{EngineEvent, EventSink};

use crate::EngineError;
use crate::store::JobStore;

pub const HOT_OWNER_WINDOW: Duration = Duration::from_secs(60);
const HOT_NAP: Duration = Duration::from_millis(100);
const COLD_NAP: Duration = Duration::from_millis(1000);

/// One worker's dequeue request.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub service: String,
    pub limit: i64,
    pub machine: MachineId,
    pub ip: String,
    /// Hard deadline for the long poll; an empty result is returned once it
    /// elapses.
    pub ttl: Duration,
}

pub(crate) async fn next_jobs(
    store: &Arc<dyn JobStore>,
    sink: &EventSink,
    owner: &OwnerHash,
    request: ClaimRequest,
) -> Result<Vec<Job>, EngineError> {
    if request.limit <= 0 {
        return Err(EngineError::Validation("limit must be positive".into()));
    }

    let deadline = Instant::now() + request.ttl;

    loop {
        // Heartbeat rides alongside the claim; it is best-effort and not
        // part of the claim's atomicity.
        let (claimed, heartbeat) = tokio::join!(
            store.claim(owner, &request.service, &request.machine, request.limit),
            store.upsert_heartbeat(owner, &request.machine, &request.ip, Utc::now()),
        );
        if let Err(err) = heartbeat {
            warn!(machine = %request.machine, error = %err, "heartbeat upsert failed");
        }

        let claimed = claimed?;
        if !claimed.is_empty() {
            debug!(
                owner = %owner,
                service = %request.service,
                machine = %request.machine,
                count = claimed.len(),
                "claimed jobs"
            );
            for job in &claimed {
                sink.emit(EngineEvent::JobReceived {
                    owner: owner.clone(),
                    job_id: job.id.clone(),
                    machine: request.machine.clone(),
                    occurred_at: Utc::now(),
                })
                .await;
            }
            return Ok(claimed);
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(Vec::new());
        }

        let hot = store
            .owner_is_hot(owner, HOT_OWNER_WINDOW)
            .await
            .unwrap_or(false);
        let nap = if hot { HOT_NAP } else { COLD_NAP };
        tokio::time::sleep(nap.min(deadline - now)).await;
    }
}
