//! Best-effort event sink.
//!
//! The engine pushes lifecycle events through this sink toward the metrics
//! aggregation side channel. A publish that keeps failing is retried with
//! linear backoff and then dropped — observability never blocks a job
//! state change.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::bus::EventBus;
use crate::event::EngineEvent;

const ATTEMPTS: u32 = 3;
const BACKOFF_STEP: Duration = Duration::from_millis(50);

/// Cloneable handle wrapping a bus with the retry-then-drop policy.
#[derive(Clone)]
pub struct EventSink {
    bus: Arc<dyn EventBus<EngineEvent>>,
}

impl EventSink {
    pub fn new(bus: Arc<dyn EventBus<EngineEvent>>) -> Self {
        Self { bus }
    }

    /// Publish `event`, retrying up to 3 times with linear backoff.
    ///
    /// Never returns an error: a final failure is logged and the event is
    /// dropped.
    pub async fn emit(&self, event: EngineEvent) {
        let mut last_err = None;
        for attempt in 1..=ATTEMPTS {
            match self.bus.publish(event.clone()) {
                Ok(()) => return,
                Err(err) => {
                    last_err = Some(err);
                    if attempt < ATTEMPTS {
                        tokio::time::sleep(BACKOFF_STEP * attempt).await;
                    }
                }
            }
        }

        warn!(
            event_type = event.event_type(),
            job_id = %event.job_id(),
            error = ?last_err,
            "dropping engine event after retries"
        );
    }
}

impl core::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;
    use jobrelay_core::{JobId, OwnerHash};

    use super::*;
    use crate::bus::{PublishError, Subscription};
    use crate::in_memory_bus::InMemoryEventBus;

    fn test_event() -> EngineEvent {
        EngineEvent::JobCreated {
            owner: OwnerHash::new("o"),
            job_id: JobId::from_key("j"),
            service: "svc".to_string(),
            target_fn: "f".to_string(),
            occurred_at: Utc::now(),
        }
    }

    /// Fails the first `failures` publishes, then succeeds.
    struct FlakyBus {
        inner: InMemoryEventBus<EngineEvent>,
        failures: AtomicU32,
    }

    impl EventBus<EngineEvent> for FlakyBus {
        fn publish(&self, message: EngineEvent) -> Result<(), PublishError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PublishError("transport down".to_string()));
            }
            self.inner.publish(message)
        }

        fn subscribe(&self) -> Subscription<EngineEvent> {
            self.inner.subscribe()
        }
    }

    #[tokio::test]
    async fn emit_retries_transient_failures() {
        let bus = Arc::new(FlakyBus {
            inner: InMemoryEventBus::new(),
            failures: AtomicU32::new(2),
        });
        let sub = bus.subscribe();

        EventSink::new(bus).emit(test_event()).await;

        assert_eq!(sub.drain().len(), 1);
    }

    #[tokio::test]
    async fn emit_drops_after_exhausting_retries() {
        let bus = Arc::new(FlakyBus {
            inner: InMemoryEventBus::new(),
            failures: AtomicU32::new(10),
        });
        let sub = bus.subscribe();

        // Must complete without error even though every attempt failed.
        EventSink::new(bus).emit(test_event()).await;

        assert!(sub.drain().is_empty());
    }
}
