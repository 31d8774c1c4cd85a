//! `jobrelay-events` — observability events emitted by the job engine.
//!
//! Events here are a write-only side channel toward downstream consumers
//! (metrics aggregation, the deployment scheduler). They are best-effort by
//! design: losing one never blocks or fails the job lifecycle.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod sink;

pub use bus::{EventBus, PublishError, Subscription};
pub use event::EngineEvent;
pub use in_memory_bus::InMemoryEventBus;
pub use sink::EventSink;
