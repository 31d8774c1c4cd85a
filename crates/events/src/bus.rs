//! Event publishing/subscription abstraction (mechanics only).
//!
//! Transport-agnostic pub/sub with broadcast semantics and at-least-once
//! delivery; consumers must be idempotent. The bus is for distribution, not
//! storage — the job store remains the source of truth.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use thiserror::Error;

/// Failure to hand a message to the transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

/// A subscription to an event stream. Each subscription gets a copy of every
/// published message.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<M> {
        let mut out = Vec::new();
        while let Ok(m) = self.try_recv() {
            out.push(m);
        }
        out
    }
}

/// Pub/sub transport for engine events.
pub trait EventBus<M>: Send + Sync {
    fn publish(&self, message: M) -> Result<(), PublishError>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    fn publish(&self, message: M) -> Result<(), PublishError> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
