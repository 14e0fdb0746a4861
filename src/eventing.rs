//! Lifecycle event bus: abstract contract plus the built-in backends
//!
//! Start/stop events are transported at-least-once; every consumer must be
//! idempotent. Two backends ship with the gateway, selected once at startup
//! by configuration: a no-op bus for degenerate single-replica deployments
//! (the proxy then dispatches to the provisioner handler in-task) and an
//! in-process broadcast bus. Networked transports implement the same trait
//! externally.

use crate::domain::LifecycleEvent;
use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

pub type EventStream = Pin<Box<dyn Stream<Item = LifecycleEvent> + Send>>;

#[derive(Debug, Error)]
pub enum EventingError {
    #[error("event transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Eventing: Send + Sync {
    async fn publish(&self, event: LifecycleEvent) -> Result<(), EventingError>;
    fn subscribe(&self) -> EventStream;
    /// Whether published events reach a consumer. A bus that answers false
    /// makes publishers responsible for dispatching the work themselves.
    fn delivers(&self) -> bool;
}

/// Bus that drops every event
pub struct NoopEventing;

#[async_trait]
impl Eventing for NoopEventing {
    async fn publish(&self, event: LifecycleEvent) -> Result<(), EventingError> {
        debug!(event_id = %event.id, exhibit_id = %event.data.exhibit_id, "Dropping event (no-op bus)");
        Ok(())
    }

    fn subscribe(&self) -> EventStream {
        Box::pin(stream::pending())
    }

    fn delivers(&self) -> bool {
        false
    }
}

/// In-process broadcast bus
pub struct ChannelEventing {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl ChannelEventing {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

#[async_trait]
impl Eventing for ChannelEventing {
    async fn publish(&self, event: LifecycleEvent) -> Result<(), EventingError> {
        // send fails only when no subscriber exists; the event is simply lost
        // then, same as an expired topic message
        if self.tx.send(event).is_err() {
            debug!("Published event had no subscribers");
        }
        Ok(())
    }

    fn subscribe(&self) -> EventStream {
        let rx = self.tx.subscribe();
        Box::pin(stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    // a lagged consumer skips to the oldest retained event
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }))
    }

    fn delivers(&self) -> bool {
        true
    }
}
