//! Lifecycle event handling: dispatches start/stop events to the provisioner

use crate::domain::{EventKind, LifecycleEvent};
use crate::eventing::Eventing;
use crate::exhibit::{ExhibitError, ExhibitService};
use crate::provisioner::{ApplicationProvisioner, ProvisionError};
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Exhibit(#[from] ExhibitError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

/// Consumes lifecycle events and drives the provisioner.
///
/// Events arrive at-least-once: a duplicate start observes an
/// already-Running record inside the provisioner and performs no new side
/// effects. Provisioning failures propagate to the caller so event ingestion
/// can report them instead of acknowledging blindly.
pub struct ProvisionerHandler {
    exhibits: Arc<ExhibitService>,
    provisioner: Arc<ApplicationProvisioner>,
}

impl ProvisionerHandler {
    pub fn new(exhibits: Arc<ExhibitService>, provisioner: Arc<ApplicationProvisioner>) -> Self {
        Self {
            exhibits,
            provisioner,
        }
    }

    pub async fn handle(&self, event: &LifecycleEvent) -> Result<(), HandlerError> {
        let exhibit_id = &event.data.exhibit_id;
        debug!(
            event_id = %event.id,
            kind = ?event.kind,
            exhibit_id,
            correlation_id = event.correlation_id.as_deref().unwrap_or(""),
            "Handling lifecycle event"
        );

        let exhibit = self.exhibits.get(exhibit_id).await?;
        match event.kind {
            EventKind::Start => self.provisioner.start(&exhibit).await?,
            EventKind::Stop => self.provisioner.stop(&exhibit.id).await?,
        }
        Ok(())
    }
}

/// Drain the event bus subscription on a background task, feeding the
/// handler. Per-event failures are logged; the consumer keeps running.
pub fn spawn_event_consumer(
    eventing: Arc<dyn Eventing>,
    handler: Arc<ProvisionerHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    // subscribe before the task is scheduled so no early publish is lost
    let mut stream = eventing.subscribe();
    tokio::spawn(async move {
        info!("Event consumer started");

        loop {
            tokio::select! {
                event = stream.next() => {
                    match event {
                        Some(event) => {
                            if let Err(e) = handler.handle(&event).await {
                                error!(
                                    event_id = %event.id,
                                    exhibit_id = %event.data.exhibit_id,
                                    error = %e,
                                    "Failed to handle lifecycle event"
                                );
                            }
                        }
                        None => {
                            info!("Event stream closed, consumer exiting");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Event consumer shutting down");
                        break;
                    }
                }
            }
        }
    })
}
