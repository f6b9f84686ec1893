//! Host availability gate.
//!
//! A fleet may only run while its host is `busy`, and only one fleet may take
//! a host from `available` to `busy`. Blocking statuses set by an operator or
//! a balancer are never overwritten here.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::error::Result;
use crate::model::{Host, HostStatus, Stage};
use crate::store::HostStore;
use crate::telemetry::metrics;

pub struct HostGate<S: ?Sized> {
    store: Arc<S>,
    host: Host,
}

impl<S: HostStore + ?Sized> HostGate<S> {
    /// Mark the host busy. `None` when it is busy already or blocked.
    ///
    /// A host seen for the first time is registered as busy.
    pub async fn acquire(store: Arc<S>, stage: Stage, name: &str) -> Result<Option<Self>> {
        let host = match store.find_host(stage, name).await? {
            None => {
                info!(host = name, %stage, "registering new host");
                store.register_host(stage, name, HostStatus::Busy).await?
            }
            Some(host) if host.status.is_blocking() => {
                warn!(host = name, status = %host.status, "host is blocked, refusing to run");
                return Ok(None);
            }
            Some(host) => {
                if !store
                    .transition_host(host.id, HostStatus::Available, HostStatus::Busy)
                    .await?
                {
                    info!(host = name, "host is busy, refusing to run");
                    return Ok(None);
                }
                metrics::host_status_changes().add(
                    1,
                    &[
                        KeyValue::new("stage", stage.as_str()),
                        KeyValue::new("to", "busy"),
                    ],
                );
                Host {
                    status: HostStatus::Busy,
                    ..host
                }
            }
        };
        Ok(Some(Self { store, host }))
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Whether workers may start another batch.
    pub async fn permits_work(&self) -> Result<bool> {
        let current = self.store.host(self.host.id).await?;
        if current.status.is_blocking() {
            info!(host = %self.host.name, status = %current.status, "asked to quit by host");
            return Ok(false);
        }
        Ok(true)
    }

    /// Hand the host back. A blocking status set meanwhile stays in place.
    pub async fn release(&self) -> Result<()> {
        if self
            .store
            .set_host_status(self.host.id, HostStatus::Available)
            .await?
        {
            metrics::host_status_changes().add(
                1,
                &[
                    KeyValue::new("stage", self.host.stage.as_str()),
                    KeyValue::new("to", "available"),
                ],
            );
        }
        Ok(())
    }
}
