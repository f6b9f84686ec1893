//! Send balancer: assigns queued deliveries to send hosts by leveling their
//! backlog depths.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use super::{BalanceReport, RunLock, RunOutcome, compute_allotments, lock_holder};
use crate::error::{Error, Result};
use crate::model::{Host, HostStatus, Stage};
use crate::store::Store;
use crate::telemetry::{metrics, work};

pub struct SendBalancer<S: ?Sized> {
    store: Arc<S>,
    batch_size: u64,
    host_name: String,
}

impl<S: Store + ?Sized> SendBalancer<S> {
    pub fn new(store: Arc<S>, batch_size: u64, host_name: impl Into<String>) -> Self {
        Self {
            store,
            batch_size,
            host_name: host_name.into(),
        }
    }

    /// One guarded balancer invocation.
    pub async fn run(&self) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let span = work::start_run_span("balance", Stage::Send, &self.host_name, &run_id);
        async {
            let holder = lock_holder(&self.host_name, &run_id);
            let Some(lock) = RunLock::acquire(&*self.store, Stage::Send, holder).await? else {
                info!("send balancer already running, quitting");
                return Ok(RunOutcome::Locked);
            };
            let result = self.balance().await;
            lock.release().await?;
            result.map(RunOutcome::Completed)
        }
        .instrument(span)
        .await
    }

    /// Assign until no unassigned delivery is left, then close drained campaigns.
    ///
    /// Callers must hold the send run lock.
    pub async fn balance(&self) -> Result<BalanceReport> {
        let started = Instant::now();
        let mut report = BalanceReport::default();

        if !self.store.has_unassigned_deliveries().await? {
            info!("nothing to send");
            report.finished_campaigns = self.cleanup().await?;
            return Ok(report);
        }

        while self.store.has_unassigned_deliveries().await? {
            let hosts = self.store.active_hosts(Stage::Send).await?;
            if hosts.is_empty() {
                warn!("no send hosts available, quitting");
                return Ok(report);
            }
            report.hosts = hosts.len();
            report.rounds += 1;

            let assigned = self.round(&hosts).await?;
            report.reserved += assigned;
            if assigned == 0 {
                // Pending rows exist but none could be assigned; another writer got them.
                break;
            }
        }

        report.finished_campaigns = self.cleanup().await?;
        info!(
            count = report.reserved,
            hosts = report.hosts,
            rounds = report.rounds,
            duration_ms = started.elapsed().as_millis() as u64,
            "finished distributing emails"
        );
        Ok(report)
    }

    async fn round(&self, hosts: &[Host]) -> Result<u64> {
        let depths: Vec<_> = hosts.iter().map(|h| (h.id, h.queue_depth)).collect();
        let mut total = 0;
        for (host, allotment) in hosts.iter().zip(compute_allotments(&depths, self.batch_size)) {
            if allotment.allotment == 0 {
                continue;
            }
            let assigned = match self
                .store
                .assign_deliveries(host.id, allotment.allotment)
                .await
            {
                Ok(n) => n,
                Err(e) => return Err(self.fail_host(host, e).await),
            };
            if assigned == 0 {
                continue;
            }
            self.store
                .set_queue_depth(host.id, allotment.depth + assigned)
                .await?;
            metrics::reservations().add(
                assigned,
                &[
                    KeyValue::new("stage", "send"),
                    KeyValue::new("host", host.name.clone()),
                ],
            );
            info!(host = %host.name, count = assigned, "distributed emails");
            total += assigned;
        }
        Ok(total)
    }

    /// Exclude a host that refused its batch and stop the run.
    async fn fail_host(&self, host: &Host, cause: Error) -> Error {
        error!(
            host = %host.name,
            error = %cause,
            "send host failed to accept emails and will be ignored until cleared"
        );
        if let Err(e) = self.store.set_host_status(host.id, HostStatus::Failed).await {
            error!(host = %host.name, error = %e, "could not mark host failed");
        } else {
            metrics::host_status_changes().add(
                1,
                &[KeyValue::new("stage", "send"), KeyValue::new("to", "failed")],
            );
        }
        Error::Delegation {
            host: host.name.clone(),
            reason: cause.to_string(),
        }
    }

    /// Complete every campaign with nothing left in flight.
    async fn cleanup(&self) -> Result<Vec<crate::model::CampaignId>> {
        let drained = self.store.drained_campaigns().await?;
        for id in &drained {
            self.store.finish_campaign(*id).await?;
            info!(campaign = %id, "campaign complete");
        }
        Ok(drained)
    }
}
