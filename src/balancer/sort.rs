//! Sort balancer: reserves pending recipients to sort hosts, one campaign at a
//! time, earliest scheduled campaign first.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use super::{BalanceReport, RunLock, RunOutcome, lock_holder};
use crate::error::{Error, Result};
use crate::model::{Campaign, CampaignStatus, Host, HostStatus, Stage};
use crate::store::Store;
use crate::telemetry::{metrics, work};

pub struct SortBalancer<S: ?Sized> {
    store: Arc<S>,
    batch_size: u64,
    host_name: String,
}

impl<S: Store + ?Sized> SortBalancer<S> {
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
        let span = work::start_run_span("balance", Stage::Sort, &self.host_name, &run_id);
        async {
            let holder = lock_holder(&self.host_name, &run_id);
            let Some(lock) = RunLock::acquire(&*self.store, Stage::Sort, holder).await? else {
                info!("sort balancer already running, quitting");
                return Ok(RunOutcome::Locked);
            };
            let result = self.balance().await;
            lock.release().await?;
            result.map(RunOutcome::Completed)
        }
        .instrument(span)
        .await
    }

    /// Reserve every pending recipient. Callers must hold the sort run lock.
    pub async fn balance(&self) -> Result<BalanceReport> {
        let started = Instant::now();
        let mut report = BalanceReport::default();

        let hosts = self.store.active_hosts(Stage::Sort).await?;
        if hosts.is_empty() {
            warn!("no sort hosts available, quitting");
            return Ok(report);
        }
        report.hosts = hosts.len();

        if !self.store.has_pending_recipients(None).await? {
            info!("no pending recipients, quitting");
            return Ok(report);
        }

        for campaign in self.store.delegatable_campaigns().await? {
            let (reserved, rounds) = self.balance_campaign(&campaign, &hosts).await?;
            report.reserved += reserved;
            report.rounds += rounds;
        }

        for host in &hosts {
            let depth = self.store.recipient_depth(host.id).await?;
            self.store.set_queue_depth(host.id, depth).await?;
        }

        info!(
            count = report.reserved,
            hosts = report.hosts,
            duration_ms = started.elapsed().as_millis() as u64,
            "finished delegating recipients"
        );
        Ok(report)
    }

    async fn balance_campaign(&self, campaign: &Campaign, hosts: &[Host]) -> Result<(u64, u32)> {
        if !self.store.has_pending_recipients(Some(campaign.id)).await? {
            return Ok((0, 0));
        }
        if campaign.status == CampaignStatus::Delegate {
            self.store
                .transition_campaign(campaign.id, CampaignStatus::Delegate, CampaignStatus::Delegating)
                .await?;
        }

        let mut reserved = 0;
        let mut rounds = 0;
        while self.store.has_pending_recipients(Some(campaign.id)).await? {
            rounds += 1;
            let mut this_round = 0;
            for host in hosts {
                let n = match self
                    .store
                    .reserve_recipients(campaign.id, host.id, self.batch_size)
                    .await
                {
                    Ok(n) => n,
                    Err(e) => return Err(self.fail_host(host, e).await),
                };
                if n > 0 {
                    metrics::reservations().add(
                        n,
                        &[
                            KeyValue::new("stage", "sort"),
                            KeyValue::new("host", host.name.clone()),
                        ],
                    );
                }
                this_round += n;
            }
            reserved += this_round;
            if this_round == 0 {
                break;
            }
        }
        info!(campaign = %campaign.id, count = reserved, "delegated campaign recipients");
        Ok((reserved, rounds))
    }

    async fn fail_host(&self, host: &Host, cause: Error) -> Error {
        error!(
            host = %host.name,
            error = %cause,
            "sort host failed to accept recipients and will be ignored until cleared"
        );
        if let Err(e) = self.store.set_host_status(host.id, HostStatus::Failed).await {
            error!(host = %host.name, error = %e, "could not mark host failed");
        } else {
            metrics::host_status_changes().add(
                1,
                &[KeyValue::new("stage", "sort"), KeyValue::new("to", "failed")],
            );
        }
        Error::Delegation {
            host: host.name.clone(),
            reason: cause.to_string(),
        }
    }
}
