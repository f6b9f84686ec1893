//! Sort slot worker: turns reserved recipients into queued emails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::{Instrument, debug, info};

use super::{HostGate, ItemStats, SlotReport};
use crate::config::LinkSettings;
use crate::error::Result;
use crate::model::{CampaignId, CampaignStatus, Recipient, Slot, Stage};
use crate::personalize::{CampaignPlan, Personalized};
use crate::store::Store;
use crate::telemetry::{metrics, work};

pub struct SortWorker<S: ?Sized> {
    store: Arc<S>,
    gate: Arc<HostGate<S>>,
    slot: Slot,
    batch_size: u64,
    links: LinkSettings,
    /// Start of the fleet run; fixes `[date]` and `[identifier]` for all slots.
    timestamp: DateTime<Utc>,
    plans: HashMap<CampaignId, CampaignPlan>,
}

impl<S: Store + ?Sized> SortWorker<S> {
    pub fn new(
        store: Arc<S>,
        gate: Arc<HostGate<S>>,
        slot: Slot,
        batch_size: u64,
        links: LinkSettings,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            gate,
            slot,
            batch_size,
            links,
            timestamp,
            plans: HashMap::new(),
        }
    }

    /// Process batches until the slot's reservation is drained or the host
    /// asks to stop. Stops between batches, never inside one.
    pub async fn run(mut self) -> Result<SlotReport> {
        let mut report = SlotReport::new(self.slot);
        loop {
            let batch = self
                .store
                .claim_recipients(self.slot, self.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            let span = work::start_batch_span(Stage::Sort, self.slot);
            let started = Instant::now();
            let items = self.process(&batch).instrument(span.clone()).await?;
            let elapsed = started.elapsed();
            report.batches += 1;
            report.items += items;

            metrics::batch_duration_ms()
                .record(elapsed.as_secs_f64() * 1000.0, &[KeyValue::new("stage", "sort")]);
            info!(
                slot = %self.slot,
                count = items.done,
                removed = items.removed,
                duration_ms = elapsed.as_millis() as u64,
                "delegated recipients"
            );

            let host = self.gate.host().id;
            let depth = self.store.recipient_depth(host).await?;
            self.store.set_queue_depth(host, depth).await?;
            metrics::queue_depth().record(
                depth,
                &[
                    KeyValue::new("stage", "sort"),
                    KeyValue::new("host", self.gate.host().name.clone()),
                ],
            );

            if !self.gate.permits_work().await? || self.campaign_pulled(&batch).await? {
                work::record_outcome(&span, "stopped");
                report.stopped = true;
                break;
            }
            work::record_outcome(&span, "ok");
        }
        Ok(report)
    }

    async fn process(&mut self, batch: &[Recipient]) -> Result<ItemStats> {
        let mut items = ItemStats::default();
        let mut touched: Vec<CampaignId> = Vec::new();

        for recipient in batch {
            if !touched.contains(&recipient.campaign_id) {
                touched.push(recipient.campaign_id);
            }
            self.load_plan(recipient.campaign_id).await?;
            let Some(plan) = self.plans.get(&recipient.campaign_id) else {
                continue;
            };
            match plan.personalize(&*self.store, recipient).await? {
                Personalized::Email(email) => {
                    self.store.complete_recipient(recipient.id, email).await?;
                    items.done += 1;
                }
                Personalized::Ineligible(reason) => {
                    debug!(
                        recipient = %recipient.id,
                        reason = reason.as_str(),
                        "removing ineligible recipient"
                    );
                    self.store.remove_recipient(recipient.id).await?;
                    items.removed += 1;
                }
            }
        }

        for outcome in [("sent", items.done), ("removed", items.removed)] {
            if outcome.1 > 0 {
                metrics::items_processed().add(
                    outcome.1,
                    &[
                        KeyValue::new("stage", "sort"),
                        KeyValue::new("outcome", outcome.0),
                    ],
                );
            }
        }

        for campaign in touched {
            self.finish_if_sorted(campaign).await?;
        }
        Ok(items)
    }

    async fn load_plan(&mut self, campaign: CampaignId) -> Result<()> {
        if !self.plans.contains_key(&campaign) {
            let plan =
                CampaignPlan::load(&*self.store, campaign, &self.links, self.timestamp).await?;
            self.plans.insert(campaign, plan);
        }
        Ok(())
    }

    /// Move a campaign whose recipients are all personalized on to the send stage.
    async fn finish_if_sorted(&self, campaign: CampaignId) -> Result<()> {
        if !self.store.campaign_fully_sorted(campaign).await? {
            return Ok(());
        }
        let current = self.store.campaign(campaign).await?;
        if current.status != CampaignStatus::Delegating {
            return Ok(());
        }
        let next = CampaignStatus::after_sorting(current.nr_sent);
        // Only one slot wins the transition; it also closes the template.
        if self
            .store
            .transition_campaign(campaign, CampaignStatus::Delegating, next)
            .await?
        {
            if let Some(plan) = self.plans.get(&campaign) {
                self.store.mark_template_sent(plan.template.id).await?;
            }
            info!(campaign = %campaign, status = %next, "campaign fully delegated");
        }
        Ok(())
    }

    /// A campaign of the batch left the sort stage under us.
    async fn campaign_pulled(&self, batch: &[Recipient]) -> Result<bool> {
        let mut seen: Vec<CampaignId> = Vec::new();
        for r in batch {
            if seen.contains(&r.campaign_id) {
                continue;
            }
            seen.push(r.campaign_id);
            let campaign = self.store.campaign(r.campaign_id).await?;
            if campaign.status.is_sortable() {
                continue;
            }
            // Leaving the sort stage because we finished it is not a reassignment.
            if !self.store.campaign_fully_sorted(r.campaign_id).await? {
                info!(campaign = %r.campaign_id, status = %campaign.status, "campaign reassigned, stopping");
                return Ok(true);
            }
        }
        Ok(false)
    }
}
