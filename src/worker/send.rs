//! Send slot worker: delivers reserved emails through its own transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::{Instrument, error, info, warn};

use super::{HostGate, ItemStats, SlotReport};
use crate::error::Result;
use crate::model::{CampaignId, CampaignStatus, Delivery, DeliveryStatus, Slot, Stage};
use crate::store::Store;
use crate::telemetry::{metrics, work};
use crate::transport::{MailTransport, OutgoingMail};

pub struct SendWorker<S: ?Sized> {
    store: Arc<S>,
    gate: Arc<HostGate<S>>,
    slot: Slot,
    batch_size: u64,
    max_failures: u32,
    due_window: chrono::Duration,
    transport: Box<dyn MailTransport>,
}

/// Delivered and failed counts of one campaign within a batch.
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    sent: u64,
    failed: u64,
}

impl<S: Store + ?Sized> SendWorker<S> {
    pub fn new(
        store: Arc<S>,
        gate: Arc<HostGate<S>>,
        slot: Slot,
        settings: &super::WorkerSettings,
        transport: Box<dyn MailTransport>,
    ) -> Self {
        Self {
            store,
            gate,
            slot,
            batch_size: settings.batch_size,
            max_failures: settings.max_failures,
            due_window: settings.due_window,
            transport,
        }
    }

    /// Deliver batches until the slot's reservation is drained or the host
    /// asks to stop. Stops between batches, never inside one.
    pub async fn run(mut self) -> Result<SlotReport> {
        let mut report = SlotReport::new(self.slot);
        loop {
            let batch = self
                .store
                .claim_deliveries(self.slot, self.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            let span = work::start_batch_span(Stage::Send, self.slot);
            let started = Instant::now();
            let items = self.process(&batch).instrument(span.clone()).await?;
            let elapsed = started.elapsed();
            report.batches += 1;
            report.items += items;

            metrics::batch_duration_ms()
                .record(elapsed.as_secs_f64() * 1000.0, &[KeyValue::new("stage", "send")]);
            info!(
                slot = %self.slot,
                count = items.done,
                failed = items.failed,
                retried = items.retried,
                duration_ms = elapsed.as_millis() as u64,
                "sent emails"
            );

            self.report_depth().await?;

            if !self.gate.permits_work().await? {
                work::record_outcome(&span, "stopped");
                report.stopped = true;
                break;
            }
            work::record_outcome(&span, "ok");
        }
        Ok(report)
    }

    async fn process(&mut self, batch: &[Delivery]) -> Result<ItemStats> {
        let mut items = ItemStats::default();
        let mut tallies: HashMap<CampaignId, Tally> = HashMap::new();

        // Rows settled before a failure still count toward their campaigns.
        let settled = self.settle_batch(batch, &mut items, &mut tallies).await;
        let recorded = self.record_tallies(tallies).await;

        for (outcome, n) in [
            ("sent", items.done),
            ("retry", items.retried),
            ("failed", items.failed),
            ("zombie", items.zombies),
        ] {
            if n > 0 {
                metrics::items_processed().add(
                    n,
                    &[KeyValue::new("stage", "send"), KeyValue::new("outcome", outcome)],
                );
            }
        }
        settled?;
        recorded?;
        Ok(items)
    }

    async fn settle_batch(
        &mut self,
        batch: &[Delivery],
        items: &mut ItemStats,
        tallies: &mut HashMap<CampaignId, Tally>,
    ) -> Result<()> {
        for delivery in batch {
            let Some(email) = self.store.email(delivery.email_id).await? else {
                warn!(
                    delivery = %delivery.id,
                    email = %delivery.email_id,
                    "removing zombie status entry with no email"
                );
                self.store.delete_delivery(delivery.id).await?;
                items.zombies += 1;
                continue;
            };
            if delivery.scheduled_at.is_none() {
                warn!(delivery = %delivery.id, campaign = %delivery.campaign_id, "email has no send time");
            }

            let mail = OutgoingMail {
                envelope_sender: &email.envelope_sender,
                recipient: &email.recipient,
                header: &email.header,
                body: &email.body,
            };
            match self.transport.send(&mail).await {
                Ok(()) => {
                    self.store.mark_delivered(delivery.id).await?;
                    tallies.entry(delivery.campaign_id).or_default().sent += 1;
                    items.done += 1;
                }
                Err(e) => {
                    match DeliveryStatus::after_failure(delivery.failure_count, self.max_failures) {
                        DeliveryStatus::Send => {
                            warn!(
                                delivery = %delivery.id,
                                attempt = delivery.failure_count + 1,
                                diagnostic = %e.diagnostic,
                                "send failed, will retry"
                            );
                            self.store.requeue_delivery(delivery.id).await?;
                            self.transport.reset().await;
                            items.retried += 1;
                        }
                        _ => {
                            error!(
                                delivery = %delivery.id,
                                recipient = %email.recipient,
                                diagnostic = %e.diagnostic,
                                "send failed permanently"
                            );
                            self.store.fail_delivery(delivery.id).await?;
                            tallies.entry(delivery.campaign_id).or_default().failed += 1;
                            items.failed += 1;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn record_tallies(&mut self, tallies: HashMap<CampaignId, Tally>) -> Result<()> {
        for (campaign, tally) in tallies {
            self.store
                .record_delivery_stats(campaign, tally.sent, tally.failed)
                .await?;
            if tally.sent > 0 {
                self.store
                    .transition_campaign(campaign, CampaignStatus::Send, CampaignStatus::Sending)
                    .await?;
            }
        }
        Ok(())
    }

    async fn report_depth(&mut self) -> Result<()> {
        let host = self.gate.host();
        let horizon = chrono::Utc::now() + self.due_window;
        let depth = self.store.count_due_deliveries(host.id, horizon).await?;
        self.store.set_queue_depth(host.id, depth).await?;
        metrics::queue_depth().record(
            depth,
            &[
                KeyValue::new("stage", "send"),
                KeyValue::new("host", host.name.clone()),
            ],
        );
        Ok(())
    }
}
