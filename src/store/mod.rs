//! Storage seams.
//!
//! Everything the balancers and workers know about shared state goes through
//! these traits. Each mutating operation is a single conditional update, so
//! two callers racing on the same rows can never both win. [`crate::db::Db`]
//! implements them over Postgres; [`memory::MemoryStore`] implements them in
//! process for tests and dry runs.

pub mod memory;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    Backlog, Campaign, CampaignId, CampaignStatus, DataField, Delivery, DeliveryId, Email,
    EmailId, FieldId, Host, HostId, HostStatus, InterestId, ListId, MailingList, NewEmail,
    Recipient, RecipientId, Slot, Stage, Template, TemplateId, TemplateVariant, UserId,
};

/// Host registry, availability flags, depth gauges and run locks.
#[async_trait]
pub trait HostStore: Send + Sync {
    async fn find_host(&self, stage: Stage, name: &str) -> Result<Option<Host>>;

    async fn host(&self, id: HostId) -> Result<Host>;

    async fn register_host(&self, stage: Stage, name: &str, status: HostStatus) -> Result<Host>;

    /// Move a host from `from` to `to`. Returns false when the host was not in `from`.
    async fn transition_host(&self, id: HostId, from: HostStatus, to: HostStatus) -> Result<bool>;

    /// Set a host's status unless its current status forbids it (blocking
    /// statuses are sticky). Returns whether the update applied.
    async fn set_host_status(&self, id: HostId, to: HostStatus) -> Result<bool>;

    /// Operator reset: back to `available` from any status.
    async fn clear_host(&self, id: HostId) -> Result<()>;

    /// Hosts of a stage that may receive work, ordered by id.
    async fn active_hosts(&self, stage: Stage) -> Result<Vec<Host>>;

    async fn all_hosts(&self) -> Result<Vec<Host>>;

    async fn set_queue_depth(&self, id: HostId, depth: u64) -> Result<()>;

    /// Take the run-level mutex of a stage. Returns false when someone holds it.
    async fn try_lock_run(&self, stage: Stage, holder: &str) -> Result<bool>;

    async fn unlock_run(&self, stage: Stage, holder: &str) -> Result<()>;
}

/// Campaign metadata and the reference data personalization reads.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Campaigns in `delegate` or `delegating`, earliest scheduled first.
    async fn delegatable_campaigns(&self) -> Result<Vec<Campaign>>;

    async fn campaign(&self, id: CampaignId) -> Result<Campaign>;

    /// Conditional status change. Returns false when the campaign was not in `from`.
    ///
    /// # Errors
    ///
    /// [`crate::error::Error::InvalidTransition`] when `from -> to` is not a
    /// campaign transition at all.
    async fn transition_campaign(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<bool>;

    /// Add to the campaign's delivered/failed counters.
    async fn record_delivery_stats(&self, id: CampaignId, sent: u64, failed: u64) -> Result<()>;

    async fn template(
        &self,
        campaign: CampaignId,
        variant: TemplateVariant,
    ) -> Result<Option<Template>>;

    async fn mark_template_sent(&self, id: TemplateId) -> Result<()>;

    async fn mailing_list(&self, id: ListId) -> Result<MailingList>;

    async fn data_fields(&self, list: ListId) -> Result<Vec<DataField>>;

    /// Stored values of one user, keyed by field. Absent fields have no entry.
    async fn data_field_values(&self, user: UserId) -> Result<HashMap<FieldId, String>>;

    async fn user_interests(&self, user: UserId) -> Result<HashSet<InterestId>>;

    /// Campaigns in `send`/`sending` with no open recipient and no open delivery.
    async fn drained_campaigns(&self) -> Result<Vec<CampaignId>>;

    /// Mark a drained campaign complete and delete its residual rows.
    async fn finish_campaign(&self, id: CampaignId) -> Result<()>;
}

/// Sort-stage work items: recipients.
#[async_trait]
pub trait SortStore: Send + Sync {
    /// Whether any recipient is pending, optionally restricted to one campaign.
    async fn has_pending_recipients(&self, campaign: Option<CampaignId>) -> Result<bool>;

    /// Reserve up to `limit` pending recipients of `campaign` to `host`.
    async fn reserve_recipients(&self, campaign: CampaignId, host: HostId, limit: u64)
    -> Result<u64>;

    /// Reserved recipients of `host` not yet handed to a slot.
    async fn count_unpartitioned_recipients(&self, host: HostId) -> Result<u64>;

    /// Hand up to `limit` of the host's unpartitioned recipients to `slot`.
    async fn partition_recipients(&self, slot: Slot, limit: u64) -> Result<u64>;

    /// Recipients owned by `slot`, earliest scheduled campaign first.
    async fn claim_recipients(&self, slot: Slot, limit: u64) -> Result<Vec<Recipient>>;

    /// Drop an ineligible recipient without producing an email.
    async fn remove_recipient(&self, id: RecipientId) -> Result<()>;

    /// Store the personalized email, queue its delivery and mark the recipient
    /// `sent`, all at once.
    async fn complete_recipient(&self, id: RecipientId, email: NewEmail) -> Result<EmailId>;

    /// No recipient of the campaign is pending or reserved.
    async fn campaign_fully_sorted(&self, campaign: CampaignId) -> Result<bool>;

    /// Recipients reserved to `host`, partitioned or not.
    async fn recipient_depth(&self, host: HostId) -> Result<u64>;

    /// Delete the host's `sent` recipients.
    async fn purge_sorted_recipients(&self, host: HostId) -> Result<u64>;

    async fn recipient_backlog(&self) -> Result<Backlog>;
}

/// Send-stage work items: delivery rows and their email payloads.
#[async_trait]
pub trait SendStore: Send + Sync {
    /// Whether any pending delivery has no host yet.
    async fn has_unassigned_deliveries(&self) -> Result<bool>;

    /// Assign up to `limit` unassigned pending deliveries to `host`, earliest first.
    async fn assign_deliveries(&self, host: HostId, limit: u64) -> Result<u64>;

    /// Open deliveries of `host` due by `horizon`. Unscheduled ones count as due.
    async fn count_due_deliveries(&self, host: HostId, horizon: DateTime<Utc>) -> Result<u64>;

    /// Pending deliveries of the slot's host, due by `horizon` and not yet
    /// owned by any slot.
    async fn count_unpartitioned_deliveries(
        &self,
        host: HostId,
        horizon: DateTime<Utc>,
    ) -> Result<u64>;

    /// Reserve up to `limit` of those to `slot`.
    async fn reserve_deliveries(&self, slot: Slot, horizon: DateTime<Utc>, limit: u64)
    -> Result<u64>;

    /// Deliveries reserved to `slot`, earliest scheduled first.
    async fn claim_deliveries(&self, slot: Slot, limit: u64) -> Result<Vec<Delivery>>;

    async fn email(&self, id: EmailId) -> Result<Option<Email>>;

    /// Remove a delivery row outright. Used for rows whose payload is gone.
    async fn delete_delivery(&self, id: DeliveryId) -> Result<()>;

    async fn mark_delivered(&self, id: DeliveryId) -> Result<()>;

    /// Back to pending with one more failure, released from its slot.
    async fn requeue_delivery(&self, id: DeliveryId) -> Result<()>;

    /// Permanently failed, with one more failure.
    async fn fail_delivery(&self, id: DeliveryId) -> Result<()>;

    /// Delete the host's delivered rows and their payloads.
    async fn purge_finished_deliveries(&self, host: HostId) -> Result<u64>;

    async fn delivery_backlog(&self) -> Result<Backlog>;
}

/// Everything a balancer or worker needs.
pub trait Store: HostStore + CampaignStore + SortStore + SendStore {}

impl<T> Store for T where T: HostStore + CampaignStore + SortStore + SendStore {}
