//! In-process implementation of the storage traits.
//!
//! All tables live behind one mutex, so every trait method is atomic in the
//! same way a single conditional statement is in Postgres. Used by the test
//! suite.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{CampaignStore, HostStore, SendStore, SortStore};
use crate::error::{Error, Result};
use crate::model::{
    Backlog, Campaign, CampaignId, CampaignStatus, DataField, Delivery, DeliveryId,
    DeliveryStatus, Email, EmailId, FieldId, Host, HostId, HostStatus, InterestId, ListId,
    MailingList, NewEmail, Recipient, RecipientId, RecipientStatus, Slot, Stage, Template,
    TemplateId, TemplateVariant, UserId,
};

#[derive(Default)]
struct Tables {
    next_id: i64,
    hosts: BTreeMap<HostId, Host>,
    broken_hosts: HashSet<HostId>,
    broken_deliveries: HashSet<DeliveryId>,
    run_locks: HashMap<Stage, String>,
    campaigns: BTreeMap<CampaignId, Campaign>,
    templates: BTreeMap<TemplateId, Template>,
    sent_templates: HashSet<TemplateId>,
    lists: HashMap<ListId, MailingList>,
    fields: Vec<DataField>,
    values: HashMap<(UserId, FieldId), String>,
    interests: HashMap<UserId, HashSet<InterestId>>,
    recipients: BTreeMap<RecipientId, Recipient>,
    emails: BTreeMap<EmailId, Email>,
    deliveries: BTreeMap<DeliveryId, Delivery>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn host_mut(&mut self, id: HostId) -> Result<&mut Host> {
        self.hosts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("host {id}")))
    }

    fn check_reachable(&self, id: HostId) -> Result<()> {
        if self.broken_hosts.contains(&id) {
            return Err(Error::Connection(format!("host {id} refused the batch")));
        }
        Ok(())
    }

    fn campaign_schedule(&self, id: CampaignId) -> Option<DateTime<Utc>> {
        self.campaigns.get(&id).and_then(|c| c.scheduled_at)
    }

    fn delivery_mut(&mut self, id: DeliveryId) -> Result<&mut Delivery> {
        self.deliveries
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("delivery {id}")))
    }

    /// Move a reserved delivery to `to`, refusing any other starting status.
    fn settle_delivery(&mut self, id: DeliveryId, to: DeliveryStatus) -> Result<&mut Delivery> {
        if self.broken_deliveries.contains(&id) {
            return Err(Error::Connection(format!("lost connection settling delivery {id}")));
        }
        let d = self.delivery_mut(id)?;
        if !d.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: d.status.to_string(),
                to: to.to_string(),
            });
        }
        d.status = to;
        Ok(d)
    }
}

fn is_due(scheduled_at: Option<DateTime<Utc>>, horizon: DateTime<Utc>) -> bool {
    scheduled_at.is_none_or(|t| t <= horizon)
}

/// Sort key placing unscheduled items after scheduled ones.
fn schedule_key(scheduled_at: Option<DateTime<Utc>>) -> (bool, Option<DateTime<Utc>>) {
    (scheduled_at.is_none(), scheduled_at)
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- seeding ------------------------------------------------------------

    pub fn insert_list(&self, list: MailingList) {
        self.tables.lock().lists.insert(list.id, list);
    }

    pub fn insert_campaign(&self, campaign: Campaign) {
        self.tables.lock().campaigns.insert(campaign.id, campaign);
    }

    pub fn insert_template(&self, template: Template) {
        self.tables.lock().templates.insert(template.id, template);
    }

    pub fn insert_field(&self, field: DataField) {
        self.tables.lock().fields.push(field);
    }

    pub fn set_field_value(&self, user: UserId, field: FieldId, value: impl Into<String>) {
        self.tables
            .lock()
            .values
            .insert((user, field), value.into());
    }

    pub fn add_interest(&self, user: UserId, interest: InterestId) {
        self.tables
            .lock()
            .interests
            .entry(user)
            .or_default()
            .insert(interest);
    }

    /// Add a pending recipient and return its id.
    pub fn add_recipient(
        &self,
        campaign: CampaignId,
        user: UserId,
        name: &str,
        email: &str,
        locale: &str,
    ) -> RecipientId {
        let mut t = self.tables.lock();
        let id = RecipientId(t.next_id());
        t.recipients.insert(
            id,
            Recipient {
                id,
                campaign_id: campaign,
                user_id: user,
                name: name.to_string(),
                email: email.to_string(),
                is_hotmail: false,
                locale: locale.to_string(),
                external_pass: format!("pass{}", user.0),
                status: RecipientStatus::Delegate,
                host: None,
                slot: None,
            },
        );
        id
    }

    /// Add an email payload with a pending, unassigned delivery.
    pub fn add_email(&self, email: NewEmail) -> (EmailId, DeliveryId) {
        let mut t = self.tables.lock();
        insert_email(&mut t, email)
    }

    /// Make every batch handed to `host` fail as if its connection were broken.
    pub fn break_host(&self, host: HostId) {
        self.tables.lock().broken_hosts.insert(host);
    }

    /// Make settling `delivery` fail as if the connection dropped mid-batch.
    pub fn break_delivery(&self, delivery: DeliveryId) {
        self.tables.lock().broken_deliveries.insert(delivery);
    }

    /// Delete an email payload, leaving its delivery row behind.
    pub fn remove_email(&self, id: EmailId) {
        self.tables.lock().emails.remove(&id);
    }

    // -- inspection ---------------------------------------------------------

    pub fn recipient(&self, id: RecipientId) -> Option<Recipient> {
        self.tables.lock().recipients.get(&id).cloned()
    }

    pub fn recipients(&self) -> Vec<Recipient> {
        self.tables.lock().recipients.values().cloned().collect()
    }

    pub fn delivery(&self, id: DeliveryId) -> Option<Delivery> {
        self.tables.lock().deliveries.get(&id).cloned()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.tables.lock().deliveries.values().cloned().collect()
    }

    pub fn emails(&self) -> Vec<Email> {
        self.tables.lock().emails.values().cloned().collect()
    }

    pub fn template_is_sent(&self, id: TemplateId) -> bool {
        self.tables.lock().sent_templates.contains(&id)
    }

    pub fn run_lock_holder(&self, stage: Stage) -> Option<String> {
        self.tables.lock().run_locks.get(&stage).cloned()
    }
}

fn insert_email(t: &mut Tables, email: NewEmail) -> (EmailId, DeliveryId) {
    let email_id = EmailId(t.next_id());
    let delivery_id = DeliveryId(t.next_id());
    t.deliveries.insert(
        delivery_id,
        Delivery {
            id: delivery_id,
            email_id,
            campaign_id: email.campaign_id,
            status: DeliveryStatus::Send,
            host: None,
            slot: None,
            failure_count: 0,
            scheduled_at: email.scheduled_at,
        },
    );
    t.emails.insert(
        email_id,
        Email {
            id: email_id,
            campaign_id: email.campaign_id,
            envelope_sender: email.envelope_sender,
            recipient: email.recipient,
            header: email.header,
            body: email.body,
            is_hotmail: email.is_hotmail,
        },
    );
    (email_id, delivery_id)
}

#[async_trait]
impl HostStore for MemoryStore {
    async fn find_host(&self, stage: Stage, name: &str) -> Result<Option<Host>> {
        let t = self.tables.lock();
        Ok(t.hosts
            .values()
            .find(|h| h.stage == stage && h.name == name)
            .cloned())
    }

    async fn host(&self, id: HostId) -> Result<Host> {
        let t = self.tables.lock();
        t.hosts
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("host {id}")))
    }

    async fn register_host(&self, stage: Stage, name: &str, status: HostStatus) -> Result<Host> {
        let mut t = self.tables.lock();
        if let Some(existing) = t.hosts.values().find(|h| h.stage == stage && h.name == name) {
            return Ok(existing.clone());
        }
        let id = HostId(t.next_id());
        let host = Host {
            id,
            stage,
            name: name.to_string(),
            status,
            queue_depth: 0,
        };
        t.hosts.insert(id, host.clone());
        Ok(host)
    }

    async fn transition_host(&self, id: HostId, from: HostStatus, to: HostStatus) -> Result<bool> {
        let mut t = self.tables.lock();
        let host = t.host_mut(id)?;
        if host.status != from {
            return Ok(false);
        }
        host.status = to;
        Ok(true)
    }

    async fn set_host_status(&self, id: HostId, to: HostStatus) -> Result<bool> {
        let mut t = self.tables.lock();
        let host = t.host_mut(id)?;
        if !host.status.can_transition_to(to) {
            return Ok(false);
        }
        host.status = to;
        Ok(true)
    }

    async fn clear_host(&self, id: HostId) -> Result<()> {
        let mut t = self.tables.lock();
        t.host_mut(id)?.status = HostStatus::Available;
        t.broken_hosts.remove(&id);
        Ok(())
    }

    async fn active_hosts(&self, stage: Stage) -> Result<Vec<Host>> {
        let t = self.tables.lock();
        Ok(t.hosts
            .values()
            .filter(|h| h.stage == stage && !h.status.is_blocking())
            .cloned()
            .collect())
    }

    async fn all_hosts(&self) -> Result<Vec<Host>> {
        Ok(self.tables.lock().hosts.values().cloned().collect())
    }

    async fn set_queue_depth(&self, id: HostId, depth: u64) -> Result<()> {
        self.tables.lock().host_mut(id)?.queue_depth = depth;
        Ok(())
    }

    async fn try_lock_run(&self, stage: Stage, holder: &str) -> Result<bool> {
        let mut t = self.tables.lock();
        if t.run_locks.contains_key(&stage) {
            return Ok(false);
        }
        t.run_locks.insert(stage, holder.to_string());
        Ok(true)
    }

    async fn unlock_run(&self, stage: Stage, holder: &str) -> Result<()> {
        let mut t = self.tables.lock();
        if t.run_locks.get(&stage).is_some_and(|h| h == holder) {
            t.run_locks.remove(&stage);
        }
        Ok(())
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn delegatable_campaigns(&self) -> Result<Vec<Campaign>> {
        let t = self.tables.lock();
        let mut out: Vec<Campaign> = t
            .campaigns
            .values()
            .filter(|c| c.status.is_sortable())
            .cloned()
            .collect();
        out.sort_by_key(|c| (schedule_key(c.scheduled_at), c.id));
        Ok(out)
    }

    async fn campaign(&self, id: CampaignId) -> Result<Campaign> {
        let t = self.tables.lock();
        t.campaigns
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("campaign {id}")))
    }

    async fn transition_campaign(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let mut t = self.tables.lock();
        let campaign = t
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("campaign {id}")))?;
        if campaign.status != from {
            return Ok(false);
        }
        campaign.status = to;
        Ok(true)
    }

    async fn record_delivery_stats(&self, id: CampaignId, sent: u64, failed: u64) -> Result<()> {
        let mut t = self.tables.lock();
        let campaign = t
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("campaign {id}")))?;
        campaign.nr_sent += sent;
        campaign.nr_failed += failed;
        Ok(())
    }

    async fn template(
        &self,
        campaign: CampaignId,
        variant: TemplateVariant,
    ) -> Result<Option<Template>> {
        let t = self.tables.lock();
        Ok(t.templates
            .values()
            .find(|tpl| tpl.campaign_id == campaign && tpl.variant == variant)
            .cloned())
    }

    async fn mark_template_sent(&self, id: TemplateId) -> Result<()> {
        self.tables.lock().sent_templates.insert(id);
        Ok(())
    }

    async fn mailing_list(&self, id: ListId) -> Result<MailingList> {
        let t = self.tables.lock();
        t.lists
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("mailing list {id}")))
    }

    async fn data_fields(&self, list: ListId) -> Result<Vec<DataField>> {
        let t = self.tables.lock();
        Ok(t.fields
            .iter()
            .filter(|f| f.list_id == list)
            .cloned()
            .collect())
    }

    async fn data_field_values(&self, user: UserId) -> Result<HashMap<FieldId, String>> {
        let t = self.tables.lock();
        Ok(t.values
            .iter()
            .filter(|((u, _), _)| *u == user)
            .map(|((_, field), value)| (*field, value.clone()))
            .collect())
    }

    async fn user_interests(&self, user: UserId) -> Result<HashSet<InterestId>> {
        Ok(self
            .tables
            .lock()
            .interests
            .get(&user)
            .cloned()
            .unwrap_or_default())
    }

    async fn drained_campaigns(&self) -> Result<Vec<CampaignId>> {
        let t = self.tables.lock();
        Ok(t.campaigns
            .values()
            .filter(|c| matches!(c.status, CampaignStatus::Send | CampaignStatus::Sending))
            .filter(|c| {
                !t.recipients
                    .values()
                    .any(|r| r.campaign_id == c.id && !r.status.is_terminal())
            })
            .filter(|c| {
                !t.deliveries
                    .values()
                    .any(|d| d.campaign_id == c.id && !d.status.is_terminal())
            })
            .map(|c| c.id)
            .collect())
    }

    async fn finish_campaign(&self, id: CampaignId) -> Result<()> {
        let mut t = self.tables.lock();
        let campaign = t
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("campaign {id}")))?;
        if !campaign.status.can_transition_to(CampaignStatus::Complete) {
            return Err(Error::InvalidTransition {
                from: campaign.status.to_string(),
                to: CampaignStatus::Complete.to_string(),
            });
        }
        campaign.status = CampaignStatus::Complete;
        t.recipients.retain(|_, r| r.campaign_id != id);
        t.deliveries.retain(|_, d| d.campaign_id != id);
        t.emails.retain(|_, e| e.campaign_id != id);
        Ok(())
    }
}

#[async_trait]
impl SortStore for MemoryStore {
    async fn has_pending_recipients(&self, campaign: Option<CampaignId>) -> Result<bool> {
        let t = self.tables.lock();
        Ok(t.recipients.values().any(|r| {
            r.status == RecipientStatus::Delegate && campaign.is_none_or(|c| r.campaign_id == c)
        }))
    }

    async fn reserve_recipients(
        &self,
        campaign: CampaignId,
        host: HostId,
        limit: u64,
    ) -> Result<u64> {
        let mut t = self.tables.lock();
        t.check_reachable(host)?;
        let mut reserved = 0;
        for r in t.recipients.values_mut() {
            if reserved == limit {
                break;
            }
            if r.campaign_id == campaign && r.status == RecipientStatus::Delegate {
                r.status = RecipientStatus::Reserved;
                r.host = Some(host);
                r.slot = None;
                reserved += 1;
            }
        }
        Ok(reserved)
    }

    async fn count_unpartitioned_recipients(&self, host: HostId) -> Result<u64> {
        let t = self.tables.lock();
        Ok(t.recipients
            .values()
            .filter(|r| {
                r.status == RecipientStatus::Reserved && r.host == Some(host) && r.slot.is_none()
            })
            .count() as u64)
    }

    async fn partition_recipients(&self, slot: Slot, limit: u64) -> Result<u64> {
        let mut t = self.tables.lock();
        let mut taken = 0;
        for r in t.recipients.values_mut() {
            if taken == limit {
                break;
            }
            if r.status == RecipientStatus::Reserved
                && r.host == Some(slot.host)
                && r.slot.is_none()
            {
                r.slot = Some(slot.index);
                taken += 1;
            }
        }
        Ok(taken)
    }

    async fn claim_recipients(&self, slot: Slot, limit: u64) -> Result<Vec<Recipient>> {
        let t = self.tables.lock();
        let mut owned: Vec<&Recipient> = t
            .recipients
            .values()
            .filter(|r| {
                r.status == RecipientStatus::Reserved
                    && r.host == Some(slot.host)
                    && r.slot == Some(slot.index)
            })
            .collect();
        owned.sort_by_key(|r| (schedule_key(t.campaign_schedule(r.campaign_id)), r.id));
        Ok(owned
            .into_iter()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn remove_recipient(&self, id: RecipientId) -> Result<()> {
        self.tables.lock().recipients.remove(&id);
        Ok(())
    }

    async fn complete_recipient(&self, id: RecipientId, email: NewEmail) -> Result<EmailId> {
        let mut t = self.tables.lock();
        let recipient = t
            .recipients
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("recipient {id}")))?;
        if !recipient.status.can_transition_to(RecipientStatus::Sent) {
            return Err(Error::InvalidTransition {
                from: recipient.status.to_string(),
                to: RecipientStatus::Sent.to_string(),
            });
        }
        recipient.status = RecipientStatus::Sent;
        let (email_id, _) = insert_email(&mut t, email);
        Ok(email_id)
    }

    async fn campaign_fully_sorted(&self, campaign: CampaignId) -> Result<bool> {
        let t = self.tables.lock();
        Ok(!t
            .recipients
            .values()
            .any(|r| r.campaign_id == campaign && !r.status.is_terminal()))
    }

    async fn recipient_depth(&self, host: HostId) -> Result<u64> {
        let t = self.tables.lock();
        Ok(t.recipients
            .values()
            .filter(|r| r.status == RecipientStatus::Reserved && r.host == Some(host))
            .count() as u64)
    }

    async fn purge_sorted_recipients(&self, host: HostId) -> Result<u64> {
        let mut t = self.tables.lock();
        let before = t.recipients.len();
        t.recipients
            .retain(|_, r| !(r.status == RecipientStatus::Sent && r.host == Some(host)));
        Ok((before - t.recipients.len()) as u64)
    }

    async fn recipient_backlog(&self) -> Result<Backlog> {
        let t = self.tables.lock();
        let mut backlog = Backlog::default();
        for r in t.recipients.values() {
            match r.status {
                RecipientStatus::Delegate => backlog.pending += 1,
                RecipientStatus::Reserved => backlog.reserved += 1,
                RecipientStatus::Sent => backlog.finished += 1,
            }
        }
        Ok(backlog)
    }
}

#[async_trait]
impl SendStore for MemoryStore {
    async fn has_unassigned_deliveries(&self) -> Result<bool> {
        let t = self.tables.lock();
        Ok(t.deliveries
            .values()
            .any(|d| d.status == DeliveryStatus::Send && d.host.is_none()))
    }

    async fn assign_deliveries(&self, host: HostId, limit: u64) -> Result<u64> {
        let mut t = self.tables.lock();
        t.check_reachable(host)?;
        let mut ids: Vec<(bool, Option<DateTime<Utc>>, DeliveryId)> = t
            .deliveries
            .values()
            .filter(|d| d.status == DeliveryStatus::Send && d.host.is_none())
            .map(|d| {
                let (unscheduled, at) = schedule_key(d.scheduled_at);
                (unscheduled, at, d.id)
            })
            .collect();
        ids.sort();
        let mut assigned = 0;
        for (_, _, id) in ids.into_iter().take(limit as usize) {
            t.delivery_mut(id)?.host = Some(host);
            assigned += 1;
        }
        Ok(assigned)
    }

    async fn count_due_deliveries(&self, host: HostId, horizon: DateTime<Utc>) -> Result<u64> {
        let t = self.tables.lock();
        Ok(t.deliveries
            .values()
            .filter(|d| {
                d.host == Some(host) && !d.status.is_terminal() && is_due(d.scheduled_at, horizon)
            })
            .count() as u64)
    }

    async fn count_unpartitioned_deliveries(
        &self,
        host: HostId,
        horizon: DateTime<Utc>,
    ) -> Result<u64> {
        let t = self.tables.lock();
        Ok(t.deliveries
            .values()
            .filter(|d| {
                d.host == Some(host)
                    && d.status == DeliveryStatus::Send
                    && d.slot.is_none()
                    && is_due(d.scheduled_at, horizon)
            })
            .count() as u64)
    }

    async fn reserve_deliveries(
        &self,
        slot: Slot,
        horizon: DateTime<Utc>,
        limit: u64,
    ) -> Result<u64> {
        let mut t = self.tables.lock();
        let mut reserved = 0;
        for d in t.deliveries.values_mut() {
            if reserved == limit {
                break;
            }
            if d.host == Some(slot.host)
                && d.status == DeliveryStatus::Send
                && d.slot.is_none()
                && is_due(d.scheduled_at, horizon)
            {
                d.status = DeliveryStatus::Reserved;
                d.slot = Some(slot.index);
                reserved += 1;
            }
        }
        Ok(reserved)
    }

    async fn claim_deliveries(&self, slot: Slot, limit: u64) -> Result<Vec<Delivery>> {
        let t = self.tables.lock();
        let mut owned: Vec<&Delivery> = t
            .deliveries
            .values()
            .filter(|d| {
                d.status == DeliveryStatus::Reserved
                    && d.host == Some(slot.host)
                    && d.slot == Some(slot.index)
            })
            .collect();
        owned.sort_by_key(|d| (schedule_key(d.scheduled_at), d.id));
        Ok(owned
            .into_iter()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn email(&self, id: EmailId) -> Result<Option<Email>> {
        Ok(self.tables.lock().emails.get(&id).cloned())
    }

    async fn delete_delivery(&self, id: DeliveryId) -> Result<()> {
        self.tables.lock().deliveries.remove(&id);
        Ok(())
    }

    async fn mark_delivered(&self, id: DeliveryId) -> Result<()> {
        let mut t = self.tables.lock();
        t.settle_delivery(id, DeliveryStatus::Sent)?;
        Ok(())
    }

    async fn requeue_delivery(&self, id: DeliveryId) -> Result<()> {
        let mut t = self.tables.lock();
        let d = t.settle_delivery(id, DeliveryStatus::Send)?;
        d.slot = None;
        d.failure_count += 1;
        Ok(())
    }

    async fn fail_delivery(&self, id: DeliveryId) -> Result<()> {
        let mut t = self.tables.lock();
        let d = t.settle_delivery(id, DeliveryStatus::Failed)?;
        d.failure_count += 1;
        Ok(())
    }

    async fn purge_finished_deliveries(&self, host: HostId) -> Result<u64> {
        let mut t = self.tables.lock();
        let done: Vec<(DeliveryId, EmailId)> = t
            .deliveries
            .values()
            .filter(|d| d.host == Some(host) && d.status == DeliveryStatus::Sent)
            .map(|d| (d.id, d.email_id))
            .collect();
        for (delivery, email) in &done {
            t.deliveries.remove(delivery);
            t.emails.remove(email);
        }
        Ok(done.len() as u64)
    }

    async fn delivery_backlog(&self) -> Result<Backlog> {
        let t = self.tables.lock();
        let mut backlog = Backlog::default();
        for d in t.deliveries.values() {
            match d.status {
                DeliveryStatus::Send => backlog.pending += 1,
                DeliveryStatus::Reserved => backlog.reserved += 1,
                DeliveryStatus::Sent => backlog.finished += 1,
                DeliveryStatus::Failed => backlog.failed += 1,
            }
        }
        Ok(backlog)
    }
}
