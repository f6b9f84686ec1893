//! Sort-stage work items.

use async_trait::async_trait;

use super::{Db, count, limit};
use crate::error::{Error, Result};
use crate::model::{
    Backlog, CampaignId, EmailId, HostId, NewEmail, Recipient, RecipientId, Slot, UserId,
};
use crate::store::SortStore;

#[derive(sqlx::FromRow)]
struct RecipientRow {
    id: i64,
    campaign_id: i64,
    user_id: i64,
    name: String,
    email: String,
    is_hotmail: bool,
    locale: String,
    external_pass: String,
    status: String,
    host_id: Option<i64>,
    slot: Option<i32>,
}

impl RecipientRow {
    fn try_into_recipient(self) -> Result<Recipient> {
        Ok(Recipient {
            id: RecipientId(self.id),
            campaign_id: CampaignId(self.campaign_id),
            user_id: UserId(self.user_id),
            name: self.name,
            email: self.email,
            is_hotmail: self.is_hotmail,
            locale: self.locale,
            external_pass: self.external_pass,
            status: self.status.parse()?,
            host: self.host_id.map(HostId),
            slot: self.slot.and_then(|s| u32::try_from(s).ok()),
        })
    }
}

fn slot_index(slot: Slot) -> i32 {
    i32::try_from(slot.index).unwrap_or(i32::MAX)
}

#[async_trait]
impl SortStore for Db {
    async fn has_pending_recipients(&self, campaign: Option<CampaignId>) -> Result<bool> {
        let (found,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (
                 SELECT 1 FROM recipients
                 WHERE status = 'delegate' AND ($1::BIGINT IS NULL OR campaign_id = $1))",
        )
        .bind(campaign.map(|c| c.0))
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn reserve_recipients(
        &self,
        campaign: CampaignId,
        host: HostId,
        limit_to: u64,
    ) -> Result<u64> {
        // One statement: concurrent balancers skip rows the other has locked.
        let rows_affected = sqlx::query(
            "WITH picked AS (
                 SELECT id FROM recipients
                 WHERE campaign_id = $1 AND status = 'delegate'
                 ORDER BY id
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE recipients r
             SET status = 'reserved', host_id = $3, slot = NULL
             FROM picked p
             WHERE r.id = p.id",
        )
        .bind(campaign.0)
        .bind(limit(limit_to))
        .bind(host.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected)
    }

    async fn count_unpartitioned_recipients(&self, host: HostId) -> Result<u64> {
        let (n,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM recipients
             WHERE host_id = $1 AND status = 'reserved' AND slot IS NULL",
        )
        .bind(host.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count(n))
    }

    async fn partition_recipients(&self, slot: Slot, limit_to: u64) -> Result<u64> {
        let rows_affected = sqlx::query(
            "WITH picked AS (
                 SELECT id FROM recipients
                 WHERE host_id = $1 AND status = 'reserved' AND slot IS NULL
                 ORDER BY id
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE recipients r SET slot = $3
             FROM picked p
             WHERE r.id = p.id",
        )
        .bind(slot.host.0)
        .bind(limit(limit_to))
        .bind(slot_index(slot))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected)
    }

    async fn claim_recipients(&self, slot: Slot, limit_to: u64) -> Result<Vec<Recipient>> {
        let rows: Vec<RecipientRow> = sqlx::query_as(
            "SELECT r.id, r.campaign_id, r.user_id, r.name, r.email, r.is_hotmail, r.locale,
                    r.external_pass, r.status, r.host_id, r.slot
             FROM recipients r
             JOIN campaigns c ON c.id = r.campaign_id
             WHERE r.host_id = $1 AND r.slot = $2 AND r.status = 'reserved'
             ORDER BY c.scheduled_at ASC NULLS LAST, r.id
             LIMIT $3",
        )
        .bind(slot.host.0)
        .bind(slot_index(slot))
        .bind(limit(limit_to))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(RecipientRow::try_into_recipient)
            .collect()
    }

    async fn remove_recipient(&self, id: RecipientId) -> Result<()> {
        sqlx::query("DELETE FROM recipients WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete_recipient(&self, id: RecipientId, email: NewEmail) -> Result<EmailId> {
        let mut tx = self.pool.begin().await?;

        let rows_affected = sqlx::query(
            "UPDATE recipients SET status = 'sent' WHERE id = $1 AND status = 'reserved'",
        )
        .bind(id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if rows_affected == 0 {
            return Err(Error::InvalidTransition {
                from: "reserved".to_string(),
                to: "sent".to_string(),
            });
        }

        let (email_id,): (i64,) = sqlx::query_as(
            "INSERT INTO emails (campaign_id, envelope_sender, recipient, header, body, is_hotmail)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(email.campaign_id.0)
        .bind(&email.envelope_sender)
        .bind(&email.recipient)
        .bind(&email.header)
        .bind(&email.body)
        .bind(email.is_hotmail)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO deliveries (email_id, campaign_id, status, scheduled_at)
             VALUES ($1, $2, 'send', $3)",
        )
        .bind(email_id)
        .bind(email.campaign_id.0)
        .bind(email.scheduled_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(EmailId(email_id))
    }

    async fn campaign_fully_sorted(&self, campaign: CampaignId) -> Result<bool> {
        let (open,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (
                 SELECT 1 FROM recipients
                 WHERE campaign_id = $1 AND status IN ('delegate', 'reserved'))",
        )
        .bind(campaign.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(!open)
    }

    async fn recipient_depth(&self, host: HostId) -> Result<u64> {
        let (n,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM recipients WHERE host_id = $1 AND status = 'reserved'",
        )
        .bind(host.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count(n))
    }

    async fn purge_sorted_recipients(&self, host: HostId) -> Result<u64> {
        let rows_affected =
            sqlx::query("DELETE FROM recipients WHERE host_id = $1 AND status = 'sent'")
                .bind(host.0)
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(rows_affected)
    }

    async fn recipient_backlog(&self) -> Result<Backlog> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM recipients GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut backlog = Backlog::default();
        for (status, n) in rows {
            match status.as_str() {
                "delegate" => backlog.pending = count(n),
                "reserved" => backlog.reserved = count(n),
                "sent" => backlog.finished = count(n),
                _ => {}
            }
        }
        Ok(backlog)
    }
}
