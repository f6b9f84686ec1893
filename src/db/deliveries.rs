//! Send-stage work items and their payloads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Db, count, limit};
use crate::error::{Error, Result};
use crate::model::{
    Backlog, CampaignId, Delivery, DeliveryId, Email, EmailId, HostId, Slot,
};
use crate::store::SendStore;

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    id: i64,
    email_id: i64,
    campaign_id: i64,
    status: String,
    host_id: Option<i64>,
    slot: Option<i32>,
    failure_count: i32,
    scheduled_at: Option<DateTime<Utc>>,
}

impl DeliveryRow {
    fn try_into_delivery(self) -> Result<Delivery> {
        Ok(Delivery {
            id: DeliveryId(self.id),
            email_id: EmailId(self.email_id),
            campaign_id: CampaignId(self.campaign_id),
            status: self.status.parse()?,
            host: self.host_id.map(HostId),
            slot: self.slot.and_then(|s| u32::try_from(s).ok()),
            failure_count: u32::try_from(self.failure_count).unwrap_or(0),
            scheduled_at: self.scheduled_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EmailRow {
    id: i64,
    campaign_id: i64,
    envelope_sender: String,
    recipient: String,
    header: String,
    body: String,
    is_hotmail: bool,
}

impl Db {
    /// Conditional single-row update from `reserved`.
    async fn settle_delivery(&self, id: DeliveryId, sql: &str, to: &str) -> Result<()> {
        let rows_affected = sqlx::query(sql)
            .bind(id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows_affected == 0 {
            return Err(Error::InvalidTransition {
                from: "reserved".to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SendStore for Db {
    async fn has_unassigned_deliveries(&self) -> Result<bool> {
        let (found,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM deliveries WHERE status = 'send' AND host_id IS NULL)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn assign_deliveries(&self, host: HostId, limit_to: u64) -> Result<u64> {
        let rows_affected = sqlx::query(
            "WITH picked AS (
                 SELECT id FROM deliveries
                 WHERE status = 'send' AND host_id IS NULL
                 ORDER BY scheduled_at ASC NULLS LAST, id
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE deliveries d SET host_id = $2
             FROM picked p
             WHERE d.id = p.id",
        )
        .bind(limit(limit_to))
        .bind(host.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected)
    }

    async fn count_due_deliveries(&self, host: HostId, horizon: DateTime<Utc>) -> Result<u64> {
        let (n,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM deliveries
             WHERE host_id = $1 AND status IN ('send', 'reserved')
               AND (scheduled_at IS NULL OR scheduled_at <= $2)",
        )
        .bind(host.0)
        .bind(horizon)
        .fetch_one(&self.pool)
        .await?;
        Ok(count(n))
    }

    async fn count_unpartitioned_deliveries(
        &self,
        host: HostId,
        horizon: DateTime<Utc>,
    ) -> Result<u64> {
        let (n,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM deliveries
             WHERE host_id = $1 AND status = 'send' AND slot IS NULL
               AND (scheduled_at IS NULL OR scheduled_at <= $2)",
        )
        .bind(host.0)
        .bind(horizon)
        .fetch_one(&self.pool)
        .await?;
        Ok(count(n))
    }

    async fn reserve_deliveries(
        &self,
        slot: Slot,
        horizon: DateTime<Utc>,
        limit_to: u64,
    ) -> Result<u64> {
        let rows_affected = sqlx::query(
            "WITH picked AS (
                 SELECT id FROM deliveries
                 WHERE host_id = $1 AND status = 'send' AND slot IS NULL
                   AND (scheduled_at IS NULL OR scheduled_at <= $2)
                 ORDER BY scheduled_at ASC NULLS LAST, id
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE deliveries d SET status = 'reserved', slot = $4
             FROM picked p
             WHERE d.id = p.id",
        )
        .bind(slot.host.0)
        .bind(horizon)
        .bind(limit(limit_to))
        .bind(i32::try_from(slot.index).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected)
    }

    async fn claim_deliveries(&self, slot: Slot, limit_to: u64) -> Result<Vec<Delivery>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(
            "SELECT id, email_id, campaign_id, status, host_id, slot, failure_count, scheduled_at
             FROM deliveries
             WHERE host_id = $1 AND slot = $2 AND status = 'reserved'
             ORDER BY scheduled_at ASC NULLS LAST, id
             LIMIT $3",
        )
        .bind(slot.host.0)
        .bind(i32::try_from(slot.index).unwrap_or(i32::MAX))
        .bind(limit(limit_to))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DeliveryRow::try_into_delivery).collect()
    }

    async fn email(&self, id: EmailId) -> Result<Option<Email>> {
        let row: Option<EmailRow> = sqlx::query_as(
            "SELECT id, campaign_id, envelope_sender, recipient, header, body, is_hotmail
             FROM emails WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Email {
            id: EmailId(r.id),
            campaign_id: CampaignId(r.campaign_id),
            envelope_sender: r.envelope_sender,
            recipient: r.recipient,
            header: r.header,
            body: r.body,
            is_hotmail: r.is_hotmail,
        }))
    }

    async fn delete_delivery(&self, id: DeliveryId) -> Result<()> {
        sqlx::query("DELETE FROM deliveries WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_delivered(&self, id: DeliveryId) -> Result<()> {
        self.settle_delivery(
            id,
            "UPDATE deliveries SET status = 'sent' WHERE id = $1 AND status = 'reserved'",
            "sent",
        )
        .await
    }

    async fn requeue_delivery(&self, id: DeliveryId) -> Result<()> {
        self.settle_delivery(
            id,
            "UPDATE deliveries SET status = 'send', slot = NULL, failure_count = failure_count + 1
             WHERE id = $1 AND status = 'reserved'",
            "send",
        )
        .await
    }

    async fn fail_delivery(&self, id: DeliveryId) -> Result<()> {
        self.settle_delivery(
            id,
            "UPDATE deliveries SET status = 'failed', failure_count = failure_count + 1
             WHERE id = $1 AND status = 'reserved'",
            "failed",
        )
        .await
    }

    async fn purge_finished_deliveries(&self, host: HostId) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let removed: Vec<(i64,)> = sqlx::query_as(
            "DELETE FROM deliveries WHERE host_id = $1 AND status = 'sent' RETURNING email_id",
        )
        .bind(host.0)
        .fetch_all(&mut *tx)
        .await?;
        let email_ids: Vec<i64> = removed.iter().map(|(id,)| *id).collect();
        sqlx::query("DELETE FROM emails WHERE id = ANY($1)")
            .bind(&email_ids)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(email_ids.len() as u64)
    }

    async fn delivery_backlog(&self) -> Result<Backlog> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM deliveries GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut backlog = Backlog::default();
        for (status, n) in rows {
            match status.as_str() {
                "send" => backlog.pending = count(n),
                "reserved" => backlog.reserved = count(n),
                "sent" => backlog.finished = count(n),
                "failed" => backlog.failed = count(n),
                _ => {}
            }
        }
        Ok(backlog)
    }
}
