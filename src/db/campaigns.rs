//! Campaigns, templates, lists and recipient reference data.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Db, count};
use crate::error::{Error, Result};
use crate::model::{
    Campaign, CampaignId, CampaignStatus, DataField, EligibilityRules, FieldId, InterestId,
    Limits, ListId, MailingList, RangeLimit, Template, TemplateId, TemplateVariant, UserId,
};
use crate::store::CampaignStore;

fn validate_transition(from: CampaignStatus, to: CampaignStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct CampaignRow {
    id: i64,
    list_id: i64,
    manager_id: i64,
    status: String,
    variant: String,
    subject: String,
    subject_first_resend: String,
    subject_second_resend: String,
    scheduled_at: Option<DateTime<Utc>>,
    use_limits: bool,
    from_zipcode: Option<i64>,
    to_zipcode: Option<i64>,
    include_empty_zipcodes: bool,
    from_birth_year: Option<i64>,
    to_birth_year: Option<i64>,
    include_empty_birth_years: bool,
    gender: Option<String>,
    include_empty_genders: bool,
    nr_sent: i64,
    nr_failed: i64,
}

const CAMPAIGN_COLUMNS: &str = "id, list_id, manager_id, status, variant, subject, \
     subject_first_resend, subject_second_resend, scheduled_at, use_limits, from_zipcode, \
     to_zipcode, include_empty_zipcodes, from_birth_year, to_birth_year, \
     include_empty_birth_years, gender, include_empty_genders, nr_sent, nr_failed";

fn range(from: Option<i64>, to: Option<i64>) -> Option<RangeLimit> {
    match (from, to) {
        (Some(from), Some(to)) => Some(RangeLimit { from, to }),
        _ => None,
    }
}

impl CampaignRow {
    fn try_into_campaign(self, interests: Vec<InterestId>) -> Result<Campaign> {
        let limits = self.use_limits.then(|| Limits {
            zipcode: range(self.from_zipcode, self.to_zipcode),
            include_empty_zipcodes: self.include_empty_zipcodes,
            birth_year: range(self.from_birth_year, self.to_birth_year),
            include_empty_birth_years: self.include_empty_birth_years,
            gender: self.gender,
            include_empty_genders: self.include_empty_genders,
        });
        Ok(Campaign {
            id: CampaignId(self.id),
            list_id: ListId(self.list_id),
            manager_id: UserId(self.manager_id),
            status: self.status.parse()?,
            variant: self.variant.parse()?,
            subject: self.subject,
            subject_first_resend: self.subject_first_resend,
            subject_second_resend: self.subject_second_resend,
            scheduled_at: self.scheduled_at,
            rules: EligibilityRules { interests, limits },
            nr_sent: count(self.nr_sent),
            nr_failed: count(self.nr_failed),
        })
    }
}

#[derive(sqlx::FromRow)]
struct TemplateRow {
    id: i64,
    campaign_id: i64,
    variant: String,
    sender: String,
    header: String,
    body: String,
}

#[derive(sqlx::FromRow)]
struct DataFieldRow {
    id: i64,
    list_id: i64,
    name: String,
    token: String,
    default_value: String,
    is_gender: bool,
    is_birth_year: bool,
}

impl Db {
    async fn campaign_interests(&self, id: CampaignId) -> Result<Vec<InterestId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT interest_id FROM campaign_interests WHERE campaign_id = $1 ORDER BY interest_id",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(i,)| InterestId(i)).collect())
    }

    async fn load_campaign(&self, row: CampaignRow) -> Result<Campaign> {
        let interests = self.campaign_interests(CampaignId(row.id)).await?;
        row.try_into_campaign(interests)
    }
}

#[async_trait]
impl CampaignStore for Db {
    async fn delegatable_campaigns(&self) -> Result<Vec<Campaign>> {
        let rows: Vec<CampaignRow> = sqlx::query_as(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns
             WHERE status IN ('delegate', 'delegating')
             ORDER BY scheduled_at ASC NULLS LAST, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(self.load_campaign(row).await?);
        }
        Ok(out)
    }

    async fn campaign(&self, id: CampaignId) -> Result<Campaign> {
        let row: Option<CampaignRow> = sqlx::query_as(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        let row = row.ok_or_else(|| Error::NotFound(format!("campaign {id}")))?;
        self.load_campaign(row).await
    }

    async fn transition_campaign(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<bool> {
        validate_transition(from, to)?;
        let rows_affected = sqlx::query(
            "UPDATE campaigns SET status = $1, updated_at = now() WHERE id = $2 AND status = $3",
        )
        .bind(to.as_str())
        .bind(id.0)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    async fn record_delivery_stats(&self, id: CampaignId, sent: u64, failed: u64) -> Result<()> {
        sqlx::query(
            "UPDATE campaigns SET nr_sent = nr_sent + $1, nr_failed = nr_failed + $2, updated_at = now()
             WHERE id = $3",
        )
        .bind(super::limit(sent))
        .bind(super::limit(failed))
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn template(
        &self,
        campaign: CampaignId,
        variant: TemplateVariant,
    ) -> Result<Option<Template>> {
        let row: Option<TemplateRow> = sqlx::query_as(
            "SELECT id, campaign_id, variant, sender, header, body FROM templates
             WHERE campaign_id = $1 AND variant = $2",
        )
        .bind(campaign.0)
        .bind(variant.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(Template {
                id: TemplateId(r.id),
                campaign_id: CampaignId(r.campaign_id),
                variant: r.variant.parse()?,
                sender: r.sender,
                header: r.header,
                body: r.body,
            })
        })
        .transpose()
    }

    async fn mark_template_sent(&self, id: TemplateId) -> Result<()> {
        sqlx::query("UPDATE templates SET sent = true WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mailing_list(&self, id: ListId) -> Result<MailingList> {
        let row: Option<(i64, String, String, String)> = sqlx::query_as(
            "SELECT id, name, footer_link_type, footer_link_text FROM mailing_lists WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        let (id, name, link_type, link_text) =
            row.ok_or_else(|| Error::NotFound(format!("mailing list {id}")))?;
        Ok(MailingList {
            id: ListId(id),
            name,
            footer_link_type: link_type.parse()?,
            footer_link_text: link_text,
        })
    }

    async fn data_fields(&self, list: ListId) -> Result<Vec<DataField>> {
        let rows: Vec<DataFieldRow> = sqlx::query_as(
            "SELECT id, list_id, name, token, default_value, is_gender, is_birth_year
             FROM data_fields WHERE list_id = $1 ORDER BY id",
        )
        .bind(list.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| DataField {
                id: FieldId(r.id),
                list_id: ListId(r.list_id),
                name: r.name,
                token: r.token,
                default_value: r.default_value,
                is_gender: r.is_gender,
                is_birth_year: r.is_birth_year,
            })
            .collect())
    }

    async fn data_field_values(&self, user: UserId) -> Result<HashMap<FieldId, String>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT field_id, value FROM data_field_values WHERE user_id = $1")
                .bind(user.0)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(field, value)| (FieldId(field), value))
            .collect())
    }

    async fn user_interests(&self, user: UserId) -> Result<HashSet<InterestId>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT interest_id FROM user_interests WHERE user_id = $1")
                .bind(user.0)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(i,)| InterestId(i)).collect())
    }

    async fn drained_campaigns(&self) -> Result<Vec<CampaignId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT c.id FROM campaigns c
             WHERE c.status IN ('send', 'sending')
               AND NOT EXISTS (
                   SELECT 1 FROM recipients r
                   WHERE r.campaign_id = c.id AND r.status IN ('delegate', 'reserved'))
               AND NOT EXISTS (
                   SELECT 1 FROM deliveries d
                   WHERE d.campaign_id = c.id AND d.status IN ('send', 'reserved'))
             ORDER BY c.id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| CampaignId(id)).collect())
    }

    async fn finish_campaign(&self, id: CampaignId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let rows_affected = sqlx::query(
            "UPDATE campaigns SET status = 'complete', updated_at = now()
             WHERE id = $1 AND status IN ('send', 'sending')",
        )
        .bind(id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if rows_affected == 0 {
            return Err(Error::InvalidTransition {
                from: "send|sending".to_string(),
                to: CampaignStatus::Complete.to_string(),
            });
        }

        sqlx::query("DELETE FROM deliveries WHERE campaign_id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM emails WHERE campaign_id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM recipients WHERE campaign_id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
