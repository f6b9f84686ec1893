//! Personalization engine.
//!
//! A [`CampaignPlan`] is built once per campaign per sort run: it holds the
//! template, its classified tags and the limit fields. Each recipient is then
//! checked for eligibility and rendered against the plan.

pub mod eligibility;
pub mod resolve;
pub mod tags;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

pub use eligibility::{Eligibility, LimitFields, Reason};
pub use resolve::{RenderContext, substitute};
pub use tags::{Builtin, Tag, TagKind, collect_tags, find_tags, match_tags};

use crate::config::LinkSettings;
use crate::error::{Error, Result};
use crate::model::{
    Campaign, CampaignId, FieldId, InterestId, MailingList, NewEmail, Recipient, Template,
};
use crate::store::CampaignStore;

/// Result of personalizing one recipient.
#[derive(Debug, Clone, PartialEq)]
pub enum Personalized {
    Email(NewEmail),
    Ineligible(Reason),
}

/// Per-campaign rendering state.
#[derive(Debug, Clone)]
pub struct CampaignPlan {
    pub campaign: Campaign,
    pub template: Template,
    pub list: MailingList,
    pub tags: Vec<Tag>,
    pub limit_fields: LimitFields,
    links: LinkSettings,
    timestamp: DateTime<Utc>,
}

impl CampaignPlan {
    /// Load the campaign's active template, list and fields.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the campaign has no template for its variant.
    pub async fn load<S: CampaignStore + ?Sized>(
        store: &S,
        campaign: CampaignId,
        links: &LinkSettings,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        let campaign = store.campaign(campaign).await?;
        let template = store
            .template(campaign.id, campaign.variant)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "{} template for campaign {}",
                    campaign.variant, campaign.id
                ))
            })?;
        let list = store.mailing_list(campaign.list_id).await?;
        let fields = store.data_fields(campaign.list_id).await?;

        if campaign.scheduled_at.is_none() {
            tracing::warn!(
                campaign = %campaign.id,
                "campaign has no send time, emails will be ordered last"
            );
        }

        let found = collect_tags(&[&template.header, &template.body]);
        let tags = match_tags(&found, &fields);
        let limit_fields = LimitFields::from_fields(&fields);

        Ok(Self {
            campaign,
            template,
            list,
            tags,
            limit_fields,
            links: links.clone(),
            timestamp,
        })
    }

    pub fn evaluate(
        &self,
        interests: &HashSet<InterestId>,
        values: &HashMap<FieldId, String>,
    ) -> Eligibility {
        eligibility::evaluate(&self.campaign.rules, &self.limit_fields, interests, values)
    }

    /// Render the template for one recipient.
    pub fn render(&self, recipient: &Recipient, values: &HashMap<FieldId, String>) -> NewEmail {
        let envelope_sender = resolve::envelope_sender(&self.list, recipient, &self.links);
        let recipient_address = resolve::recipient_address(recipient);
        let ctx = RenderContext {
            recipient,
            campaign: &self.campaign,
            list: &self.list,
            links: &self.links,
            values,
            timestamp: self.timestamp,
            envelope_sender: &envelope_sender,
            recipient_address: &recipient_address,
        };
        let resolved: HashMap<String, String> = self
            .tags
            .iter()
            .map(|tag| (tag.key.clone(), resolve::resolve(tag, &ctx)))
            .collect();

        NewEmail {
            campaign_id: self.campaign.id,
            header: substitute(&self.template.header, &resolved),
            body: substitute(&self.template.body, &resolved),
            envelope_sender,
            recipient: recipient_address,
            is_hotmail: recipient.is_hotmail,
            scheduled_at: self.campaign.scheduled_at,
        }
    }

    /// Check eligibility and render, reading the recipient's data from `store`.
    pub async fn personalize<S: CampaignStore + ?Sized>(
        &self,
        store: &S,
        recipient: &Recipient,
    ) -> Result<Personalized> {
        let values = store.data_field_values(recipient.user_id).await?;
        let interests = if self.campaign.rules.interests.is_empty() {
            HashSet::new()
        } else {
            store.user_interests(recipient.user_id).await?
        };
        Ok(match self.evaluate(&interests, &values) {
            Eligibility::Eligible => Personalized::Email(self.render(recipient, &values)),
            Eligibility::Ineligible(reason) => Personalized::Ineligible(reason),
        })
    }
}
