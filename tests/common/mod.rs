//! Shared fixtures for the in-memory pipeline tests.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use mailq::model::{
    Campaign, CampaignId, CampaignStatus, DataField, EligibilityRules, FieldId, FooterLinkType,
    ListId, MailingList, NewEmail, Template, TemplateId, TemplateVariant, UserId,
};
use mailq::store::memory::MemoryStore;

pub const LIST: ListId = ListId(3);

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

pub fn list() -> MailingList {
    MailingList {
        id: LIST,
        name: "News".to_string(),
        footer_link_type: FooterLinkType::Unsubscribe,
        footer_link_text: "Unsubscribe".to_string(),
    }
}

pub fn campaign(id: i64, status: CampaignStatus) -> Campaign {
    Campaign {
        id: CampaignId(id),
        list_id: LIST,
        manager_id: UserId(1),
        status,
        variant: TemplateVariant::Initial,
        subject: "Weekly news".to_string(),
        subject_first_resend: "Reminder: weekly news".to_string(),
        subject_second_resend: "Last call: weekly news".to_string(),
        scheduled_at: Some(at(1_700_000_000)),
        rules: EligibilityRules::default(),
        nr_sent: 0,
        nr_failed: 0,
    }
}

pub fn template(campaign: i64, header: &str, body: &str) -> Template {
    Template {
        id: TemplateId(campaign * 10),
        campaign_id: CampaignId(campaign),
        variant: TemplateVariant::Initial,
        sender: "news@example.com".to_string(),
        header: header.to_string(),
        body: body.to_string(),
    }
}

pub fn field(id: i64, token: &str, default_value: &str) -> DataField {
    DataField {
        id: FieldId(id),
        list_id: LIST,
        name: token.to_string(),
        token: token.to_string(),
        default_value: default_value.to_string(),
        is_gender: false,
        is_birth_year: false,
    }
}

/// A store holding the list and one campaign with its initial template.
pub fn seeded(campaign: Campaign, header: &str, body: &str) -> MemoryStore {
    let store = MemoryStore::new();
    store.insert_list(list());
    store.insert_template(template(campaign.id.0, header, body));
    store.insert_campaign(campaign);
    store
}

pub fn email(campaign: i64, recipient: &str) -> NewEmail {
    NewEmail {
        campaign_id: CampaignId(campaign),
        envelope_sender: "Mailinglist System <3_7@mailbox.localhost>".to_string(),
        recipient: recipient.to_string(),
        header: "Subject: Weekly news".to_string(),
        body: "Hello".to_string(),
        is_hotmail: false,
        scheduled_at: Some(at(1_700_000_000)),
    }
}
