//! Tag values and substitution.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::tags::{Builtin, TAG_PATTERN, Tag, TagKind};
use crate::config::LinkSettings;
use crate::model::{Campaign, FieldId, MailingList, Recipient};

/// Everything a tag may render from, for one recipient.
pub struct RenderContext<'a> {
    pub recipient: &'a Recipient,
    pub campaign: &'a Campaign,
    pub list: &'a MailingList,
    pub links: &'a LinkSettings,
    /// The recipient's stored data field values.
    pub values: &'a HashMap<FieldId, String>,
    /// Start of the sort run. Feeds `[date]` and `[identifier]`.
    pub timestamp: DateTime<Utc>,
    pub envelope_sender: &'a str,
    pub recipient_address: &'a str,
}

/// `Mailinglist System <{list}_{user}@{mailbox}>`.
pub fn envelope_sender(list: &MailingList, recipient: &Recipient, links: &LinkSettings) -> String {
    format!(
        "Mailinglist System <{}_{}@{}>",
        list.id, recipient.user_id, links.mailbox_domain
    )
}

/// `Name <email>`, or the bare address when the recipient has no name.
pub fn recipient_address(recipient: &Recipient) -> String {
    if recipient.name.is_empty() {
        recipient.email.clone()
    } else {
        format!("{} <{}>", recipient.name, recipient.email)
    }
}

/// Unique per recipient and run: `{campaign}_{user}_{timestamp}{user}`.
pub fn identifier(campaign: &Campaign, recipient: &Recipient, timestamp: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}{}",
        campaign.id,
        recipient.user_id,
        timestamp.timestamp(),
        recipient.user_id
    )
}

fn gender_word(value: String, danish: bool) -> String {
    if !danish {
        return value;
    }
    match value.as_str() {
        "male" => "mand".to_string(),
        "female" => "kvinde".to_string(),
        _ => value,
    }
}

fn admin_url(ctx: &RenderContext<'_>) -> Option<String> {
    let action = ctx.list.footer_link_type.action()?;
    Some(format!(
        "{}/mailinglist/{action}/id/{}/userId/{}/externalPass/{}",
        ctx.links.userservice(ctx.recipient.is_danish()),
        ctx.list.id,
        ctx.recipient.user_id,
        ctx.recipient.external_pass
    ))
}

fn letter_url(ctx: &RenderContext<'_>) -> String {
    format!(
        "{}/newsletter/show/id/{}",
        ctx.links.letter_url(ctx.recipient.is_danish()),
        ctx.campaign.id
    )
}

/// Value of one tag for the recipient in `ctx`.
pub fn resolve(tag: &Tag, ctx: &RenderContext<'_>) -> String {
    let danish = ctx.recipient.is_danish();
    match &tag.kind {
        TagKind::Field(field) => {
            let value = ctx
                .values
                .get(&field.id)
                .cloned()
                .unwrap_or_else(|| field.default_value.clone());
            if field.is_gender {
                gender_word(value, danish)
            } else {
                value
            }
        }
        TagKind::Builtin(builtin) => match builtin {
            Builtin::Name { fallback } => {
                if ctx.recipient.name.is_empty() {
                    fallback.clone()
                } else {
                    ctx.recipient.name.clone()
                }
            }
            Builtin::Email => ctx.recipient.email.clone(),
            Builtin::ListName => ctx.list.name.clone(),
            Builtin::AdminUrl => admin_url(ctx).unwrap_or_default(),
            Builtin::AdminLink => admin_url(ctx)
                .map(|url| format!("<a href=\"{url}\">{}</a>", ctx.list.footer_link_text))
                .unwrap_or_default(),
            Builtin::Date => {
                let format = if danish { "%d/%m-%Y" } else { "%Y-%m-%d" };
                ctx.timestamp.format(format).to_string()
            }
            Builtin::UserId => ctx.recipient.user_id.to_string(),
            Builtin::ExternalPass => ctx.recipient.external_pass.clone(),
            Builtin::Recipient => ctx.recipient_address.to_string(),
            Builtin::EnvelopeSender => ctx.envelope_sender.to_string(),
            Builtin::Identifier => identifier(ctx.campaign, ctx.recipient, ctx.timestamp),
            Builtin::LetterUrl => letter_url(ctx),
            Builtin::LetterLink => {
                let url = letter_url(ctx);
                format!("<a href=\"{url}\">{url}</a>")
            }
            Builtin::Subject => ctx.campaign.subject().to_string(),
            Builtin::Unknown => String::new(),
        },
    }
}

/// Replace every tag in `text` by its value, matching case-insensitively.
///
/// Runs in one pass, so values containing brackets are never re-expanded.
/// Tags with no entry in `values` are left as written.
pub fn substitute(text: &str, values: &HashMap<String, String>) -> String {
    TAG_PATTERN
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let raw = &caps[0];
            values
                .get(&raw.to_lowercase())
                .cloned()
                .unwrap_or_else(|| raw.to_string())
        })
        .into_owned()
}
