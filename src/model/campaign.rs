use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    CampaignId, CampaignStatus, FieldId, InterestId, ListId, TemplateId, TemplateVariant, UserId,
};

// ---------------------------------------------------------------------------
// Campaign
// ---------------------------------------------------------------------------

/// A newsletter send job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub list_id: ListId,
    pub manager_id: UserId,
    pub status: CampaignStatus,
    /// Which pass this is: the initial send or one of the resends.
    pub variant: TemplateVariant,
    pub subject: String,
    pub subject_first_resend: String,
    pub subject_second_resend: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub rules: EligibilityRules,
    pub nr_sent: u64,
    pub nr_failed: u64,
}

impl Campaign {
    /// Subject line for the active variant.
    pub fn subject(&self) -> &str {
        match self.variant {
            TemplateVariant::Initial => &self.subject,
            TemplateVariant::FirstResend => &self.subject_first_resend,
            TemplateVariant::SecondResend => &self.subject_second_resend,
        }
    }
}

/// Inclusion rules a recipient must pass before an email is produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EligibilityRules {
    /// When non-empty, a recipient must hold at least one of these interests.
    pub interests: Vec<InterestId>,
    /// `None` when the campaign does not use limits.
    pub limits: Option<Limits>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Limits {
    pub zipcode: Option<RangeLimit>,
    pub include_empty_zipcodes: bool,
    pub birth_year: Option<RangeLimit>,
    pub include_empty_birth_years: bool,
    pub gender: Option<String>,
    pub include_empty_genders: bool,
}

/// Inclusive numeric range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeLimit {
    pub from: i64,
    pub to: i64,
}

impl RangeLimit {
    pub fn contains(&self, value: i64) -> bool {
        value >= self.from && value <= self.to
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub campaign_id: CampaignId,
    pub variant: TemplateVariant,
    pub sender: String,
    /// Raw mail header block, tags included.
    pub header: String,
    pub body: String,
}

// ---------------------------------------------------------------------------
// Mailing list & data fields
// ---------------------------------------------------------------------------

/// Which self-service page the footer link of a list points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FooterLinkType {
    Unsubscribe,
    Admin,
    /// No footer link; admin tags render empty.
    None,
}

impl FooterLinkType {
    /// Path segment of the user service URL.
    pub fn action(self) -> Option<&'static str> {
        match self {
            FooterLinkType::Unsubscribe => Some("unsubscribeExternal"),
            FooterLinkType::Admin => Some("adminExternal"),
            FooterLinkType::None => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FooterLinkType::Unsubscribe => "unsubscribe",
            FooterLinkType::Admin => "admin",
            FooterLinkType::None => "none",
        }
    }
}

impl std::str::FromStr for FooterLinkType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsubscribe" => Ok(FooterLinkType::Unsubscribe),
            "admin" => Ok(FooterLinkType::Admin),
            "none" | "" => Ok(FooterLinkType::None),
            other => Err(crate::error::Error::Other(format!(
                "unknown footer link type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailingList {
    pub id: ListId,
    pub name: String,
    pub footer_link_type: FooterLinkType,
    pub footer_link_text: String,
}

/// A per-list recipient attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataField {
    pub id: FieldId,
    pub list_id: ListId,
    pub name: String,
    /// Text between the brackets of the tag that renders this field.
    pub token: String,
    pub default_value: String,
    pub is_gender: bool,
    pub is_birth_year: bool,
}

impl DataField {
    /// The field zipcode limits are evaluated against.
    pub fn is_zipcode(&self) -> bool {
        !self.is_gender && !self.is_birth_year && self.token == "zipcode"
    }
}
