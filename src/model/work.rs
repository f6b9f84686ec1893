use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    CampaignId, DeliveryId, DeliveryStatus, EmailId, HostId, HostStatus, RecipientId,
    RecipientStatus, Stage, UserId,
};

// ---------------------------------------------------------------------------
// Ownership
// ---------------------------------------------------------------------------

/// A worker identity: one task slot on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub host: HostId,
    pub index: u32,
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.host, self.index)
    }
}

/// A registered sort or send host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub stage: Stage,
    pub name: String,
    pub status: HostStatus,
    /// Backlog gauge written by the host's workers, read by the balancer.
    pub queue_depth: u64,
}

// ---------------------------------------------------------------------------
// Sort stage
// ---------------------------------------------------------------------------

/// A recipient pending personalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub campaign_id: CampaignId,
    pub user_id: UserId,
    pub name: String,
    pub email: String,
    pub is_hotmail: bool,
    /// Culture code of the recipient, e.g. `da`.
    pub locale: String,
    pub external_pass: String,
    pub status: RecipientStatus,
    pub host: Option<HostId>,
    pub slot: Option<u32>,
}

impl Recipient {
    pub fn is_danish(&self) -> bool {
        self.locale == "da"
    }
}

// ---------------------------------------------------------------------------
// Send stage
// ---------------------------------------------------------------------------

/// A personalized email, produced by the sort stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEmail {
    pub campaign_id: CampaignId,
    pub envelope_sender: String,
    pub recipient: String,
    pub header: String,
    pub body: String,
    pub is_hotmail: bool,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// A stored email payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Email {
    pub id: EmailId,
    pub campaign_id: CampaignId,
    pub envelope_sender: String,
    pub recipient: String,
    pub header: String,
    pub body: String,
    pub is_hotmail: bool,
}

/// Delivery status row. Points at an [`Email`] payload that may have vanished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub email_id: EmailId,
    pub campaign_id: CampaignId,
    pub status: DeliveryStatus,
    pub host: Option<HostId>,
    pub slot: Option<u32>,
    pub failure_count: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// Open work left in the store, per stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backlog {
    pub pending: u64,
    pub reserved: u64,
    pub finished: u64,
    pub failed: u64,
}
