//! Core data model.
//!
//! Two stages share one store. The sort stage turns pending recipients into
//! personalized emails; the send stage delivers those emails. Every row that
//! moves through a stage carries a closed status enum (see [`status`]).

pub mod campaign;
pub mod status;
pub mod work;

pub use campaign::*;
pub use status::*;
pub use work::*;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(
    /// Newsletter campaign.
    CampaignId
);
row_id!(
    /// A recipient row pending personalization.
    RecipientId
);
row_id!(
    /// A personalized email payload.
    EmailId
);
row_id!(
    /// A delivery status row pointing at an email payload.
    DeliveryId
);
row_id!(
    /// A sort or send host.
    HostId
);
row_id!(UserId);
row_id!(ListId);
row_id!(TemplateId);
row_id!(FieldId);
row_id!(InterestId);

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// The two halves of the pipeline. Hosts, balancers and run locks are all
/// scoped to one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Personalization: recipients become emails.
    Sort,
    /// Delivery: emails go out through the mail transport.
    Send,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Sort => "sort",
            Stage::Send => "send",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sort" => Ok(Stage::Sort),
            "send" => Ok(Stage::Send),
            other => Err(crate::error::Error::Other(format!("unknown stage: {other}"))),
        }
    }
}
