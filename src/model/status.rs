//! Closed status enums and their transition tables.
//!
//! Every status is stored as lowercase text. The text values are the ones the
//! rest of the newsletter system reads, so they must not change.

use serde::{Deserialize, Serialize};

use crate::error::Error;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::Other(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Sort stage
// ---------------------------------------------------------------------------

/// Status of a recipient awaiting personalization.
///
/// Ineligible recipients are deleted outright, so "removed" has no variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    /// Pending: waiting for the sort balancer.
    Delegate,
    /// Reserved to a sort host.
    Reserved,
    /// Personalized; an email exists for it.
    Sent,
}

text_enum!(RecipientStatus {
    Delegate => "delegate",
    Reserved => "reserved",
    Sent => "sent",
});

impl RecipientStatus {
    pub fn can_transition_to(self, to: RecipientStatus) -> bool {
        use RecipientStatus::*;
        matches!((self, to), (Delegate, Reserved) | (Reserved, Sent))
    }

    pub fn is_terminal(self) -> bool {
        self == RecipientStatus::Sent
    }
}

// ---------------------------------------------------------------------------
// Send stage
// ---------------------------------------------------------------------------

/// Status of an email awaiting delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Pending. May or may not be assigned to a host yet.
    Send,
    /// Reserved to one worker slot on its host.
    Reserved,
    /// Delivered.
    Sent,
    /// Gave up after too many attempts.
    Failed,
}

text_enum!(DeliveryStatus {
    Send => "send",
    Reserved => "reserved",
    Sent => "sent",
    Failed => "failed",
});

impl DeliveryStatus {
    pub fn can_transition_to(self, to: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, to),
            (Send, Reserved)
                | (Reserved, Sent)
                | (Reserved, Send)   // retry
                | (Reserved, Failed) // retries exhausted
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Sent | DeliveryStatus::Failed)
    }

    /// Where a failed attempt goes, given the failures recorded before it.
    ///
    /// With `max_failures = 3` an email is attempted three times: the first two
    /// failures return it to `Send`, the third marks it `Failed`.
    pub fn after_failure(failure_count: u32, max_failures: u32) -> DeliveryStatus {
        if failure_count < max_failures.saturating_sub(1) {
            DeliveryStatus::Send
        } else {
            DeliveryStatus::Failed
        }
    }
}

// ---------------------------------------------------------------------------
// Campaign
// ---------------------------------------------------------------------------

/// Campaign lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    /// Recipients are pending personalization.
    Delegate,
    /// Sort hosts are personalizing recipients.
    Delegating,
    /// Fully personalized, nothing delivered yet.
    Send,
    /// Fully personalized, at least one email delivered.
    Sending,
    /// Every recipient and every email reached a terminal status.
    Complete,
}

text_enum!(CampaignStatus {
    Draft => "draft",
    Delegate => "delegate",
    Delegating => "delegating",
    Send => "send",
    Sending => "sending",
    Complete => "complete",
});

impl CampaignStatus {
    pub fn can_transition_to(self, to: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, to),
            (Draft, Delegate)
                | (Delegate, Delegating)
                | (Delegating, Send)
                | (Delegating, Sending)
                | (Send, Sending)
                | (Send, Complete)
                | (Sending, Complete)
                | (Complete, Delegate) // resend with the next template variant
        )
    }

    /// Statuses the sort stage works on.
    pub fn is_sortable(self) -> bool {
        matches!(self, CampaignStatus::Delegate | CampaignStatus::Delegating)
    }

    /// Status a fully personalized campaign moves to.
    pub fn after_sorting(nr_sent: u64) -> CampaignStatus {
        if nr_sent > 0 {
            CampaignStatus::Sending
        } else {
            CampaignStatus::Send
        }
    }
}

/// Which subject/template a campaign pass uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateVariant {
    Initial,
    FirstResend,
    SecondResend,
}

text_enum!(TemplateVariant {
    Initial => "send",
    FirstResend => "first_resend",
    SecondResend => "second_resend",
});

// ---------------------------------------------------------------------------
// Hosts
// ---------------------------------------------------------------------------

/// Operational status of a sort or send host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Available,
    Busy,
    /// Set by an operator.
    Disabled,
    /// Set by the balancer when the host could not accept work.
    Failed,
    Unreachable,
}

text_enum!(HostStatus {
    Available => "available",
    Busy => "busy",
    Disabled => "disabled",
    Failed => "failed",
    Unreachable => "unreachable",
});

impl HostStatus {
    /// Blocking statuses are sticky; only an operator clears them.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            HostStatus::Disabled | HostStatus::Failed | HostStatus::Unreachable
        )
    }

    pub fn can_transition_to(self, to: HostStatus) -> bool {
        if self.is_blocking() {
            return self == to;
        }
        // available <-> busy, and any working state may be blocked
        true
    }

    /// Statuses from which `to` may be entered. Used for conditional updates.
    pub fn sources_for(to: HostStatus) -> Vec<HostStatus> {
        HostStatus::ALL
            .iter()
            .copied()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_bound() {
        assert_eq!(DeliveryStatus::after_failure(0, 3), DeliveryStatus::Send);
        assert_eq!(DeliveryStatus::after_failure(1, 3), DeliveryStatus::Send);
        assert_eq!(DeliveryStatus::after_failure(2, 3), DeliveryStatus::Failed);
        assert_eq!(DeliveryStatus::after_failure(0, 1), DeliveryStatus::Failed);
    }

    #[test]
    fn blocking_host_status_is_sticky() {
        assert!(!HostStatus::Disabled.can_transition_to(HostStatus::Available));
        assert!(!HostStatus::Failed.can_transition_to(HostStatus::Busy));
        assert!(HostStatus::Busy.can_transition_to(HostStatus::Disabled));
        assert_eq!(
            HostStatus::sources_for(HostStatus::Available),
            vec![HostStatus::Available, HostStatus::Busy]
        );
    }

    #[test]
    fn text_round_trip_uses_wire_names() {
        assert_eq!(TemplateVariant::Initial.as_str(), "send");
        assert_eq!(
            "first_resend".parse::<TemplateVariant>().unwrap(),
            TemplateVariant::FirstResend
        );
        assert!("bogus".parse::<CampaignStatus>().is_err());
    }
}
