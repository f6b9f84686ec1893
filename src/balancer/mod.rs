//! Balancers: periodic jobs that hand pending work to hosts.
//!
//! A balancer run holds the stage's run lock for its whole duration, so two
//! invocations for the same stage never interleave. The second one sees the
//! lock and exits without touching anything.

pub mod send;
pub mod sort;

use serde::Serialize;
use uuid::Uuid;

pub use send::SendBalancer;
pub use sort::SortBalancer;

use crate::error::Result;
use crate::model::{CampaignId, HostId, Stage};
use crate::store::HostStore;

// ---------------------------------------------------------------------------
// Leveling
// ---------------------------------------------------------------------------

/// How many items one host receives this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allotment {
    pub host: HostId,
    pub depth: u64,
    pub allotment: u64,
}

/// Level host backlogs: every host is topped up to `max(depth) + batch_cap`.
///
/// The deepest host receives exactly `batch_cap`; the rest receive enough to
/// catch up with it. A host already deeper than the target receives nothing.
pub fn compute_allotments(depths: &[(HostId, u64)], batch_cap: u64) -> Vec<Allotment> {
    let max = depths.iter().map(|(_, d)| *d).max().unwrap_or(0);
    let target = max.saturating_add(batch_cap);
    depths
        .iter()
        .map(|&(host, depth)| Allotment {
            host,
            depth,
            allotment: target.saturating_sub(depth),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Run lock
// ---------------------------------------------------------------------------

/// Held run-level mutex for one stage.
///
/// Release is explicit; a crashed holder leaves the lock in place until an
/// operator removes it, like a stale lock file.
pub struct RunLock<'a, S: HostStore + ?Sized> {
    store: &'a S,
    stage: Stage,
    holder: String,
}

impl<'a, S: HostStore + ?Sized> RunLock<'a, S> {
    /// Try to take the lock. `None` when another run holds it.
    pub async fn acquire(store: &'a S, stage: Stage, holder: String) -> Result<Option<Self>> {
        if store.try_lock_run(stage, &holder).await? {
            Ok(Some(Self {
                store,
                stage,
                holder,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn release(self) -> Result<()> {
        self.store.unlock_run(self.stage, &self.holder).await
    }
}

/// Lock holder name: host, process and run.
pub fn lock_holder(host: &str, run_id: &Uuid) -> String {
    format!("{host}:{}:{run_id}", std::process::id())
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What one balancer run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BalanceReport {
    /// Items handed to hosts.
    pub reserved: u64,
    pub rounds: u32,
    pub hosts: usize,
    /// Campaigns closed by the terminal cleanup.
    pub finished_campaigns: Vec<CampaignId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RunOutcome {
    /// Another run held the lock. Nothing was done.
    Locked,
    Completed(BalanceReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_to_deepest_plus_cap() {
        let a = compute_allotments(&[(HostId(1), 100), (HostId(2), 250)], 1000);
        assert_eq!(a[0].allotment, 1150);
        assert_eq!(a[1].allotment, 1000);
        for x in &a {
            assert_eq!(x.depth + x.allotment, 1250);
        }
    }

    #[test]
    fn empty_fleet_gets_nothing() {
        assert!(compute_allotments(&[], 1000).is_empty());
    }

    #[test]
    fn never_negative() {
        let a = compute_allotments(&[(HostId(1), u64::MAX), (HostId(2), 0)], 10);
        assert_eq!(a[0].allotment, 0);
        assert_eq!(a[1].allotment, u64::MAX);
    }
}
