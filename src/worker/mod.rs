//! Worker side of the pipeline.
//!
//! A host runs a [`Fleet`]: it takes the host's availability gate, splits the
//! host's reserved backlog across its slots, runs one worker task per slot and
//! finally drains finished rows and hands the gate back.

pub mod fleet;
pub mod gate;
pub mod send;
pub mod sort;

use std::ops::AddAssign;

use serde::Serialize;

pub use fleet::{Fleet, FleetReport};
pub use gate::HostGate;
pub use send::SendWorker;
pub use sort::SortWorker;

use crate::config::PipelineSettings;
use crate::model::Slot;

/// Knobs shared by all workers of a fleet.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: u64,
    pub max_failures: u32,
    pub processes: u32,
    pub due_window: chrono::Duration,
}

impl WorkerSettings {
    pub fn from_pipeline(pipeline: &PipelineSettings) -> Self {
        Self {
            batch_size: pipeline.max_batch_size,
            max_failures: pipeline.max_failure_count,
            processes: pipeline.process_count,
            due_window: pipeline.due_window(),
        }
    }
}

/// Item counts by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ItemStats {
    /// Emails created (sort) or delivered (send).
    pub done: u64,
    /// Ineligible recipients dropped.
    pub removed: u64,
    /// Failed attempts returned to pending.
    pub retried: u64,
    /// Emails given up on.
    pub failed: u64,
    /// Delivery rows whose payload was missing.
    pub zombies: u64,
}

impl ItemStats {
    pub fn total(&self) -> u64 {
        self.done + self.removed + self.retried + self.failed + self.zombies
    }
}

impl AddAssign for ItemStats {
    fn add_assign(&mut self, other: Self) {
        self.done += other.done;
        self.removed += other.removed;
        self.retried += other.retried;
        self.failed += other.failed;
        self.zombies += other.zombies;
    }
}

/// What one slot worker did before it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotReport {
    pub slot: Slot,
    pub batches: u32,
    pub items: ItemStats,
    /// Stopped early because the host was blocked or a campaign was pulled.
    pub stopped: bool,
}

impl SlotReport {
    fn new(slot: Slot) -> Self {
        Self {
            slot,
            batches: 0,
            items: ItemStats::default(),
            stopped: false,
        }
    }
}
