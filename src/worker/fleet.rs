//! Fleet supervisor for one host.
//!
//! Runs the host's slot workers as a task group. Each slot owns a disjoint
//! share of the host's reservation, so slots never coordinate with each other.
//! After every round the supervisor re-partitions anything new (freshly
//! assigned items, retries) and runs another round, until nothing is left or
//! the host is told to stop. Then it drains finished rows and releases the host.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info};
use uuid::Uuid;

use super::{HostGate, ItemStats, SendWorker, SlotReport, SortWorker, WorkerSettings};
use crate::config::LinkSettings;
use crate::error::{Error, Result};
use crate::model::{HostId, Slot, Stage};
use crate::store::Store;
use crate::telemetry::work;
use crate::transport::TransportFactory;

/// What one fleet run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FleetReport {
    pub host: String,
    /// The gate refused: host busy or blocked. Nothing ran.
    pub refused: bool,
    pub rounds: u32,
    pub items: ItemStats,
    /// Some slot stopped early on request.
    pub stopped: bool,
    /// Finished rows deleted by the final drain.
    pub purged: u64,
}

pub struct Fleet<S: ?Sized> {
    store: Arc<S>,
    stage: Stage,
    host_name: String,
    settings: WorkerSettings,
    links: LinkSettings,
    transport: Arc<dyn TransportFactory>,
}

/// Even split: every slot gets `ceil(n / slots)`.
pub fn share(n: u64, slots: u32) -> u64 {
    n.div_ceil(u64::from(slots.max(1)))
}

impl<S: Store + ?Sized + 'static> Fleet<S> {
    pub fn new(
        store: Arc<S>,
        stage: Stage,
        host_name: impl Into<String>,
        settings: WorkerSettings,
        links: LinkSettings,
        transport: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            store,
            stage,
            host_name: host_name.into(),
            settings,
            links,
            transport,
        }
    }

    pub async fn run(&self) -> Result<FleetReport> {
        let run_id = Uuid::new_v4();
        let span = work::start_run_span("fleet", self.stage, &self.host_name, &run_id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<FleetReport> {
        let mut report = FleetReport {
            host: self.host_name.clone(),
            ..FleetReport::default()
        };
        let Some(gate) =
            HostGate::acquire(Arc::clone(&self.store), self.stage, &self.host_name).await?
        else {
            report.refused = true;
            return Ok(report);
        };
        let gate = Arc::new(gate);
        let host = gate.host().id;
        let timestamp = Utc::now();
        info!(host = %self.host_name, stage = %self.stage, processes = self.settings.processes, "fleet starting");

        let mut failure: Option<Error> = None;
        loop {
            let partitioned = match self.partition(host).await {
                Ok(n) => n,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            // The first round also picks up slot-owned leftovers of an earlier run.
            if partitioned == 0 && report.rounds > 0 {
                break;
            }
            report.rounds += 1;

            let mut tasks = JoinSet::new();
            for index in 0..self.settings.processes {
                let slot = Slot { host, index };
                let store = Arc::clone(&self.store);
                let gate = Arc::clone(&gate);
                match self.stage {
                    Stage::Sort => {
                        let worker = SortWorker::new(
                            store,
                            gate,
                            slot,
                            self.settings.batch_size,
                            self.links.clone(),
                            timestamp,
                        );
                        tasks.spawn(worker.run());
                    }
                    Stage::Send => {
                        let worker = SendWorker::new(
                            store,
                            gate,
                            slot,
                            &self.settings,
                            self.transport.open(),
                        );
                        tasks.spawn(worker.run());
                    }
                }
            }

            let slots = self.join(&mut tasks, &mut report, &mut failure).await;
            if failure.is_some() || slots.iter().any(|s| s.stopped) {
                break;
            }
            match gate.permits_work().await {
                Ok(true) => {}
                Ok(false) => {
                    report.stopped = true;
                    break;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match self.drain(host).await {
            Ok(purged) => report.purged = purged,
            Err(e) => {
                error!(error = %e, "final drain failed");
                failure.get_or_insert(e);
            }
        }

        gate.release().await?;

        if let Some(e) = failure {
            return Err(e);
        }
        info!(
            host = %self.host_name,
            rounds = report.rounds,
            count = report.items.done,
            purged = report.purged,
            "fleet finished"
        );
        Ok(report)
    }

    /// Wait for every slot of a round. The first slot error is kept.
    async fn join(
        &self,
        tasks: &mut JoinSet<Result<SlotReport>>,
        report: &mut FleetReport,
        failure: &mut Option<Error>,
    ) -> Vec<SlotReport> {
        let mut slots = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(slot)) => {
                    report.items += slot.items;
                    report.stopped |= slot.stopped;
                    slots.push(slot);
                }
                Ok(Err(e)) => {
                    error!(error = %e, "slot worker failed");
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "slot worker panicked");
                    failure.get_or_insert(Error::Other(format!("slot worker panicked: {e}")));
                }
            }
        }
        slots
    }

    /// Split the host's unowned backlog evenly across slots.
    async fn partition(&self, host: HostId) -> Result<u64> {
        let slots = self.settings.processes;
        let mut total = 0;
        match self.stage {
            Stage::Sort => {
                let n = self.store.count_unpartitioned_recipients(host).await?;
                let per_slot = share(n, slots);
                for index in 0..slots {
                    total += self
                        .store
                        .partition_recipients(Slot { host, index }, per_slot)
                        .await?;
                }
            }
            Stage::Send => {
                let horizon = Utc::now() + self.settings.due_window;
                let n = self
                    .store
                    .count_unpartitioned_deliveries(host, horizon)
                    .await?;
                let per_slot = share(n, slots);
                for index in 0..slots {
                    total += self
                        .store
                        .reserve_deliveries(Slot { host, index }, horizon, per_slot)
                        .await?;
                }
            }
        }
        if total > 0 {
            info!(count = total, slots, "partitioned backlog");
        }
        Ok(total)
    }

    async fn drain(&self, host: HostId) -> Result<u64> {
        let purged = match self.stage {
            Stage::Sort => self.store.purge_sorted_recipients(host).await?,
            Stage::Send => self.store.purge_finished_deliveries(host).await?,
        };
        let depth = match self.stage {
            Stage::Sort => self.store.recipient_depth(host).await?,
            Stage::Send => {
                self.store
                    .count_due_deliveries(host, Utc::now() + self.settings.due_window)
                    .await?
            }
        };
        self.store.set_queue_depth(host, depth).await?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::share;

    #[test]
    fn share_rounds_up() {
        assert_eq!(share(10, 4), 3);
        assert_eq!(share(8, 4), 2);
        assert_eq!(share(0, 4), 0);
        assert_eq!(share(5, 0), 5);
    }
}
