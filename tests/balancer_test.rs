//! Balancer runs against the in-memory store.

mod common;

use std::sync::Arc;

use common::{campaign, email, seeded};
use mailq::balancer::{RunOutcome, SendBalancer, SortBalancer};
use mailq::error::Error;
use chrono::Utc;
use mailq::model::{
    CampaignId, CampaignStatus, DeliveryStatus, HostId, HostStatus, RecipientStatus, Slot, Stage,
    UserId,
};
use mailq::store::memory::MemoryStore;
use mailq::store::{CampaignStore, HostStore, SendStore};

async fn send_host(store: &MemoryStore, name: &str, depth: u64) -> HostId {
    let host = store
        .register_host(Stage::Send, name, HostStatus::Available)
        .await
        .unwrap();
    store.set_queue_depth(host.id, depth).await.unwrap();
    host.id
}

fn completed(outcome: RunOutcome) -> mailq::balancer::BalanceReport {
    match outcome {
        RunOutcome::Completed(report) => report,
        RunOutcome::Locked => panic!("balancer unexpectedly locked out"),
    }
}

fn assigned_to(store: &MemoryStore, host: HostId) -> usize {
    store
        .deliveries()
        .iter()
        .filter(|d| d.host == Some(host))
        .count()
}

#[tokio::test]
async fn send_balancer_levels_hosts() {
    let store = Arc::new(seeded(campaign(1, CampaignStatus::Send), "", ""));
    let shallow = send_host(&store, "send1", 100).await;
    let deep = send_host(&store, "send2", 250).await;
    for i in 0..2150 {
        store.add_email(email(1, &format!("user{i}@example.com")));
    }

    let report = completed(SendBalancer::new(Arc::clone(&store), 1000, "test").run().await.unwrap());

    assert_eq!(report.reserved, 2150);
    assert_eq!(report.rounds, 1);
    assert_eq!(assigned_to(&store, shallow), 1150);
    assert_eq!(assigned_to(&store, deep), 1000);
    assert_eq!(store.host(shallow).await.unwrap().queue_depth, 1250);
    assert_eq!(store.host(deep).await.unwrap().queue_depth, 1250);
}

#[tokio::test]
async fn send_balancer_keeps_going_until_everything_is_assigned() {
    let store = Arc::new(seeded(campaign(1, CampaignStatus::Send), "", ""));
    let a = send_host(&store, "send1", 0).await;
    let b = send_host(&store, "send2", 0).await;
    for i in 0..25 {
        store.add_email(email(1, &format!("user{i}@example.com")));
    }

    let report = completed(SendBalancer::new(Arc::clone(&store), 10, "test").run().await.unwrap());

    assert_eq!(report.reserved, 25);
    assert_eq!(report.rounds, 2);
    assert_eq!(assigned_to(&store, a), 15);
    assert_eq!(assigned_to(&store, b), 10);
    assert!(!store.has_unassigned_deliveries().await.unwrap());
}

#[tokio::test]
async fn idle_run_changes_nothing() {
    let store = Arc::new(seeded(campaign(1, CampaignStatus::Delegating), "", ""));
    let host = send_host(&store, "send1", 7).await;

    let report = completed(SendBalancer::new(Arc::clone(&store), 1000, "test").run().await.unwrap());

    assert_eq!(report.reserved, 0);
    assert_eq!(store.host(host).await.unwrap().queue_depth, 7);
    assert_eq!(
        store.campaign(CampaignId(1)).await.unwrap().status,
        CampaignStatus::Delegating
    );
}

#[tokio::test]
async fn second_run_backs_off_while_locked() {
    let store = Arc::new(seeded(campaign(1, CampaignStatus::Send), "", ""));
    send_host(&store, "send1", 0).await;
    store.add_email(email(1, "ann@example.com"));
    assert!(store.try_lock_run(Stage::Send, "other-run").await.unwrap());

    let outcome = SendBalancer::new(Arc::clone(&store), 1000, "test").run().await.unwrap();

    assert_eq!(outcome, RunOutcome::Locked);
    assert!(store.has_unassigned_deliveries().await.unwrap());
    assert_eq!(store.run_lock_holder(Stage::Send).as_deref(), Some("other-run"));
}

/// Total reserved by the runs that got the lock. At least one must have.
fn reserved_by(outcomes: &[RunOutcome]) -> u64 {
    let reports: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            RunOutcome::Completed(report) => Some(report.reserved),
            RunOutcome::Locked => None,
        })
        .collect();
    assert!(!reports.is_empty(), "every run was locked out");
    // A run that started after the other finished finds nothing left.
    assert!(reports.iter().filter(|r| **r > 0).count() <= 1, "{reports:?}");
    reports.iter().sum()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_send_runs_reserve_each_email_once() {
    let store = Arc::new(seeded(campaign(1, CampaignStatus::Send), "", ""));
    send_host(&store, "send1", 0).await;
    send_host(&store, "send2", 0).await;
    for i in 0..1500 {
        store.add_email(email(1, &format!("user{i}@example.com")));
    }

    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let runs: Vec<_> = ["run-a", "run-b"]
        .into_iter()
        .map(|holder| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                SendBalancer::new(store, 1000, holder).run().await
            })
        })
        .collect();
    let mut outcomes = Vec::new();
    for run in runs {
        outcomes.push(run.await.unwrap().unwrap());
    }

    assert_eq!(reserved_by(&outcomes), 1500);
    assert!(store.deliveries().iter().all(|d| d.host.is_some()));
    let depths: u64 = store
        .active_hosts(Stage::Send)
        .await
        .unwrap()
        .iter()
        .map(|h| h.queue_depth)
        .sum();
    assert_eq!(depths, 1500);
    assert_eq!(store.run_lock_holder(Stage::Send), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sort_runs_reserve_each_recipient_once() {
    let store = Arc::new(seeded(campaign(1, CampaignStatus::Delegate), "", ""));
    for name in ["sort1", "sort2"] {
        store
            .register_host(Stage::Sort, name, HostStatus::Available)
            .await
            .unwrap();
    }
    for user in 0..200 {
        store.add_recipient(CampaignId(1), UserId(user), "", "x@example.com", "en");
    }

    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let runs: Vec<_> = ["run-a", "run-b"]
        .into_iter()
        .map(|holder| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                SortBalancer::new(store, 25, holder).run().await
            })
        })
        .collect();
    let mut outcomes = Vec::new();
    for run in runs {
        outcomes.push(run.await.unwrap().unwrap());
    }

    assert_eq!(reserved_by(&outcomes), 200);
    let recipients = store.recipients();
    assert!(recipients.iter().all(|r| r.status == RecipientStatus::Reserved));
    assert!(recipients.iter().all(|r| r.host.is_some()));
    assert_eq!(store.run_lock_holder(Stage::Sort), None);
}

#[tokio::test]
async fn lock_is_released_after_a_run() {
    let store = Arc::new(seeded(campaign(1, CampaignStatus::Send), "", ""));
    send_host(&store, "send1", 0).await;
    let balancer = SendBalancer::new(Arc::clone(&store), 1000, "test");

    completed(balancer.run().await.unwrap());
    assert_eq!(store.run_lock_holder(Stage::Send), None);
    completed(balancer.run().await.unwrap());
}

#[tokio::test]
async fn broken_host_is_failed_and_stops_the_run() {
    let store = Arc::new(seeded(campaign(1, CampaignStatus::Send), "", ""));
    let broken = send_host(&store, "send1", 0).await;
    let healthy = send_host(&store, "send2", 0).await;
    store.add_email(email(1, "ann@example.com"));
    store.break_host(broken);

    let result = SendBalancer::new(Arc::clone(&store), 1000, "test").run().await;

    assert!(matches!(result, Err(Error::Delegation { ref host, .. }) if host == "send1"));
    assert_eq!(store.host(broken).await.unwrap().status, HostStatus::Failed);
    assert_eq!(store.run_lock_holder(Stage::Send), None);

    // The failed host stays out of later runs until an operator clears it.
    let report = completed(SendBalancer::new(Arc::clone(&store), 1000, "test").run().await.unwrap());
    assert_eq!(report.hosts, 1);
    assert_eq!(assigned_to(&store, healthy), 1);
    assert_eq!(store.host(broken).await.unwrap().status, HostStatus::Failed);
}

#[tokio::test]
async fn drained_campaigns_are_completed() {
    let store = Arc::new(seeded(campaign(1, CampaignStatus::Sending), "", ""));
    store.insert_campaign(campaign(2, CampaignStatus::Send));
    let host = send_host(&store, "send1", 0).await;
    let (_, done) = store.add_email(email(1, "ann@example.com"));
    store.add_email(email(2, "bo@example.com"));
    assert_eq!(store.assign_deliveries(host, 2).await.unwrap(), 2);
    let slot = Slot { host, index: 0 };
    assert_eq!(store.reserve_deliveries(slot, Utc::now(), 2).await.unwrap(), 2);

    // Campaign 1 delivered its only email; campaign 2 still has one in flight.
    store.mark_delivered(done).await.unwrap();
    assert_eq!(store.delivery(done).unwrap().status, DeliveryStatus::Sent);

    let report = completed(SendBalancer::new(Arc::clone(&store), 1000, "test").run().await.unwrap());

    assert_eq!(report.finished_campaigns, vec![CampaignId(1)]);
    assert_eq!(
        store.campaign(CampaignId(1)).await.unwrap().status,
        CampaignStatus::Complete
    );
    assert_eq!(
        store.campaign(CampaignId(2)).await.unwrap().status,
        CampaignStatus::Send
    );
    assert!(store.emails().iter().all(|e| e.campaign_id == CampaignId(2)));
}

#[tokio::test]
async fn sort_balancer_reserves_and_starts_delegation() {
    let store = Arc::new(seeded(campaign(1, CampaignStatus::Delegate), "", ""));
    let a = store
        .register_host(Stage::Sort, "sort1", HostStatus::Available)
        .await
        .unwrap();
    let b = store
        .register_host(Stage::Sort, "sort2", HostStatus::Available)
        .await
        .unwrap();
    for user in 0..5 {
        store.add_recipient(CampaignId(1), UserId(user), "", "x@example.com", "en");
    }

    let report = completed(SortBalancer::new(Arc::clone(&store), 2, "test").run().await.unwrap());

    assert_eq!(report.reserved, 5);
    assert_eq!(
        store.campaign(CampaignId(1)).await.unwrap().status,
        CampaignStatus::Delegating
    );
    let recipients = store.recipients();
    assert!(recipients.iter().all(|r| r.status == RecipientStatus::Reserved));
    let on_a = recipients.iter().filter(|r| r.host == Some(a.id)).count();
    let on_b = recipients.iter().filter(|r| r.host == Some(b.id)).count();
    assert_eq!((on_a, on_b), (3, 2));
    assert_eq!(store.host(a.id).await.unwrap().queue_depth, 3);
}

#[tokio::test]
async fn sort_balancer_without_hosts_touches_nothing() {
    let store = Arc::new(seeded(campaign(1, CampaignStatus::Delegate), "", ""));
    store.add_recipient(CampaignId(1), UserId(1), "", "x@example.com", "en");

    let report = completed(SortBalancer::new(Arc::clone(&store), 10, "test").run().await.unwrap());

    assert_eq!(report.reserved, 0);
    assert_eq!(
        store.campaign(CampaignId(1)).await.unwrap().status,
        CampaignStatus::Delegate
    );
}
