mod common;

use common::{Order, RecordingService, init_logging};
use table_repo::{ErrorKind, MemoryTableService, Query, Repository, RepositoryOptions};
use tokio::sync::watch;

async fn seeded(
    service: RecordingService,
    options: RepositoryOptions,
) -> Repository<Order, RecordingService> {
    init_logging();
    let repo = Repository::with_options(service, options);
    let mut orders = Vec::new();
    for customer in ["a", "b", "c"] {
        for i in 0..150 {
            let mut order = Order::new(customer, &format!("{customer}-{i:04}"), i as f64);
            if i % 2 == 0 {
                order.status = "closed".to_string();
            }
            orders.push(order);
        }
    }
    repo.save_batch(orders).await.unwrap();
    repo
}

#[tokio::test]
async fn deletes_every_match_across_pages() {
    let service = RecordingService::over(MemoryTableService::new().with_max_page_size(40));
    let repo = seeded(service.clone(), RepositoryOptions::new()).await;
    let before = service.queries();

    let deleted = repo
        .delete_where(Order::columns().status().eq("closed"))
        .await
        .unwrap();

    assert_eq!(deleted, 225);
    assert!(service.queries() - before > 225 / 40);
    let left = repo.find_all(Query::All).await.unwrap();
    assert_eq!(left.len(), 225);
    assert!(left.iter().all(|o| o.status == "open"));
}

#[tokio::test]
async fn delete_page_size_bounds_each_round() {
    let service = RecordingService::new();
    let repo = seeded(service.clone(), RepositoryOptions::new().delete_page_size(100)).await;
    let seeded_transactions = service.transactions().len();

    let deleted = repo
        .delete_where(Order::columns().customer().eq("b"))
        .await
        .unwrap();

    assert_eq!(deleted, 150);
    let transactions = service.transactions();
    let rounds = &transactions[seeded_transactions..];
    assert_eq!(rounds, &[("b".to_string(), 100), ("b".to_string(), 50)]);
    assert_eq!(repo.find_all(Query::All).await.unwrap().len(), 300);
}

#[tokio::test]
async fn nothing_to_delete() {
    let service = RecordingService::new();
    let repo = seeded(service.clone(), RepositoryOptions::new()).await;
    let seeded_transactions = service.transactions().len();

    assert_eq!(repo.delete_where("status eq 'archived'").await.unwrap(), 0);
    assert_eq!(service.transactions().len(), seeded_transactions);
}

#[tokio::test]
async fn a_failure_stops_the_sweep() {
    init_logging();
    // The seed writes two chunks per customer; attempt 7 is the second delete.
    let service = RecordingService::new().failing_transaction(7);
    let repo = seeded(service.clone(), RepositoryOptions::new()).await;

    let err = repo.delete_where(Query::All).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(repo.find_all(Query::All).await.unwrap().len(), 350);
}

#[tokio::test]
async fn cancelling_mid_sweep_keeps_committed_chunks() {
    let service = RecordingService::new();
    let repo = seeded(service.clone(), RepositoryOptions::new()).await;
    let seeded_transactions = service.transactions().len();

    let (cancel, observed) = watch::channel(false);
    service.cancel_after_next_commit(cancel);
    let err = repo
        .with_cancellation(observed)
        .delete_where(Order::columns().customer().eq("b"))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    let transactions = service.transactions();
    assert_eq!(
        &transactions[seeded_transactions..],
        &[("b".to_string(), 100)]
    );
    let left = repo
        .find_all(Order::columns().customer().eq("b"))
        .await
        .unwrap();
    assert_eq!(left.len(), 50);
    assert!(left.iter().all(|o| o.id.as_str() >= "b-0100"));
    assert_eq!(repo.find_all(Query::All).await.unwrap().len(), 350);
}
