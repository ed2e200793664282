mod common;

use chrono::{DateTime, TimeDelta, Utc};
use proptest::prelude::*;
use table_repo::keys::{
    MAX_UNIX_MILLIS, PARTITION_KEY_WIDTH, decode_partition_key, generate_partition_key,
    generate_partition_key_range_query, generate_time_ordered_id, partition_key_range,
};
use table_repo::{
    MemoryTableService, Query, Repository, RepositoryOptions, TableEntity, TimeBucketedPolicy,
    provision_tables, registered_tables,
};

#[derive(TableEntity, Clone, Debug, Default, PartialEq)]
struct Reading {
    #[partition_key]
    bucket: String,
    #[row_key]
    id: String,
    value: i32,
}

fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn readings_repo() -> Repository<Reading, MemoryTableService, TimeBucketedPolicy> {
    common::init_logging();
    Repository::with_policy(
        MemoryTableService::new(),
        TimeBucketedPolicy::default(),
        RepositoryOptions::new(),
    )
}

proptest! {
    #[test]
    fn newer_buckets_never_sort_after_older(a in 0i64..253_402_000_000, b in 0i64..253_402_000_000) {
        let (ta, tb) = (
            DateTime::from_timestamp(a, 0).unwrap(),
            DateTime::from_timestamp(b, 0).unwrap(),
        );
        let (ka, kb) = (generate_partition_key(&ta).unwrap(), generate_partition_key(&tb).unwrap());
        prop_assert_eq!(ka.len(), PARTITION_KEY_WIDTH);
        if ta <= tb {
            prop_assert!(kb <= ka);
        }
        let bucket = decode_partition_key(&ka).unwrap();
        prop_assert!((bucket - ta).abs() <= TimeDelta::seconds(150));
    }

    #[test]
    fn newer_ids_sort_first(millis in 0i64..(MAX_UNIX_MILLIS as i64 - 1_000_000), delta in 1i64..1_000_000) {
        let older = DateTime::from_timestamp_millis(millis).unwrap();
        let newer = DateTime::from_timestamp_millis(millis + delta).unwrap();
        prop_assert!(generate_time_ordered_id(&newer).unwrap() < generate_time_ordered_id(&older).unwrap());
    }
}

#[tokio::test]
async fn range_selects_buckets_from_start_up_to_end() {
    let repo = readings_repo();
    let times = ["10:00", "10:05", "10:10", "10:15", "10:20"];
    let readings = times
        .iter()
        .enumerate()
        .map(|(i, hm)| {
            let time = at(&format!("2024-05-01T{hm}:00Z"));
            Reading {
                bucket: generate_partition_key(&time).unwrap(),
                id: generate_time_ordered_id(&time).unwrap(),
                value: i as i32,
            }
        })
        .collect::<Vec<_>>();
    repo.save_batch(readings).await.unwrap();

    let (start, end) = (at("2024-05-01T10:05:00Z"), at("2024-05-01T10:15:00Z"));
    let structured = repo
        .find_all(partition_key_range(&start, &end).unwrap())
        .await
        .unwrap();
    let values = structured.iter().map(|r| r.value).collect::<Vec<_>>();
    assert_eq!(values, vec![2, 1]);

    let raw = generate_partition_key_range_query(&start, &end).unwrap();
    assert_eq!(repo.find_all(raw).await.unwrap(), structured);

    let empty = repo
        .find_all(partition_key_range(&start, &start).unwrap())
        .await
        .unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn time_bucketed_policy_assigns_keys() {
    let repo = readings_repo();
    let before = Utc::now();
    let saved = repo.save(Reading::default()).await.unwrap();

    assert_eq!(saved.bucket.len(), PARTITION_KEY_WIDTH);
    let bucket = decode_partition_key(&saved.bucket).unwrap();
    assert!((bucket - before).abs() <= TimeDelta::minutes(3));
    assert!(!saved.id.is_empty());

    repo.save(Reading {
        value: 1,
        ..Default::default()
    })
    .await
    .unwrap();
    assert_eq!(repo.find_all(Query::All).await.unwrap().len(), 2);
}

#[tokio::test]
async fn registered_entities_are_provisioned() {
    common::init_logging();
    let tables = registered_tables()
        .iter()
        .map(|meta| meta.table_name)
        .collect::<Vec<_>>();
    assert_eq!(tables, vec!["Orders", "Reading"]);
    assert_eq!(Reading::table_name(), "Reading");

    let service = MemoryTableService::new();
    let created = provision_tables(&service).await.unwrap();
    assert_eq!(created, vec!["Orders", "Reading"]);
    assert_eq!(
        service.table_names(),
        vec!["Orders".to_string(), "Reading".to_string()]
    );
}
