use chrono::{TimeDelta, Utc};
use table_repo::keys::partition_key_range;
use table_repo::{
    Error, MemoryTableService, Repository, RepositoryOptions, TableEntity, TimeBucketedPolicy,
};

#[derive(TableEntity, Clone, Debug, Default)]
#[table(name = "AuditEvents")]
pub struct AuditEvent {
    #[partition_key]
    pub bucket: String,
    #[row_key]
    pub id: String,
    #[timestamp]
    pub timestamp: Option<chrono::DateTime<Utc>>,
    pub actor: String,
    pub action: String,
    #[property(name = "Size")]
    pub size: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let repo: Repository<AuditEvent, _, _> = Repository::with_policy(
        MemoryTableService::new(),
        TimeBucketedPolicy::default(),
        RepositoryOptions::new(),
    );

    let saved = repo
        .save(AuditEvent {
            actor: "alice".to_string(),
            action: "login".to_string(),
            ..Default::default()
        })
        .await?;
    println!("{:?}", saved);

    let events = (0..250).map(|i| AuditEvent {
        actor: format!("user{}", i % 7),
        action: "upload".to_string(),
        size: Some(i * 1024),
        ..Default::default()
    });
    println!("written in batches: {}", repo.save_batch(events).await?);

    let columns = AuditEvent::columns();
    let large = repo
        .find_all(columns.action().eq("upload").and(columns.size().ge(200 * 1024i64)))
        .await?;
    println!("large uploads: {}", large.len());

    let now = Utc::now();
    let recent = partition_key_range(&(now - TimeDelta::hours(1)), &(now + TimeDelta::hours(1)))?;
    println!("recent events: {}", repo.find_all(recent).await?.len());

    let removed = repo.delete_where(columns.actor().eq("user3")).await?;
    println!("removed: {}", removed);

    Ok(())
}
