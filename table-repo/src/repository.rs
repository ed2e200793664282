use std::marker::PhantomData;
use std::pin::pin;
use std::sync::Arc;

use async_stream::try_stream;
use chrono::{TimeDelta, Utc};
use futures::{
    Stream, TryStreamExt,
    future::{BoxFuture, FutureExt, Shared},
};
use tokio::sync::watch;

use crate::{
    Error,
    client::{ContinuationToken, Operation, Page, TableClient, TableService},
    config::RepositoryOptions,
    entity::{EntityRecord, TableEntity, registered_tables, validate_keys},
    filter::Query,
    keys,
};

/// Per-entity-type customisation points of a repository.
pub trait EntityPolicy<T: TableEntity>: Send + Sync + 'static {
    fn table_name(&self) -> String {
        T::table_name().to_string()
    }

    fn new_row_key(&self) -> String {
        keys::new_id()
    }

    /// Runs before every write except deletes. Must not overwrite keys that are already set.
    fn before_save(&self, entity: &mut T) {
        assign_missing_keys(entity, || self.new_row_key());
    }

    /// Runs on the re-read copy once a single-entity write is confirmed.
    fn after_save(&self, _entity: &T) {}
}

/// Fills an empty row key from `new_row_key` and an empty partition key from the row key.
pub fn assign_missing_keys<T: TableEntity>(entity: &mut T, new_row_key: impl FnOnce() -> String) {
    if entity.row_key().is_empty() {
        entity.set_row_key(new_row_key());
    }
    if entity.partition_key().is_empty() {
        let row_key = entity.row_key().to_string();
        entity.set_partition_key(row_key);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultPolicy;

impl<T: TableEntity> EntityPolicy<T> for DefaultPolicy {}

/// Newest-first keys: time-ordered row keys inside reverse-chronological
/// partitions of `interval` width.
#[derive(Clone, Copy, Debug)]
pub struct TimeBucketedPolicy {
    interval: TimeDelta,
}

impl TimeBucketedPolicy {
    pub fn new(interval: TimeDelta) -> Result<Self, Error> {
        keys::generate_partition_key_with_interval(&Utc::now(), interval)?;
        Ok(Self { interval })
    }
}

impl Default for TimeBucketedPolicy {
    fn default() -> Self {
        Self {
            interval: keys::default_rounding_interval(),
        }
    }
}

impl<T: TableEntity> EntityPolicy<T> for TimeBucketedPolicy {
    fn new_row_key(&self) -> String {
        keys::generate_time_ordered_id(&Utc::now()).unwrap_or_else(|_| keys::new_id())
    }

    fn before_save(&self, entity: &mut T) {
        if entity.row_key().is_empty() {
            entity.set_row_key(EntityPolicy::<T>::new_row_key(self));
        }
        if entity.partition_key().is_empty() {
            let partition_key = keys::generate_partition_key_with_interval(&Utc::now(), self.interval)
                .unwrap_or_else(|_| entity.row_key().to_string());
            entity.set_partition_key(partition_key);
        }
    }
}

type TableInit<C> = Shared<BoxFuture<'static, Result<C, Arc<Error>>>>;

/// Lazily creates the table on first poll; every clone observes the same attempt.
fn lazy_table<S: TableService>(service: S, name: Arc<str>) -> TableInit<S::Table> {
    async move {
        log::debug!("initializing table {}", name);
        match service.create_table_if_not_exists(&name).await {
            Ok(table) => {
                log::info!("table {} ready", name);
                Ok(table)
            }
            Err(e) => {
                log::warn!("initializing table {} failed: {}", name, e);
                Err(Arc::new(e))
            }
        }
    }
    .boxed()
    .shared()
}

/// CRUD, query and paging over the table of one entity type.
pub struct Repository<T, S: TableService, P = DefaultPolicy> {
    policy: Arc<P>,
    options: RepositoryOptions,
    table_name: Arc<str>,
    table: TableInit<S::Table>,
    cancel: watch::Receiver<bool>,
    _entity: PhantomData<fn() -> T>,
}

impl<T, S: TableService, P> Clone for Repository<T, S, P> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            options: self.options.clone(),
            table_name: self.table_name.clone(),
            table: self.table.clone(),
            cancel: self.cancel.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: TableEntity, S: TableService> Repository<T, S, DefaultPolicy> {
    pub fn new(service: S) -> Self {
        Self::with_policy(service, DefaultPolicy, RepositoryOptions::default())
    }

    pub fn with_options(service: S, options: RepositoryOptions) -> Self {
        Self::with_policy(service, DefaultPolicy, options)
    }
}

impl<T, S, P> Repository<T, S, P>
where
    T: TableEntity,
    S: TableService,
    P: EntityPolicy<T>,
{
    pub fn with_policy(service: S, policy: P, options: RepositoryOptions) -> Self {
        let table_name: Arc<str> = options
            .table_name
            .clone()
            .unwrap_or_else(|| policy.table_name())
            .into();
        Self {
            table: lazy_table(service, table_name.clone()),
            policy: Arc::new(policy),
            options,
            table_name,
            cancel: watch::channel(false).1,
            _entity: PhantomData,
        }
    }

    /// A handle sharing this repository's table that stops issuing calls
    /// once `true` is published on `cancel`.
    pub fn with_cancellation(&self, cancel: watch::Receiver<bool>) -> Self {
        let mut repo = self.clone();
        repo.cancel = cancel;
        repo
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn options(&self) -> &RepositoryOptions {
        &self.options
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn new_row_key(&self) -> String {
        self.policy.new_row_key()
    }

    pub fn before_save(&self, entity: &mut T) {
        self.policy.before_save(entity);
    }

    pub fn after_save(&self, entity: &T) {
        self.policy.after_save(entity);
    }

    pub(crate) fn ensure_not_cancelled(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    pub(crate) async fn table(&self) -> Result<S::Table, Error> {
        self.ensure_not_cancelled()?;
        self.table
            .clone()
            .await
            .map_err(|source| Error::Initialization {
                table: self.table_name.to_string(),
                source,
            })
    }

    /// Forces table creation instead of waiting for the first operation.
    pub async fn initialize(&self) -> Result<(), Error> {
        self.table().await.map(|_| ())
    }

    pub async fn find(&self, row_key: &str, partition_key: &str) -> Result<Option<T>, Error> {
        validate_keys(partition_key, row_key)?;
        let table = self.table().await?;
        self.ensure_not_cancelled()?;
        table
            .get_entity(partition_key, row_key)
            .await?
            .map(T::from_record)
            .transpose()
    }

    pub(crate) async fn fetch_page(
        &self,
        query: &Query,
        continuation: Option<&ContinuationToken>,
        page_size: Option<u32>,
    ) -> Result<Page<EntityRecord>, Error> {
        let table = self.table().await?;
        self.ensure_not_cancelled()?;
        let filter = query.to_filter_string();
        let page_size = page_size.or(self.options.page_size);
        log::debug!(
            "querying {} filter={:?} page_size={:?} resume={:?}",
            self.table_name,
            filter,
            page_size,
            continuation.map(ContinuationToken::as_str)
        );
        table
            .query_entities(filter.as_deref(), page_size, continuation)
            .await
    }

    /// Exactly one server page; it may hold fewer than `page_size` entities.
    pub async fn find_page(
        &self,
        query: impl Into<Query>,
        continuation: Option<ContinuationToken>,
        page_size: Option<u32>,
    ) -> Result<Page<T>, Error> {
        self.fetch_page(&query.into(), continuation.as_ref(), page_size)
            .await?
            .try_map(T::from_record)
    }

    /// Lazily fetches pages one at a time until the server stops issuing tokens.
    pub fn pages(
        &self,
        query: impl Into<Query>,
        page_size: Option<u32>,
    ) -> impl Stream<Item = Result<Page<T>, Error>> + Send + '_ {
        let query = query.into();
        try_stream! {
            let mut continuation: Option<ContinuationToken> = None;
            loop {
                let page = self.fetch_page(&query, continuation.as_ref(), page_size).await?;
                continuation = page.continuation.clone();
                yield page.try_map(T::from_record)?;
                if continuation.is_none() {
                    break;
                }
            }
        }
    }

    /// Every matching entity. No client-side limit; keep the filter selective.
    pub async fn find_all(&self, query: impl Into<Query>) -> Result<Vec<T>, Error> {
        let mut pages = pin!(self.pages(query, None));
        let mut items = Vec::new();
        while let Some(page) = pages.try_next().await? {
            items.extend(page.items);
        }
        Ok(items)
    }

    /// First match using single-entity pages.
    pub async fn find_one(&self, query: impl Into<Query>) -> Result<Option<T>, Error> {
        let query = query.into();
        let mut continuation = None;
        loop {
            let page = self.fetch_page(&query, continuation.as_ref(), Some(1)).await?;
            if let Some(first) = page.items.into_iter().next() {
                return T::from_record(first).map(Some);
            }
            // Servers may hand out an empty page that still carries a token.
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => return Ok(None),
            }
        }
    }

    /// Insert-or-replace, then re-read to pick up the service's timestamp and etag.
    pub async fn save(&self, entity: T) -> Result<T, Error> {
        self.write(entity, Operation::UpsertReplace).await
    }

    /// Insert only; [`Error::Conflict`] when the key pair exists.
    pub async fn create(&self, entity: T) -> Result<T, Error> {
        self.write(entity, Operation::Add).await
    }

    /// Same as [`save`](Self::save): the entity does not need to exist.
    pub async fn update(&self, entity: T) -> Result<T, Error> {
        self.save(entity).await
    }

    async fn write(&self, mut entity: T, operation: Operation) -> Result<T, Error> {
        self.policy.before_save(&mut entity);
        let record = entity.to_record();
        validate_keys(&record.partition_key, &record.row_key)?;
        let (partition_key, row_key) = (record.partition_key.clone(), record.row_key.clone());

        let table = self.table().await?;
        self.ensure_not_cancelled()?;
        match operation {
            Operation::Add => table.insert_entity(record).await?,
            _ => table.upsert_entity(record).await?,
        }
        log::debug!(
            "{} ({}, {}) in {}",
            operation.as_str(),
            partition_key,
            row_key,
            self.table_name
        );

        self.ensure_not_cancelled()?;
        let stored = table.get_entity(&partition_key, &row_key).await?;
        let Some(stored) = stored else {
            return Err(Error::EntityNotFound {
                partition_key,
                row_key,
            });
        };
        let saved = T::from_record(stored)?;
        self.policy.after_save(&saved);
        Ok(saved)
    }

    pub async fn delete(&self, entity: &T) -> Result<(), Error> {
        self.delete_by_key(entity.row_key(), entity.partition_key())
            .await
    }

    /// Deleting an entity that does not exist succeeds.
    pub async fn delete_by_key(&self, row_key: &str, partition_key: &str) -> Result<(), Error> {
        validate_keys(partition_key, row_key)?;
        let table = self.table().await?;
        self.ensure_not_cancelled()?;
        table.delete_entity(partition_key, row_key).await
    }
}

/// Creates the table of every entity type registered through `#[derive(TableEntity)]`.
pub async fn provision_tables<S: TableService>(service: &S) -> Result<Vec<&'static str>, Error> {
    let mut created = Vec::new();
    for meta in registered_tables() {
        if created.contains(&meta.table_name) {
            continue;
        }
        service.create_table_if_not_exists(meta.table_name).await?;
        log::info!("provisioned table {} for {}", meta.table_name, meta.type_path);
        created.push(meta.table_name);
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryTableService, entity::FromProperty, filter::Column};

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Note {
        partition_key: String,
        row_key: String,
        text: String,
        timestamp: Option<chrono::DateTime<Utc>>,
        etag: Option<String>,
    }

    impl TableEntity for Note {
        fn table_name() -> &'static str {
            "Note"
        }
        fn partition_key(&self) -> &str {
            &self.partition_key
        }
        fn row_key(&self) -> &str {
            &self.row_key
        }
        fn set_partition_key(&mut self, partition_key: String) {
            self.partition_key = partition_key;
        }
        fn set_row_key(&mut self, row_key: String) {
            self.row_key = row_key;
        }
        fn timestamp(&self) -> Option<chrono::DateTime<Utc>> {
            self.timestamp
        }
        fn etag(&self) -> Option<&str> {
            self.etag.as_deref()
        }
        fn to_record(&self) -> EntityRecord {
            EntityRecord::new(self.partition_key.clone(), self.row_key.clone())
                .with("text", self.text.clone())
        }
        fn from_record(mut record: EntityRecord) -> Result<Self, Error> {
            Ok(Self {
                text: String::from_property("text", record.take("text"))?,
                partition_key: record.partition_key,
                row_key: record.row_key,
                timestamp: record.timestamp,
                etag: record.etag,
            })
        }
    }

    fn note(text: &str) -> Note {
        Note {
            text: text.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn default_keys_are_assigned_once() {
        let policy = DefaultPolicy;
        let mut n = note("a");
        EntityPolicy::<Note>::before_save(&policy, &mut n);
        assert!(!n.row_key.is_empty());
        assert_eq!(n.partition_key, n.row_key);

        let first = n.clone();
        EntityPolicy::<Note>::before_save(&policy, &mut n);
        assert_eq!(n, first);
    }

    #[test]
    fn time_bucketed_keys_sort_newest_first() {
        let policy = TimeBucketedPolicy::default();
        let mut n = note("a");
        EntityPolicy::<Note>::before_save(&policy, &mut n);
        assert_eq!(n.partition_key.len(), keys::PARTITION_KEY_WIDTH);
        assert!(keys::decode_partition_key(&n.partition_key).is_ok());
        assert!(TimeBucketedPolicy::new(TimeDelta::zero()).is_err());
    }

    #[tokio::test]
    async fn save_reads_back_service_fields() {
        let repo = Repository::<Note, _>::new(MemoryTableService::new());
        assert_eq!(repo.table_name(), "Note");

        let saved = repo.save(note("hello")).await.unwrap();
        assert!(saved.timestamp.is_some());
        assert!(saved.etag.is_some());

        let found = repo
            .find(&saved.row_key, &saved.partition_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, saved);

        assert!(matches!(
            repo.find("", "p").await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn find_one_uses_single_item_pages() {
        let repo = Repository::<Note, _>::new(MemoryTableService::new());
        for text in ["a", "b", "c"] {
            repo.save(note(text)).await.unwrap();
        }
        let hit = repo
            .find_one(Column::new("text").eq("b"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.text, "b");
        assert_eq!(repo.find_one("text eq 'zzz'").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancelled_handles_stop_before_io() {
        let repo = Repository::<Note, _>::new(MemoryTableService::new());
        let (cancel, observed) = watch::channel(false);
        let cancelled = repo.with_cancellation(observed);
        cancel.send_replace(true);
        assert!(cancelled.is_cancelled());
        assert!(!repo.is_cancelled());
        assert!(matches!(
            cancelled.save(note("x")).await,
            Err(Error::Cancelled)
        ));
        assert!(repo.find_all(Query::All).await.unwrap().is_empty());
    }
}
