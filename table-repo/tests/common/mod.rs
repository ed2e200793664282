#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use table_repo::{
    ContinuationToken, EntityRecord, Error, MemoryTable, MemoryTableService, Page, TableClient,
    TableEntity, TableService, TransactionAction, TransactionOutcome,
};
use tokio::sync::watch;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(TableEntity, Clone, Debug, Default, PartialEq)]
#[table(name = "Orders")]
pub struct Order {
    #[partition_key]
    pub customer: String,
    #[row_key]
    pub id: String,
    #[timestamp]
    pub timestamp: Option<DateTime<Utc>>,
    #[etag]
    pub etag: Option<String>,
    #[property(name = "Total")]
    pub total: f64,
    pub status: String,
    pub note: Option<String>,
    #[property(skip)]
    pub dirty: bool,
}

impl Order {
    pub fn new(customer: &str, id: &str, total: f64) -> Self {
        Self {
            customer: customer.to_string(),
            id: id.to_string(),
            total,
            status: "open".to_string(),
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct CallLog {
    create_calls: AtomicUsize,
    queries: AtomicUsize,
    transactions: Mutex<Vec<(String, usize)>>,
    cancel_on_commit: Mutex<Option<watch::Sender<bool>>>,
}

/// Memory-backed service that records calls and injects failures.
#[derive(Clone)]
pub struct RecordingService {
    inner: MemoryTableService,
    log: Arc<CallLog>,
    fail_init: bool,
    fail_transaction: Option<usize>,
    init_delay: Option<Duration>,
}

impl RecordingService {
    pub fn new() -> Self {
        Self::over(MemoryTableService::new())
    }

    pub fn over(inner: MemoryTableService) -> Self {
        Self {
            inner,
            log: Arc::default(),
            fail_init: false,
            fail_transaction: None,
            init_delay: None,
        }
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Fails the transaction with this zero-based attempt number.
    pub fn failing_transaction(mut self, attempt: usize) -> Self {
        self.fail_transaction = Some(attempt);
        self
    }

    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    /// Publishes `true` on `cancel` once the next transaction commits.
    pub fn cancel_after_next_commit(&self, cancel: watch::Sender<bool>) {
        *self
            .log
            .cancel_on_commit
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cancel);
    }

    pub fn memory(&self) -> &MemoryTableService {
        &self.inner
    }

    pub fn create_calls(&self) -> usize {
        self.log.create_calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.log.queries.load(Ordering::SeqCst)
    }

    /// `(partition key, action count)` of every attempted transaction.
    pub fn transactions(&self) -> Vec<(String, usize)> {
        self.log
            .transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TableService for RecordingService {
    type Table = RecordingTable;

    async fn create_table_if_not_exists(&self, name: &str) -> Result<RecordingTable, Error> {
        self.log.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.init_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_init {
            return Err(Error::Transport("service unavailable".to_string()));
        }
        Ok(RecordingTable {
            inner: self.inner.create_table_if_not_exists(name).await?,
            log: self.log.clone(),
            fail_transaction: self.fail_transaction,
        })
    }
}

#[derive(Clone)]
pub struct RecordingTable {
    inner: MemoryTable,
    log: Arc<CallLog>,
    fail_transaction: Option<usize>,
}

impl TableClient for RecordingTable {
    fn table_name(&self) -> &str {
        self.inner.table_name()
    }

    async fn get_entity(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<EntityRecord>, Error> {
        self.inner.get_entity(partition_key, row_key).await
    }

    async fn upsert_entity(&self, record: EntityRecord) -> Result<(), Error> {
        self.inner.upsert_entity(record).await
    }

    async fn insert_entity(&self, record: EntityRecord) -> Result<(), Error> {
        self.inner.insert_entity(record).await
    }

    async fn delete_entity(&self, partition_key: &str, row_key: &str) -> Result<(), Error> {
        self.inner.delete_entity(partition_key, row_key).await
    }

    async fn query_entities(
        &self,
        filter: Option<&str>,
        page_size: Option<u32>,
        continuation: Option<&ContinuationToken>,
    ) -> Result<Page<EntityRecord>, Error> {
        self.log.queries.fetch_add(1, Ordering::SeqCst);
        self.inner
            .query_entities(filter, page_size, continuation)
            .await
    }

    async fn submit_transaction(
        &self,
        partition_key: &str,
        actions: Vec<TransactionAction>,
    ) -> Result<Vec<TransactionOutcome>, Error> {
        let attempt = {
            let mut transactions = self
                .log
                .transactions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            transactions.push((partition_key.to_string(), actions.len()));
            transactions.len() - 1
        };
        if self.fail_transaction == Some(attempt) {
            return Err(Error::Transport(format!("transaction {attempt} throttled")));
        }
        let outcomes = self.inner.submit_transaction(partition_key, actions).await?;
        let cancel = self
            .log
            .cancel_on_commit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cancel) = cancel {
            cancel.send_replace(true);
        }
        Ok(outcomes)
    }
}
