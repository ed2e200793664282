//! In-process table store.
//!
//! Rows of a table live in one ordered map keyed by `(partition key, row key)`,
//! so scans, pages and continuation tokens follow the same order a partitioned
//! table service uses.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::{
    Error,
    client::{
        ContinuationToken, MAX_PAGE_SIZE, Operation, Page, TableClient, TableService,
        TransactionAction, TransactionOutcome, apply_action, effective_page_size,
        validate_table_name, validate_transaction,
    },
    entity::{EntityRecord, validate_keys},
    filter::Filter,
};

type RowKey = (String, String);
type Rows = BTreeMap<RowKey, EntityRecord>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct MemoryTableService {
    tables: Arc<Mutex<HashMap<String, Arc<Mutex<Rows>>>>>,
    max_page_size: u32,
}

impl Default for MemoryTableService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTableService {
    pub fn new() -> Self {
        Self {
            tables: Arc::default(),
            max_page_size: MAX_PAGE_SIZE,
        }
    }

    /// Caps every page at `max_page_size` regardless of what the caller asks for.
    pub fn with_max_page_size(mut self, max_page_size: u32) -> Self {
        self.max_page_size = max_page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names = lock(&self.tables).keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}

impl TableService for MemoryTableService {
    type Table = MemoryTable;

    async fn create_table_if_not_exists(&self, name: &str) -> Result<MemoryTable, Error> {
        validate_table_name(name)?;
        let rows = lock(&self.tables)
            .entry(name.to_string())
            .or_insert_with(|| {
                log::debug!("creating memory table {}", name);
                Arc::default()
            })
            .clone();
        Ok(MemoryTable {
            name: name.to_string(),
            rows,
            max_page_size: self.max_page_size,
        })
    }
}

#[derive(Clone)]
pub struct MemoryTable {
    name: String,
    rows: Arc<Mutex<Rows>>,
    max_page_size: u32,
}

impl MemoryTable {
    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_one(&self, operation: Operation, record: EntityRecord) -> Result<(), Error> {
        validate_keys(&record.partition_key, &record.row_key)?;
        let key = (record.partition_key.clone(), record.row_key.clone());
        let mut rows = lock(&self.rows);
        let action = TransactionAction::new(operation, record);
        match apply_action(rows.get(&key), &action, Utc::now())? {
            Some(stored) => {
                rows.insert(key, stored);
            }
            None => {
                rows.remove(&key);
            }
        }
        Ok(())
    }
}

impl TableClient for MemoryTable {
    fn table_name(&self) -> &str {
        &self.name
    }

    async fn get_entity(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<EntityRecord>, Error> {
        let key = (partition_key.to_string(), row_key.to_string());
        Ok(lock(&self.rows).get(&key).cloned())
    }

    async fn upsert_entity(&self, record: EntityRecord) -> Result<(), Error> {
        self.write_one(Operation::UpsertReplace, record)
    }

    async fn insert_entity(&self, record: EntityRecord) -> Result<(), Error> {
        self.write_one(Operation::Add, record)
    }

    async fn delete_entity(&self, partition_key: &str, row_key: &str) -> Result<(), Error> {
        let key = (partition_key.to_string(), row_key.to_string());
        lock(&self.rows).remove(&key);
        Ok(())
    }

    async fn query_entities(
        &self,
        filter: Option<&str>,
        page_size: Option<u32>,
        continuation: Option<&ContinuationToken>,
    ) -> Result<Page<EntityRecord>, Error> {
        let filter = filter.map(Filter::parse).transpose()?;
        let lower = match continuation {
            Some(token) => {
                let (pk, rk) = token.row()?;
                Bound::Included((pk.to_string(), rk.to_string()))
            }
            None => Bound::Unbounded,
        };
        let limit = effective_page_size(page_size).min(self.max_page_size as usize);

        let rows = lock(&self.rows);
        let mut matching = rows
            .range((lower, Bound::Unbounded))
            .map(|(_, record)| record)
            .filter(|record| filter.as_ref().is_none_or(|f| f.matches(record)));
        let items = matching.by_ref().take(limit).cloned().collect::<Vec<_>>();
        let continuation = matching
            .next()
            .map(|next| ContinuationToken::for_row(&next.partition_key, &next.row_key));
        Ok(Page::new(items, continuation))
    }

    async fn submit_transaction(
        &self,
        partition_key: &str,
        actions: Vec<TransactionAction>,
    ) -> Result<Vec<TransactionOutcome>, Error> {
        validate_transaction(partition_key, &actions)?;
        let now = Utc::now();
        let mut rows = lock(&self.rows);

        // Stage every change first so a failing action leaves the table untouched.
        let mut staged = Vec::with_capacity(actions.len());
        for (index, action) in actions.iter().enumerate() {
            let key = (
                action.record.partition_key.clone(),
                action.record.row_key.clone(),
            );
            let next = apply_action(rows.get(&key), action, now).map_err(|source| {
                Error::Transaction {
                    index,
                    source: Box::new(source),
                }
            })?;
            staged.push((key, next));
        }

        let mut outcomes = Vec::with_capacity(staged.len());
        for (key, next) in staged {
            let etag = next.as_ref().and_then(|record| record.etag.clone());
            match next {
                Some(record) => {
                    rows.insert(key.clone(), record);
                }
                None => {
                    rows.remove(&key);
                }
            }
            outcomes.push(TransactionOutcome {
                row_key: key.1,
                etag,
            });
        }
        Ok(outcomes)
    }
}
