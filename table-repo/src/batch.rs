//! Multi-entity writes.
//!
//! The service only accepts transactions whose actions share one partition key
//! and number at most [`MAX_TRANSACTION_ACTIONS`]. Entities are therefore
//! grouped by partition key, each group is cut into chunks, and every chunk is
//! submitted as its own transaction, one after the other. A failed chunk stops
//! the batch; chunks committed before it stay committed.

use std::collections::{HashMap, HashSet};

use crate::{
    Error, Repository,
    client::{MAX_TRANSACTION_ACTIONS, Operation, TableClient, TableService, TransactionAction},
    entity::{EntityRecord, TableEntity, validate_keys},
    repository::EntityPolicy,
};

/// A single-partition transaction of at most [`MAX_TRANSACTION_ACTIONS`] actions.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionChunk {
    pub partition_key: String,
    pub actions: Vec<TransactionAction>,
}

/// Groups records by partition key, keeping first-seen order of groups and of
/// records within a group, then cuts each group into transaction-sized chunks.
pub fn plan_transactions(records: Vec<EntityRecord>, operation: Operation) -> Vec<TransactionChunk> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<EntityRecord>)> = Vec::new();
    for record in records {
        let slot = *slots.entry(record.partition_key.clone()).or_insert_with(|| {
            groups.push((record.partition_key.clone(), Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(record);
    }

    let mut chunks = Vec::new();
    for (partition_key, records) in groups {
        let mut records = records.into_iter().peekable();
        while records.peek().is_some() {
            let actions = records
                .by_ref()
                .take(MAX_TRANSACTION_ACTIONS)
                .map(|record| match operation {
                    Operation::Delete => TransactionAction::new(operation, record.key_only()),
                    _ => TransactionAction::new(operation, record),
                })
                .collect();
            chunks.push(TransactionChunk {
                partition_key: partition_key.clone(),
                actions,
            });
        }
    }
    chunks
}

/// Rejects invalid keys and repeated key pairs before anything is submitted.
fn validate_batch(records: &[EntityRecord]) -> Result<(), Error> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        validate_keys(&record.partition_key, &record.row_key)?;
        if !seen.insert(record.key()) {
            return Err(Error::invalid(format!(
                "entity ({}, {}) appears more than once in one batch",
                record.partition_key, record.row_key
            )));
        }
    }
    Ok(())
}

impl<T, S, P> Repository<T, S, P>
where
    T: TableEntity,
    S: TableService,
    P: EntityPolicy<T>,
{
    /// Writes `entities` with `operation` and returns how many were committed.
    ///
    /// The pre-save hook runs on every entity unless deleting. An empty input
    /// returns 0 without touching the store.
    pub async fn batch_submit(
        &self,
        entities: impl IntoIterator<Item = T>,
        operation: Operation,
    ) -> Result<usize, Error> {
        let mut entities = entities.into_iter().collect::<Vec<_>>();
        if entities.is_empty() {
            return Ok(0);
        }
        if operation != Operation::Delete {
            for entity in entities.iter_mut() {
                self.before_save(entity);
            }
        }
        let records = entities.iter().map(T::to_record).collect();
        self.submit_records(records, operation).await
    }

    pub(crate) async fn submit_records(
        &self,
        records: Vec<EntityRecord>,
        operation: Operation,
    ) -> Result<usize, Error> {
        if records.is_empty() {
            return Ok(0);
        }
        validate_batch(&records)?;

        let chunks = plan_transactions(records, operation);
        let table = self.table().await?;
        let total = chunks.len();
        let mut submitted = 0;
        for (n, chunk) in chunks.into_iter().enumerate() {
            self.ensure_not_cancelled()?;
            let size = chunk.actions.len();
            if let Err(e) = table
                .submit_transaction(&chunk.partition_key, chunk.actions)
                .await
            {
                log::warn!(
                    "{} chunk {}/{} on partition {} of {} failed after {} committed: {}",
                    operation.as_str(),
                    n + 1,
                    total,
                    chunk.partition_key,
                    self.table_name(),
                    submitted,
                    e
                );
                return Err(e);
            }
            submitted += size;
            log::debug!(
                "{} chunk {}/{} on partition {} of {}: {} entities",
                operation.as_str(),
                n + 1,
                total,
                chunk.partition_key,
                self.table_name(),
                size
            );
        }
        Ok(submitted)
    }

    /// Inserts; a chunk fails if any of its entities exists.
    pub async fn create_batch(&self, entities: impl IntoIterator<Item = T>) -> Result<usize, Error> {
        self.batch_submit(entities, Operation::Add).await
    }

    /// Replaces entities that must already exist.
    pub async fn update_batch(&self, entities: impl IntoIterator<Item = T>) -> Result<usize, Error> {
        self.batch_submit(entities, Operation::UpdateReplace).await
    }

    /// Merges properties into entities that must already exist.
    pub async fn merge_batch(&self, entities: impl IntoIterator<Item = T>) -> Result<usize, Error> {
        self.batch_submit(entities, Operation::UpdateMerge).await
    }

    /// Insert-or-replace.
    pub async fn save_batch(&self, entities: impl IntoIterator<Item = T>) -> Result<usize, Error> {
        self.batch_submit(entities, Operation::UpsertReplace).await
    }

    pub async fn delete_batch(&self, entities: impl IntoIterator<Item = T>) -> Result<usize, Error> {
        self.batch_submit(entities, Operation::Delete).await
    }
}
