//! The storage client capability the repository is written against.
//!
//! Back-ends implement [`TableService`] and [`TableClient`]; the rules every
//! back-end shares (transaction shape, per-action semantics, page sizing) live
//! here so the memory and TiKV stores behave the same way.

use std::collections::HashSet;
use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    Error,
    entity::{EntityRecord, validate_keys},
};

/// Hard per-transaction item limit of the service.
pub const MAX_TRANSACTION_ACTIONS: usize = 100;

/// Largest page a query returns, also the default page size.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Opaque cursor naming where the next page of a query resumes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Token resuming at the given row. Keys never contain `/`.
    pub fn for_row(partition_key: &str, row_key: &str) -> Self {
        Self(format!("{partition_key}/{row_key}"))
    }

    pub fn row(&self) -> Result<(&str, &str), Error> {
        self.0
            .split_once('/')
            .filter(|(pk, rk)| !pk.is_empty() && !rk.is_empty())
            .ok_or_else(|| Error::invalid(format!("malformed continuation token {:?}", self.0)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One server page. The token is present iff more results may follow.
#[derive(Clone, Debug, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continuation: Option<ContinuationToken>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, continuation: Option<ContinuationToken>) -> Self {
        Self {
            items,
            continuation,
        }
    }

    pub fn is_last(&self) -> bool {
        self.continuation.is_none()
    }

    pub fn try_map<U>(self, f: impl FnMut(T) -> Result<U, Error>) -> Result<Page<U>, Error> {
        Ok(Page {
            items: self.items.into_iter().map(f).collect::<Result<_, _>>()?,
            continuation: self.continuation,
        })
    }
}

/// The write semantics a transaction action carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Insert; fails if the entity exists.
    Add,
    /// Replace an existing entity.
    UpdateReplace,
    /// Merge properties into an existing entity.
    UpdateMerge,
    /// Insert or replace.
    UpsertReplace,
    /// Insert or merge.
    UpsertMerge,
    /// Delete an existing entity.
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Add => "add",
            Operation::UpdateReplace => "update-replace",
            Operation::UpdateMerge => "update-merge",
            Operation::UpsertReplace => "upsert-replace",
            Operation::UpsertMerge => "upsert-merge",
            Operation::Delete => "delete",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransactionAction {
    pub operation: Operation,
    pub record: EntityRecord,
}

impl TransactionAction {
    pub fn new(operation: Operation, record: EntityRecord) -> Self {
        Self { operation, record }
    }
}

/// Per-action result of a committed transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionOutcome {
    pub row_key: String,
    /// `None` for deletes.
    pub etag: Option<String>,
}

/// Creates table handles.
pub trait TableService: Clone + Send + Sync + 'static {
    type Table: TableClient + Clone + Send + Sync + 'static;

    /// Idempotent create-if-not-exists.
    fn create_table_if_not_exists(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Self::Table, Error>> + Send;
}

/// Operations against one table.
pub trait TableClient {
    fn table_name(&self) -> &str;

    /// `None` when the entity does not exist.
    fn get_entity(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> impl Future<Output = Result<Option<EntityRecord>, Error>> + Send;

    fn upsert_entity(&self, record: EntityRecord)
    -> impl Future<Output = Result<(), Error>> + Send;

    /// Fails with [`Error::Conflict`] when the key pair is taken.
    fn insert_entity(&self, record: EntityRecord)
    -> impl Future<Output = Result<(), Error>> + Send;

    /// Succeeds when the entity does not exist.
    fn delete_entity(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Fetches one page, resuming at `continuation` when given.
    fn query_entities(
        &self,
        filter: Option<&str>,
        page_size: Option<u32>,
        continuation: Option<&ContinuationToken>,
    ) -> impl Future<Output = Result<Page<EntityRecord>, Error>> + Send;

    /// Applies every action atomically, or none of them.
    fn submit_transaction(
        &self,
        partition_key: &str,
        actions: Vec<TransactionAction>,
    ) -> impl Future<Output = Result<Vec<TransactionOutcome>, Error>> + Send;
}

/// Table names are 3 to 63 alphanumeric characters starting with a letter.
pub fn validate_table_name(name: &str) -> Result<(), Error> {
    let valid = (3..=63).contains(&name.len())
        && name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(Error::invalid(format!("invalid table name {name:?}")))
    }
}

/// Rejects transactions the service would refuse.
pub fn validate_transaction(partition_key: &str, actions: &[TransactionAction]) -> Result<(), Error> {
    if actions.is_empty() {
        return Err(Error::invalid("a transaction needs at least one action"));
    }
    if actions.len() > MAX_TRANSACTION_ACTIONS {
        return Err(Error::invalid(format!(
            "a transaction holds at most {MAX_TRANSACTION_ACTIONS} actions, got {}",
            actions.len()
        )));
    }
    let mut seen = HashSet::with_capacity(actions.len());
    for action in actions {
        let record = &action.record;
        validate_keys(&record.partition_key, &record.row_key)?;
        if record.partition_key != partition_key {
            return Err(Error::invalid(format!(
                "transaction for partition {partition_key:?} contains partition {:?}",
                record.partition_key
            )));
        }
        if !seen.insert(record.row_key.as_str()) {
            return Err(Error::invalid(format!(
                "row {:?} appears more than once in one transaction",
                record.row_key
            )));
        }
    }
    Ok(())
}

pub fn new_etag() -> String {
    format!("W/\"{}\"", Uuid::now_v7().simple())
}

fn stamp(mut record: EntityRecord, now: DateTime<Utc>) -> EntityRecord {
    record.timestamp = Some(now);
    record.etag = Some(new_etag());
    record
}

/// Computes the stored state after one action; `None` means the row is gone.
pub fn apply_action(
    existing: Option<&EntityRecord>,
    action: &TransactionAction,
    now: DateTime<Utc>,
) -> Result<Option<EntityRecord>, Error> {
    let record = &action.record;
    let missing = || Error::EntityNotFound {
        partition_key: record.partition_key.clone(),
        row_key: record.row_key.clone(),
    };
    let merged = |existing: &EntityRecord| {
        let mut merged = existing.clone();
        merged
            .properties
            .extend(record.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    };

    let next = match (action.operation, existing) {
        (Operation::Add, Some(_)) => {
            return Err(Error::Conflict {
                partition_key: record.partition_key.clone(),
                row_key: record.row_key.clone(),
            });
        }
        (Operation::Add, None) | (Operation::UpsertReplace, _) | (Operation::UpsertMerge, None) => {
            Some(record.clone())
        }
        (Operation::UpdateReplace, Some(_)) => Some(record.clone()),
        (Operation::UpdateMerge, Some(current)) | (Operation::UpsertMerge, Some(current)) => {
            Some(merged(current))
        }
        (Operation::Delete, Some(_)) => None,
        (Operation::UpdateReplace | Operation::UpdateMerge | Operation::Delete, None) => {
            return Err(missing());
        }
    };
    Ok(next.map(|record| stamp(record, now)))
}

/// Clamps a requested page size into `1..=MAX_PAGE_SIZE`.
pub fn effective_page_size(requested: Option<u32>) -> usize {
    requested.unwrap_or(MAX_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(operation: Operation, pk: &str, rk: &str) -> TransactionAction {
        TransactionAction::new(operation, EntityRecord::new(pk, rk).with("v", 1))
    }

    #[test]
    fn transaction_shape_is_enforced() {
        assert!(validate_transaction("p", &[]).is_err());

        let full = (0..MAX_TRANSACTION_ACTIONS)
            .map(|i| action(Operation::Add, "p", &format!("r{i}")))
            .collect::<Vec<_>>();
        assert!(validate_transaction("p", &full).is_ok());

        let mut over = full.clone();
        over.push(action(Operation::Add, "p", "extra"));
        assert!(validate_transaction("p", &over).is_err());

        let mixed = vec![action(Operation::Add, "p", "a"), action(Operation::Add, "q", "b")];
        assert!(validate_transaction("p", &mixed).is_err());

        let dup = vec![action(Operation::Add, "p", "a"), action(Operation::Delete, "p", "a")];
        assert!(validate_transaction("p", &dup).is_err());
    }

    #[test]
    fn action_semantics() {
        let now = Utc::now();
        let existing = EntityRecord::new("p", "r").with("keep", "yes").with("v", 0);

        assert!(matches!(
            apply_action(Some(&existing), &action(Operation::Add, "p", "r"), now),
            Err(Error::Conflict { .. })
        ));
        assert!(matches!(
            apply_action(None, &action(Operation::UpdateReplace, "p", "r"), now),
            Err(Error::EntityNotFound { .. })
        ));
        assert!(matches!(
            apply_action(None, &action(Operation::Delete, "p", "r"), now),
            Err(Error::EntityNotFound { .. })
        ));

        let replaced = apply_action(Some(&existing), &action(Operation::UpsertReplace, "p", "r"), now)
            .unwrap()
            .unwrap();
        assert!(!replaced.properties.contains_key("keep"));
        assert_eq!(replaced.timestamp, Some(now));
        assert!(replaced.etag.is_some());

        let merged = apply_action(Some(&existing), &action(Operation::UpdateMerge, "p", "r"), now)
            .unwrap()
            .unwrap();
        assert!(merged.properties.contains_key("keep"));
        assert_eq!(merged.property("v"), Some(crate::PropertyValue::Int32(1)));

        assert_eq!(
            apply_action(Some(&existing), &action(Operation::Delete, "p", "r"), now).unwrap(),
            None
        );
    }

    #[test]
    fn tokens_and_page_sizes() {
        let token = ContinuationToken::for_row("p1", "r-9");
        assert_eq!(token.row().unwrap(), ("p1", "r-9"));
        assert!(ContinuationToken::new("garbage").row().is_err());
        assert_eq!(effective_page_size(None), MAX_PAGE_SIZE as usize);
        assert_eq!(effective_page_size(Some(0)), 1);
        assert_eq!(effective_page_size(Some(5000)), MAX_PAGE_SIZE as usize);
    }
}
