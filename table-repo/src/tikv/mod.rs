//! TiKV-backed table store.
//!
//! Layout:
//! - `table/catalog/<table>` marks a created table.
//! - `table/rows/<table>/<partition key>\0<row key>` holds one row, prost-encoded.
//!
//! Keys never contain control characters, so the NUL separator keeps rows of a
//! partition contiguous and ordered by row key.

mod record;

use chrono::{DateTime, Utc};
use tikv_client::{CheckLevel, Key, Snapshot, Transaction, TransactionClient, TransactionOptions};

use crate::{
    Error,
    client::{
        ContinuationToken, Operation, Page, TableClient, TableService, TransactionAction,
        TransactionOutcome, apply_action, effective_page_size, validate_table_name,
        validate_transaction,
    },
    entity::{EntityRecord, validate_keys},
    filter::Filter,
};

use record::{decode_record, encode_record};

/// Comma-separated PD endpoints read by [`TikvTableService::from_env`].
pub const PD_ENDPOINTS_ENV: &str = "TABLE_REPO_PD_ENDPOINTS";

/// Rows fetched per scan round trip.
const SCAN_BATCH: u32 = 128;

fn catalog_path(table: &str) -> String {
    format!("table/catalog/{}", table)
}

fn rows_prefix(table: &str) -> String {
    format!("table/rows/{}/", table)
}

fn row_path(table: &str, partition_key: &str, row_key: &str) -> String {
    format!("table/rows/{}/{}\0{}", table, partition_key, row_key)
}

/// First key past every key starting with `prefix`.
fn prefix_end(prefix: &Key) -> Key {
    let mut end = Into::<Vec<u8>>::into(prefix.clone());
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return Key::from(end);
        }
    }
    Key::from(end)
}

/// Smallest key sorting after `key`.
fn successor(key: &Key) -> Key {
    let mut next = Into::<Vec<u8>>::into(key.clone());
    next.push(0);
    Key::from(next)
}

fn parse_endpoints(raw: &str) -> Result<Vec<String>, Error> {
    let endpoints = raw
        .split(',')
        .map(str::trim)
        .filter(|endpoint| !endpoint.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    if endpoints.is_empty() {
        return Err(Error::invalid("no PD endpoints given"));
    }
    Ok(endpoints)
}

fn write_options() -> TransactionOptions {
    TransactionOptions::new_optimistic().drop_check(CheckLevel::Warn)
}

/// Commits on success, rolls back otherwise.
async fn finish<R>(mut txn: Transaction, outcome: Result<R, Error>) -> Result<R, Error> {
    match outcome {
        Ok(value) => {
            txn.commit().await.map_err(Error::TikvError)?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = txn.rollback().await {
                log::warn!("rollback failed: {}", rollback);
            }
            Err(e)
        }
    }
}

/// Applies one action inside `txn`, returning the new etag.
async fn apply_in(
    txn: &mut Transaction,
    table: &str,
    action: &TransactionAction,
    now: DateTime<Utc>,
) -> Result<Option<String>, Error> {
    let record = &action.record;
    let key = row_path(table, &record.partition_key, &record.row_key);
    let existing = match txn.get(key.clone()).await.map_err(Error::TikvError)? {
        Some(data) => Some(decode_record(&data)?),
        None => None,
    };
    match apply_action(existing.as_ref(), action, now)? {
        Some(stored) => {
            let etag = stored.etag.clone();
            txn.put(key, encode_record(&stored))
                .await
                .map_err(Error::TikvError)?;
            Ok(etag)
        }
        None => {
            txn.delete(key).await.map_err(Error::TikvError)?;
            Ok(None)
        }
    }
}

#[derive(Clone)]
pub struct TikvTableService {
    client: TransactionClient,
}

impl TikvTableService {
    pub async fn connect(pd_endpoints: Vec<String>) -> Result<Self, Error> {
        let client = TransactionClient::new(pd_endpoints)
            .await
            .map_err(Error::TikvError)?;
        Ok(Self { client })
    }

    /// Connects to the endpoints listed in [`PD_ENDPOINTS_ENV`].
    pub async fn from_env() -> Result<Self, Error> {
        let raw = std::env::var(PD_ENDPOINTS_ENV)
            .map_err(|_| Error::invalid(format!("{} is not set", PD_ENDPOINTS_ENV)))?;
        Self::connect(parse_endpoints(&raw)?).await
    }
}

impl TableService for TikvTableService {
    type Table = TikvTable;

    async fn create_table_if_not_exists(&self, name: &str) -> Result<TikvTable, Error> {
        validate_table_name(name)?;
        let mut txn = self
            .client
            .begin_with_options(write_options())
            .await
            .map_err(Error::TikvError)?;
        let outcome = async {
            let key = catalog_path(name);
            if txn.get(key.clone()).await.map_err(Error::TikvError)?.is_none() {
                txn.put(key, Utc::now().to_rfc3339())
                    .await
                    .map_err(Error::TikvError)?;
                log::info!("created table {}", name);
            }
            Ok::<(), Error>(())
        }
        .await;
        finish(txn, outcome).await?;
        Ok(TikvTable {
            name: name.to_string(),
            client: self.client.clone(),
        })
    }
}

#[derive(Clone)]
pub struct TikvTable {
    name: String,
    client: TransactionClient,
}

impl TikvTable {
    async fn snapshot(&self) -> Result<Snapshot, Error> {
        let timestamp = self
            .client
            .current_timestamp()
            .await
            .map_err(Error::TikvError)?;
        Ok(self
            .client
            .snapshot(timestamp, TransactionOptions::new_optimistic()))
    }

    async fn begin(&self) -> Result<Transaction, Error> {
        self.client
            .begin_with_options(write_options())
            .await
            .map_err(Error::TikvError)
    }

    async fn write_one(&self, operation: Operation, record: EntityRecord) -> Result<(), Error> {
        validate_keys(&record.partition_key, &record.row_key)?;
        let action = TransactionAction::new(operation, record);
        let mut txn = self.begin().await?;
        let outcome = apply_in(&mut txn, &self.name, &action, Utc::now()).await;
        finish(txn, outcome).await.map(|_| ())
    }
}

impl TableClient for TikvTable {
    fn table_name(&self) -> &str {
        &self.name
    }

    async fn get_entity(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<EntityRecord>, Error> {
        let mut snapshot = self.snapshot().await?;
        let Some(data) = snapshot
            .get(row_path(&self.name, partition_key, row_key))
            .await
            .map_err(Error::TikvError)?
        else {
            return Ok(None);
        };
        decode_record(&data).map(Some)
    }

    async fn upsert_entity(&self, record: EntityRecord) -> Result<(), Error> {
        self.write_one(Operation::UpsertReplace, record).await
    }

    async fn insert_entity(&self, record: EntityRecord) -> Result<(), Error> {
        self.write_one(Operation::Add, record).await
    }

    async fn delete_entity(&self, partition_key: &str, row_key: &str) -> Result<(), Error> {
        let mut txn = self.begin().await?;
        let outcome = txn
            .delete(row_path(&self.name, partition_key, row_key))
            .await
            .map_err(Error::TikvError);
        finish(txn, outcome).await
    }

    async fn query_entities(
        &self,
        filter: Option<&str>,
        page_size: Option<u32>,
        continuation: Option<&ContinuationToken>,
    ) -> Result<Page<EntityRecord>, Error> {
        let filter = filter.map(Filter::parse).transpose()?;
        let limit = effective_page_size(page_size);
        let prefix = rows_prefix(&self.name);
        let end = prefix_end(&Key::from(prefix.clone()));
        let mut start = match continuation {
            Some(token) => {
                let (pk, rk) = token.row()?;
                Key::from(row_path(&self.name, pk, rk))
            }
            None => Key::from(prefix),
        };

        let mut snapshot = self.snapshot().await?;
        let mut items = Vec::new();
        loop {
            let batch = snapshot
                .scan(start.clone()..end.clone(), SCAN_BATCH)
                .await
                .map_err(Error::TikvError)?
                .collect::<Vec<_>>();
            let Some(last) = batch.last().map(|pair| pair.key().clone()) else {
                return Ok(Page::new(items, None));
            };
            let exhausted = batch.len() < SCAN_BATCH as usize;

            for pair in batch {
                let record = decode_record(pair.value())?;
                if !filter.as_ref().is_none_or(|f| f.matches(&record)) {
                    continue;
                }
                if items.len() == limit {
                    let next = ContinuationToken::for_row(&record.partition_key, &record.row_key);
                    return Ok(Page::new(items, Some(next)));
                }
                items.push(record);
            }

            if exhausted {
                return Ok(Page::new(items, None));
            }
            start = successor(&last);
        }
    }

    async fn submit_transaction(
        &self,
        partition_key: &str,
        actions: Vec<TransactionAction>,
    ) -> Result<Vec<TransactionOutcome>, Error> {
        validate_transaction(partition_key, &actions)?;
        let now = Utc::now();
        let mut txn = self.begin().await?;
        let outcome = async {
            let mut outcomes = Vec::with_capacity(actions.len());
            for (index, action) in actions.iter().enumerate() {
                let etag = apply_in(&mut txn, &self.name, action, now)
                    .await
                    .map_err(|source| Error::Transaction {
                        index,
                        source: Box::new(source),
                    })?;
                outcomes.push(TransactionOutcome {
                    row_key: action.record.row_key.clone(),
                    etag,
                });
            }
            Ok::<_, Error>(outcomes)
        }
        .await;
        finish(txn, outcome).await
    }
}
