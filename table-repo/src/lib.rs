extern crate self as table_repo;

mod batch;
mod bulk_delete;
pub mod client;
mod config;
mod entity;
mod error;
mod filter;
pub mod keys;
mod memory;
mod repository;
pub mod tikv;

pub use batch::{TransactionChunk, plan_transactions};
pub use client::{
    ContinuationToken, MAX_PAGE_SIZE, MAX_TRANSACTION_ACTIONS, Operation, Page, TableClient,
    TableService, TransactionAction, TransactionOutcome,
};
pub use config::RepositoryOptions;
pub use entity::{
    EntityRecord, EntityTableMeta, FromProperty, IntoProperty, PropertyValue, TableEntity,
    registered_tables,
};
pub use error::{Error, ErrorKind};
pub use filter::{Column, CompareOp, Filter, Query};
pub use memory::{MemoryTable, MemoryTableService};
pub use repository::{
    DefaultPolicy, EntityPolicy, Repository, TimeBucketedPolicy, assign_missing_keys,
    provision_tables,
};
pub use tikv::{TikvTable, TikvTableService};

pub use table_repo_derive::TableEntity;

#[doc(hidden)]
pub use inventory;

#[doc(hidden)]
pub mod __private {
    pub use chrono::{DateTime, Utc};
}
