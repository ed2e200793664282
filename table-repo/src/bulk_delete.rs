use crate::{
    Error, Repository,
    client::{ContinuationToken, Operation, TableService},
    entity::{EntityRecord, TableEntity},
    filter::Query,
    repository::EntityPolicy,
};

impl<T, S, P> Repository<T, S, P>
where
    T: TableEntity,
    S: TableService,
    P: EntityPolicy<T>,
{
    /// Deletes every entity matching `query`, holding one page in memory at a time.
    ///
    /// Pages are fetched with the continuation token of the previous page and
    /// deleted through the batch engine, so only committed chunks are counted.
    /// The loop ends on an empty page or when the server stops issuing tokens.
    pub async fn delete_where(&self, query: impl Into<Query>) -> Result<usize, Error> {
        let query = query.into();
        let page_size = Some(self.options().delete_page_size);
        let mut continuation: Option<ContinuationToken> = None;
        let mut deleted = 0;
        let mut pages = 0;

        loop {
            let page = self
                .fetch_page(&query, continuation.as_ref(), page_size)
                .await?;
            if page.items.is_empty() {
                break;
            }
            pages += 1;

            let keys = page.items.iter().map(EntityRecord::key_only).collect();
            deleted += match self.submit_records(keys, Operation::Delete).await {
                Ok(count) => count,
                Err(e) => {
                    log::warn!(
                        "bulk delete on {} stopped at page {} after {} deletions: {}",
                        self.table_name(),
                        pages,
                        deleted,
                        e
                    );
                    return Err(e);
                }
            };

            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        log::info!(
            "bulk delete on {} removed {} entities over {} pages",
            self.table_name(),
            deleted,
            pages
        );
        Ok(deleted)
    }
}
