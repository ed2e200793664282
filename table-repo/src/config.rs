use crate::client::MAX_PAGE_SIZE;

/// Construction-time settings of a [`Repository`](crate::Repository).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepositoryOptions {
    /// Overrides the policy's table name.
    pub table_name: Option<String>,
    /// Page size hint used when a query does not pass one.
    pub page_size: Option<u32>,
    /// Page size used by [`delete_where`](crate::Repository::delete_where).
    pub delete_page_size: u32,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            table_name: None,
            page_size: None,
            delete_page_size: MAX_PAGE_SIZE,
        }
    }
}

impl RepositoryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn delete_page_size(mut self, page_size: u32) -> Self {
        self.delete_page_size = page_size;
        self
    }
}
