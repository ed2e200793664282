use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid filter at offset {offset}: {message}")]
    InvalidFilter { offset: usize, message: String },
    #[error("Entity already exists: ({partition_key}, {row_key})")]
    Conflict {
        partition_key: String,
        row_key: String,
    },
    #[error("Entity not found: ({partition_key}, {row_key})")]
    EntityNotFound {
        partition_key: String,
        row_key: String,
    },
    #[error("Transaction action {index} failed: {source}")]
    Transaction {
        index: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("Failed to initialize table {table}: {source}")]
    Initialization {
        table: String,
        #[source]
        source: Arc<Error>,
    },
    #[error("Operation cancelled")]
    Cancelled,
    /// Raised by custom back-ends for failures outside TiKV.
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("TiKV error: {0}")]
    TikvError(#[from] tikv_client::Error),
    #[error("Prost error: {0}")]
    DeserializationError(#[from] prost::DecodeError),
    #[error("Corrupt stored record: {0}")]
    CorruptRecord(String),
    #[error("Missing property: {0}")]
    MissingProperty(String),
    #[error("Property {property} has type {found}, expected {expected}")]
    PropertyType {
        property: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Coarse classification of [`Error`] values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Conflict,
    Transport,
    Initialization,
    Cancelled,
    Data,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) | Error::InvalidFilter { .. } => ErrorKind::InvalidArgument,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::EntityNotFound { .. } => ErrorKind::NotFound,
            Error::Transaction { source, .. } => match source.kind() {
                ErrorKind::Conflict => ErrorKind::Conflict,
                ErrorKind::NotFound => ErrorKind::NotFound,
                ErrorKind::InvalidArgument => ErrorKind::InvalidArgument,
                _ => ErrorKind::Transport,
            },
            Error::Initialization { .. } => ErrorKind::Initialization,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Transport(_) | Error::TikvError(_) => ErrorKind::Transport,
            Error::DeserializationError(_)
            | Error::CorruptRecord(_)
            | Error::MissingProperty(_)
            | Error::PropertyType { .. } => ErrorKind::Data,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }
}
