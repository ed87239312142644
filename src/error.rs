use thiserror::Error;

/// Errors raised by a [`Backend`](crate::backend::Backend) implementation.
///
/// Cloneable so that a single failed flush can be reported to every request
/// whose data it carried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The target storage region is compressed and rejects direct writes.
    #[error("insert/update/delete not permitted on compressed region of {table}: {message}")]
    CompressedRegion { table: String, message: String },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backend returned no table name for metric {0}")]
    MissingTableName(String),
}

impl BackendError {
    /// Returns true if the error can be recovered by decompressing the region and retrying.
    pub fn is_compressed_region(&self) -> bool {
        matches!(self, BackendError::CompressedRegion { .. })
    }
}

impl From<rusqlite::Error> for BackendError {
    fn from(err: rusqlite::Error) -> Self {
        BackendError::Query(err.to_string())
    }
}

/// Error type for the ingestion pipeline.
#[derive(Error, Debug, Clone)]
pub enum IngestError {
    /// The metric worker could not resolve its destination table.
    #[error("Initializing the insert routine for metric {metric} has failed with {source}")]
    WorkerInit {
        metric: String,
        #[source]
        source: Box<IngestError>,
    },

    #[error("Series resolution failed: {0}")]
    SeriesResolution(#[source] BackendError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// An internal consistency check failed; the affected flush is abandoned.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Ingestor is closed")]
    Closed,

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Background task error: {0}")]
    BackgroundTask(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for IngestError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        IngestError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

impl IngestError {
    /// Returns the backend error at the root of this error, if any.
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            IngestError::Backend(e) | IngestError::SeriesResolution(e) => Some(e),
            IngestError::WorkerInit { source, .. } => source.backend_error(),
            _ => None,
        }
    }
}
