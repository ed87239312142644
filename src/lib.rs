#![doc = include_str!("../README.md")]
// Declare modules
pub mod backend;
pub mod buffer;
pub mod cache;
pub mod completion;
pub mod config;
pub mod copier;
pub mod error;
pub mod ingestor;
pub mod labels;
pub mod pool;
pub mod resolver;
pub mod telemetry;
pub mod types;
mod worker;

/// Storage engine contract and the bundled backends.
pub use crate::backend::{Backend, MemoryBackend, SqliteBackend};
/// Metric → table name cache.
pub use crate::cache::{MetricCache, MetricNameCache};
/// Configuration options for the ingestor.
pub use crate::config::IngestConfig;
/// Error types for ingestion and backend operations.
pub use crate::error::{BackendError, IngestError};
/// Main entry point of the ingestion pipeline.
pub use crate::ingestor::{InsertOutcome, Ingestor};
/// Label set identifying a series.
pub use crate::labels::Labels;
/// Structured event hook for observability.
pub use crate::telemetry::{IngestEvent, IngestEventListener, TracingEventListener};
/// Samples and series identifiers.
pub use crate::types::{Sample, SampleBatch, SeriesId, Timestamp, Value};

/// Number of sample batches a metric worker accumulates before flushing.
pub use crate::buffer::FLUSH_SIZE;
