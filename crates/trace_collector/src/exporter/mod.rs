//! OLAP exporter and the repositories it writes to.
//!
//! The exporter groups each batch by retention class and issues one
//! repository insert per class. Inserts go through [`RetryingRepository`]
//! and are bounded by `insertTimeout`.

pub mod olap;
pub mod repository;
pub mod retry;

pub use olap::{OlapExporterConfig, OlapExporterFactory, TraceExporter, EXPORTER_TYPE};
pub use repository::{
    InsertSpansParam, JsonLinesTraceRepository, MemoryTraceRepository, RepositoryError,
    TraceRepository,
};
pub use retry::{RetryConfig, RetryingRepository};
