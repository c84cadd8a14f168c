//! Trace repositories: where the OLAP exporter writes spans.

use async_trait::async_trait;
use pipeline_core::{Span, Ttl};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Error types for repository writes
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// Storage or network failure, worth retrying
    #[error("transport error: {0}")]
    Transport(String),
    /// Rows could not be encoded; retrying will not help
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("all {attempts} attempts failed, last error: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<RepositoryError>,
    },
    #[error("insert timed out after {0:?}")]
    Timeout(Duration),
}

impl RepositoryError {
    /// Whether a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

/// One write: spans of a tenant sharing a retention class.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertSpansParam {
    pub database: String,
    pub table: String,
    pub tenant: String,
    pub ttl: Ttl,
    pub spans: Vec<Span>,
}

/// Span storage.
#[async_trait]
pub trait TraceRepository: Send + Sync {
    async fn insert_spans(&self, param: &InsertSpansParam) -> Result<(), RepositoryError>;

    /// Returns the repository name for logging.
    fn name(&self) -> &str;
}

/// Keeps every insert in memory.
#[derive(Debug, Default)]
pub struct MemoryTraceRepository {
    inserts: Mutex<Vec<InsertSpansParam>>,
}

impl MemoryTraceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inserts(&self) -> Vec<InsertSpansParam> {
        self.inserts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn span_count(&self) -> usize {
        self.inserts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|insert| insert.spans.len())
            .sum()
    }

    /// Spans stored for a tenant in one retention class.
    pub fn spans_for(&self, tenant: &str, ttl: Ttl) -> Vec<Span> {
        self.inserts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|insert| insert.tenant == tenant && insert.ttl == ttl)
            .flat_map(|insert| insert.spans.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl TraceRepository for MemoryTraceRepository {
    async fn insert_spans(&self, param: &InsertSpansParam) -> Result<(), RepositoryError> {
        self.inserts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(param.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpanRow<'a> {
    database: &'a str,
    table: &'a str,
    tenant: &'a str,
    ttl: Ttl,
    #[serde(flatten)]
    span: &'a Span,
}

/// Appends one JSON object per span to a file, for local development.
pub struct JsonLinesTraceRepository {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonLinesTraceRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(param: &InsertSpansParam) -> Result<Vec<u8>, RepositoryError> {
        let mut buf = Vec::new();
        for span in &param.spans {
            let row = SpanRow {
                database: &param.database,
                table: &param.table,
                tenant: &param.tenant,
                ttl: param.ttl,
                span,
            };
            serde_json::to_writer(&mut buf, &row)
                .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

#[async_trait]
impl TraceRepository for JsonLinesTraceRepository {
    async fn insert_spans(&self, param: &InsertSpansParam) -> Result<(), RepositoryError> {
        let buf = Self::encode(param)?;

        // one writer at a time keeps lines whole
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| RepositoryError::Transport(format!("{}: {e}", self.path.display())))?;
        file.write_all(&buf)
            .await
            .map_err(|e| RepositoryError::Transport(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| RepositoryError::Transport(e.to_string()))?;
        Ok(())
    }

    fn name(&self) -> &str {
        "json_lines"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::testing::span;

    fn param(tenant: &str, ttl: Ttl, ids: &[&str]) -> InsertSpansParam {
        InsertSpansParam {
            database: "observability".to_string(),
            table: "spans".to_string(),
            tenant: tenant.to_string(),
            ttl,
            spans: ids.iter().map(|id| span("t", id)).collect(),
        }
    }

    #[tokio::test]
    async fn test_memory_repository_records_inserts() {
        let repo = MemoryTraceRepository::new();
        repo.insert_spans(&param("acme", Ttl::ThreeDays, &["a", "b"])).await.unwrap();
        repo.insert_spans(&param("acme", Ttl::SevenDays, &["c"])).await.unwrap();
        repo.insert_spans(&param("other", Ttl::ThreeDays, &["d"])).await.unwrap();

        assert_eq!(repo.inserts().len(), 3);
        assert_eq!(repo.span_count(), 4);
        assert_eq!(repo.spans_for("acme", Ttl::ThreeDays).len(), 2);
        assert_eq!(repo.spans_for("acme", Ttl::SevenDays)[0].span_id, "c");
        assert!(repo.spans_for("acme", Ttl::OneYear).is_empty());
    }

    #[tokio::test]
    async fn test_json_lines_repository_appends_rows() {
        let path = std::env::temp_dir().join(format!("trace-collector-{}.jsonl", std::process::id()));
        let _ = tokio::fs::remove_file(&path).await;
        let repo = JsonLinesTraceRepository::new(&path);

        repo.insert_spans(&param("acme", Ttl::ThirtyDays, &["a", "b"])).await.unwrap();
        repo.insert_spans(&param("acme", Ttl::ThreeDays, &["c"])).await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let rows: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["tenant"], "acme");
        assert_eq!(rows[0]["ttl"], "30d");
        assert_eq!(rows[0]["table"], "spans");
        assert_eq!(rows[0]["spanId"], "a");
        assert_eq!(rows[2]["ttl"], "3d");

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_json_lines_repository_reports_unwritable_path() {
        let repo = JsonLinesTraceRepository::new("/nonexistent-dir/spans.jsonl");
        let err = repo
            .insert_spans(&param("acme", Ttl::ThreeDays, &["a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Transport(_)));
        assert!(err.is_retryable());
    }
}
