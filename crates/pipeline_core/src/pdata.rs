//! Trace payloads flowing through a pipeline.
//!
//! A [`TraceData`] is one message worth of spans for a tenant. [`Traces`]
//! groups one or more of them under a single tenant and is the unit passed
//! between components.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Attribute value types (simplified OpenTelemetry model)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<AttributeValue>),
}

/// Retention class of stored spans.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Ttl {
    #[default]
    #[serde(rename = "3d")]
    ThreeDays,
    #[serde(rename = "7d")]
    SevenDays,
    #[serde(rename = "30d")]
    ThirtyDays,
    #[serde(rename = "90d")]
    NinetyDays,
    #[serde(rename = "180d")]
    HalfYear,
    #[serde(rename = "365d")]
    OneYear,
}

impl Ttl {
    pub const ALL: [Ttl; 6] = [
        Ttl::ThreeDays,
        Ttl::SevenDays,
        Ttl::ThirtyDays,
        Ttl::NinetyDays,
        Ttl::HalfYear,
        Ttl::OneYear,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Ttl::ThreeDays => "3d",
            Ttl::SevenDays => "7d",
            Ttl::ThirtyDays => "30d",
            Ttl::NinetyDays => "90d",
            Ttl::HalfYear => "180d",
            Ttl::OneYear => "365d",
        }
    }

    pub fn days(self) -> u32 {
        match self {
            Ttl::ThreeDays => 3,
            Ttl::SevenDays => 7,
            Ttl::ThirtyDays => 30,
            Ttl::NinetyDays => 90,
            Ttl::HalfYear => 180,
            Ttl::OneYear => 365,
        }
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a span was rejected at ingestion.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidSpan {
    #[error("trace id is empty")]
    MissingTraceId,
    #[error("span id is empty")]
    MissingSpanId,
    #[error("start time is not set")]
    MissingStartTime,
    #[error("duration is negative")]
    NegativeDuration,
}

/// A single span as delivered by instrumented services.
///
/// Times are microseconds since the Unix epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_id: String,
    pub workspace_id: String,
    pub span_name: String,
    pub span_type: String,
    pub start_time: i64,
    pub duration: i64,
    pub status_code: i32,
    pub input: String,
    pub output: String,
    pub tags: BTreeMap<String, AttributeValue>,
}

impl Span {
    /// Checks the fields every stored span must carry.
    pub fn check(&self) -> Result<(), InvalidSpan> {
        if self.trace_id.is_empty() {
            return Err(InvalidSpan::MissingTraceId);
        }
        if self.span_id.is_empty() {
            return Err(InvalidSpan::MissingSpanId);
        }
        if self.start_time <= 0 {
            return Err(InvalidSpan::MissingStartTime);
        }
        if self.duration < 0 {
            return Err(InvalidSpan::NegativeDuration);
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.check().is_ok()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TenantInfo {
    pub ttl: Ttl,
}

/// One message worth of spans for a tenant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TraceData {
    pub tenant: String,
    pub tenant_info: TenantInfo,
    pub span_list: Vec<Span>,
}

/// Spans of one tenant, grouped by the message they arrived in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Traces {
    pub tenant: String,
    pub trace_data: Vec<TraceData>,
}

impl Traces {
    pub fn new(tenant: impl Into<String>, trace_data: Vec<TraceData>) -> Self {
        Self {
            tenant: tenant.into(),
            trace_data,
        }
    }

    /// Wraps a single message, taking the tenant from it.
    pub fn from_trace_data(data: TraceData) -> Self {
        Self {
            tenant: data.tenant.clone(),
            trace_data: vec![data],
        }
    }

    /// Total spans across all grouped messages.
    pub fn span_count(&self) -> usize {
        self.trace_data.iter().map(|td| td.span_list.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.span_count() == 0
    }

    /// Appends the messages of `other`, which must belong to the same tenant.
    pub fn merge(&mut self, other: Traces) {
        debug_assert_eq!(self.tenant, other.tenant, "merging traces across tenants");
        self.trace_data.extend(other.trace_data);
    }

    pub fn spans(&self) -> impl Iterator<Item = &Span> {
        self.trace_data.iter().flat_map(|td| td.span_list.iter())
    }
}
