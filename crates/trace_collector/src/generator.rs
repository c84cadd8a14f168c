//! Random trace data for local smoke runs and benchmarks.

use pipeline_core::{AttributeValue, Span, TenantInfo, TraceData, Ttl};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

const OPERATIONS: [&str; 10] = [
    "http.request",
    "http.response",
    "db.query",
    "db.connect",
    "cache.get",
    "cache.set",
    "queue.publish",
    "queue.consume",
    "rpc.call",
    "auth.validate",
];

const SPAN_TYPES: [&str; 4] = ["llm", "tool", "retriever", "custom"];

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(1, |d| d.as_micros() as i64)
}

fn hex_id<R: Rng + ?Sized>(rng: &mut R, bytes: usize) -> String {
    (0..bytes).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}

/// One trace of `span_count` spans: a root and children pointing at it.
///
/// The retention class is picked at random.
pub fn trace_data<R: Rng + ?Sized>(rng: &mut R, tenant: &str, span_count: usize) -> TraceData {
    let trace_id = hex_id(rng, 16);
    let root_id = hex_id(rng, 8);
    let workspace_id = format!("ws-{}", rng.gen_range(1..=5));
    let start = now_micros();

    let span_list = (0..span_count)
        .map(|i| {
            let (span_id, parent_id) = if i == 0 {
                (root_id.clone(), String::new())
            } else {
                (hex_id(rng, 8), root_id.clone())
            };
            let mut tags = BTreeMap::new();
            tags.insert("sequence".to_string(), AttributeValue::Int(i as i64));
            if rng.gen_bool(0.2) {
                tags.insert("cache.hit".to_string(), AttributeValue::Bool(rng.gen()));
            }
            let status_code = if rng.gen_bool(0.05) { 1 } else { 0 };
            Span {
                trace_id: trace_id.clone(),
                span_id,
                parent_id,
                workspace_id: workspace_id.clone(),
                span_name: OPERATIONS.choose(rng).copied().unwrap_or("op").to_string(),
                span_type: SPAN_TYPES.choose(rng).copied().unwrap_or("custom").to_string(),
                start_time: start + i as i64 * 1_000,
                duration: rng.gen_range(100..50_000),
                status_code,
                input: String::new(),
                output: String::new(),
                tags,
            }
        })
        .collect();

    TraceData {
        tenant: tenant.to_string(),
        tenant_info: TenantInfo {
            ttl: Ttl::ALL.choose(rng).copied().unwrap_or_default(),
        },
        span_list,
    }
}
