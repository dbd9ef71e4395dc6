//! Injected collaborator interfaces: response cache, metrics sink, and
//! structured request logging. The core only depends on these traits; the
//! binary decides the concrete wiring.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::info;

/// Response cache for idempotent, non-streaming calls.
pub trait ResponseCache: Send + Sync {
    fn get(&self, key: &str) -> Option<JsonValue>;
    fn put(&self, key: &str, value: JsonValue);
}

/// SHA-256 hex over the model and the canonical input serialization.
pub fn cache_key(model: &str, input: &JsonValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(b"\x00");
    hasher.update(input.to_string().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Bounded in-memory cache with insertion-order eviction.
pub struct MemoryCache {
    capacity: usize,
    inner: Mutex<(HashMap<String, JsonValue>, VecDeque<String>)>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new((HashMap::new(), VecDeque::new())),
        }
    }
}

impl ResponseCache for MemoryCache {
    fn get(&self, key: &str) -> Option<JsonValue> {
        self.inner.lock().unwrap().0.get(key).cloned()
    }

    fn put(&self, key: &str, value: JsonValue) {
        let mut inner = self.inner.lock().unwrap();
        let (map, order) = &mut *inner;
        if map.insert(key.to_string(), value).is_none() {
            order.push_back(key.to_string());
        }
        while map.len() > self.capacity {
            match order.pop_front() {
                Some(oldest) => {
                    map.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

/// Cache that never hits; the default when caching is disabled.
pub struct NoopCache;

impl ResponseCache for NoopCache {
    fn get(&self, _key: &str) -> Option<JsonValue> {
        None
    }

    fn put(&self, _key: &str, _value: JsonValue) {}
}

/// Metrics emission points used by the pipeline. Label sets are small and
/// static; the sink owns aggregation and exposition.
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &'static str, labels: &[(&'static str, &str)], n: u64);
    fn gauge_add(&self, name: &'static str, delta: i64);
    fn observe_seconds(&self, name: &'static str, labels: &[(&'static str, &str)], seconds: f64);
}

pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _name: &'static str, _labels: &[(&'static str, &str)], _n: u64) {}
    fn gauge_add(&self, _name: &'static str, _delta: i64) {}
    fn observe_seconds(&self, _name: &'static str, _labels: &[(&'static str, &str)], _s: f64) {}
}

#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub client_ip: String,
    pub token_id: Option<String>,
    pub model: Option<String>,
    pub elapsed_ms: u128,
    pub stream: bool,
}

pub trait RequestLog: Send + Sync {
    fn log_request(&self, record: &RequestRecord);
    fn audit(&self, action: &str, actor: &str, details: &JsonValue);
}

/// Default sink: structured fields straight into `tracing`.
pub struct TracingRequestLog;

impl RequestLog for TracingRequestLog {
    fn log_request(&self, record: &RequestRecord) {
        info!(
            event = "request",
            request_id = %record.request_id,
            method = %record.method,
            path = %record.path,
            status = record.status,
            client_ip = %record.client_ip,
            token_id = record.token_id.as_deref().unwrap_or(""),
            model = record.model.as_deref().unwrap_or(""),
            elapsed_ms = record.elapsed_ms as u64,
            stream = record.stream
        );
    }

    fn audit(&self, action: &str, actor: &str, details: &JsonValue) {
        info!(event = "audit", action, actor, details = %details);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cache_key_is_stable_and_input_sensitive() {
        let a = cache_key("m", &json!(["x"]));
        let b = cache_key("m", &json!(["x"]));
        let c = cache_key("m", &json!(["y"]));
        let d = cache_key("n", &json!(["x"]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn memory_cache_evicts_oldest() {
        let cache = MemoryCache::new(2);
        cache.put("a", json!(1));
        cache.put("b", json!(2));
        cache.put("c", json!(3));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b"), Some(json!(2)));
        assert_eq!(cache.get("c"), Some(json!(3)));
    }

    #[test]
    fn memory_cache_overwrite_does_not_duplicate_order() {
        let cache = MemoryCache::new(2);
        cache.put("a", json!(1));
        cache.put("a", json!(2));
        cache.put("b", json!(3));
        assert_eq!(cache.get("a"), Some(json!(2)));
        assert_eq!(cache.get("b"), Some(json!(3)));
    }
}
