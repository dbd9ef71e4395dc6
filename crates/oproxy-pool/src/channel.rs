use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use oproxy_common::clock::now_rfc3339;
use oproxy_common::glob::glob_match;
use oproxy_storage::JsonFile;

/// On-disk shape of `channels.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsFile {
    #[serde(default)]
    pub channels: Vec<Channel>,
}

/// A named group of credentials sharing one base URL, with routing weight,
/// priority, a model allow-list, a model remap table, and a concurrency cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Empty list permits every model.
    #[serde(default)]
    pub models: Vec<String>,
    /// Requested name -> upstream name.
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_enabled")]
    pub healthy: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// 0 means uncapped.
    #[serde(default)]
    pub max_concurrent: u32,
    #[serde(default)]
    pub current_concurrent: u32,
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub failed_requests: u64,
    #[serde(default)]
    pub last_used: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_weight() -> u32 {
    10
}

impl Channel {
    /// A channel serves a model when its list is empty, any list entry
    /// glob-matches, or the model is remapped.
    pub fn permits_model(&self, model: &str) -> bool {
        if self.models.is_empty() {
            return true;
        }
        if self.model_mapping.contains_key(model) {
            return true;
        }
        self.models.iter().any(|pattern| glob_match(pattern, model))
    }

    pub fn has_capacity(&self) -> bool {
        self.max_concurrent == 0 || self.current_concurrent < self.max_concurrent
    }

    pub fn resolve_model(&self, model: &str) -> String {
        self.model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }
}

#[derive(Debug, Default)]
struct Inner {
    channels: Vec<Channel>,
    /// Per-channel round-robin cursor over its ordered key list.
    cursors: HashMap<String, usize>,
}

pub struct ChannelRegistry {
    inner: Mutex<Inner>,
    store: Option<JsonFile>,
}

impl ChannelRegistry {
    pub fn new(store: Option<JsonFile>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            store,
        }
    }

    pub fn load(store: Option<JsonFile>, file: ChannelsFile) -> Self {
        let registry = Self::new(store);
        {
            let mut inner = registry.inner.lock().unwrap();
            inner.channels = file.channels;
            // In-flight counts never survive a restart.
            for channel in &mut inner.channels {
                channel.current_concurrent = 0;
            }
        }
        registry
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().channels.is_empty()
    }

    pub fn all(&self) -> Vec<Channel> {
        self.inner.lock().unwrap().channels.clone()
    }

    /// Channels eligible for `model`: enabled, healthy, under cap, and
    /// model-permitted.
    pub fn eligible_for(&self, model: &str) -> Vec<Channel> {
        self.inner
            .lock()
            .unwrap()
            .channels
            .iter()
            .filter(|c| c.enabled && c.healthy && c.has_capacity() && c.permits_model(model))
            .cloned()
            .collect()
    }

    /// Round-robin pick of a key within the channel.
    pub fn next_key_in(&self, channel_id: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        let channel = inner.channels.iter().find(|c| c.id == channel_id)?.clone();
        if channel.api_keys.is_empty() {
            // A keyless channel still routes; self-hosted servers accept
            // unauthenticated calls.
            return Some(String::new());
        }
        let cursor = inner.cursors.entry(channel_id.to_string()).or_insert(0);
        let key = channel.api_keys[*cursor % channel.api_keys.len()].clone();
        *cursor = cursor.wrapping_add(1);
        Some(key)
    }

    /// Reserve one concurrency slot; the returned guard releases it exactly
    /// once on drop, whatever path the request takes afterwards.
    pub fn acquire_slot(self: &Arc<Self>, channel_id: &str) -> ConcurrencyGuard {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(channel) = inner.channels.iter_mut().find(|c| c.id == channel_id) {
                channel.current_concurrent = channel.current_concurrent.saturating_add(1);
            }
        }
        ConcurrencyGuard {
            registry: Arc::clone(self),
            channel_id: channel_id.to_string(),
        }
    }

    fn release_slot(&self, channel_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(channel) = inner.channels.iter_mut().find(|c| c.id == channel_id) {
            channel.current_concurrent = channel.current_concurrent.saturating_sub(1);
        }
    }

    pub fn record_success(&self, channel_id: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(channel) = inner.channels.iter_mut().find(|c| c.id == channel_id) else {
                return;
            };
            channel.total_requests += 1;
            channel.last_used = Some(now_rfc3339());
            channel.healthy = true;
            channel.last_error = None;
        }
        self.persist();
    }

    pub fn record_failure(&self, channel_id: &str, error: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(channel) = inner.channels.iter_mut().find(|c| c.id == channel_id) else {
                return;
            };
            channel.total_requests += 1;
            channel.failed_requests += 1;
            channel.last_used = Some(now_rfc3339());
            channel.last_error = Some(error.to_string());
            if channel.failed_requests > 5
                && channel.total_requests > 0
                && (channel.failed_requests as f64 / channel.total_requests as f64) > 0.8
            {
                channel.healthy = false;
            }
        }
        self.persist();
    }

    fn snapshot(&self) -> JsonValue {
        let inner = self.inner.lock().unwrap();
        serde_json::to_value(ChannelsFile {
            channels: inner.channels.clone(),
        })
        .unwrap_or(JsonValue::Null)
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            store.schedule(self.snapshot());
        }
    }
}

/// RAII release of a channel concurrency slot.
pub struct ConcurrencyGuard {
    registry: Arc<ChannelRegistry>,
    channel_id: String,
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        self.registry.release_slot(&self.channel_id);
    }
}

impl std::fmt::Debug for ConcurrencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyGuard")
            .field("channel_id", &self.channel_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_channel(id: &str) -> Channel {
        Channel {
            id: id.to_string(),
            name: id.to_string(),
            base_url: "http://localhost:11434".to_string(),
            api_keys: vec!["k1".to_string(), "k2".to_string()],
            models: Vec::new(),
            model_mapping: HashMap::new(),
            enabled: true,
            healthy: true,
            priority: 0,
            weight: 10,
            max_concurrent: 0,
            current_concurrent: 0,
            total_requests: 0,
            failed_requests: 0,
            last_used: None,
            last_error: None,
        }
    }

    fn registry_with(channels: Vec<Channel>) -> Arc<ChannelRegistry> {
        Arc::new(ChannelRegistry::load(None, ChannelsFile { channels }))
    }

    #[test]
    fn empty_model_list_permits_all() {
        let channel = test_channel("a");
        assert!(channel.permits_model("anything"));
    }

    #[test]
    fn model_list_glob_matches() {
        let mut channel = test_channel("a");
        channel.models = vec!["llama*".to_string()];
        assert!(channel.permits_model("llama3:8b"));
        assert!(!channel.permits_model("qwen2"));
    }

    #[test]
    fn remapped_model_is_permitted_and_resolved() {
        let mut channel = test_channel("a");
        channel.models = vec!["other".to_string()];
        channel
            .model_mapping
            .insert("gpt-4o".to_string(), "llama3:70b".to_string());
        assert!(channel.permits_model("gpt-4o"));
        assert_eq!(channel.resolve_model("gpt-4o"), "llama3:70b");
        assert_eq!(channel.resolve_model("other"), "other");
    }

    #[test]
    fn per_channel_round_robin_cycles_keys() {
        let registry = registry_with(vec![test_channel("a")]);
        assert_eq!(registry.next_key_in("a").as_deref(), Some("k1"));
        assert_eq!(registry.next_key_in("a").as_deref(), Some("k2"));
        assert_eq!(registry.next_key_in("a").as_deref(), Some("k1"));
    }

    #[test]
    fn concurrency_guard_releases_exactly_once() {
        let mut channel = test_channel("a");
        channel.max_concurrent = 1;
        let registry = registry_with(vec![channel]);

        let guard = registry.acquire_slot("a");
        assert!(registry.eligible_for("m").is_empty()); // at cap
        drop(guard);
        assert_eq!(registry.eligible_for("m").len(), 1);
        // Releasing an already-dropped guard is impossible by construction;
        // the counter never goes negative even under spurious releases.
        registry.release_slot("a");
        assert_eq!(registry.all()[0].current_concurrent, 0);
    }

    #[test]
    fn zero_cap_means_uncapped() {
        let registry = registry_with(vec![test_channel("a")]);
        let _g1 = registry.acquire_slot("a");
        let _g2 = registry.acquire_slot("a");
        assert_eq!(registry.eligible_for("m").len(), 1);
    }

    #[test]
    fn channel_quarantine_follows_failure_ratio() {
        let registry = registry_with(vec![test_channel("a")]);
        for _ in 0..6 {
            registry.record_failure("a", "HTTP 500");
        }
        assert!(!registry.all()[0].healthy);
        registry.record_success("a");
        assert!(registry.all()[0].healthy);
    }

    #[test]
    fn reload_zeroes_inflight_counts() {
        let mut channel = test_channel("a");
        channel.current_concurrent = 3;
        let registry = registry_with(vec![channel]);
        assert_eq!(registry.all()[0].current_concurrent, 0);
    }
}
