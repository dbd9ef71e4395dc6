use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use oproxy_common::clock::now_rfc3339;
use oproxy_storage::JsonFile;

use crate::credential::{mask_key, parse_key_string, Credential};

/// On-disk shape of `keys.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysFile {
    #[serde(default)]
    pub keys: Vec<Credential>,
    #[serde(default)]
    pub current_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskedCredential {
    pub id: String,
    pub name: String,
    pub key: String,
    pub base_url: String,
    pub enabled: bool,
    pub healthy: bool,
    pub weight: u32,
    pub priority: i32,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub last_check: Option<String>,
    pub last_used: Option<String>,
    pub last_error: Option<String>,
    pub added_at: String,
}

impl MaskedCredential {
    fn from_credential(cred: &Credential) -> Self {
        Self {
            id: cred.id.clone(),
            name: cred.name.clone(),
            key: mask_key(&cred.key),
            base_url: cred.base_url.clone(),
            enabled: cred.enabled,
            healthy: cred.healthy,
            weight: cred.weight,
            priority: cred.priority,
            total_requests: cred.total_requests,
            failed_requests: cred.failed_requests,
            last_check: cred.last_check.clone(),
            last_used: cred.last_used.clone(),
            last_error: cred.last_error.clone(),
            added_at: cred.added_at.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct KeySummary {
    pub total: usize,
    pub enabled: usize,
    pub healthy: usize,
    pub disabled: usize,
    pub unhealthy: usize,
}

#[derive(Debug, Clone)]
pub enum AddOutcome {
    Added(Credential),
    Duplicate(Credential),
}

#[derive(Debug, Clone, Default)]
pub struct BatchImportReport {
    pub added: Vec<Credential>,
    pub duplicates: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    keys: Vec<Credential>,
    cursor: usize,
    generation: u64,
    masked_cache: Option<(u64, Vec<MaskedCredential>)>,
    summary_cache: Option<(u64, KeySummary)>,
}

/// Owns the flat credential pool: lifecycle, counters, health flags, the
/// round-robin cursor, and write-behind persistence of `keys.json`.
///
/// All methods are synchronous CPU work behind one lock; readers observing
/// counter pairs always see a consistent snapshot.
pub struct KeyRegistry {
    inner: Mutex<Inner>,
    store: Option<JsonFile>,
}

impl KeyRegistry {
    pub fn new(store: Option<JsonFile>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            store,
        }
    }

    pub fn load(store: Option<JsonFile>, file: KeysFile) -> Self {
        let registry = Self::new(store);
        {
            let mut inner = registry.inner.lock().unwrap();
            inner.cursor = file.current_index;
            inner.keys = file.keys;
            let len = inner.keys.len();
            if len > 0 {
                inner.cursor %= len;
            } else {
                inner.cursor = 0;
            }
        }
        registry
    }

    pub fn add_key(&self, raw: &str, default_base_url: &str) -> Option<AddOutcome> {
        let parsed = parse_key_string(raw, default_base_url)?;
        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(existing) = inner
                .keys
                .iter()
                .find(|c| c.key == parsed.key && c.base_url == parsed.base_url)
            {
                return Some(AddOutcome::Duplicate(existing.clone()));
            }
            let name = format!("key-{}", inner.keys.len() + 1);
            let cred = Credential::new(parsed.key, parsed.base_url, name);
            inner.keys.push(cred.clone());
            inner.generation += 1;
            AddOutcome::Added(cred)
        };
        self.persist();
        Some(outcome)
    }

    /// Import many keys at once. Lines split on newline, comma, or
    /// semicolon; blank lines and `#` comments are skipped; duplicates are
    /// checked against both the existing pool and earlier batch entries.
    /// Persists once at the end.
    pub fn batch_import(&self, text: &str, default_base_url: &str) -> BatchImportReport {
        let mut report = BatchImportReport::default();
        {
            let mut inner = self.inner.lock().unwrap();
            for line in text.split(['\n', ',', ';']) {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let Some(parsed) = parse_key_string(line, default_base_url) else {
                    report.errors.push(line.to_string());
                    continue;
                };
                let duplicate = inner
                    .keys
                    .iter()
                    .any(|c| c.key == parsed.key && c.base_url == parsed.base_url);
                if duplicate {
                    report.duplicates.push(line.to_string());
                    continue;
                }
                let name = format!("key-{}", inner.keys.len() + 1);
                let cred = Credential::new(parsed.key, parsed.base_url, name);
                inner.keys.push(cred.clone());
                report.added.push(cred);
            }
            if !report.added.is_empty() {
                inner.generation += 1;
            }
        }
        if !report.added.is_empty() {
            self.persist();
        }
        report
    }

    pub fn remove_key(&self, id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let before = inner.keys.len();
            inner.keys.retain(|c| c.id != id);
            let removed = inner.keys.len() != before;
            if removed {
                inner.generation += 1;
                let len = inner.keys.len();
                if len > 0 {
                    inner.cursor %= len;
                } else {
                    inner.cursor = 0;
                }
            }
            removed
        };
        if removed {
            self.persist();
        }
        removed
    }

    pub fn toggle_key(&self, id: &str) -> Option<Credential> {
        let toggled = {
            let mut inner = self.inner.lock().unwrap();
            let cred = inner.keys.iter_mut().find(|c| c.id == id)?;
            cred.enabled = !cred.enabled;
            let out = cred.clone();
            inner.generation += 1;
            Some(out)
        };
        if toggled.is_some() {
            self.persist();
        }
        toggled
    }

    pub fn clear_all(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.keys.clear();
            inner.cursor = 0;
            inner.generation += 1;
        }
        self.persist();
    }

    /// Operator action: mark every credential healthy again.
    pub fn reset_health(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            for cred in &mut inner.keys {
                cred.healthy = true;
                cred.last_error = None;
            }
            inner.generation += 1;
        }
        self.persist();
    }

    /// Round-robin over enabled+healthy credentials, falling back to all
    /// enabled ones when every credential is quarantined. Over any window
    /// of pool-size calls with a stable pool, each member is picked once.
    pub fn next_key(&self) -> Option<Credential> {
        let mut inner = self.inner.lock().unwrap();

        let healthy: Vec<usize> = inner
            .keys
            .iter()
            .enumerate()
            .filter(|(_, c)| c.enabled && c.healthy)
            .map(|(i, _)| i)
            .collect();
        let pool = if healthy.is_empty() {
            inner
                .keys
                .iter()
                .enumerate()
                .filter(|(_, c)| c.enabled)
                .map(|(i, _)| i)
                .collect()
        } else {
            healthy
        };
        if pool.is_empty() {
            return None;
        }

        let pick = pool[inner.cursor % pool.len()];
        inner.cursor = inner.cursor.wrapping_add(1);
        Some(inner.keys[pick].clone())
    }

    pub fn record_success(&self, id: &str) {
        let found = {
            let mut inner = self.inner.lock().unwrap();
            let Some(cred) = inner.keys.iter_mut().find(|c| c.id == id) else {
                return;
            };
            cred.total_requests += 1;
            cred.last_used = Some(now_rfc3339());
            cred.healthy = true;
            cred.last_error = None;
            inner.generation += 1;
            true
        };
        if found {
            self.persist();
        }
    }

    pub fn record_failure(&self, id: &str, error: &str) {
        let found = {
            let mut inner = self.inner.lock().unwrap();
            let Some(cred) = inner.keys.iter_mut().find(|c| c.id == id) else {
                return;
            };
            cred.total_requests += 1;
            cred.failed_requests += 1;
            cred.last_used = Some(now_rfc3339());
            cred.last_error = Some(error.to_string());
            if cred.over_failure_threshold() {
                cred.healthy = false;
            }
            inner.generation += 1;
            true
        };
        if found {
            self.persist();
        }
    }

    /// Probe outcome from the health checker.
    pub fn apply_health(&self, id: &str, healthy: bool, error: Option<String>) {
        let found = {
            let mut inner = self.inner.lock().unwrap();
            let Some(cred) = inner.keys.iter_mut().find(|c| c.id == id) else {
                return;
            };
            cred.healthy = healthy;
            cred.last_error = error;
            cred.last_check = Some(now_rfc3339());
            inner.generation += 1;
            true
        };
        if found {
            self.persist();
        }
    }

    pub fn all_credentials(&self) -> Vec<Credential> {
        self.inner.lock().unwrap().keys.clone()
    }

    /// Masked projection, memoised until the next mutation.
    pub fn masked_keys(&self) -> Vec<MaskedCredential> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((generation, cached)) = &inner.masked_cache {
            if *generation == inner.generation {
                return cached.clone();
            }
        }
        let generation = inner.generation;
        let masked: Vec<MaskedCredential> = inner
            .keys
            .iter()
            .map(MaskedCredential::from_credential)
            .collect();
        inner.masked_cache = Some((generation, masked.clone()));
        masked
    }

    /// Single-pass counts, memoised until the next mutation.
    pub fn summary(&self) -> KeySummary {
        let mut inner = self.inner.lock().unwrap();
        if let Some((generation, cached)) = &inner.summary_cache {
            if *generation == inner.generation {
                return *cached;
            }
        }
        let generation = inner.generation;
        let mut summary = KeySummary {
            total: inner.keys.len(),
            ..Default::default()
        };
        for cred in &inner.keys {
            if cred.enabled {
                summary.enabled += 1;
                if cred.healthy {
                    summary.healthy += 1;
                } else {
                    summary.unhealthy += 1;
                }
            } else {
                summary.disabled += 1;
            }
        }
        inner.summary_cache = Some((generation, summary));
        summary
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().keys.is_empty()
    }

    fn snapshot(&self) -> JsonValue {
        let inner = self.inner.lock().unwrap();
        serde_json::to_value(KeysFile {
            keys: inner.keys.clone(),
            current_index: inner.cursor,
        })
        .unwrap_or(JsonValue::Null)
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            store.schedule(self.snapshot());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: &str = "https://ollama.com/api";

    fn registry_with(keys: &[&str]) -> KeyRegistry {
        let registry = KeyRegistry::new(None);
        for key in keys {
            registry.add_key(key, DEFAULT).unwrap();
        }
        registry
    }

    #[test]
    fn add_key_detects_duplicates_by_key_and_base() {
        let registry = KeyRegistry::new(None);
        assert!(matches!(
            registry.add_key("sk-aaaa", DEFAULT),
            Some(AddOutcome::Added(_))
        ));
        assert!(matches!(
            registry.add_key("sk-aaaa", DEFAULT),
            Some(AddOutcome::Duplicate(_))
        ));
        // Same key under a different base URL is a distinct credential.
        assert!(matches!(
            registry.add_key("http://other:11434|sk-aaaa", DEFAULT),
            Some(AddOutcome::Added(_))
        ));
    }

    #[test]
    fn batch_import_splits_dedupes_and_reports() {
        let registry = registry_with(&["sk-existing"]);
        let report = registry.batch_import(
            "# comment\nsk-one, sk-two; sk-one\nsk-existing\n\n",
            DEFAULT,
        );
        assert_eq!(report.added.len(), 2);
        assert_eq!(report.duplicates, vec!["sk-one", "sk-existing"]);
        assert!(report.errors.is_empty());
        assert_eq!(registry.summary().total, 3);
    }

    #[test]
    fn round_robin_visits_every_key_once_per_cycle() {
        let registry = registry_with(&["sk-a", "sk-b", "sk-c"]);
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(registry.next_key().unwrap().key);
        }
        seen.sort();
        assert_eq!(seen, vec!["sk-a", "sk-b", "sk-c"]);
        // Second cycle revisits in the same order.
        assert_eq!(registry.next_key().unwrap().key, "sk-a");
    }

    #[test]
    fn round_robin_skips_disabled_and_unhealthy() {
        let registry = registry_with(&["sk-a", "sk-b", "sk-c"]);
        let all = registry.all_credentials();
        registry.toggle_key(&all[0].id); // disable sk-a
        registry.apply_health(&all[1].id, false, Some("HTTP 500".into()));

        for _ in 0..4 {
            assert_eq!(registry.next_key().unwrap().key, "sk-c");
        }
    }

    #[test]
    fn unhealthy_pool_falls_back_to_enabled() {
        let registry = registry_with(&["sk-a"]);
        let id = registry.all_credentials()[0].id.clone();
        registry.apply_health(&id, false, Some("HTTP 502".into()));
        assert_eq!(registry.next_key().unwrap().key, "sk-a");
    }

    #[test]
    fn empty_pool_yields_none() {
        let registry = KeyRegistry::new(None);
        assert!(registry.next_key().is_none());
        let registry = registry_with(&["sk-a"]);
        let id = registry.all_credentials()[0].id.clone();
        registry.toggle_key(&id);
        assert!(registry.next_key().is_none());
    }

    #[test]
    fn failure_counters_trip_quarantine() {
        let registry = registry_with(&["sk-a"]);
        let id = registry.all_credentials()[0].id.clone();
        for _ in 0..6 {
            registry.record_failure(&id, "HTTP 500");
        }
        let cred = &registry.all_credentials()[0];
        assert_eq!(cred.total_requests, 6);
        assert_eq!(cred.failed_requests, 6);
        assert!(!cred.healthy);
        assert_eq!(cred.last_error.as_deref(), Some("HTTP 500"));
    }

    #[test]
    fn success_restores_health_and_clears_error() {
        let registry = registry_with(&["sk-a"]);
        let id = registry.all_credentials()[0].id.clone();
        for _ in 0..6 {
            registry.record_failure(&id, "HTTP 500");
        }
        registry.record_success(&id);
        let cred = &registry.all_credentials()[0];
        assert!(cred.healthy);
        assert_eq!(cred.last_error, None);
        assert_eq!(cred.total_requests, 7);
    }

    #[test]
    fn summary_counts_every_state() {
        let registry = registry_with(&["sk-a", "sk-b", "sk-c"]);
        let all = registry.all_credentials();
        registry.toggle_key(&all[0].id);
        registry.apply_health(&all[1].id, false, None);

        let summary = registry.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.enabled, 2);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.unhealthy, 1);
        assert_eq!(summary.disabled, 1);
    }

    #[test]
    fn masked_keys_never_expose_raw_material() {
        let registry = registry_with(&["sk-test123456789012test"]);
        let masked = registry.masked_keys();
        assert_eq!(masked[0].key, "sk-tes***test");
    }

    #[test]
    fn cursor_survives_reload_and_clamps_to_pool() {
        let registry = registry_with(&["sk-a", "sk-b"]);
        registry.next_key();
        let file = KeysFile {
            keys: registry.all_credentials(),
            current_index: 5,
        };
        let reloaded = KeyRegistry::load(None, file);
        // 5 % 2 == 1 -> sk-b first.
        assert_eq!(reloaded.next_key().unwrap().key, "sk-b");
    }
}
