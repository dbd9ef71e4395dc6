use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use oproxy_common::clock::{days_ago_utc, today_utc};
use oproxy_storage::JsonFile;

const RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayStat {
    #[serde(default)]
    pub success: u64,
    #[serde(default)]
    pub fail: u64,
}

/// `stats.json`: date -> backend id -> success/fail tallies, 30-day window.
pub type StatsFile = BTreeMap<String, BTreeMap<String, DayStat>>;

pub struct StatsRegistry {
    inner: Mutex<StatsFile>,
    store: Option<JsonFile>,
}

impl StatsRegistry {
    pub fn new(store: Option<JsonFile>) -> Self {
        Self {
            inner: Mutex::new(StatsFile::new()),
            store,
        }
    }

    pub fn load(store: Option<JsonFile>, file: StatsFile) -> Self {
        let registry = Self::new(store);
        *registry.inner.lock().unwrap() = file;
        registry
    }

    pub fn record(&self, backend_id: &str, success: bool) {
        {
            let mut inner = self.inner.lock().unwrap();
            let day = inner.entry(today_utc()).or_default();
            let stat = day.entry(backend_id.to_string()).or_default();
            if success {
                stat.success += 1;
            } else {
                stat.fail += 1;
            }

            let horizon = days_ago_utc(RETENTION_DAYS);
            inner.retain(|date, _| date.as_str() >= horizon.as_str());
        }
        self.persist();
    }

    pub fn snapshot_map(&self) -> StatsFile {
        self.inner.lock().unwrap().clone()
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            let snapshot = serde_json::to_value(self.snapshot_map()).unwrap_or(JsonValue::Null);
            store.schedule(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_tallies_by_day_and_backend() {
        let stats = StatsRegistry::new(None);
        stats.record("b1", true);
        stats.record("b1", true);
        stats.record("b1", false);
        stats.record("b2", true);

        let map = stats.snapshot_map();
        let today = map.get(&today_utc()).unwrap();
        assert_eq!(today["b1"], DayStat { success: 2, fail: 1 });
        assert_eq!(today["b2"], DayStat { success: 1, fail: 0 });
    }

    #[test]
    fn retention_drops_dates_past_the_horizon() {
        let mut file = StatsFile::new();
        file.insert(
            "2000-01-01".to_string(),
            BTreeMap::from([("old".to_string(), DayStat { success: 1, fail: 0 })]),
        );
        let stats = StatsRegistry::load(None, file);
        stats.record("b1", true);

        let map = stats.snapshot_map();
        assert!(!map.contains_key("2000-01-01"));
        assert!(map.contains_key(&today_utc()));
    }
}
