use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use oproxy_common::clock::{first_of_next_month, format_date, now_rfc3339, now_utc};
use oproxy_common::glob::glob_match;
use oproxy_common::RateLimitScope;
use oproxy_storage::JsonFile;

pub const TOKEN_PREFIX: &str = "sk-o2o-";

/// Client-facing bearer token with scoping and quota accounting.
/// Serialized camelCase into `tokens.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthToken {
    pub id: String,
    pub name: String,
    /// Plain bearer string; lookup stays keyed by it (see design notes).
    pub token: String,
    /// SHA-256 of the plain string, stored for a future hash-only lookup.
    pub token_hash: String,
    pub enabled: bool,
    pub created_at: String,
    #[serde(default)]
    pub expires_at: Option<String>,
    /// Monthly token-count budget; `None` disables quota checks.
    #[serde(default)]
    pub monthly_quota: Option<u64>,
    #[serde(default)]
    pub quota_used: u64,
    #[serde(default)]
    pub quota_reset_at: Option<String>,
    /// Glob patterns; empty permits every model.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    /// Exact IPv4 matches; empty permits every source.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub last_used: Option<String>,
    /// Per-token override of the token rate-limit window.
    #[serde(default)]
    pub rate_limit: Option<RateLimitScope>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsage {
    #[serde(default)]
    pub requests: u64,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

/// token id -> date (YYYY-MM-DD) -> tallies.
pub type UsageStats = BTreeMap<String, BTreeMap<String, DailyUsage>>;

/// On-disk shape of `tokens.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokensFile {
    #[serde(default)]
    pub tokens: Vec<AuthToken>,
    #[serde(default)]
    pub usage_stats: UsageStats,
}

#[derive(Debug, Clone, Default)]
pub struct CreateTokenOptions {
    pub name: String,
    pub expires_at: Option<String>,
    pub monthly_quota: Option<u64>,
    pub allowed_models: Vec<String>,
    pub allowed_ips: Vec<String>,
    pub rate_limit: Option<RateLimitScope>,
}

/// Request-scoped view of the authenticated caller.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub token: Option<AuthToken>,
}

impl AuthContext {
    pub fn token_id(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.id.as_str())
    }
}

#[derive(Debug, Default)]
struct Inner {
    tokens: Vec<AuthToken>,
    by_plain: HashMap<String, usize>,
    by_id: HashMap<String, usize>,
    usage: UsageStats,
}

impl Inner {
    fn reindex(&mut self) {
        self.by_plain.clear();
        self.by_id.clear();
        for (i, token) in self.tokens.iter().enumerate() {
            self.by_plain.insert(token.token.clone(), i);
            self.by_id.insert(token.id.clone(), i);
        }
    }
}

pub struct TokenRegistry {
    inner: Mutex<Inner>,
    store: Option<JsonFile>,
}

impl TokenRegistry {
    pub fn new(store: Option<JsonFile>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            store,
        }
    }

    /// Rebuild both lookup maps in one pass and catch up any quota resets
    /// that came due while the process was down.
    pub fn load(store: Option<JsonFile>, file: TokensFile) -> Self {
        let registry = Self::new(store);
        let mut reset_any = false;
        {
            let mut inner = registry.inner.lock().unwrap();
            inner.tokens = file.tokens;
            inner.usage = file.usage_stats;
            let now = now_utc();
            for token in &mut inner.tokens {
                reset_any |= reset_quota_if_due(token, now);
            }
            inner.reindex();
        }
        if reset_any {
            registry.persist();
        }
        registry
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().tokens.is_empty()
    }

    pub fn create_token(&self, opts: CreateTokenOptions) -> AuthToken {
        let plain = generate_token();
        let token = AuthToken {
            id: uuid::Uuid::new_v4().to_string(),
            name: opts.name,
            token_hash: sha256_hex(&plain),
            token: plain,
            enabled: true,
            created_at: now_rfc3339(),
            expires_at: opts.expires_at,
            monthly_quota: opts.monthly_quota,
            quota_used: 0,
            quota_reset_at: opts
                .monthly_quota
                .map(|_| rfc3339(first_of_next_month(now_utc()))),
            allowed_models: opts.allowed_models,
            allowed_ips: opts.allowed_ips,
            total_requests: 0,
            total_tokens: 0,
            last_used: None,
            rate_limit: opts.rate_limit,
        };
        {
            let mut inner = self.inner.lock().unwrap();
            inner.tokens.push(token.clone());
            inner.reindex();
        }
        self.persist();
        token
    }

    pub fn remove_token(&self, id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let before = inner.tokens.len();
            inner.tokens.retain(|t| t.id != id);
            let removed = inner.tokens.len() != before;
            if removed {
                inner.usage.remove(id);
                inner.reindex();
            }
            removed
        };
        if removed {
            self.persist();
        }
        removed
    }

    /// O(1) lookup without validation; used to key the token rate window
    /// before the auth gate runs.
    pub fn peek(&self, plain: &str) -> Option<AuthToken> {
        let inner = self.inner.lock().unwrap();
        inner
            .by_plain
            .get(plain)
            .map(|i| inner.tokens[*i].clone())
    }

    /// Validation order: existence, enabled, expiry, quota. The first
    /// failure wins. A due quota reset is applied before the quota check.
    pub fn validate(&self, plain: &str) -> Result<AuthToken, &'static str> {
        let mut reset_applied = false;
        let result = {
            let mut inner = self.inner.lock().unwrap();
            let Some(&index) = inner.by_plain.get(plain) else {
                return Err("invalid token");
            };
            let now = now_utc();
            let token = &mut inner.tokens[index];
            if !token.enabled {
                return Err("token disabled");
            }
            if let Some(expires_at) = token.expires_at.as_deref() {
                if parse_rfc3339(expires_at).is_some_and(|at| at <= now) {
                    return Err("token expired");
                }
            }
            reset_applied = reset_quota_if_due(token, now);
            if let Some(quota) = token.monthly_quota {
                if token.quota_used >= quota {
                    return Err("quota exceeded");
                }
            }
            Ok(token.clone())
        };
        if reset_applied {
            self.persist();
        }
        result
    }

    /// Empty list permits every model; otherwise any `*`-glob must match.
    pub fn check_model_access(token: &AuthToken, model: &str) -> bool {
        token.allowed_models.is_empty()
            || token
                .allowed_models
                .iter()
                .any(|pattern| glob_match(pattern, model))
    }

    /// Empty list permits every source IP; otherwise exact membership.
    pub fn check_ip_access(token: &AuthToken, ip: &str) -> bool {
        token.allowed_ips.is_empty() || token.allowed_ips.iter().any(|entry| entry == ip)
    }

    pub fn record_usage(&self, id: &str, prompt_tokens: u64, completion_tokens: u64) {
        let found = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            let Some(&index) = inner.by_id.get(id) else {
                return;
            };
            let token = &mut inner.tokens[index];
            token.total_requests += 1;
            token.total_tokens += prompt_tokens + completion_tokens;
            token.quota_used += prompt_tokens + completion_tokens;
            token.last_used = Some(now_rfc3339());

            let day = inner
                .usage
                .entry(id.to_string())
                .or_default()
                .entry(format_date(now_utc().date()))
                .or_default();
            day.requests += 1;
            day.prompt_tokens += prompt_tokens;
            day.completion_tokens += completion_tokens;
            true
        };
        if found {
            self.persist();
        }
    }

    /// Summed usage across all tokens over the last `days` calendar days.
    pub fn aggregate_usage(&self, days: i64) -> DailyUsage {
        let horizon = format_date((now_utc() - time::Duration::days(days)).date());
        let inner = self.inner.lock().unwrap();
        let mut total = DailyUsage::default();
        for per_day in inner.usage.values() {
            for (date, usage) in per_day {
                if date.as_str() >= horizon.as_str() {
                    total.requests += usage.requests;
                    total.prompt_tokens += usage.prompt_tokens;
                    total.completion_tokens += usage.completion_tokens;
                }
            }
        }
        total
    }

    pub fn all_tokens(&self) -> Vec<AuthToken> {
        self.inner.lock().unwrap().tokens.clone()
    }

    fn snapshot(&self) -> JsonValue {
        let inner = self.inner.lock().unwrap();
        serde_json::to_value(TokensFile {
            tokens: inner.tokens.clone(),
            usage_stats: inner.usage.clone(),
        })
        .unwrap_or(JsonValue::Null)
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            store.schedule(self.snapshot());
        }
    }
}

/// Idempotent: fires once per month boundary, re-arming for the next one.
fn reset_quota_if_due(token: &mut AuthToken, now: OffsetDateTime) -> bool {
    if token.monthly_quota.is_none() {
        return false;
    }
    let due = match token.quota_reset_at.as_deref().and_then(parse_rfc3339) {
        Some(at) => at <= now,
        // A quota without a reset instant picks one up on first sight.
        None => true,
    };
    if !due {
        return false;
    }
    token.quota_used = 0;
    token.quota_reset_at = Some(rfc3339(first_of_next_month(now)));
    true
}

fn generate_token() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..48).map(|_| HEX[rng.gen_range(0..HEX.len())] as char).collect();
    format!("{TOKEN_PREFIX}{suffix}")
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn parse_rfc3339(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).ok()
}

fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}
