use serde::{Deserialize, Serialize};

use oproxy_common::clock::now_rfc3339;

/// One upstream authority: an API key (possibly empty for unauthenticated
/// self-hosted servers) bound to a base URL, plus its live counters.
///
/// Field names serialize camelCase to stay readable in `keys.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,
    pub name: String,
    pub key: String,
    pub base_url: String,
    pub enabled: bool,
    pub healthy: bool,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub failed_requests: u64,
    #[serde(default)]
    pub last_check: Option<String>,
    #[serde(default)]
    pub last_used: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub added_at: String,
}

fn default_weight() -> u32 {
    10
}

impl Credential {
    pub fn new(key: String, base_url: String, name: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            key,
            base_url,
            enabled: true,
            healthy: true,
            weight: default_weight(),
            priority: 0,
            total_requests: 0,
            failed_requests: 0,
            last_check: None,
            last_used: None,
            last_error: None,
            added_at: now_rfc3339(),
        }
    }

    /// Quarantine rule: a failure-dominated credential drops out of the
    /// primary pool once past the warm-up threshold.
    pub fn over_failure_threshold(&self) -> bool {
        self.failed_requests > 5
            && self.total_requests > 0
            && (self.failed_requests as f64 / self.total_requests as f64) > 0.8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub key: String,
    pub base_url: String,
}

/// Parse one operator-supplied key line. Accepted forms, first match wins:
///
/// 1. `url|key` or `key|url` (whichever side starts with `http` is the URL)
/// 2. `url#key` (last `#`)
/// 3. `url/key` where the tail after the last `/` looks like a key
/// 4. bare key, paired with `default_base_url`
pub fn parse_key_string(raw: &str, default_base_url: &str) -> Option<ParsedKey> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some((lhs, rhs)) = raw.split_once('|') {
        let (base, key) = if lhs.trim().starts_with("http") {
            (lhs.trim(), rhs.trim())
        } else {
            (rhs.trim(), lhs.trim())
        };
        if key.is_empty() {
            return None;
        }
        return Some(ParsedKey {
            key: key.to_string(),
            base_url: normalize_base_url(base),
        });
    }

    if raw.starts_with("http") {
        if let Some(pos) = raw.rfind('#') {
            let (base, key) = (&raw[..pos], &raw[pos + 1..]);
            if !key.trim().is_empty() {
                return Some(ParsedKey {
                    key: key.trim().to_string(),
                    base_url: normalize_base_url(base.trim()),
                });
            }
        }

        if let Some(pos) = raw.rfind('/') {
            let tail = &raw[pos + 1..];
            if tail.len() >= 20
                && tail
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
            {
                return Some(ParsedKey {
                    key: tail.to_string(),
                    base_url: normalize_base_url(&raw[..pos]),
                });
            }
        }
    }

    Some(ParsedKey {
        key: raw.to_string(),
        base_url: normalize_base_url(default_base_url),
    })
}

/// Canonical base-URL form used for dedup and request building: no trailing
/// slash, no trailing `/api` — except ollama.com, which always carries it.
pub fn normalize_base_url(url: &str) -> String {
    let mut base = url.trim().trim_end_matches('/').to_string();
    if let Some(stripped) = base.strip_suffix("/api") {
        base = stripped.to_string();
    }
    if host_of(&base).contains("ollama.com") {
        base.push_str("/api");
    }
    base
}

fn host_of(url: &str) -> &str {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    rest.split('/').next().unwrap_or(rest)
}

/// Build a target URL for an Ollama API path like `/chat`.
pub fn api_url(base_url: &str, path: &str) -> String {
    if base_url.ends_with("/api") {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/api{path}")
    }
}

/// Masked projection of a key for listings and logs.
pub fn mask_key(key: &str) -> String {
    if key.len() > 10 {
        format!("{}***{}", &key[..6], &key[key.len() - 4..])
    } else if key.len() >= 2 {
        format!("{}***", &key[..2])
    } else {
        "***".to_string()
    }
}
