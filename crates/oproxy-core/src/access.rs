use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use oproxy_common::AccessMode;
use oproxy_storage::JsonFile;

/// On-disk shape of `access.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessFile {
    #[serde(default)]
    pub mode: AccessMode,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
}

/// IPv4 allow/deny policy with literal and CIDR entries. The policy is a
/// read-mostly snapshot; replacement swaps it atomically.
pub struct AccessControl {
    policy: ArcSwap<AccessFile>,
    store: Option<JsonFile>,
}

impl AccessControl {
    pub fn new(policy: AccessFile, store: Option<JsonFile>) -> Self {
        Self {
            policy: ArcSwap::from_pointee(policy),
            store,
        }
    }

    pub fn policy(&self) -> AccessFile {
        self.policy.load().as_ref().clone()
    }

    pub fn replace(&self, policy: AccessFile) {
        self.policy.store(Arc::new(policy));
        if let Some(store) = &self.store {
            let snapshot =
                serde_json::to_value(self.policy()).unwrap_or(JsonValue::Null);
            store.schedule(snapshot);
        }
    }

    pub fn is_allowed(&self, ip: &str) -> bool {
        let ip = normalize_ip(ip);
        let policy = self.policy.load();
        match policy.mode {
            AccessMode::Disabled => true,
            AccessMode::Whitelist => {
                policy.whitelist.is_empty()
                    || policy.whitelist.iter().any(|entry| matches_entry(entry, &ip))
            }
            AccessMode::Blacklist => {
                !policy.blacklist.iter().any(|entry| matches_entry(entry, &ip))
            }
        }
    }
}

/// Strip the IPv4-mapped IPv6 prefix and fold loopback to dotted form.
pub fn normalize_ip(ip: &str) -> String {
    let ip = ip.trim();
    let ip = ip.strip_prefix("::ffff:").unwrap_or(ip);
    if ip == "::1" {
        return "127.0.0.1".to_string();
    }
    ip.to_string()
}

fn matches_entry(entry: &str, ip: &str) -> bool {
    if entry.contains('/') {
        cidr_contains(entry, ip)
    } else {
        entry == ip
    }
}

fn cidr_contains(cidr: &str, ip: &str) -> bool {
    let Some((range, bits)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(bits) = bits.parse::<u32>() else {
        return false;
    };
    if bits > 32 {
        return false;
    }
    let (Some(range), Some(ip)) = (ipv4_to_u32(range), ipv4_to_u32(ip)) else {
        return false;
    };
    let mask = (!((1u64 << (32 - bits)) - 1)) as u32;
    (range & mask) == (ip & mask)
}

fn ipv4_to_u32(ip: &str) -> Option<u32> {
    let mut octets = [0u32; 4];
    let mut count = 0;
    for part in ip.split('.') {
        if count == 4 {
            return None;
        }
        octets[count] = part.parse::<u8>().ok()? as u32;
        count += 1;
    }
    if count != 4 {
        return None;
    }
    Some((octets[0] << 24) | (octets[1] << 16) | (octets[2] << 8) | octets[3])
}
