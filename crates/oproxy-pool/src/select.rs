use std::sync::Arc;

use rand::Rng;

use crate::channel::{Channel, ChannelRegistry, ConcurrencyGuard};
use crate::registry::KeyRegistry;

/// A routed backend for one request: where to send it, which key to use,
/// the upstream model name, and (for channels) the held concurrency slot.
#[derive(Debug)]
pub struct Selection {
    /// Credential id or channel id, whichever pool produced the pick.
    pub backend_id: String,
    pub key: String,
    pub base_url: String,
    /// Requested model after any channel remap.
    pub model: String,
    pub from_channel: bool,
    pub guard: Option<ConcurrencyGuard>,
}

pub struct Selector {
    keys: Arc<KeyRegistry>,
    channels: Arc<ChannelRegistry>,
}

impl Selector {
    pub fn new(keys: Arc<KeyRegistry>, channels: Arc<ChannelRegistry>) -> Self {
        Self { keys, channels }
    }

    /// Channel regime when any channel exists and yields a candidate;
    /// otherwise round-robin over the flat credential pool.
    pub fn select(&self, model: &str) -> Option<Selection> {
        if !self.channels.is_empty() {
            if let Some(selection) = self.select_from_channels(model) {
                return Some(selection);
            }
        }
        self.select_flat(model)
    }

    fn select_from_channels(&self, model: &str) -> Option<Selection> {
        let eligible = self.channels.eligible_for(model);
        if eligible.is_empty() {
            return None;
        }

        let top_priority = eligible.iter().map(|c| c.priority).max()?;
        let tier: Vec<&Channel> = eligible
            .iter()
            .filter(|c| c.priority == top_priority)
            .collect();

        let chosen = if tier.len() == 1 {
            tier[0]
        } else {
            let total: u64 = tier.iter().map(|c| u64::from(c.weight)).sum();
            let r = rand::thread_rng().gen_range(0..total.max(1));
            weighted_pick(&tier, r)
        };

        let key = self.channels.next_key_in(&chosen.id)?;
        let guard = self.channels.acquire_slot(&chosen.id);
        Some(Selection {
            backend_id: chosen.id.clone(),
            key,
            base_url: chosen.base_url.clone(),
            model: chosen.resolve_model(model),
            from_channel: true,
            guard: Some(guard),
        })
    }

    fn select_flat(&self, model: &str) -> Option<Selection> {
        let cred = self.keys.next_key()?;
        Some(Selection {
            backend_id: cred.id,
            key: cred.key,
            base_url: cred.base_url,
            model: model.to_string(),
            from_channel: false,
            guard: None,
        })
    }
}

/// Scan until the running weight sum passes `r`.
fn weighted_pick<'a>(tier: &[&'a Channel], r: u64) -> &'a Channel {
    let mut acc = 0u64;
    for channel in tier.iter().copied() {
        acc += u64::from(channel.weight);
        if r < acc {
            return channel;
        }
    }
    tier[tier.len() - 1]
}
