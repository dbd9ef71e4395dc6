use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use oproxy_common::Config;
use oproxy_pool::{ChannelRegistry, KeyRegistry, StatsRegistry};

use crate::access::AccessControl;
use crate::auth::TokenRegistry;
use crate::proxy::ProxyEngine;
use crate::ratelimit::RateLimiter;
use crate::services::{MetricsSink, RequestLog, ResponseCache};
use crate::upstream::UpstreamClient;

/// Constructed once at boot and shared through the router; no module-level
/// mutable state anywhere, so tests can spin up isolated instances.
pub struct AppState {
    pub config: Config,
    pub keys: Arc<KeyRegistry>,
    pub channels: Arc<ChannelRegistry>,
    pub tokens: Arc<TokenRegistry>,
    pub stats: Arc<StatsRegistry>,
    pub access: Arc<AccessControl>,
    pub limiter: Arc<RateLimiter>,
    pub engine: ProxyEngine,
    pub cache: Arc<dyn ResponseCache>,
    pub metrics: Arc<dyn MetricsSink>,
    pub request_log: Arc<dyn RequestLog>,
    pub active_connections: AtomicI64,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        keys: Arc<KeyRegistry>,
        channels: Arc<ChannelRegistry>,
        tokens: Arc<TokenRegistry>,
        stats: Arc<StatsRegistry>,
        access: Arc<AccessControl>,
        client: Arc<dyn UpstreamClient>,
        cache: Arc<dyn ResponseCache>,
        metrics: Arc<dyn MetricsSink>,
        request_log: Arc<dyn RequestLog>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_global,
            config.rate_limit_ip,
            config.rate_limit_token,
        ));
        let engine = ProxyEngine::new(
            Arc::clone(&keys),
            Arc::clone(&channels),
            Arc::clone(&stats),
            client,
            Arc::clone(&metrics),
            config.max_retries,
            Duration::from_millis(config.connect_timeout_ms),
            Duration::from_millis(config.request_timeout_ms),
        );
        Self {
            config,
            keys,
            channels,
            tokens,
            stats,
            access,
            limiter,
            engine,
            cache,
            metrics,
            request_log,
            active_connections: AtomicI64::new(0),
        }
    }
}
