pub mod access;
pub mod auth;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod proxy;
pub mod ratelimit;
pub mod relay;
pub mod services;
pub mod state;
pub mod upstream;

pub use access::{AccessControl, AccessFile};
pub use auth::{AuthContext, AuthToken, CreateTokenOptions, TokenRegistry, TokensFile};
pub use error::ApiError;
pub use middleware::{access_gate, auth_gate, rate_gate, request_context, ClientIp, RequestId};
pub use proxy::{BackendRef, ProxyEngine};
pub use ratelimit::{LimitScope, RateLimiter};
pub use relay::{spawn_relay, StreamTranslator};
pub use services::{
    cache_key, MemoryCache, MetricsSink, NoopCache, NoopMetrics, RequestLog, RequestRecord,
    ResponseCache, TracingRequestLog,
};
pub use state::AppState;
pub use upstream::{HttpUpstreamClient, UpstreamBody, UpstreamClient};
