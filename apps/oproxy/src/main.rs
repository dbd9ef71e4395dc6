use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use oproxy_common::Config;
use oproxy_core::{
    AccessControl, AccessFile, AppState, HttpUpstreamClient, MemoryCache, NoopMetrics,
    TokenRegistry, TokensFile, TracingRequestLog, UpstreamClient,
};
use oproxy_pool::{
    ChannelRegistry, ChannelsFile, HealthChecker, KeyRegistry, KeysFile, StatsFile, StatsRegistry,
};
use oproxy_storage::{
    load_json, JsonFile, ACCESS_FILE, CHANNELS_FILE, DEFAULT_DEBOUNCE, KEYS_FILE, STATS_FILE,
    TOKENS_FILE,
};

mod cli;

const EMBEDDINGS_CACHE_CAPACITY: usize = 512;

#[tokio::main]
async fn main() -> Result<()> {
    let config = cli::Cli::parse().overlay(Config::from_env());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let data_dir = Path::new(&config.data_dir);
    let store =
        |name: &str| Some(JsonFile::new(data_dir.join(name), DEFAULT_DEBOUNCE));

    let keys_store = store(KEYS_FILE);
    let channels_store = store(CHANNELS_FILE);
    let tokens_store = store(TOKENS_FILE);
    let access_store = store(ACCESS_FILE);
    let stats_store = store(STATS_FILE);
    let all_stores: Vec<JsonFile> = [
        &keys_store,
        &channels_store,
        &tokens_store,
        &access_store,
        &stats_store,
    ]
    .into_iter()
    .flatten()
    .cloned()
    .collect();

    let keys = Arc::new(KeyRegistry::load(
        keys_store,
        load_json::<KeysFile>(data_dir.join(KEYS_FILE)).unwrap_or_default(),
    ));
    let channels = Arc::new(ChannelRegistry::load(
        channels_store,
        load_json::<ChannelsFile>(data_dir.join(CHANNELS_FILE)).unwrap_or_default(),
    ));
    let tokens = Arc::new(TokenRegistry::load(
        tokens_store,
        load_json::<TokensFile>(data_dir.join(TOKENS_FILE)).unwrap_or_default(),
    ));
    let stats = Arc::new(StatsRegistry::load(
        stats_store,
        load_json::<StatsFile>(data_dir.join(STATS_FILE)).unwrap_or_default(),
    ));
    let access_policy = load_json::<AccessFile>(data_dir.join(ACCESS_FILE))
        .unwrap_or_else(|| access_policy_from_config(&config));
    let access = Arc::new(AccessControl::new(access_policy, access_store));

    let client: Arc<dyn UpstreamClient> = Arc::new(HttpUpstreamClient::new(
        Duration::from_millis(config.connect_timeout_ms),
    )?);

    let bind = format!("{}:{}", config.host, config.port);
    let health_interval = config.health_check_interval_secs;

    let state = Arc::new(AppState::new(
        config,
        Arc::clone(&keys),
        channels,
        tokens,
        stats,
        access,
        client,
        Arc::new(MemoryCache::new(EMBEDDINGS_CACHE_CAPACITY)),
        Arc::new(NoopMetrics),
        Arc::new(TracingRequestLog),
    ));

    spawn_health_loop(Arc::clone(&keys), health_interval);
    spawn_limiter_sweep(Arc::clone(&state));

    let app = oproxy_router::api_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(bind = %bind, "oproxy listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Drain pending write-behind snapshots before exiting.
    for file in &all_stores {
        file.flush().await;
    }
    info!("state flushed, bye");
    Ok(())
}

fn access_policy_from_config(config: &Config) -> AccessFile {
    AccessFile {
        mode: config.ip_access_mode,
        whitelist: config.ip_whitelist.clone(),
        blacklist: config.ip_blacklist.clone(),
    }
}

fn spawn_health_loop(keys: Arc<KeyRegistry>, interval_secs: u64) {
    if interval_secs == 0 {
        info!("health probing disabled");
        return;
    }
    tokio::spawn(async move {
        let checker = HealthChecker::new();
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            checker.check_all(&keys).await;
        }
    });
}

fn spawn_limiter_sweep(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            oproxy_core::ratelimit::SWEEP_INTERVAL_SECS,
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            state.limiter.sweep();
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
