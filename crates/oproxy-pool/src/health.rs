use std::time::Duration;

use futures_util::future::join_all;
use tracing::debug;

use crate::credential::{api_url, Credential};
use crate::registry::KeyRegistry;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Active prober: GET `<base>/api/tags` against each credential's upstream.
pub struct HealthChecker {
    client: reqwest::Client,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Probe one credential and apply the outcome to the registry.
    pub async fn check_key(&self, registry: &KeyRegistry, cred: &Credential) {
        let (healthy, error) = self.probe(cred).await;
        debug!(
            backend = %cred.id,
            healthy,
            error = error.as_deref().unwrap_or(""),
            "health probe finished"
        );
        registry.apply_health(&cred.id, healthy, error);
    }

    /// Probe every credential in parallel and await all outcomes.
    pub async fn check_all(&self, registry: &KeyRegistry) {
        let credentials = registry.all_credentials();
        let probes = credentials
            .iter()
            .map(|cred| self.check_key(registry, cred));
        join_all(probes).await;
    }

    async fn probe(&self, cred: &Credential) -> (bool, Option<String>) {
        let url = api_url(&cred.base_url, "/tags");
        let mut request = self.client.get(&url);
        if !cred.key.is_empty() {
            request = request.bearer_auth(&cred.key);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => (true, None),
            Ok(response) => (false, Some(format!("HTTP {}", response.status().as_u16()))),
            Err(err) if err.is_timeout() => {
                (false, Some("Health check timeout (10s)".to_string()))
            }
            Err(err) => (false, Some(err.to_string())),
        }
    }
}
