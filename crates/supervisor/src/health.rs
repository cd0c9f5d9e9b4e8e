//! Gateway health polling.

use async_trait::async_trait;
use clawlink_core::config::loopback_health_url;
use clawlink_core::{retry, RetryPolicy};
use std::time::Duration;
use tracing::debug;

/// Poll schedule right after spawning the gateway process
pub const SPAWN_HEALTH_POLICY: RetryPolicy = RetryPolicy::fixed(10, Duration::from_millis(1500));
/// Poll schedule for the final installer step
pub const INSTALL_HEALTH_POLICY: RetryPolicy = RetryPolicy::fixed(15, Duration::from_secs(2));

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// One probe; `true` when the gateway answered healthy
    async fn probe(&self) -> bool;
}

/// HTTP GET against the gateway health endpoint; any 2xx is healthy
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: url.into(),
            client,
        }
    }

    pub fn for_port(port: u16) -> Self {
        Self::new(loopback_health_url(port))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                let healthy = response.status().is_success();
                if !healthy {
                    debug!("Health probe {} returned {}", self.url, response.status());
                }
                healthy
            }
            Err(e) => {
                debug!("Health probe {} failed: {}", self.url, e);
                false
            }
        }
    }
}

/// Probe until healthy or the policy runs out
pub async fn health_check(probe: &dyn HealthProbe, policy: &RetryPolicy) -> bool {
    retry(policy, |attempt| async move {
        if probe.probe().await {
            Ok(())
        } else {
            debug!("Gateway not healthy yet (attempt {})", attempt);
            Err(())
        }
    })
    .await
    .is_ok()
}
