// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry endpoints: one side (source or target) of a task.
//!
//! An [`Endpoint`] owns the address, TLS policy and the current credentials
//! of a registry. Credentials are rotated through an
//! [`AuthRefresher`](crate::AuthRefresher); at most one refresh per endpoint
//! is in flight; concurrent callers wait for it and then reuse its result.
//!
//! # Credential generations
//!
//! ```text
//! gen 0 ──refresh──► gen 1 ──refresh──► gen 2
//!   ▲                  ▲
//!   │ observed by op A │ observed by op B
//! ```
//!
//! A caller that saw an auth failure passes the generation it used. If the
//! endpoint has already moved past that generation the refresh is skipped.

use crate::auth::{AuthRefresher, Credentials};
use crate::config::EndpointConfig;
use crate::error::Result;
use crate::metrics;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct CredentialState {
    credentials: Credentials,
    generation: u64,
    refreshed_at: Option<Instant>,
}

/// One registry as seen by a task.
#[derive(Debug)]
pub struct Endpoint {
    registry: String,
    skip_tls_verify: bool,
    auth_refresh: Option<Duration>,
    state: RwLock<CredentialState>,
    refresh_lock: Mutex<()>,
}

impl Endpoint {
    /// Create an endpoint with static credentials.
    pub fn new(registry: impl Into<String>, credentials: Credentials, skip_tls_verify: bool) -> Self {
        // Configured credentials count as fresh at creation time.
        let refreshed_at = (!credentials.is_anonymous()).then(Instant::now);
        Self {
            registry: registry.into(),
            skip_tls_verify,
            auth_refresh: None,
            state: RwLock::new(CredentialState {
                credentials,
                generation: 0,
                refreshed_at,
            }),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Anonymous endpoint.
    pub fn anonymous(registry: impl Into<String>) -> Self {
        Self::new(registry, Credentials::Anonymous, false)
    }

    /// Build from configuration. Auth material must already be validated.
    pub fn from_config(config: &EndpointConfig) -> Result<Self> {
        let credentials = match &config.auth {
            Some(raw) => Credentials::decode(raw)?,
            None => Credentials::Anonymous,
        };
        Ok(Self::new(config.registry.trim(), credentials, config.skip_tls_verify)
            .with_auth_refresh(config.auth_refresh()?))
    }

    /// Set the interval after which credentials are considered stale.
    pub fn with_auth_refresh(mut self, interval: Option<Duration>) -> Self {
        self.auth_refresh = interval;
        self
    }

    /// Registry address as configured (may carry an `http://` scheme).
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Registry host without any scheme, as used in image references.
    pub fn host(&self) -> &str {
        let host = self
            .registry
            .strip_prefix("https://")
            .or_else(|| self.registry.strip_prefix("http://"))
            .unwrap_or(&self.registry);
        host.trim_end_matches('/')
    }

    /// Whether the registry is addressed over plain HTTP.
    pub fn is_plain_http(&self) -> bool {
        self.registry.starts_with("http://")
    }

    pub fn skip_tls_verify(&self) -> bool {
        self.skip_tls_verify
    }

    /// Whether TLS certificates must be verified for this endpoint.
    pub fn tls_verify(&self) -> bool {
        !self.skip_tls_verify && !self.is_plain_http()
    }

    /// Base URL for Registry API v2 calls.
    pub fn api_base(&self) -> String {
        let scheme = if self.is_plain_http() { "http" } else { "https" };
        let host = match self.host() {
            "docker.io" | "index.docker.io" => "registry-1.docker.io",
            other => other,
        };
        format!("{scheme}://{host}")
    }

    /// Full image reference `<host>/<path>:<tag>`.
    pub fn reference(&self, path: &str, tag: &str) -> String {
        format!("{}/{}:{}", self.host(), path.trim_matches('/'), tag)
    }

    /// Current credentials.
    pub async fn credentials(&self) -> Credentials {
        self.state.read().await.credentials.clone()
    }

    /// Current credential generation, bumped on every successful refresh.
    pub async fn generation(&self) -> u64 {
        self.state.read().await.generation
    }

    /// Whether credentials should be refreshed before use.
    ///
    /// True when there are no credentials yet, or when they are older than
    /// the configured refresh interval.
    pub async fn needs_refresh(&self) -> bool {
        let state = self.state.read().await;
        match state.refreshed_at {
            None => state.credentials.is_anonymous(),
            Some(at) => self.auth_refresh.is_some_and(|interval| at.elapsed() >= interval),
        }
    }

    /// Refresh proactively if [`needs_refresh`](Self::needs_refresh) says so.
    pub async fn ensure_fresh(&self, refresher: &dyn AuthRefresher) -> Result<()> {
        if !self.needs_refresh().await {
            return Ok(());
        }
        let observed = self.generation().await;
        self.refresh(refresher, observed).await
    }

    /// Refresh credentials unless someone already refreshed past `observed`.
    pub async fn refresh(&self, refresher: &dyn AuthRefresher, observed: u64) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;

        if self.generation().await != observed {
            debug!(registry = %self.registry, "Credentials already refreshed by another caller");
            return Ok(());
        }

        match refresher.refresh(self).await {
            Ok(credentials) => {
                let mut state = self.state.write().await;
                state.credentials = credentials;
                state.generation += 1;
                state.refreshed_at = Some(Instant::now());
                metrics::record_auth_refresh(&self.registry, true);
                info!(
                    registry = %self.registry,
                    generation = state.generation,
                    "Credentials refreshed"
                );
                Ok(())
            }
            Err(e) => {
                metrics::record_auth_refresh(&self.registry, false);
                warn!(registry = %self.registry, error = %e, "Credential refresh failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::CountingRefresher;
    use std::sync::Arc;

    #[test]
    fn test_host_and_references() {
        let ep = Endpoint::anonymous("registry.example.com:5000");
        assert_eq!(ep.host(), "registry.example.com:5000");
        assert_eq!(
            ep.reference("/lib/app/", "1.0"),
            "registry.example.com:5000/lib/app:1.0"
        );
        assert_eq!(ep.api_base(), "https://registry.example.com:5000");
        assert!(ep.tls_verify());

        let plain = Endpoint::anonymous("http://127.0.0.1:5000/");
        assert_eq!(plain.host(), "127.0.0.1:5000");
        assert!(plain.is_plain_http());
        assert!(!plain.tls_verify());
        assert_eq!(plain.api_base(), "http://127.0.0.1:5000");
    }

    #[test]
    fn test_docker_hub_api_host() {
        let ep = Endpoint::anonymous("docker.io");
        assert_eq!(ep.api_base(), "https://registry-1.docker.io");
        assert_eq!(ep.reference("library/busybox", "1.36"), "docker.io/library/busybox:1.36");
    }

    #[test]
    fn test_from_config() {
        let mut config = EndpointConfig::for_testing("mirror.internal");
        config.auth = Some("bob:secret".to_string());
        config.skip_tls_verify = true;
        let ep = Endpoint::from_config(&config).unwrap();
        assert!(ep.skip_tls_verify());
        assert!(!ep.tls_verify());

        config.auth = Some("not valid auth".to_string());
        assert!(Endpoint::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_needs_refresh_without_credentials() {
        let ep = Endpoint::anonymous("r");
        assert!(ep.needs_refresh().await);

        let ep = Endpoint::new("r", Credentials::basic("u", "p"), false);
        assert!(!ep.needs_refresh().await);
    }

    #[tokio::test]
    async fn test_needs_refresh_after_interval() {
        let ep = Endpoint::new("r", Credentials::basic("u", "p"), false)
            .with_auth_refresh(Some(Duration::from_millis(20)));
        assert!(!ep.needs_refresh().await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(ep.needs_refresh().await);
    }

    #[tokio::test]
    async fn test_ensure_fresh_refreshes_once() {
        let refresher = CountingRefresher::new(Credentials::basic("u", "fresh"));
        let ep = Endpoint::anonymous("r");

        ep.ensure_fresh(&refresher).await.unwrap();
        ep.ensure_fresh(&refresher).await.unwrap();

        assert_eq!(refresher.count(), 1);
        assert_eq!(ep.generation().await, 1);
        assert_eq!(ep.credentials().await, Credentials::basic("u", "fresh"));
    }

    #[tokio::test]
    async fn test_refresh_skipped_for_stale_generation() {
        let refresher = CountingRefresher::new(Credentials::basic("u", "p"));
        let ep = Endpoint::anonymous("r");

        ep.refresh(&refresher, 0).await.unwrap();
        // Caller observed generation 0 but the endpoint is already at 1
        ep.refresh(&refresher, 0).await.unwrap();

        assert_eq!(refresher.count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_single_flight() {
        let refresher = Arc::new(
            CountingRefresher::new(Credentials::basic("u", "p"))
                .with_delay(Duration::from_millis(50)),
        );
        let ep = Arc::new(Endpoint::anonymous("r"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ep = Arc::clone(&ep);
            let refresher = Arc::clone(&refresher);
            handles.push(tokio::spawn(async move {
                ep.refresh(refresher.as_ref(), 0).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(refresher.count(), 1);
        assert_eq!(ep.generation().await, 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_generation() {
        let refresher = CountingRefresher::failing();
        let ep = Endpoint::anonymous("r");

        let err = ep.refresh(&refresher, 0).await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(ep.generation().await, 0);
        assert!(ep.credentials().await.is_anonymous());
    }
}
