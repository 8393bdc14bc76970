// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Docker relay: pull, tag and push through a Docker daemon.
//!
//! Talks to the Docker Engine API over TCP/HTTP (`docker.host`).
//!
//! ```text
//! POST /images/create?fromImage=<src>&tag=<tag>     X-Registry-Auth: <source>
//! POST /images/<src>:<tag>/tag?repo=<dst>&tag=<tag>
//! POST /images/<dst>/push?tag=<tag>                 X-Registry-Auth: <target>
//! DELETE /images/<dst>:<tag>, /images/<src>:<tag>    (cleanup)
//! ```
//!
//! Pull and push answer 200 with a JSON progress stream; failures show up as
//! `{"error": ...}` objects inside that stream.
//!
//! The daemon decides about TLS itself: endpoints with `skip-tls-verify` must
//! be listed in the daemon's `insecure-registries`.

use super::{looks_like_auth_failure, replicate_each, Relay, ReplicationFuture, ReplicationRequest};
use crate::config::DockerConfig;
use crate::endpoint::Endpoint;
use crate::error::{BoxFuture, Result, SyncError};
use crate::task::Task;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const RELAY: &str = "docker";

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    error: Option<String>,
}

/// Scan a JSON-lines progress stream for an error message.
fn stream_error(body: &str) -> Option<String> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<StreamMessage>(line).ok())
        .find_map(|msg| msg.error)
}

/// Relay using a Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRelay {
    client: reqwest::Client,
    base_url: String,
    cleanup: bool,
}

impl DockerRelay {
    pub fn from_config(config: &DockerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SyncError::Internal(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url(),
            cleanup: config.cleanup,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn daemon_error(&self, operation: &str, e: reqwest::Error) -> SyncError {
        SyncError::relay(RELAY, format!("{operation}: daemon unreachable: {e}"))
    }

    /// Map a failed pull/push message onto an error.
    fn classify(endpoint: &Endpoint, operation: &str, message: String) -> SyncError {
        if looks_like_auth_failure(&message) {
            SyncError::auth(endpoint.host(), message)
        } else {
            SyncError::relay(RELAY, format!("{operation}: {message}"))
        }
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(self.url("/_ping"))
            .send()
            .await
            .map_err(|e| self.daemon_error("ping", e))?;
        if !response.status().is_success() {
            return Err(SyncError::relay(
                RELAY,
                format!("ping: daemon answered {}", response.status()),
            ));
        }
        Ok(())
    }

    /// Run a streaming operation (pull/push) and check the stream for errors.
    async fn stream_op(
        &self,
        endpoint: &Endpoint,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<()> {
        let auth = endpoint.credentials().await.to_x_registry_auth(endpoint.host());
        let response = request
            .header("X-Registry-Auth", auth)
            .send()
            .await
            .map_err(|e| self.daemon_error(operation, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.daemon_error(operation, e))?;

        if !status.is_success() {
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
                .unwrap_or(body);
            return Err(Self::classify(endpoint, operation, format!("{status}: {message}")));
        }
        match stream_error(&body) {
            Some(message) => Err(Self::classify(endpoint, operation, message)),
            None => Ok(()),
        }
    }

    async fn pull(&self, endpoint: &Endpoint, image: &str, tag: &str) -> Result<()> {
        let request = self
            .client
            .post(self.url("/images/create"))
            .query(&[("fromImage", image), ("tag", tag)]);
        self.stream_op(endpoint, "pull", request).await
    }

    async fn tag(&self, source: &str, repo: &str, tag: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/images/{source}/tag")))
            .query(&[("repo", repo), ("tag", tag)])
            .send()
            .await
            .map_err(|e| self.daemon_error("tag", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::relay(RELAY, format!("tag {source}: {status}: {body}")));
        }
        Ok(())
    }

    async fn push(&self, endpoint: &Endpoint, image: &str, tag: &str) -> Result<()> {
        let request = self
            .client
            .post(self.url(&format!("/images/{image}/push")))
            .query(&[("tag", tag)]);
        self.stream_op(endpoint, "push", request).await
    }

    async fn remove(&self, reference: &str) {
        let result = self
            .client
            .delete(self.url(&format!("/images/{reference}")))
            .send()
            .await;
        match result {
            Ok(r) if r.status().is_success() || r.status() == StatusCode::NOT_FOUND => {
                debug!(image = reference, "Removed local image");
            }
            Ok(r) => warn!(image = reference, status = %r.status(), "Cannot remove local image"),
            Err(e) => warn!(image = reference, error = %e, "Cannot remove local image"),
        }
    }

    async fn copy_tag(&self, request: &ReplicationRequest, tag: &str) -> Result<()> {
        let source_image = format!("{}/{}", request.source.host(), request.from);
        let target_image = format!("{}/{}", request.target.host(), request.to);

        self.pull(&request.source, &source_image, tag).await?;
        let result = async {
            self.tag(&request.source_ref(tag), &target_image, tag).await?;
            self.push(&request.target, &target_image, tag).await
        }
        .await;

        if self.cleanup {
            self.remove(&request.target_ref(tag)).await;
            self.remove(&request.source_ref(tag)).await;
        }
        result
    }
}

impl Relay for DockerRelay {
    fn name(&self) -> &'static str {
        RELAY
    }

    fn prepare<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            for endpoint in [&task.source, &task.target] {
                if endpoint.skip_tls_verify() {
                    warn!(
                        task = %task.name,
                        registry = %endpoint.registry(),
                        "skip-tls-verify requires the registry in the daemon's insecure-registries"
                    );
                }
            }
            self.ping().await
        })
    }

    fn replicate<'a>(
        &'a self,
        request: &'a ReplicationRequest,
        tags: &'a [String],
        target_tags: Option<&'a [String]>,
        cancel: &'a CancellationToken,
    ) -> ReplicationFuture<'a> {
        Box::pin(async move {
            replicate_each(RELAY, request, tags, target_tags, cancel, |tag| async move {
                self.copy_tag(request, &tag).await
            })
            .await
        })
    }
}
