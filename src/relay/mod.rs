// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relays: the engines that move image content between registries.
//!
//! A [`Relay`] receives the resolved tag set of one mapping and copies each
//! tag from the source to the target endpoint. Two strategies exist:
//!
//! | Relay | How | Module |
//! |-------|-----|--------|
//! | `docker` | pull, tag, push through a Docker daemon | [`docker`] |
//! | `skopeo` | `skopeo copy` registry to registry | [`skopeo`] |
//!
//! Both are behaviorally substitutable: given the same tags and registry
//! state they leave the same tag set at the target.
//!
//! # Failure model
//!
//! Per-tag failures are collected in [`ReplicationOutcome::failed`] and the
//! batch continues. A relay returns [`Halted`] only when continuing is
//! pointless: credentials rejected, or the abort token fired. `Halted` keeps
//! the tags settled before the stop, so a retry resumes instead of copying
//! them again.
//!
//! # Example
//!
//! ```rust,no_run
//! use registry_mirror::relay::{Relay, ReplicationFuture, ReplicationOutcome, ReplicationRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! struct PrintRelay;
//!
//! impl Relay for PrintRelay {
//!     fn name(&self) -> &'static str {
//!         "print"
//!     }
//!
//!     fn replicate<'a>(
//!         &'a self,
//!         request: &'a ReplicationRequest,
//!         tags: &'a [String],
//!         _target_tags: Option<&'a [String]>,
//!         _cancel: &'a CancellationToken,
//!     ) -> ReplicationFuture<'a> {
//!         Box::pin(async move {
//!             for tag in tags {
//!                 println!("{} -> {}", request.source_ref(tag), request.target_ref(tag));
//!             }
//!             Ok(ReplicationOutcome { succeeded: tags.to_vec(), ..Default::default() })
//!         })
//!     }
//! }
//! ```

pub mod docker;
pub mod skopeo;

use crate::config::{RelayKind, SyncConfig};
use crate::endpoint::Endpoint;
use crate::error::{BoxFuture, Result, SyncError};
use crate::registry::RegistryClient;
use crate::resilience::RetryConfig;
use crate::tags::{CachedLister, TagLister};
use crate::task::Task;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use docker::DockerRelay;
pub use skopeo::SkopeoRelay;

/// Everything a relay needs to know about one mapping.
#[derive(Debug, Clone)]
pub struct ReplicationRequest {
    pub task: String,
    pub source: Arc<Endpoint>,
    pub target: Arc<Endpoint>,
    pub from: String,
    pub to: String,
    /// Upper bound for copying a single tag.
    pub operation_timeout: Duration,
}

impl ReplicationRequest {
    pub fn source_ref(&self, tag: &str) -> String {
        self.source.reference(&self.from, tag)
    }

    pub fn target_ref(&self, tag: &str) -> String {
        self.target.reference(&self.to, tag)
    }
}

/// Per-tag results of one mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationOutcome {
    pub succeeded: Vec<String>,
    pub skipped: Vec<String>,
    /// `(tag, error message)`
    pub failed: Vec<(String, String)>,
}

impl ReplicationOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Whether `tag` already has a result in this outcome.
    pub fn settled(&self, tag: &str) -> bool {
        self.succeeded.iter().chain(&self.skipped).any(|t| t == tag)
            || self.failed.iter().any(|(t, _)| t == tag)
    }

    /// Append the results of a later batch of the same mapping.
    pub fn merge(&mut self, other: ReplicationOutcome) {
        self.succeeded.extend(other.succeeded);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
    }
}

/// A batch stopped before every tag was attempted.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct Halted {
    /// Results of the tags handled before the stop.
    pub outcome: ReplicationOutcome,
    #[source]
    pub error: SyncError,
}

impl From<SyncError> for Halted {
    fn from(error: SyncError) -> Self {
        Self {
            outcome: ReplicationOutcome::default(),
            error,
        }
    }
}

pub type ReplicationResult = std::result::Result<ReplicationOutcome, Halted>;

pub type ReplicationFuture<'a> = Pin<Box<dyn Future<Output = ReplicationResult> + Send + 'a>>;

/// Replication backend.
pub trait Relay: Send + Sync + 'static {
    /// Short name used in logs, metrics and errors.
    fn name(&self) -> &'static str;

    /// Per-task, per-tick setup. An error fails the task for this tick only.
    fn prepare<'a>(&'a self, _task: &'a Task) -> BoxFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Copy `tags` from `request.source` to `request.target`.
    ///
    /// `target_tags`, when given, lists what the target already has; those
    /// tags are skipped. `cancel` is the abort token: once it fires the
    /// in-flight copy is dropped and the batch halts with
    /// [`SyncError::ShutdownTimeout`].
    fn replicate<'a>(
        &'a self,
        request: &'a ReplicationRequest,
        tags: &'a [String],
        target_tags: Option<&'a [String]>,
        cancel: &'a CancellationToken,
    ) -> ReplicationFuture<'a>;
}

/// Create the relay selected in configuration.
pub fn build_relay(config: &SyncConfig) -> Result<Arc<dyn Relay>> {
    Ok(match config.relay {
        RelayKind::Docker => Arc::new(DockerRelay::from_config(&config.docker)?),
        RelayKind::Skopeo => Arc::new(SkopeoRelay::from_config(&config.skopeo)),
    })
}

/// Create the tag lister matching the configured relay, behind the tag cache.
///
/// The skopeo relay lists through `skopeo list-tags` so both share one view
/// of TLS and credentials; the docker relay lists through the Registry API.
pub fn build_lister(config: &SyncConfig) -> Result<Arc<dyn TagLister>> {
    let inner: Arc<dyn TagLister> = match config.relay {
        RelayKind::Docker => Arc::new(RegistryClient::from_config(
            &config.lister,
            RetryConfig::default(),
        )?),
        RelayKind::Skopeo => Arc::new(SkopeoRelay::from_config(&config.skopeo)),
    };
    Ok(Arc::new(CachedLister::new(
        inner,
        config.lister.cache_duration()?,
        config.lister.max_items,
    )))
}

/// Run `fut` until it completes or the abort token fires.
pub(crate) async fn abortable<T, Fut>(cancel: &CancellationToken, what: &str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::ShutdownTimeout(what.to_string())),
        result = fut => result,
    }
}

/// Run `fut` bounded by `timeout` and the abort token.
pub(crate) async fn guarded<T, Fut>(
    cancel: &CancellationToken,
    timeout: Duration,
    what: &str,
    fut: Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    abortable(cancel, what, async {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::relay(what, format!("timed out after {timeout:?}"))),
        }
    })
    .await
}

/// Shared per-tag loop: skip what the target has, copy the rest one by one.
///
/// Auth and shutdown errors halt the batch; anything else is recorded
/// against the tag.
pub(crate) async fn replicate_each<F, Fut>(
    relay: &str,
    request: &ReplicationRequest,
    tags: &[String],
    target_tags: Option<&[String]>,
    cancel: &CancellationToken,
    mut copy: F,
) -> ReplicationResult
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let existing: HashSet<&str> = target_tags
        .unwrap_or_default()
        .iter()
        .map(String::as_str)
        .collect();
    let mut outcome = ReplicationOutcome::default();

    for tag in tags {
        if existing.contains(tag.as_str()) {
            outcome.skipped.push(tag.clone());
            continue;
        }
        if cancel.is_cancelled() {
            let error = SyncError::ShutdownTimeout(format!("{} {}", relay, request.source_ref(tag)));
            return Err(Halted { outcome, error });
        }

        debug!(
            relay,
            task = %request.task,
            source = %request.source_ref(tag),
            target = %request.target_ref(tag),
            "Copying tag"
        );
        let what = format!("{relay} {}", request.source_ref(tag));
        match guarded(cancel, request.operation_timeout, &what, copy(tag.clone())).await {
            Ok(()) => outcome.succeeded.push(tag.clone()),
            Err(error) if error.is_auth() || error.is_shutdown() => {
                return Err(Halted { outcome, error });
            }
            Err(e) => {
                warn!(relay, task = %request.task, tag = %tag, error = %e, "Tag replication failed");
                outcome.failed.push((tag.clone(), e.to_string()));
            }
        }
    }

    Ok(outcome)
}

/// Classify backend error text as an auth failure.
pub(crate) fn looks_like_auth_failure(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    [
        "unauthorized",
        "authentication required",
        "access denied",
        "access to the resource is denied",
        "incorrect username or password",
        "status 401",
        "status code 401",
        "401 unauthorized",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request() -> ReplicationRequest {
        ReplicationRequest {
            task: "t".into(),
            source: Arc::new(Endpoint::anonymous("src.example")),
            target: Arc::new(Endpoint::anonymous("dst.example:5000")),
            from: "lib/app".into(),
            to: "mirror/app".into(),
            operation_timeout: Duration::from_millis(200),
        }
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_references() {
        let req = request();
        assert_eq!(req.source_ref("1.0"), "src.example/lib/app:1.0");
        assert_eq!(req.target_ref("1.0"), "dst.example:5000/mirror/app:1.0");
    }

    #[tokio::test]
    async fn test_replicate_each_skips_existing() {
        let copies = AtomicUsize::new(0);
        let existing = tags(&["1.0"]);
        let outcome = replicate_each(
            "test",
            &request(),
            &tags(&["1.0", "1.1", "2.0"]),
            Some(&existing),
            &CancellationToken::new(),
            |_| async {
                copies.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.skipped, tags(&["1.0"]));
        assert_eq!(outcome.succeeded, tags(&["1.1", "2.0"]));
        assert_eq!(copies.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_replicate_each_collects_failures() {
        let outcome = replicate_each(
            "test",
            &request(),
            &tags(&["1.0", "bad", "2.0"]),
            None,
            &CancellationToken::new(),
            |tag| async move {
                if tag == "bad" {
                    Err(SyncError::relay("test", "manifest unknown"))
                } else {
                    Ok(())
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.succeeded, tags(&["1.0", "2.0"]));
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "bad");
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_replicate_each_halts_on_auth_keeping_progress() {
        let halted = replicate_each(
            "test",
            &request(),
            &tags(&["1.0", "1.1", "2.0"]),
            Some(&tags(&["1.0"])),
            &CancellationToken::new(),
            |tag| async move {
                if tag == "2.0" {
                    Err(SyncError::auth("dst.example:5000", "denied"))
                } else {
                    Ok(())
                }
            },
        )
        .await
        .unwrap_err();

        assert!(halted.error.is_auth());
        assert_eq!(halted.outcome.skipped, tags(&["1.0"]));
        assert_eq!(halted.outcome.succeeded, tags(&["1.1"]));
        assert!(halted.outcome.settled("1.1"));
        assert!(!halted.outcome.settled("2.0"));
    }

    #[tokio::test]
    async fn test_replicate_each_times_out_per_tag() {
        let outcome = replicate_each(
            "test",
            &request(),
            &tags(&["slow"]),
            None,
            &CancellationToken::new(),
            |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome.failed.len(), 1);
        assert!(outcome.failed[0].1.contains("timed out"));
    }

    #[tokio::test]
    async fn test_guarded_abort() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<()> = guarded(&cancel, Duration::from_secs(10), "copy", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(SyncError::ShutdownTimeout(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_auth_failure_classification() {
        assert!(looks_like_auth_failure("Error: unauthorized: authentication required"));
        assert!(looks_like_auth_failure("denied: requested access to the resource is denied"));
        assert!(!looks_like_auth_failure("manifest unknown"));
        assert!(looks_like_auth_failure("received unexpected HTTP status 401"));
    }

    #[test]
    fn test_digest_digits_are_not_auth_failures() {
        assert!(!looks_like_auth_failure(
            "Error: reading blob sha256:9c4013a401e2b7f0c: connection reset by peer"
        ));
    }
}
