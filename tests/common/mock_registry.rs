//! In-memory registry, relay and refresher for testing.
//!
//! [`MockRegistry`] stores tag lists per `(host, path)` and serves them as a
//! [`TagLister`]. [`MockRelay`] "copies" tags by writing them into the same
//! registry, and records every copy for assertions.

use registry_mirror::relay::{Halted, ReplicationFuture, ReplicationOutcome, ReplicationRequest, ReplicationResult};
use registry_mirror::{AuthRefresher, BoxFuture, Credentials, Endpoint, Relay, SyncError, TagLister};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tag store keyed by `(host, path)`.
#[derive(Default)]
pub struct MockRegistry {
    tags: Mutex<HashMap<(String, String), Vec<String>>>,
    list_calls: AtomicUsize,
    /// Hosts whose listing fails with a registry error.
    broken_hosts: Mutex<HashSet<String>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `host/path` with `tags`.
    pub fn with_image(self, host: &str, path: &str, tags: &[&str]) -> Self {
        self.tags.lock().unwrap().insert(
            (host.to_string(), path.to_string()),
            tags.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    /// Listing any image on `host` fails.
    pub fn break_host(&self, host: &str) {
        self.broken_hosts.lock().unwrap().insert(host.to_string());
    }

    /// Current tags of `host/path`, sorted.
    pub fn tags(&self, host: &str, path: &str) -> Vec<String> {
        let mut tags = self
            .tags
            .lock()
            .unwrap()
            .get(&(host.to_string(), path.to_string()))
            .cloned()
            .unwrap_or_default();
        tags.sort();
        tags
    }

    pub fn push(&self, host: &str, path: &str, tag: &str) {
        let mut store = self.tags.lock().unwrap();
        let tags = store.entry((host.to_string(), path.to_string())).or_default();
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

impl TagLister for MockRegistry {
    fn list_tags<'a>(&'a self, endpoint: &'a Endpoint, path: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.broken_hosts.lock().unwrap().contains(endpoint.host()) {
                return Err(SyncError::registry_msg(endpoint.host(), "list_tags", "connection refused"));
            }
            Ok(self
                .tags
                .lock()
                .unwrap()
                .get(&(endpoint.host().to_string(), path.to_string()))
                .cloned()
                .unwrap_or_default())
        })
    }
}

/// How the mock relay misbehaves.
#[derive(Default)]
pub enum Behavior {
    #[default]
    Normal,
    /// Ignore the cancel token and never finish.
    Unresponsive,
    /// Panic inside replicate.
    Panic,
}

/// Relay that copies tags inside a [`MockRegistry`].
pub struct MockRelay {
    registry: std::sync::Arc<MockRegistry>,
    delay: Duration,
    failing_tags: HashSet<String>,
    /// Target credentials that are rejected with an auth error.
    rejected: Option<Credentials>,
    /// Tag whose copy is rejected once, mid-batch.
    expiring: Mutex<Option<String>>,
    behavior: Behavior,
    copies: Mutex<Vec<String>>,
    replicate_calls: AtomicUsize,
    auth_failures: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockRelay {
    pub fn new(registry: std::sync::Arc<MockRegistry>) -> Self {
        Self {
            registry,
            delay: Duration::ZERO,
            failing_tags: HashSet::new(),
            rejected: None,
            expiring: Mutex::new(None),
            behavior: Behavior::Normal,
            copies: Mutex::new(Vec::new()),
            replicate_calls: AtomicUsize::new(0),
            auth_failures: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Sleep this long per copied tag.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_tag(mut self, tag: &str) -> Self {
        self.failing_tags.insert(tag.to_string());
        self
    }

    /// Reject the target while it presents `credentials`.
    pub fn rejecting(mut self, credentials: Credentials) -> Self {
        self.rejected = Some(credentials);
        self
    }

    /// Reject the copy of `tag` once with an auth error, after the tags
    /// before it were copied.
    pub fn expiring_at(self, tag: &str) -> Self {
        *self.expiring.lock().unwrap() = Some(tag.to_string());
        self
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Target references copied so far, in copy order.
    pub fn copies(&self) -> Vec<String> {
        self.copies.lock().unwrap().clone()
    }

    pub fn replicate_calls(&self) -> usize {
        self.replicate_calls.load(Ordering::SeqCst)
    }

    pub fn auth_failures(&self) -> usize {
        self.auth_failures.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent replicate calls observed.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl Relay for MockRelay {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn replicate<'a>(
        &'a self,
        request: &'a ReplicationRequest,
        tags: &'a [String],
        target_tags: Option<&'a [String]>,
        cancel: &'a CancellationToken,
    ) -> ReplicationFuture<'a> {
        Box::pin(async move {
            self.replicate_calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            let result = self.copy_all(request, tags, target_tags, cancel).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }
}

impl MockRelay {
    async fn copy_all(
        &self,
        request: &ReplicationRequest,
        tags: &[String],
        target_tags: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> ReplicationResult {
        match self.behavior {
            Behavior::Normal => {}
            Behavior::Unresponsive => std::future::pending::<()>().await,
            Behavior::Panic => panic!("relay exploded"),
        }

        if let Some(rejected) = &self.rejected {
            if request.target.credentials().await == *rejected {
                self.auth_failures.fetch_add(1, Ordering::SeqCst);
                return Err(SyncError::auth(request.target.host(), "unauthorized: token expired").into());
            }
        }

        let mut outcome = ReplicationOutcome::default();
        for tag in tags {
            if target_tags.is_some_and(|existing| existing.contains(tag)) {
                outcome.skipped.push(tag.clone());
                continue;
            }
            if cancel.is_cancelled() {
                let error = SyncError::ShutdownTimeout(request.source_ref(tag));
                return Err(Halted { outcome, error });
            }
            if !self.delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let error = SyncError::ShutdownTimeout(request.source_ref(tag));
                        return Err(Halted { outcome, error });
                    }
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }
            if self.expiring.lock().unwrap().as_deref() == Some(tag.as_str()) {
                *self.expiring.lock().unwrap() = None;
                self.auth_failures.fetch_add(1, Ordering::SeqCst);
                let error = SyncError::auth(request.target.host(), "unauthorized: token expired");
                return Err(Halted { outcome, error });
            }
            if self.failing_tags.contains(tag) {
                outcome.failed.push((tag.clone(), "manifest unknown".to_string()));
                continue;
            }
            self.registry.push(request.target.host(), &request.to, tag);
            self.copies.lock().unwrap().push(request.target_ref(tag));
            outcome.succeeded.push(tag.clone());
        }
        Ok(outcome)
    }
}

/// Refresher handing out fixed credentials and counting calls.
pub struct CountingRefresher {
    credentials: Credentials,
    calls: AtomicUsize,
}

impl CountingRefresher {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AuthRefresher for CountingRefresher {
    fn refresh<'a>(&'a self, _endpoint: &'a Endpoint) -> BoxFuture<'a, Credentials> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.credentials.clone())
        })
    }
}
