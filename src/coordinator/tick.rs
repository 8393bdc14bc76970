// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One tick: run every due task, every mapping, and fold the results.
//!
//! # Per-mapping flow
//!
//! ```text
//! list source tags ──► filter ──► list target tags ──► relay.replicate
//!   (auth retry)                   (skip-existing)       (auth retry)
//! ```
//!
//! Tasks run under a [`Bulkhead`]; with a limit of 1 they run strictly in
//! configuration order. Permits are acquired in configuration order, so a
//! larger limit still starts tasks in that order.

use super::types::{MappingOutcome, TaskOutcome, TaskStatus, TickReport};
use crate::auth::{with_auth_retry, AuthRefresher, Credentials};
use crate::endpoint::Endpoint;
use crate::error::{BoxFuture, Result, SyncError};
use crate::metrics;
use crate::relay::{abortable, guarded, Relay, ReplicationOutcome, ReplicationRequest};
use crate::resilience::Bulkhead;
use crate::tags::TagLister;
use crate::task::{Mapping, Task};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Everything a tick needs, shared by all ticks of one orchestrator.
pub(crate) struct TickContext {
    pub tasks: Vec<Arc<Task>>,
    pub relay: Arc<dyn Relay>,
    pub lister: Arc<dyn TagLister>,
    pub refresher: Option<Arc<dyn AuthRefresher>>,
    pub bulkhead: Bulkhead,
    /// Graceful stop: no new task or mapping starts.
    pub stop: CancellationToken,
    /// Forced stop: in-flight operations are dropped.
    pub abort: CancellationToken,
    pub operation_timeout: Duration,
    pub skip_existing: bool,
}

/// Refresher bounded by the operation timeout and the abort token.
pub(crate) struct BoundedRefresher {
    inner: Arc<dyn AuthRefresher>,
    abort: CancellationToken,
    timeout: Duration,
}

impl BoundedRefresher {
    pub(crate) fn new(inner: Arc<dyn AuthRefresher>, abort: CancellationToken, timeout: Duration) -> Self {
        Self { inner, abort, timeout }
    }
}

impl AuthRefresher for BoundedRefresher {
    fn refresh<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, Credentials> {
        Box::pin(guarded(
            &self.abort,
            self.timeout,
            "auth refresh",
            self.inner.refresh(endpoint),
        ))
    }
}

/// Run one tick scheduled at `scheduled`.
pub(crate) async fn run_tick(
    ctx: Arc<TickContext>,
    tick: u64,
    scheduled: tokio::time::Instant,
) -> TickReport {
    let started = Instant::now();
    let mut outcomes: Vec<Option<TaskOutcome>> = (0..ctx.tasks.len()).map(|_| None).collect();
    let mut running = JoinSet::new();

    for (index, task) in ctx.tasks.iter().enumerate() {
        if !task.enabled {
            outcomes[index] = Some(TaskOutcome::skipped(&task.name, TaskStatus::Disabled));
            continue;
        }
        if !task.is_due(scheduled).await {
            debug!(task = %task.name, "Task not due");
            outcomes[index] = Some(TaskOutcome::skipped(&task.name, TaskStatus::NotDue));
            continue;
        }

        let permit = tokio::select! {
            biased;
            _ = ctx.stop.cancelled() => None,
            permit = ctx.bulkhead.acquire() => permit.ok(),
        };
        let Some(permit) = permit else {
            outcomes[index] = Some(TaskOutcome::skipped(&task.name, TaskStatus::Interrupted));
            continue;
        };

        task.mark_started(scheduled).await;
        let ctx = Arc::clone(&ctx);
        let task = Arc::clone(task);
        let span = info_span!("task", task = %task.name);
        running.spawn(
            async move {
                let outcome = run_task(&ctx, &task).await;
                drop(permit);
                (index, outcome)
            }
            .instrument(span),
        );
    }

    while let Some(joined) = running.join_next().await {
        match joined {
            Ok((index, outcome)) => outcomes[index] = Some(outcome),
            Err(e) => error!(tick, error = %e, "Task panicked"),
        }
    }

    let tasks = outcomes
        .into_iter()
        .zip(&ctx.tasks)
        .map(|(outcome, task)| {
            outcome.unwrap_or_else(|| TaskOutcome {
                error: Some("task panicked".to_string()),
                ..TaskOutcome::skipped(&task.name, TaskStatus::Failed)
            })
        })
        .collect();

    TickReport::aggregate(tick, tasks, started.elapsed())
}

/// Run one task: refresh, prepare, then every mapping in order.
async fn run_task(ctx: &TickContext, task: &Task) -> TaskOutcome {
    let started = Instant::now();
    let mut mappings = Vec::with_capacity(task.mappings.len());
    let mut interrupted = false;

    info!(mappings = task.mappings.len(), "Task started");

    let error = match prepare(ctx, task).await {
        Ok(()) => {
            for mapping in &task.mappings {
                if ctx.stop.is_cancelled() {
                    interrupted = true;
                    break;
                }
                let outcome = run_mapping(ctx, task, mapping)
                    .instrument(info_span!("mapping", from = %mapping.from, to = %mapping.to))
                    .await;
                mappings.push(outcome);
            }
            None
        }
        Err(e) => {
            warn!(error = %e, "Task preparation failed");
            metrics::record_error(&task.name, e.kind());
            interrupted = e.is_shutdown();
            Some(e.to_string())
        }
    };

    let status = TaskOutcome::status_of(&mappings, error.as_deref(), interrupted);
    let outcome = TaskOutcome {
        name: task.name.clone(),
        status,
        mappings,
        error,
        duration: started.elapsed(),
    };

    metrics::record_task(&task.name, status.as_str(), outcome.duration);
    match status {
        TaskStatus::Succeeded => info!(
            tags_replicated = outcome.tags_replicated(),
            duration_ms = outcome.duration.as_millis() as u64,
            "Task succeeded"
        ),
        _ => warn!(status = %status, "Task did not succeed"),
    }
    outcome
}

/// Proactive credential refresh followed by relay preparation.
async fn prepare(ctx: &TickContext, task: &Task) -> Result<()> {
    if let Some(refresher) = ctx.refresher.as_deref() {
        for endpoint in [&task.source, &task.target] {
            guarded(
                &ctx.abort,
                ctx.operation_timeout,
                "auth refresh",
                endpoint.ensure_fresh(refresher),
            )
            .await?;
        }
    }
    guarded(
        &ctx.abort,
        ctx.operation_timeout,
        "relay prepare",
        ctx.relay.prepare(task),
    )
    .await
}

async fn list_tags(ctx: &TickContext, task: &Task, source: bool, path: &str) -> Result<Vec<String>> {
    let endpoint: &Endpoint = if source { &task.source } else { &task.target };
    with_auth_retry(&[endpoint], ctx.refresher.as_deref(), || {
        guarded(
            &ctx.abort,
            ctx.operation_timeout,
            "list tags",
            ctx.lister.list_tags(endpoint, path),
        )
    })
    .await
}

async fn run_mapping(ctx: &TickContext, task: &Task, mapping: &Mapping) -> MappingOutcome {
    let mut outcome = MappingOutcome {
        from: mapping.from.clone(),
        to: mapping.to.clone(),
        ..Default::default()
    };
    let fail = |mut outcome: MappingOutcome, e: SyncError| {
        warn!(error = %e, "Mapping failed");
        metrics::record_error(&task.name, e.kind());
        outcome.interrupted = e.is_shutdown();
        outcome.error = Some(e.to_string());
        outcome
    };

    let source_tags = match list_tags(ctx, task, true, &mapping.from).await {
        Ok(tags) => tags,
        Err(e) => return fail(outcome, e),
    };
    outcome.resolved = mapping.filter.apply(&source_tags);
    debug!(
        listed = source_tags.len(),
        resolved = outcome.resolved.len(),
        "Resolved working tag set"
    );
    if outcome.resolved.is_empty() {
        return outcome;
    }

    let target_tags = if ctx.skip_existing {
        match list_tags(ctx, task, false, &mapping.to).await {
            Ok(tags) => Some(tags),
            Err(e) => return fail(outcome, e),
        }
    } else {
        None
    };

    if ctx.stop.is_cancelled() {
        return fail(outcome, SyncError::Interrupted);
    }

    let request = ReplicationRequest {
        task: task.name.clone(),
        source: Arc::clone(&task.source),
        target: Arc::clone(&task.target),
        from: mapping.from.clone(),
        to: mapping.to.clone(),
        operation_timeout: ctx.operation_timeout,
    };
    // A retry after an auth failure only gets the tags still unsettled.
    let progress = Mutex::new(ReplicationOutcome::default());
    let resolved = &outcome.resolved;
    let target_tags = target_tags.as_deref();
    let replicated = with_auth_retry(
        &[&*task.source, &*task.target],
        ctx.refresher.as_deref(),
        || async {
            let pending: Vec<String> = {
                let done = progress.lock().await;
                resolved.iter().filter(|t| !done.settled(t)).cloned().collect()
            };
            let batch = abortable(&ctx.abort, "replicate", async {
                Ok(ctx.relay.replicate(&request, &pending, target_tags, &ctx.abort).await)
            })
            .await?;

            let mut done = progress.lock().await;
            match batch {
                Ok(replication) => {
                    done.merge(replication);
                    Ok(())
                }
                Err(halted) => {
                    done.merge(halted.outcome);
                    Err(halted.error)
                }
            }
        },
    )
    .await;

    let replication = progress.into_inner();
    metrics::record_tags_replicated(
        &task.name,
        replication.succeeded.len(),
        replication.skipped.len(),
        replication.failed.len(),
    );
    if !replication.succeeded.is_empty() {
        if let Err(e) = ctx.lister.invalidate(&task.target, &mapping.to).await {
            debug!(error = %e, "Cannot invalidate cached target tags");
        }
    }
    outcome.replication = replication;

    match replicated {
        Ok(()) => outcome,
        Err(e) => fail(outcome, e),
    }
}
