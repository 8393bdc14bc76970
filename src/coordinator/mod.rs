// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync orchestrator.
//!
//! Ties together:
//! - Tasks built from [`SyncConfig`] via [`crate::task::Task`]
//! - Tag listing via a [`TagLister`]
//! - Image copying via a [`Relay`]
//! - Optional credential refresh via an [`AuthRefresher`]
//!
//! # Architecture
//!
//! One clock-driven loop produces ticks. Each tick runs every due task (see
//! [`tick`]) and publishes a [`TickReport`] on a `watch` channel once all
//! outcomes are in. If a tick is still running when the next one is due,
//! the new tick is skipped and counted, not queued.
//!
//! Shutdown is two-phase: a stop token ends scheduling and is consulted
//! before every task and mapping; after the grace period an abort token
//! drops in-flight operations.

mod tick;
mod types;

pub use types::{
    MappingOutcome, SyncState, SyncStats, TaskOutcome, TaskStatus, TickReport, TickStatus,
};

use crate::auth::AuthRefresher;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::relay::{build_lister, build_relay, Relay};
use crate::resilience::Bulkhead;
use crate::tags::TagLister;
use crate::task::Task;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tick::{BoundedRefresher, TickContext};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Extra time granted after the abort token fires before the loop is killed.
const ABORT_DEADLINE: Duration = Duration::from_secs(2);

type TickFuture = Pin<Box<dyn Future<Output = TickReport> + Send>>;

/// Channels shared between the orchestrator handle and its tick loop.
struct Shared {
    state: watch::Sender<SyncState>,
    reports: watch::Sender<Option<TickReport>>,
    /// Set once no further tick can complete.
    done: watch::Sender<bool>,
    stats: watch::Sender<SyncStats>,
}

impl Shared {
    fn set_state(&self, state: SyncState) {
        self.state.send_replace(state);
        metrics::set_orchestrator_state(&state.to_string());
    }

    fn publish(&self, report: TickReport) {
        metrics::record_tick(report.status.as_str(), report.duration);
        self.stats.send_modify(|stats| {
            stats.ticks_completed += 1;
            if !report.is_success() {
                stats.ticks_failed += 1;
            }
        });

        if report.is_success() {
            info!(
                tick = report.tick,
                tasks = report.tasks.len(),
                duration_ms = report.duration.as_millis() as u64,
                "Tick completed"
            );
        } else {
            let failed: Vec<&str> = report.failed_tasks().map(|t| t.name.as_str()).collect();
            warn!(
                tick = report.tick,
                status = report.status.as_str(),
                failed = ?failed,
                "Tick completed with failures"
            );
        }
        self.reports.send_replace(Some(report));
    }
}

/// Receives every tick report published after it was created.
///
/// Take one before [`SyncOrchestrator::start`] to observe the first tick no
/// matter how quickly it completes.
pub struct TickSubscription {
    reports: watch::Receiver<Option<TickReport>>,
    done: watch::Receiver<bool>,
}

impl TickSubscription {
    /// The next unseen tick report, or `None` once no further tick can
    /// complete.
    pub async fn next(&mut self) -> Option<TickReport> {
        if self.reports.has_changed().unwrap_or(false) {
            return self.reports.borrow_and_update().clone();
        }
        if *self.done.borrow_and_update() {
            return None;
        }

        tokio::select! {
            biased;
            changed = self.reports.changed() => match changed {
                Ok(()) => self.reports.borrow_and_update().clone(),
                Err(_) => None,
            },
            _ = self.done.changed() => None,
        }
    }
}

/// Periodically mirrors images between registries.
///
/// All methods take `&self`; wrap the orchestrator in an `Arc` to wait for
/// ticks and shut down from different tasks.
///
/// # Example
///
/// ```rust,no_run
/// use registry_mirror::{SyncConfig, SyncOrchestrator};
/// use std::time::Duration;
///
/// # async fn run() -> registry_mirror::Result<()> {
/// let config = SyncConfig::load("config.yaml")?;
/// let orchestrator = SyncOrchestrator::from_config(config)?;
/// let mut ticks = orchestrator.subscribe_ticks();
/// orchestrator.start(Duration::from_secs(60), 1).await?;
/// if let Some(report) = ticks.next().await {
///     println!("tick {} {}", report.tick, report.status.as_str());
/// }
/// orchestrator.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct SyncOrchestrator {
    config: SyncConfig,
    tasks: Vec<Arc<Task>>,
    relay: Arc<dyn Relay>,
    lister: Arc<dyn TagLister>,
    refresher: Option<Arc<dyn AuthRefresher>>,
    shared: Arc<Shared>,
    stop: CancellationToken,
    abort: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    /// Create an orchestrator with explicit collaborators.
    ///
    /// Validates the configuration; a `Config` error here means the
    /// orchestrator can never start.
    pub fn new(config: SyncConfig, relay: Arc<dyn Relay>, lister: Arc<dyn TagLister>) -> Result<Self> {
        config.validate()?;
        let tasks = config
            .tasks
            .iter()
            .map(|t| Task::from_config(t).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            tasks,
            relay,
            lister,
            refresher: None,
            shared: Arc::new(Shared {
                state: watch::channel(SyncState::Created).0,
                reports: watch::channel(None).0,
                done: watch::channel(false).0,
                stats: watch::channel(SyncStats::default()).0,
            }),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        })
    }

    /// Create an orchestrator with the relay and lister selected in `config`.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let relay = build_relay(&config)?;
        let lister = build_lister(&config)?;
        Self::new(config, relay, lister)
    }

    /// Install a credential refresher used proactively and after auth failures.
    pub fn with_auth_refresher(mut self, refresher: Arc<dyn AuthRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn relay_name(&self) -> &'static str {
        self.relay.name()
    }

    pub fn state(&self) -> SyncState {
        *self.shared.state.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<SyncState> {
        self.shared.state.subscribe()
    }

    pub fn stats(&self) -> SyncStats {
        *self.shared.stats.borrow()
    }

    /// Ticks completed so far.
    pub fn tick_count(&self) -> u64 {
        self.stats().ticks_completed
    }

    /// Begin the tick loop.
    ///
    /// The first tick starts immediately, later ones every `tick_interval`.
    /// `max_ticks == 0` ticks until shutdown; otherwise exactly `max_ticks`
    /// ticks run and the loop goes idle.
    pub async fn start(&self, tick_interval: Duration, max_ticks: u64) -> Result<()> {
        if tick_interval.is_zero() {
            return Err(SyncError::Config("tick interval must be > 0".to_string()));
        }
        let operation_timeout = self.config.tick.operation_timeout()?;
        let refresher = self.refresher.clone().map(|inner| {
            Arc::new(BoundedRefresher::new(inner, self.abort.clone(), operation_timeout))
                as Arc<dyn AuthRefresher>
        });
        let ctx = Arc::new(TickContext {
            tasks: self.tasks.clone(),
            relay: Arc::clone(&self.relay),
            lister: Arc::clone(&self.lister),
            refresher,
            bulkhead: Bulkhead::new(self.config.tick.max_concurrent_tasks),
            stop: self.stop.clone(),
            abort: self.abort.clone(),
            operation_timeout,
            skip_existing: self.config.tick.skip_existing,
        });

        let started = self.shared.state.send_if_modified(|state| {
            if *state == SyncState::Created {
                *state = SyncState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(SyncError::InvalidState {
                expected: SyncState::Created.to_string(),
                actual: self.state().to_string(),
            });
        }
        metrics::set_orchestrator_state("Running");

        info!(
            relay = self.relay.name(),
            tasks = self.tasks.len(),
            interval_ms = tick_interval.as_millis() as u64,
            max_ticks,
            "Starting sync orchestrator"
        );

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(run_loop(ctx, shared, tick_interval, max_ticks));
        *self.loop_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Subscribe to tick reports published from now on.
    pub fn subscribe_ticks(&self) -> TickSubscription {
        TickSubscription {
            reports: self.shared.reports.subscribe(),
            done: self.shared.done.subscribe(),
        }
    }

    /// Wait for the next tick to complete and return its report.
    ///
    /// Only ticks that complete after the call count. Returns `None` once no
    /// further tick can complete (stopped, or the tick limit was reached).
    pub async fn wait_for_tick(&self) -> Option<TickReport> {
        self.subscribe_ticks().next().await
    }

    /// Stop ticking and wait for the loop to finish.
    ///
    /// An in-flight tick gets the configured grace period; after that its
    /// operations are aborted and its tasks reported as interrupted. Returns
    /// once the state is `Stopped`.
    pub async fn shutdown(&self) -> Result<()> {
        let grace = self.config.tick.grace_period()?;
        let began = self.shared.state.send_if_modified(|state| {
            if *state == SyncState::Running {
                *state = SyncState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if !began {
            return match self.state() {
                SyncState::Created => Err(SyncError::InvalidState {
                    expected: SyncState::Running.to_string(),
                    actual: SyncState::Created.to_string(),
                }),
                _ => {
                    // Another caller is shutting down; wait for it.
                    let mut state = self.state_receiver();
                    let _ = state.wait_for(|s| *s == SyncState::Stopped).await;
                    Ok(())
                }
            };
        }
        metrics::set_orchestrator_state("ShuttingDown");

        info!(grace_ms = grace.as_millis() as u64, "Shutting down sync orchestrator");
        self.stop.cancel();

        let handle = self.loop_handle.lock().await.take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => debug!("Tick loop finished"),
                Ok(Err(e)) => error!(error = %e, "Tick loop panicked"),
                Err(_) => {
                    warn!("Grace period elapsed, aborting in-flight operations");
                    self.abort.cancel();
                    if tokio::time::timeout(ABORT_DEADLINE, &mut handle).await.is_err() {
                        error!("Tick loop unresponsive after abort, killing it");
                        handle.abort();
                        let _ = handle.await;
                    }
                }
            }
        }

        self.shared.done.send_replace(true);
        self.shared.set_state(SyncState::Stopped);
        info!(stats = ?self.stats(), "Sync orchestrator stopped");
        Ok(())
    }
}

/// Resolves when the in-flight tick completes; never, if there is none.
async fn in_flight_done(in_flight: &mut Option<TickFuture>) -> TickReport {
    match in_flight.as_mut() {
        Some(tick) => tick.await,
        None => std::future::pending().await,
    }
}

/// The scheduler loop. Runs until the stop token fires or the tick limit is
/// reached, then drains the in-flight tick.
async fn run_loop(ctx: Arc<TickContext>, shared: Arc<Shared>, interval: Duration, max_ticks: u64) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut in_flight: Option<TickFuture> = None;
    let mut started: u64 = 0;

    loop {
        tokio::select! {
            biased;

            _ = ctx.stop.cancelled() => {
                debug!("Stop requested, ending tick loop");
                break;
            }

            report = in_flight_done(&mut in_flight) => {
                in_flight = None;
                shared.publish(report);
                if max_ticks > 0 && started >= max_ticks {
                    info!(max_ticks, "Tick limit reached");
                    break;
                }
            }

            scheduled = timer.tick() => {
                if in_flight.is_some() {
                    shared.stats.send_modify(|stats| stats.ticks_skipped += 1);
                    metrics::record_tick_skipped();
                    warn!(tick = started, "Previous tick still running, skipping this one");
                    continue;
                }
                started += 1;
                let span = info_span!("tick", tick = started);
                in_flight = Some(Box::pin(
                    tick::run_tick(Arc::clone(&ctx), started, scheduled).instrument(span),
                ));
            }
        }
    }

    if let Some(tick) = in_flight.take() {
        shared.publish(tick.await);
    }
    shared.done.send_replace(true);
}
