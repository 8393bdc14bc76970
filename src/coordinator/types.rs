//! Orchestrator state and tick report types.
//!
//! # State Transitions
//!
//! ```text
//!            start()                 shutdown()
//! Created ───────────► Running ───────────────► ShuttingDown
//!                         │                           │
//!                         │ (max ticks reached)       │ (in-flight tick done,
//!                         │  stays Running, idle)     │  or aborted after grace)
//!                         │                           ↓
//!                         └─────── shutdown() ────► Stopped
//! ```
//!
//! - **Created**: after `SyncOrchestrator::new()`, nothing scheduled.
//! - **Running**: the tick loop is active (or idle after its last tick).
//! - **ShuttingDown**: no new tick starts; an in-flight tick is finishing.
//! - **Stopped**: terminal. `wait_for_tick()` returns `None`.
//!
//! # Reports
//!
//! Every tick produces a [`TickReport`] with one [`TaskOutcome`] per
//! configured task, in configuration order, whatever the execution model.

use crate::relay::ReplicationOutcome;
use std::time::Duration;

/// Lifecycle state of the sync orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Created => write!(f, "Created"),
            SyncState::Running => write!(f, "Running"),
            SyncState::ShuttingDown => write!(f, "ShuttingDown"),
            SyncState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// How a task ended in one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Every mapping replicated without failed tags.
    Succeeded,
    /// Preparation, listing or at least one tag failed.
    Failed,
    /// Shutdown stopped the task before or while it ran.
    Interrupted,
    /// Interval not yet elapsed (or one-off task already done).
    NotDue,
    /// Disabled in configuration.
    Disabled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Interrupted => "interrupted",
            TaskStatus::NotDue => "not_due",
            TaskStatus::Disabled => "disabled",
        }
    }

    /// Failed or interrupted.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Interrupted)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one mapping within a task run.
#[derive(Debug, Clone, Default)]
pub struct MappingOutcome {
    pub from: String,
    pub to: String,
    /// Working tag set after filtering.
    pub resolved: Vec<String>,
    pub replication: ReplicationOutcome,
    /// Mapping-level failure (listing, auth, shutdown).
    pub error: Option<String>,
    pub interrupted: bool,
}

impl MappingOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.replication.is_success()
    }
}

/// Result of one task within a tick.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub name: String,
    pub status: TaskStatus,
    pub mappings: Vec<MappingOutcome>,
    /// Task-level failure (preparation, auth refresh).
    pub error: Option<String>,
    pub duration: Duration,
}

impl TaskOutcome {
    /// Outcome of a task that did not run.
    pub fn skipped(name: &str, status: TaskStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
            mappings: Vec::new(),
            error: None,
            duration: Duration::ZERO,
        }
    }

    /// Reduce mapping outcomes into a task status.
    pub fn status_of(mappings: &[MappingOutcome], error: Option<&str>, interrupted: bool) -> TaskStatus {
        if interrupted || mappings.iter().any(|m| m.interrupted) {
            TaskStatus::Interrupted
        } else if error.is_some() || mappings.iter().any(|m| !m.is_success()) {
            TaskStatus::Failed
        } else {
            TaskStatus::Succeeded
        }
    }

    /// Tags copied across all mappings.
    pub fn tags_replicated(&self) -> usize {
        self.mappings.iter().map(|m| m.replication.succeeded.len()).sum()
    }
}

/// Overall status of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    Succeeded,
    Failed,
    Interrupted,
}

impl TickStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickStatus::Succeeded => "succeeded",
            TickStatus::Failed => "failed",
            TickStatus::Interrupted => "interrupted",
        }
    }
}

/// Everything that happened in one tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    /// 1-based tick number.
    pub tick: u64,
    pub status: TickStatus,
    /// One outcome per configured task, in configuration order.
    pub tasks: Vec<TaskOutcome>,
    pub duration: Duration,
}

impl TickReport {
    /// Aggregate task outcomes. A tick succeeds only if no task failed.
    pub fn aggregate(tick: u64, tasks: Vec<TaskOutcome>, duration: Duration) -> Self {
        let status = if tasks.iter().any(|t| t.status == TaskStatus::Interrupted) {
            TickStatus::Interrupted
        } else if tasks.iter().any(|t| t.status == TaskStatus::Failed) {
            TickStatus::Failed
        } else {
            TickStatus::Succeeded
        };
        Self {
            tick,
            status,
            tasks,
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TickStatus::Succeeded
    }

    pub fn task(&self, name: &str) -> Option<&TaskOutcome> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.tasks.iter().filter(|t| t.status.is_failure())
    }
}

/// Counters over the orchestrator's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub ticks_completed: u64,
    /// Ticks dropped because the previous one was still running.
    pub ticks_skipped: u64,
    /// Ticks containing at least one failed or interrupted task.
    pub ticks_failed: u64,
}
