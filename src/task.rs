// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tasks and mappings: the runtime form of the configured work.

use crate::config::{MappingConfig, TaskConfig};
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::tags::TagFilter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// One source path → target path rule.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub from: String,
    pub to: String,
    pub filter: TagFilter,
}

impl Mapping {
    pub fn from_config(config: &MappingConfig) -> Result<Self> {
        Ok(Self {
            from: config.from.trim().trim_matches('/').to_string(),
            to: config.to.trim().trim_matches('/').to_string(),
            filter: TagFilter::from_spec(config.tags.as_ref())?,
        })
    }
}

/// A named group of mappings sharing one endpoint pair and one interval.
///
/// Immutable during a run apart from the bookkeeping of its last start.
#[derive(Debug)]
pub struct Task {
    pub name: String,
    /// Zero means the task runs once, in the first tick.
    pub interval: Duration,
    pub source: Arc<Endpoint>,
    pub target: Arc<Endpoint>,
    pub mappings: Vec<Mapping>,
    pub enabled: bool,
    last_start: Mutex<Option<Instant>>,
}

impl Task {
    pub fn from_config(config: &TaskConfig) -> Result<Self> {
        let mappings = config
            .mappings
            .iter()
            .map(Mapping::from_config)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: config.name.clone(),
            interval: config.interval()?,
            source: Arc::new(Endpoint::from_config(&config.source)?),
            target: Arc::new(Endpoint::from_config(&config.target)?),
            mappings,
            enabled: config.enabled,
            last_start: Mutex::new(None),
        })
    }

    /// Whether the task should run in the tick scheduled at `now`.
    ///
    /// Never-run tasks are always due; one-off tasks only until their first
    /// start; periodic tasks once their interval has elapsed since the last
    /// start.
    pub async fn is_due(&self, now: Instant) -> bool {
        match *self.last_start.lock().await {
            None => true,
            Some(_) if self.interval.is_zero() => false,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    /// Record that the task started at `now`.
    pub async fn mark_started(&self, now: Instant) {
        *self.last_start.lock().await = Some(now);
    }
}
