// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for registry mirroring.
//!
//! Configuration is loaded from YAML (or built programmatically) and handed
//! to [`SyncOrchestrator::new()`](crate::SyncOrchestrator::new) after
//! [`validate()`](SyncConfig::validate) succeeded.
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── relay: RelayKind            # docker | skopeo
//! ├── docker: DockerConfig        # daemon address, cleanup
//! ├── skopeo: SkopeoConfig        # binary, certs dir, multi-arch
//! ├── lister: ListerConfig        # tag listing limits, cache, rate limit
//! ├── tick: TickConfig            # interval override, grace period, timeouts
//! └── tasks: Vec<TaskConfig>      # executed in declaration order
//!     ├── source / target: EndpointConfig
//!     └── mappings: Vec<MappingConfig>
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! relay: skopeo
//! skopeo:
//!   binary: /usr/bin/skopeo
//!
//! tasks:
//!   - name: mirror-app
//!     interval: 5m
//!     source:
//!       registry: registry.example.com
//!       auth: eyJ1c2VybmFtZSI6ICJib2IiLCAicGFzc3dvcmQiOiAic2VjcmV0In0K
//!     target:
//!       registry: mirror.internal:5000
//!       skip-tls-verify: true
//!     mappings:
//!       - from: lib/app
//!         to: mirror/app
//!         tags: ["1.1", "2.0"]
//!       - from: lib/tools
//!         to: mirror/tools
//!         tags:
//!           - "regex: ^v[0-9]+\\."
//!           - "!regex: .*-rc.*"
//! ```

use crate::error::{Result, SyncError};
use crate::tags::TagFilter;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncConfig {
    /// Which replication backend moves image content.
    #[serde(default)]
    pub relay: RelayKind,

    /// Docker daemon relay settings (used when `relay: docker`).
    #[serde(default)]
    pub docker: DockerConfig,

    /// Skopeo relay settings (used when `relay: skopeo`).
    #[serde(default)]
    pub skopeo: SkopeoConfig,

    /// Tag listing settings.
    #[serde(default)]
    pub lister: ListerConfig,

    /// Scheduler settings.
    #[serde(default)]
    pub tick: TickConfig,

    /// Tasks, in execution order.
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            relay: RelayKind::default(),
            docker: DockerConfig::default(),
            skopeo: SkopeoConfig::default(),
            lister: ListerConfig::default(),
            tick: TickConfig::default(),
            tasks: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(tasks: Vec<TaskConfig>) -> Self {
        Self {
            tick: TickConfig::testing(),
            tasks,
            ..Default::default()
        }
    }

    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| SyncError::Config(format!("invalid YAML: {e}")))
    }

    /// Load, parse and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_yaml_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for inconsistencies.
    ///
    /// Verifies that task names are unique, intervals and durations parse,
    /// image paths are non-empty and every tag filter compiles.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for task in &self.tasks {
            if task.name.trim().is_empty() {
                return Err(SyncError::Config("task without name".to_string()));
            }
            if !names.insert(task.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "duplicate task name '{}'",
                    task.name
                )));
            }
            task.validate()?;
        }
        self.tick.grace_period()?;
        self.tick.operation_timeout()?;
        self.tick.interval_override()?;
        self.lister.cache_duration()?;
        if self.tick.max_concurrent_tasks == 0 {
            return Err(SyncError::Config(
                "tick.max-concurrent-tasks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The scheduler tick interval.
    ///
    /// Uses the `tick.interval` override if present, otherwise the smallest
    /// non-zero task interval. Returns `None` when every task is one-off.
    pub fn tick_interval(&self) -> Result<Option<Duration>> {
        if let Some(interval) = self.tick.interval_override()? {
            return Ok(Some(interval));
        }
        let mut min: Option<Duration> = None;
        for task in self.tasks.iter().filter(|t| t.enabled) {
            let interval = task.interval()?;
            if interval.is_zero() {
                continue;
            }
            min = Some(min.map_or(interval, |m| m.min(interval)));
        }
        Ok(min)
    }

    /// True when no enabled task repeats (every interval is zero).
    pub fn is_one_off(&self) -> Result<bool> {
        for task in self.tasks.iter().filter(|t| t.enabled) {
            if !task.interval()?.is_zero() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Durations: bare integers are seconds, strings go through humantime
// ═══════════════════════════════════════════════════════════════════════════════

/// A duration given either as seconds (`300`) or human-readable (`"5m"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationSpec {
    Seconds(u64),
    Text(String),
}

impl DurationSpec {
    /// Parse into a [`Duration`].
    pub fn to_duration(&self) -> Result<Duration> {
        match self {
            Self::Seconds(secs) => Ok(Duration::from_secs(*secs)),
            Self::Text(text) => parse_duration(text),
        }
    }
}

impl Default for DurationSpec {
    fn default() -> Self {
        Self::Seconds(0)
    }
}

impl From<Duration> for DurationSpec {
    fn from(d: Duration) -> Self {
        Self::Text(humantime::format_duration(d).to_string())
    }
}

fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(text)
        .map_err(|e| SyncError::Config(format!("invalid duration '{text}': {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Relay backends
// ═══════════════════════════════════════════════════════════════════════════════

/// Replication backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayKind {
    /// Pull, tag and push through a local Docker daemon.
    #[default]
    Docker,
    /// Copy directly between registries with the `skopeo` tool.
    Skopeo,
}

impl std::fmt::Display for RelayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayKind::Docker => write!(f, "docker"),
            RelayKind::Skopeo => write!(f, "skopeo"),
        }
    }
}

/// Docker daemon relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DockerConfig {
    /// Docker Engine API address (`tcp://host:port` or `http(s)://host:port`).
    #[serde(default = "default_docker_host")]
    pub host: String,

    /// Engine API version prefix, e.g. `1.41`.
    #[serde(default = "default_docker_api_version")]
    pub api_version: String,

    /// Remove the images pulled/tagged for replication afterwards.
    #[serde(default = "default_true")]
    pub cleanup: bool,
}

fn default_docker_host() -> String {
    "tcp://127.0.0.1:2375".to_string()
}

fn default_docker_api_version() -> String {
    "1.41".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: default_docker_host(),
            api_version: default_docker_api_version(),
            cleanup: true,
        }
    }
}

impl DockerConfig {
    /// Base URL for Engine API requests.
    pub fn base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        let host = match host.strip_prefix("tcp://") {
            Some(rest) => format!("http://{rest}"),
            None => host.to_string(),
        };
        format!("{}/v{}", host, self.api_version)
    }
}

/// Skopeo relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SkopeoConfig {
    /// Path or name of the skopeo binary.
    #[serde(default = "default_skopeo_binary")]
    pub binary: String,

    /// Directory containing per-registry certificate directories.
    #[serde(default)]
    pub certs_dir: Option<String>,

    /// Copy every platform of multi-arch images (`--all`).
    #[serde(default)]
    pub all_platforms: bool,
}

fn default_skopeo_binary() -> String {
    "skopeo".to_string()
}

impl Default for SkopeoConfig {
    fn default() -> Self {
        Self {
            binary: default_skopeo_binary(),
            certs_dir: None,
            all_platforms: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tag listing
// ═══════════════════════════════════════════════════════════════════════════════

/// Tag listing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListerConfig {
    /// Maximum number of tags enumerated per image (0 = unlimited).
    #[serde(default)]
    pub max_items: usize,

    /// How long a tag list stays cached (0 = no caching).
    #[serde(default)]
    pub cache_duration: DurationSpec,

    /// Page size requested from the registry API.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Maximum registry API requests per second (unset = unlimited).
    #[serde(default)]
    pub rate_limit_per_sec: Option<u32>,

    /// Burst size when rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_page_size() -> usize {
    100
}

fn default_rate_limit_burst() -> u32 {
    10
}

impl Default for ListerConfig {
    fn default() -> Self {
        Self {
            max_items: 0,
            cache_duration: DurationSpec::default(),
            page_size: default_page_size(),
            rate_limit_per_sec: None,
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl ListerConfig {
    /// Parsed cache duration.
    pub fn cache_duration(&self) -> Result<Duration> {
        self.cache_duration.to_duration()
    }

    /// Rate limit configuration, `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        self.rate_limit_per_sec
            .map(|rate| crate::resilience::RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: rate,
            })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// Tick scheduling and shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TickConfig {
    /// Explicit tick interval; defaults to the smallest task interval.
    #[serde(default)]
    pub interval: Option<DurationSpec>,

    /// How long an in-flight tick may continue after shutdown is requested.
    #[serde(default = "default_grace_period")]
    pub grace_period: DurationSpec,

    /// Upper bound for a single registry or relay operation.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout: DurationSpec,

    /// Tasks executed concurrently within one tick (1 = sequential).
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Skip tags that already exist at the target.
    #[serde(default = "default_true")]
    pub skip_existing: bool,
}

fn default_grace_period() -> DurationSpec {
    DurationSpec::Text("30s".to_string())
}

fn default_operation_timeout() -> DurationSpec {
    DurationSpec::Text("30m".to_string())
}

fn default_max_concurrent_tasks() -> usize {
    1
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            interval: None,
            grace_period: default_grace_period(),
            operation_timeout: default_operation_timeout(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            skip_existing: true,
        }
    }
}

impl TickConfig {
    /// Short timeouts for tests.
    pub fn testing() -> Self {
        Self {
            interval: None,
            grace_period: DurationSpec::Text("200ms".to_string()),
            operation_timeout: DurationSpec::Text("5s".to_string()),
            max_concurrent_tasks: 1,
            skip_existing: true,
        }
    }

    /// Parsed grace period.
    pub fn grace_period(&self) -> Result<Duration> {
        self.grace_period.to_duration()
    }

    /// Parsed operation timeout.
    pub fn operation_timeout(&self) -> Result<Duration> {
        let timeout = self.operation_timeout.to_duration()?;
        if timeout.is_zero() {
            return Err(SyncError::Config(
                "tick.operation-timeout must be greater than zero".to_string(),
            ));
        }
        Ok(timeout)
    }

    /// Parsed interval override.
    pub fn interval_override(&self) -> Result<Option<Duration>> {
        match &self.interval {
            Some(spec) => {
                let interval = spec.to_duration()?;
                if interval.is_zero() {
                    return Err(SyncError::Config(
                        "tick.interval must be greater than zero".to_string(),
                    ));
                }
                Ok(Some(interval))
            }
            None => Ok(None),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tasks
// ═══════════════════════════════════════════════════════════════════════════════

/// One replication task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskConfig {
    /// Unique task name.
    pub name: String,

    /// How often the task runs; `0` runs it once.
    #[serde(default)]
    pub interval: DurationSpec,

    /// Registry images are copied from.
    pub source: EndpointConfig,

    /// Registry images are copied to.
    pub target: EndpointConfig,

    /// Image mappings, executed in order.
    #[serde(default)]
    pub mappings: Vec<MappingConfig>,

    /// Disabled tasks are never run.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl TaskConfig {
    /// Create a task config for testing.
    pub fn for_testing(name: &str, source: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            interval: DurationSpec::default(),
            source: EndpointConfig::for_testing(source),
            target: EndpointConfig::for_testing(target),
            mappings: Vec::new(),
            enabled: true,
        }
    }

    /// Add a mapping (builder style, for tests and programmatic use).
    pub fn with_mapping(mut self, mapping: MappingConfig) -> Self {
        self.mappings.push(mapping);
        self
    }

    /// Parsed interval.
    pub fn interval(&self) -> Result<Duration> {
        self.interval.to_duration().map_err(|e| {
            SyncError::Config(format!("task '{}': {e}", self.name))
        })
    }

    fn validate(&self) -> Result<()> {
        self.interval()?;
        self.source.validate(&self.name, "source")?;
        self.target.validate(&self.name, "target")?;
        for mapping in &self.mappings {
            if mapping.from.trim().is_empty() || mapping.to.trim().is_empty() {
                return Err(SyncError::Config(format!(
                    "task '{}': mapping with empty 'from' or 'to'",
                    self.name
                )));
            }
            TagFilter::from_spec(mapping.tags.as_ref()).map_err(|e| {
                SyncError::Config(format!(
                    "task '{}', mapping '{}': {e}",
                    self.name, mapping.from
                ))
            })?;
        }
        Ok(())
    }
}

/// One side of a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EndpointConfig {
    /// Registry address, e.g. `registry.example.com:5000`.
    pub registry: String,

    /// Opaque auth material (base64 JSON or `user:password`).
    #[serde(default)]
    pub auth: Option<String>,

    /// Accept invalid TLS certificates / plain HTTP.
    #[serde(default)]
    pub skip_tls_verify: bool,

    /// Refresh credentials when older than this.
    #[serde(default)]
    pub auth_refresh: Option<DurationSpec>,
}

impl EndpointConfig {
    /// Create an anonymous endpoint config for testing.
    pub fn for_testing(registry: &str) -> Self {
        Self {
            registry: registry.to_string(),
            auth: None,
            skip_tls_verify: false,
            auth_refresh: None,
        }
    }

    /// Parsed auth refresh interval.
    pub fn auth_refresh(&self) -> Result<Option<Duration>> {
        match &self.auth_refresh {
            Some(spec) => Ok(Some(spec.to_duration()?).filter(|d| !d.is_zero())),
            None => Ok(None),
        }
    }

    fn validate(&self, task: &str, side: &str) -> Result<()> {
        if self.registry.trim().is_empty() {
            return Err(SyncError::Config(format!(
                "task '{task}': {side} registry is empty"
            )));
        }
        if let Some(auth) = &self.auth {
            crate::auth::Credentials::decode(auth).map_err(|e| {
                SyncError::Config(format!("task '{task}': {side} auth: {e}"))
            })?;
        }
        self.auth_refresh()?;
        Ok(())
    }
}

/// One source path → target path rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Source image path.
    pub from: String,

    /// Target image path.
    pub to: String,

    /// Tag selection, `None` means all tags.
    #[serde(default)]
    pub tags: Option<TagsSpec>,
}

impl MappingConfig {
    /// Mapping with an explicit literal tag list.
    pub fn literal(from: &str, to: &str, tags: &[&str]) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            tags: Some(TagsSpec::List(tags.iter().map(|t| t.to_string()).collect())),
        }
    }

    /// Mapping copying every tag.
    pub fn all(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            tags: None,
        }
    }
}

/// Tag selection as written in configuration.
///
/// - `all` (or omitted): every tag
/// - list: literal tags, entries prefixed `regex:` / `!regex:` are patterns
/// - map: `{include: [...], exclude: [...]}` patterns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagsSpec {
    Keyword(String),
    List(Vec<String>),
    Rules {
        #[serde(default)]
        include: Vec<String>,
        #[serde(default)]
        exclude: Vec<String>,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
