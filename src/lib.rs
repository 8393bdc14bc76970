//! # Registry Mirror
//!
//! Periodically mirrors container images between registries.
//!
//! ## Architecture
//!
//! A clock-driven orchestrator runs configured *tasks*. Each task pairs a
//! source and a target registry endpoint with an ordered list of *mappings*
//! (`from` image path → `to` image path plus a tag filter):
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            registry-mirror                                │
//! │                                                                           │
//! │  ┌──────────────────┐   ┌────────────┐   ┌───────────┐   ┌────────────┐   │
//! │  │ SyncOrchestrator │──►│ TagLister  │──►│ TagFilter │──►│   Relay    │   │
//! │  │ (tick loop)      │   │ (Registry  │   │ (literal, │   │ (docker or │   │
//! │  └──────────────────┘   │  API/skopeo)│   │  regex)   │   │  skopeo)   │   │
//! │           │             └────────────┘   └───────────┘   └────────────┘   │
//! │           ▼                     ▲                              ▲          │
//! │  ┌──────────────────┐           └──────── Endpoint ────────────┘          │
//! │  │ TickReport       │                 (credentials, refresh)              │
//! │  │ (watch channel)  │                                                     │
//! │  └──────────────────┘                                                     │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Failures are contained per tag, per mapping and per task: one bad image
//! never stops the rest of a tick, and one failed tick never stops the next.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use registry_mirror::{SyncConfig, SyncOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::load("config.yaml")?;
//!     let interval = config.tick_interval()?.unwrap_or(std::time::Duration::from_secs(60));
//!
//!     let orchestrator = SyncOrchestrator::from_config(config)?;
//!     orchestrator.start(interval, 0).await?;
//!
//!     // Runs until shutdown
//!     tokio::signal::ctrl_c().await?;
//!     orchestrator.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod coordinator;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod resilience;
pub mod tags;
pub mod task;

// Re-exports for convenience
pub use auth::{AuthRefresher, Credentials};
pub use config::{DurationSpec, EndpointConfig, MappingConfig, RelayKind, SyncConfig, TagsSpec, TaskConfig};
pub use coordinator::{
    MappingOutcome, SyncOrchestrator, SyncState, SyncStats, TaskOutcome, TaskStatus, TickReport,
    TickStatus, TickSubscription,
};
pub use endpoint::Endpoint;
pub use error::{BoxFuture, Result, SyncError};
pub use registry::RegistryClient;
pub use relay::{
    DockerRelay, Halted, Relay, ReplicationFuture, ReplicationOutcome, ReplicationRequest,
    ReplicationResult, SkopeoRelay,
};
pub use tags::{CachedLister, TagFilter, TagLister};
pub use task::{Mapping, Task};
